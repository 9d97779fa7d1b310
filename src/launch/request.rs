//! Create-instance request assembly.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::provider::{
    BlockDeviceMapping, EbsVolume, IamInstanceProfileSpec, MANAGED_TAG_KEY, MANAGED_TAG_VALUE,
    Placement, RunInstancesRequest, SubnetInfo, Tag, TagSpecification,
};

use super::LaunchSpec;

/// Families only offered in a handful of regions, with those regions.
const REGION_RESTRICTED_FAMILIES: &[(&str, &[&str])] = &[
    ("hpc6a", &["us-east-2", "eu-north-1", "ap-southeast-1", "ap-northeast-1"]),
    ("hpc6id", &["us-east-2", "eu-west-1"]),
    ("hpc7a", &["us-east-2", "eu-north-1", "ap-northeast-1", "us-gov-west-1"]),
    ("hpc7g", &["us-east-1", "eu-west-1", "ap-northeast-1", "us-gov-west-1"]),
    ("p5e", &["us-east-2", "us-west-2"]),
    ("p5en", &["us-east-2", "us-west-2", "ap-northeast-1"]),
    ("trn1n", &["us-east-1", "us-east-2", "us-west-2"]),
];

/// Regions known to offer a region-restricted size class; empty for
/// classes that are broadly available.
#[must_use]
pub fn supported_regions(instance_type: &str) -> &'static [&'static str] {
    let family = crate::ensure::instance_family(instance_type).to_ascii_lowercase();
    REGION_RESTRICTED_FAMILIES
        .iter()
        .find(|(name, _)| *name == family)
        .map_or(&[], |(_, regions)| *regions)
}

/// Builds the create-instance call.
///
/// With a subnet, the security group is referenced by identifier and the
/// zone comes from the subnet. Without one, the group is referenced by name
/// and `zone` is passed through. A placement group always travels with its
/// zone.
#[must_use]
pub fn build_request(
    spec: &LaunchSpec,
    subnet: Option<&SubnetInfo>,
    zone: Option<String>,
) -> RunInstancesRequest {
    let (security_groups, security_group_ids) = if subnet.is_some() {
        (Vec::new(), vec![spec.security_group_id.clone()])
    } else {
        (vec![spec.security_group_name.clone()], Vec::new())
    };

    let placement = match (&spec.placement_group, subnet) {
        (Some(group), _) => Some(Placement {
            availability_zone: zone,
            group_name: Some(group.clone()),
        }),
        // The subnet pins the zone on its own.
        (None, Some(_)) => None,
        (None, None) => zone.map(|az| Placement {
            availability_zone: Some(az),
            group_name: None,
        }),
    };

    let tags = vec![
        Tag::new("Name", &spec.name_tag),
        Tag::new(MANAGED_TAG_KEY, MANAGED_TAG_VALUE),
    ];

    RunInstancesRequest {
        image_id: spec.image.image_id.clone(),
        instance_type: spec.instance_type.clone(),
        min_count: 1,
        max_count: 1,
        iam_instance_profile: IamInstanceProfileSpec {
            name: spec.instance_profile.clone(),
        },
        security_groups,
        security_group_ids,
        subnet_id: subnet.map(|info| info.id.clone()),
        placement,
        block_device_mappings: vec![BlockDeviceMapping {
            device_name: spec.image.root_device_name.clone(),
            ebs: EbsVolume {
                volume_size: spec.volume_size_gb,
                volume_type: spec.volume_type.clone(),
                delete_on_termination: true,
            },
        }],
        user_data: spec
            .user_data
            .as_deref()
            .filter(|script| !script.trim().is_empty())
            .map(|script| STANDARD.encode(script)),
        tag_specifications: ["instance", "volume"]
            .into_iter()
            .map(|resource_type| TagSpecification {
                resource_type: resource_type.to_owned(),
                tags: tags.clone(),
            })
            .collect(),
    }
}
