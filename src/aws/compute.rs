//! Compute service (`aws ec2`) operations.

use std::ffi::OsString;

use serde::Deserialize;

use crate::process::CommandRunner;
use crate::provider::{
    ComputeApi, ImageInfo, ImageQuery, InstanceInfo, PlacementGroupInfo, ProviderError,
    ProviderFuture, RunInstancesRequest, SecurityGroupInfo, SubnetInfo,
};

use super::{AwsCli, argv, encode};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroups {
    #[serde(default)]
    security_groups: Vec<SecurityGroupRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupRecord {
    group_id: String,
    group_name: String,
    vpc_id: Option<String>,
    #[serde(default)]
    ip_permissions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedGroup {
    group_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlacementGroups {
    #[serde(default)]
    placement_groups: Vec<PlacementGroupRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlacementGroupRecord {
    group_name: String,
    #[serde(default)]
    strategy: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Images {
    #[serde(default)]
    images: Vec<ImageRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageRecord {
    image_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    root_device_name: String,
    #[serde(default)]
    creation_date: String,
    #[serde(default)]
    architecture: String,
}

impl From<ImageRecord> for ImageInfo {
    fn from(record: ImageRecord) -> Self {
        Self {
            id: record.image_id,
            name: record.name,
            root_device_name: record.root_device_name,
            creation_date: record.creation_date,
            architecture: record.architecture,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Offerings {
    #[serde(default)]
    instance_type_offerings: Vec<OfferingRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OfferingRecord {
    location: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Subnets {
    #[serde(default)]
    subnets: Vec<SubnetRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubnetRecord {
    subnet_id: String,
    vpc_id: String,
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchedInstances {
    #[serde(default)]
    instances: Vec<LaunchedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchedInstance {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservations {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceRecord {
    instance_id: String,
    state: StateRecord,
    public_dns_name: Option<String>,
    public_ip_address: Option<String>,
    #[serde(default)]
    instance_type: String,
    #[serde(default)]
    tags: Vec<TagRecord>,
    launch_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateRecord {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagRecord {
    key: String,
    value: String,
}

impl From<InstanceRecord> for InstanceInfo {
    fn from(record: InstanceRecord) -> Self {
        let name = record
            .tags
            .into_iter()
            .find(|tag| tag.key == "Name")
            .map(|tag| tag.value);
        Self {
            id: record.instance_id,
            state: record.state.name,
            public_dns: record.public_dns_name,
            public_ip: record.public_ip_address,
            instance_type: record.instance_type,
            name,
            launch_time: record.launch_time,
        }
    }
}

fn flatten_instances(reservations: Reservations) -> Vec<InstanceInfo> {
    reservations
        .reservations
        .into_iter()
        .flat_map(|reservation| reservation.instances)
        .map(InstanceInfo::from)
        .collect()
}

impl<R: CommandRunner + 'static> ComputeApi for AwsCli<R> {
    fn describe_security_group<'a>(
        &'a self,
        name: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProviderFuture<'a, Option<SecurityGroupInfo>> {
        Box::pin(async move {
            // Name lookups only work in the default VPC; other VPCs need filters.
            let args = match vpc_id {
                Some(vpc) => argv([
                    String::from("--filters"),
                    format!("Name=group-name,Values={name}"),
                    format!("Name=vpc-id,Values={vpc}"),
                ]),
                None => argv(["--group-names", name]),
            };
            let groups = match self
                .invoke_json::<SecurityGroups>("ec2", "describe-security-groups", args)
                .await
            {
                Ok(groups) => groups,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(groups
                .security_groups
                .into_iter()
                .next()
                .map(|group| SecurityGroupInfo {
                    id: group.group_id,
                    name: group.group_name,
                    vpc_id: group.vpc_id,
                    ingress: group.ip_permissions,
                }))
        })
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let mut args = argv(["--group-name", name, "--description", description]);
            if let Some(vpc) = vpc_id {
                args.extend(argv(["--vpc-id", vpc]));
            }
            let created: CreatedGroup = self
                .invoke_json("ec2", "create-security-group", args)
                .await?;
            Ok(created.group_id)
        })
    }

    fn revoke_ingress<'a>(
        &'a self,
        group_id: &'a str,
        permissions: &'a [serde_json::Value],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let encoded = encode(&permissions)?;
            self.invoke(
                "ec2",
                "revoke-security-group-ingress",
                argv([
                    "--group-id",
                    group_id,
                    "--ip-permissions",
                    encoded.as_str(),
                ]),
            )
            .await?;
            Ok(())
        })
    }

    fn describe_placement_group<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<PlacementGroupInfo>> {
        Box::pin(async move {
            let groups = match self
                .invoke_json::<PlacementGroups>(
                    "ec2",
                    "describe-placement-groups",
                    argv(["--group-names", name]),
                )
                .await
            {
                Ok(groups) => groups,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(groups
                .placement_groups
                .into_iter()
                .next()
                .map(|group| PlacementGroupInfo {
                    name: group.group_name,
                    strategy: group.strategy,
                    state: group.state,
                }))
        })
    }

    fn create_placement_group<'a>(
        &'a self,
        name: &'a str,
        strategy: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "ec2",
                "create-placement-group",
                argv(["--group-name", name, "--strategy", strategy]),
            )
            .await?;
            Ok(())
        })
    }

    fn describe_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, Option<ImageInfo>> {
        Box::pin(async move {
            let images = match self
                .invoke_json::<Images>("ec2", "describe-images", argv(["--image-ids", image_id]))
                .await
            {
                Ok(images) => images,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(images.images.into_iter().next().map(ImageInfo::from))
        })
    }

    fn find_images<'a>(&'a self, query: &'a ImageQuery) -> ProviderFuture<'a, Vec<ImageInfo>> {
        Box::pin(async move {
            let args: Vec<OsString> = argv([
                String::from("--owners"),
                query.owner.clone(),
                String::from("--filters"),
                format!("Name=name,Values={}", query.name_pattern),
                format!("Name=architecture,Values={}", query.architecture),
                String::from("Name=state,Values=available"),
            ]);
            let images: Images = self.invoke_json("ec2", "describe-images", args).await?;
            Ok(images.images.into_iter().map(ImageInfo::from).collect())
        })
    }

    fn instance_type_zones<'a>(
        &'a self,
        instance_type: &'a str,
    ) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            let filter = format!("Name=instance-type,Values={instance_type}");
            let offerings: Offerings = self
                .invoke_json(
                    "ec2",
                    "describe-instance-type-offerings",
                    argv([
                        "--location-type",
                        "availability-zone",
                        "--filters",
                        filter.as_str(),
                    ]),
                )
                .await?;
            let mut zones: Vec<String> = offerings
                .instance_type_offerings
                .into_iter()
                .map(|offering| offering.location)
                .collect();
            zones.sort();
            zones.dedup();
            Ok(zones)
        })
    }

    fn describe_subnet<'a>(
        &'a self,
        subnet_id: &'a str,
    ) -> ProviderFuture<'a, Option<SubnetInfo>> {
        Box::pin(async move {
            let subnets = match self
                .invoke_json::<Subnets>(
                    "ec2",
                    "describe-subnets",
                    argv(["--subnet-ids", subnet_id]),
                )
                .await
            {
                Ok(subnets) => subnets,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(subnets.subnets.into_iter().next().map(|subnet| SubnetInfo {
                id: subnet.subnet_id,
                vpc_id: subnet.vpc_id,
                availability_zone: subnet.availability_zone,
            }))
        })
    }

    fn run_instance<'a>(&'a self, request: &'a RunInstancesRequest) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let input = encode(request)?;
            let launched: LaunchedInstances = self
                .invoke_json(
                    "ec2",
                    "run-instances",
                    argv(["--cli-input-json", input.as_str()]),
                )
                .await?;
            launched
                .instances
                .into_iter()
                .next()
                .map(|instance| instance.instance_id)
                .ok_or_else(|| {
                    ProviderError::transport("run-instances returned no instance identifier")
                })
        })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceInfo>> {
        Box::pin(async move {
            let reservations = match self
                .invoke_json::<Reservations>(
                    "ec2",
                    "describe-instances",
                    argv(["--instance-ids", instance_id]),
                )
                .await
            {
                Ok(reservations) => reservations,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(flatten_instances(reservations).into_iter().next())
        })
    }

    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "ec2",
                "terminate-instances",
                argv(["--instance-ids", instance_id]),
            )
            .await?;
            Ok(())
        })
    }

    fn list_tagged_instances<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceInfo>> {
        Box::pin(async move {
            let args = argv([
                String::from("--filters"),
                format!("Name=tag:{key},Values={value}"),
                String::from("Name=instance-state-name,Values=pending,running,stopping,stopped"),
            ]);
            let reservations: Reservations =
                self.invoke_json("ec2", "describe-instances", args).await?;
            Ok(flatten_instances(reservations))
        })
    }
}
