//! End-to-end deployment scenarios against the in-memory cloud.

use std::sync::Arc;

use rstest::rstest;
use skiff::pipeline::{DeployError, DeploymentPipeline, DeploymentRequest, ErrorKind};
use skiff::progress::BufferSink;
use skiff::test_support::FakeCloud;

fn request(region: &str, instance_type: &str, subnet: Option<&str>) -> DeploymentRequest {
    DeploymentRequest::builder()
        .region(region)
        .account_id(FakeCloud::ACCOUNT)
        .repository("solver")
        .instance_type(instance_type)
        .subnet_id(subnet.map(str::to_owned))
        .build()
        .unwrap_or_else(|err| panic!("valid request: {err}"))
}

async fn deploy(cloud: &FakeCloud, request: &DeploymentRequest) -> Result<(), DeployError> {
    DeploymentPipeline::new(Arc::new(cloud.clone()))
        .run(request, &BufferSink::new())
        .await
        .map(|_| ())
}

#[tokio::test(start_paused = true)]
async fn hpc_launch_without_subnet_uses_placement_group_and_zone() {
    let cloud = FakeCloud::with_standard_images("us-east-2");
    cloud.add_registry_image("solver", "sha256:aaa", &["latest"], None);

    deploy(&cloud, &request("us-east-2", "hpc7a.96xlarge", None))
        .await
        .unwrap_or_else(|err| panic!("deployment succeeds: {err}"));

    let group = cloud
        .position("create_placement_group")
        .expect("placement group created");
    let launch = cloud.position("run_instance").expect("instance launched");
    assert!(group < launch, "placement group must precede the launch");

    let launches = cloud.launches();
    let placement = launches[0]
        .placement
        .as_ref()
        .expect("placement section present");
    assert_eq!(placement.group_name.as_deref(), Some("skiff-cluster"));
    assert!(
        placement
            .availability_zone
            .as_deref()
            .is_some_and(|zone| zone.starts_with("us-east-2")),
        "zone resolved: {placement:?}"
    );
    assert!(launches[0].security_group_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn subnet_launch_references_security_group_by_id() {
    let cloud = FakeCloud::with_standard_images("us-east-1");
    cloud.add_registry_image("solver", "sha256:aaa", &["latest"], None);
    cloud.add_subnet("subnet-0123", "vpc-0abc", "us-east-1b");

    deploy(&cloud, &request("us-east-1", "c5.large", Some("subnet-0123")))
        .await
        .unwrap_or_else(|err| panic!("deployment succeeds: {err}"));

    let launch = cloud.launches().remove(0);
    let group = cloud
        .security_group("skiff-egress-only")
        .expect("security group exists");
    assert_eq!(launch.security_group_ids, vec![group.id]);
    assert!(launch.security_groups.is_empty());
    assert_eq!(launch.subnet_id.as_deref(), Some("subnet-0123"));
    assert!(cloud.position("create_placement_group").is_none());
}

#[rstest]
#[case::empty_repository(true)]
#[case::untagged_images_only(false)]
#[tokio::test(start_paused = true)]
async fn repository_without_pushable_image_is_actionable(#[case] empty: bool) {
    let cloud = FakeCloud::with_standard_images("us-east-1");
    if empty {
        cloud.add_repository("solver");
    } else {
        cloud.add_registry_image("solver", "sha256:bbb", &[], None);
    }

    let err = deploy(&cloud, &request("us-east-1", "c5.large", None))
        .await
        .expect_err("no image to pull");

    assert!(
        matches!(err, DeployError::NoPushableImage { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(err.kind(), ErrorKind::Actionable);
    assert!(err.to_string().contains("docker push"), "{err}");
    assert_eq!(cloud.terminations().len(), 1);
}
