//! Unit tests for the `aws` client binding.

use std::sync::Arc;

use camino::Utf8Path;
use chrono::{TimeZone, Utc};
use rstest::{fixture, rstest};

use super::*;
use crate::provider::{
    AssumeRoleRequest, CommandApi, ComputeApi, IdentityApi, InvocationStatus, ProviderErrorKind,
    RegistryApi, RegistryImageRef, StorageApi, StsApi,
};
use crate::test_support::ScriptedRunner;

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn cli(runner: &ScriptedRunner) -> AwsCli<ScriptedRunner> {
    AwsCli::new(AwsSettings::new("us-east-2"), Arc::new(runner.clone()))
}

#[rstest]
#[case(
    "\nAn error occurred (NoSuchEntity) when calling the GetRole operation: The role with name x cannot be found.\n",
    "NoSuchEntity",
    "The role with name x cannot be found."
)]
#[case(
    "An error occurred (InvalidGroup.NotFound) when calling the DescribeSecurityGroups operation: The security group 'a' does not exist",
    "InvalidGroup.NotFound",
    "The security group 'a' does not exist"
)]
#[case(
    "An error occurred (AccessDenied): denied",
    "AccessDenied",
    "denied"
)]
fn error_lines_are_parsed(#[case] stderr: &str, #[case] code: &str, #[case] message: &str) {
    let output = CommandOutput {
        code: Some(254),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    };
    let err = parse_failure("aws", &output);
    assert_eq!(err.code, code);
    assert_eq!(err.message, message);
}

#[test]
fn unparseable_failures_keep_status_and_stderr() {
    let output = CommandOutput {
        code: Some(2),
        stdout: String::new(),
        stderr: String::from("usage: aws [options]"),
    };
    let err = parse_failure("aws", &output);
    assert_eq!(err.kind, ProviderErrorKind::Other);
    assert_eq!(err.code, "CommandFailed");
    assert!(err.message.contains("status 2"), "{}", err.message);
    assert!(err.message.contains("usage: aws"), "{}", err.message);
}

#[rstest]
#[tokio::test]
async fn missing_role_probes_as_none(runner: ScriptedRunner) {
    runner.push_provider_error("NoSuchEntity", "GetRole", "role not found");
    let role = cli(&runner)
        .get_role("skiff-instance-role")
        .await
        .expect("probe should succeed");
    assert!(role.is_none());

    let invocation = runner.invocations().pop().expect("invocation recorded");
    assert_eq!(
        invocation.command_string(),
        "aws iam get-role --role-name skiff-instance-role --output json --region us-east-2"
    );
}

#[rstest]
#[tokio::test]
async fn role_trust_policy_is_decoded(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"Role":{"RoleName":"r","Arn":"arn:aws:iam::123456789012:role/r",
        "AssumeRolePolicyDocument":{"Version":"2012-10-17","Statement":[]}}}"#,
    );
    let role = cli(&runner)
        .get_role("r")
        .await
        .expect("get role")
        .expect("role present");
    assert_eq!(role.arn, "arn:aws:iam::123456789012:role/r");
    assert_eq!(role.trust_policy["Version"], "2012-10-17");
}

#[rstest]
#[tokio::test]
async fn access_denied_is_not_swallowed_by_probes(runner: ScriptedRunner) {
    runner.push_provider_error("AccessDenied", "GetInstanceProfile", "nope");
    let err = cli(&runner)
        .get_instance_profile("p")
        .await
        .expect_err("access denied should propagate");
    assert_eq!(err.kind, ProviderErrorKind::AccessDenied);
}

#[rstest]
#[tokio::test]
async fn security_group_lookup_in_vpc_uses_filters(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"SecurityGroups":[{"GroupId":"sg-1","GroupName":"skiff-egress-only",
        "VpcId":"vpc-9","IpPermissions":[]}]}"#,
    );
    let group = cli(&runner)
        .describe_security_group("skiff-egress-only", Some("vpc-9"))
        .await
        .expect("describe")
        .expect("group present");
    assert_eq!(group.id, "sg-1");
    assert!(group.ingress.is_empty());

    let invocation = runner.invocations().pop().expect("invocation recorded");
    let command = invocation.command_string();
    assert!(command.contains("Name=group-name,Values=skiff-egress-only"), "{command}");
    assert!(command.contains("Name=vpc-id,Values=vpc-9"), "{command}");
}

#[rstest]
#[tokio::test]
async fn instance_type_zones_are_sorted_and_unique(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"InstanceTypeOfferings":[
            {"InstanceType":"hpc7a.96xlarge","Location":"us-east-2b"},
            {"InstanceType":"hpc7a.96xlarge","Location":"us-east-2a"},
            {"InstanceType":"hpc7a.96xlarge","Location":"us-east-2b"}]}"#,
    );
    let zones = cli(&runner)
        .instance_type_zones("hpc7a.96xlarge")
        .await
        .expect("offerings");
    assert_eq!(zones, vec!["us-east-2a", "us-east-2b"]);
}

#[rstest]
#[tokio::test]
async fn describe_instance_reads_state_address_and_name(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"Reservations":[{"Instances":[{"InstanceId":"i-1","State":{"Name":"running"},
        "PublicDnsName":"ec2-host","PublicIpAddress":"3.3.3.3","InstanceType":"c5n.18xlarge",
        "Tags":[{"Key":"Name","Value":"skiff-app"}],"LaunchTime":"2025-01-01T00:00:00+00:00"}]}]}"#,
    );
    let instance = cli(&runner)
        .describe_instance("i-1")
        .await
        .expect("describe")
        .expect("instance present");
    assert!(instance.is_running());
    assert_eq!(instance.address(), Some("ec2-host"));
    assert_eq!(instance.name.as_deref(), Some("skiff-app"));
}

#[rstest]
#[tokio::test]
async fn send_command_encodes_script_and_timeout(runner: ScriptedRunner) {
    runner.push_json(r#"{"Command":{"CommandId":"cmd-1"}}"#);
    let id = cli(&runner)
        .send_command("i-1", "echo ready", 600)
        .await
        .expect("send");
    assert_eq!(id, "cmd-1");

    let invocation = runner.invocations().pop().expect("invocation recorded");
    let input = invocation
        .flag_value("--cli-input-json")
        .expect("cli input present");
    let json: serde_json::Value = serde_json::from_str(&input).expect("valid json");
    assert_eq!(json["DocumentName"], "AWS-RunShellScript");
    assert_eq!(json["InstanceIds"][0], "i-1");
    assert_eq!(json["Parameters"]["commands"][0], "echo ready");
    assert_eq!(json["Parameters"]["executionTimeout"][0], "600");
}

#[rstest]
#[tokio::test]
async fn invocation_status_and_output_are_read(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"Status":"Failed","StandardOutputContent":"partial\n","StandardErrorContent":"boom"}"#,
    );
    let snapshot = cli(&runner)
        .get_invocation("cmd-1", "i-1")
        .await
        .expect("invocation");
    assert_eq!(snapshot.status, InvocationStatus::Failed);
    assert_eq!(snapshot.stdout, "partial\n");
    assert_eq!(snapshot.stderr, "boom");
}

#[rstest]
#[tokio::test]
async fn registry_images_carry_tags_and_push_time(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"imageDetails":[{"imageDigest":"sha256:a","imageTags":["latest"],
        "imagePushedAt":"2025-03-01T10:00:00+00:00"},{"imageDigest":"sha256:b"}]}"#,
    );
    let images = cli(&runner).list_images("solver").await.expect("list");
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].tags, vec!["latest"]);
    assert_eq!(
        images[0].pushed_at,
        Some(Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).single().expect("valid timestamp"))
    );
    assert!(images[1].tags.is_empty());
    assert!(images[1].pushed_at.is_none());
}

#[rstest]
#[tokio::test]
async fn batch_delete_reports_failures(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"imageIds":[{"imageDigest":"sha256:a"}],"failures":[{"imageId":{"imageDigest":"sha256:b"},
        "failureCode":"ImageReferencedByManifestList","failureReason":"in use"}]}"#,
    );
    let refs = [
        RegistryImageRef {
            image_digest: String::from("sha256:a"),
        },
        RegistryImageRef {
            image_digest: String::from("sha256:b"),
        },
    ];
    let outcome = cli(&runner)
        .batch_delete_images("solver", &refs)
        .await
        .expect("delete");
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.failures[0].code, "ImageReferencedByManifestList");
    assert_eq!(outcome.failures[0].digest.as_deref(), Some("sha256:b"));
}

#[rstest]
#[tokio::test]
async fn missing_repository_probes_as_none(runner: ScriptedRunner) {
    runner.push_provider_error(
        "RepositoryNotFoundException",
        "DescribeRepositories",
        "The repository with name 'solver' does not exist in the registry",
    );
    let found = cli(&runner)
        .describe_repository("solver")
        .await
        .expect("probe should succeed");
    assert!(found.is_none());
}

#[rstest]
#[tokio::test]
async fn created_repository_scans_on_push(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"repository":{"repositoryName":"solver",
        "repositoryUri":"123456789012.dkr.ecr.us-east-2.amazonaws.com/solver"}}"#,
    );
    let repo = cli(&runner)
        .create_repository("solver")
        .await
        .expect("create");
    assert_eq!(repo.uri, "123456789012.dkr.ecr.us-east-2.amazonaws.com/solver");
    let invocation = runner.invocations().pop().expect("invocation recorded");
    assert_eq!(
        invocation.flag_value("--image-scanning-configuration").as_deref(),
        Some("scanOnPush=true")
    );
}

#[rstest]
#[tokio::test]
async fn authorization_token_is_read(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"authorizationData":[{"authorizationToken":"QVdTOnNlY3JldA==",
        "proxyEndpoint":"https://123456789012.dkr.ecr.us-east-2.amazonaws.com",
        "expiresAt":"2025-06-01T12:00:00+00:00"}]}"#,
    );
    let token = cli(&runner)
        .authorization_token()
        .await
        .expect("token");
    assert_eq!(token.token, "QVdTOnNlY3JldA==");
    assert!(token.expires_at.is_some());
    assert!(!format!("{token:?}").contains("QVdT"));
}

#[rstest]
#[tokio::test]
async fn missing_bucket_reports_absent(runner: ScriptedRunner) {
    runner.push_provider_error("404", "HeadBucket", "Not Found");
    let exists = cli(&runner)
        .bucket_exists("skiff-transfers-123456789012-us-east-2")
        .await
        .expect("lookup should succeed");
    assert!(!exists);
}

#[rstest]
#[tokio::test]
async fn forbidden_bucket_is_an_error(runner: ScriptedRunner) {
    runner.push_provider_error("403", "HeadBucket", "Forbidden");
    let err = cli(&runner)
        .bucket_exists("someone-elses-bucket")
        .await
        .expect_err("forbidden is not absence");
    assert_eq!(err.kind, ProviderErrorKind::AccessDenied);
}

#[rstest]
#[tokio::test]
async fn buckets_outside_default_region_carry_location(runner: ScriptedRunner) {
    runner.push_json(r#"{"Location":"http://bucket.s3.amazonaws.com/"}"#);
    runner.push_success();
    let binding = cli(&runner);
    binding.create_bucket("bucket").await.expect("create");
    binding
        .put_expiration_rule("bucket", 1)
        .await
        .expect("lifecycle");

    let invocations = runner.invocations();
    assert_eq!(
        invocations[0].flag_value("--create-bucket-configuration").as_deref(),
        Some("LocationConstraint=us-east-2")
    );
    let lifecycle: serde_json::Value = serde_json::from_str(
        &invocations[1]
            .flag_value("--lifecycle-configuration")
            .expect("lifecycle argument"),
    )
    .expect("lifecycle is json");
    assert_eq!(lifecycle["Rules"][0]["Expiration"]["Days"], 1);
    assert_eq!(lifecycle["Rules"][0]["Status"], "Enabled");
}

#[rstest]
#[tokio::test]
async fn presigned_url_is_trimmed(runner: ScriptedRunner) {
    runner.push_json("https://bucket.s3.amazonaws.com/a.txt?X-Amz-Signature=abc\n");
    let url = cli(&runner)
        .presign_get("bucket", "a.txt", std::time::Duration::from_secs(3600))
        .await
        .expect("presign");
    assert_eq!(url, "https://bucket.s3.amazonaws.com/a.txt?X-Amz-Signature=abc");
    let invocation = runner.invocations().pop().expect("invocation recorded");
    assert_eq!(
        invocation.command_string(),
        "aws s3 presign s3://bucket/a.txt --expires-in 3600 --output json --region us-east-2"
    );
}

#[rstest]
#[tokio::test]
async fn objects_move_through_local_paths(runner: ScriptedRunner) {
    runner.push_json(r#"{"ETag":"\"abc\""}"#);
    runner.push_json(r#"{"ContentLength":3}"#);
    let binding = cli(&runner);
    binding
        .put_object("bucket", "uploads/a.txt", Utf8Path::new("/tmp/a.txt"))
        .await
        .expect("put");
    binding
        .get_object("bucket", "downloads/b.txt", Utf8Path::new("/tmp/b.txt"))
        .await
        .expect("get");

    let invocations = runner.invocations();
    assert_eq!(invocations[0].flag_value("--body").as_deref(), Some("/tmp/a.txt"));
    assert!(
        invocations[1]
            .command_string()
            .starts_with("aws s3api get-object --bucket bucket --key downloads/b.txt /tmp/b.txt")
    );
}

#[rstest]
#[tokio::test]
async fn assume_role_passes_external_id(runner: ScriptedRunner) {
    runner.push_json(
        r#"{"Credentials":{"AccessKeyId":"ASIA1","SecretAccessKey":"secret",
        "SessionToken":"token","Expiration":"2025-06-01T12:00:00+00:00"}}"#,
    );
    let creds = cli(&runner)
        .assume_role(&AssumeRoleRequest {
            role_arn: String::from("arn:aws:iam::123456789012:role/SkiffDeployerRole"),
            session_name: String::from("skiff-verify-0123abcd"),
            external_id: Some(String::from("ext-1")),
            duration_secs: 3600,
        })
        .await
        .expect("assume role");
    assert_eq!(creds.access_key_id, "ASIA1");
    assert_eq!(
        creds.expiration,
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().expect("valid timestamp")
    );

    let command = runner
        .invocations()
        .pop()
        .expect("invocation recorded")
        .command_string();
    assert!(command.contains("--external-id ext-1"), "{command}");
    assert!(command.contains("--duration-seconds 3600"), "{command}");
}

#[rstest]
#[tokio::test]
async fn session_credentials_are_exported_and_profile_dropped(runner: ScriptedRunner) {
    runner.push_json(r#"{"Account":"123456789012","Arn":"arn:aws:sts::123456789012:assumed-role/r/s"}"#);
    let settings = AwsSettings {
        profile: Some(String::from("ops")),
        ..AwsSettings::new("us-east-1")
    };
    let creds = AssumedCredentials {
        access_key_id: String::from("ASIA2"),
        secret_access_key: String::from("secret"),
        session_token: String::from("token"),
        expiration: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().expect("valid timestamp"),
    };
    let identity = AwsCli::new(settings, Arc::new(runner.clone()))
        .with_credentials(creds)
        .caller_identity()
        .await
        .expect("identity");
    assert_eq!(identity.account, "123456789012");

    let invocation = runner.invocations().pop().expect("invocation recorded");
    assert!(!invocation.command_string().contains("--profile"));
    assert_eq!(
        invocation.env_value("AWS_ACCESS_KEY_ID").as_deref(),
        Some("ASIA2")
    );
}

#[rstest]
#[tokio::test]
async fn profile_is_passed_without_session_credentials(runner: ScriptedRunner) {
    runner.push_json(r#"{"Account":"123456789012","Arn":"arn:aws:iam::123456789012:user/ops"}"#);
    let settings = AwsSettings {
        profile: Some(String::from("ops")),
        ..AwsSettings::new("us-east-1")
    };
    AwsCli::new(settings, Arc::new(runner.clone()))
        .caller_identity()
        .await
        .expect("identity");
    let command = runner
        .invocations()
        .pop()
        .expect("invocation recorded")
        .command_string();
    assert!(command.ends_with("--profile ops"), "{command}");
}
