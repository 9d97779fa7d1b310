//! Data exchanged with provider capability interfaces.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Tag key applied to every instance launched by this crate.
pub const MANAGED_TAG_KEY: &str = "managed-by";

/// Tag value applied to every instance launched by this crate.
pub const MANAGED_TAG_VALUE: &str = "skiff";

/// Returns `true` when `value` is a twelve digit account identifier.
#[must_use]
pub fn is_account_id(value: &str) -> bool {
    value.len() == 12 && value.bytes().all(|byte| byte.is_ascii_digit())
}

/// Role as reported by the identity service.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleInfo {
    /// Role name.
    pub name: String,
    /// Fully qualified role ARN.
    pub arn: String,
    /// Decoded trust policy document.
    pub trust_policy: serde_json::Value,
}

/// Instance profile as reported by the identity service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceProfileInfo {
    /// Profile name.
    pub name: String,
    /// Fully qualified profile ARN.
    pub arn: String,
    /// Names of roles bound to the profile.
    pub roles: Vec<String>,
}

/// Security group snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct SecurityGroupInfo {
    /// Group identifier (`sg-...`).
    pub id: String,
    /// Group name.
    pub name: String,
    /// VPC the group belongs to.
    pub vpc_id: Option<String>,
    /// Inbound permission entries, kept verbatim so they can be revoked.
    pub ingress: Vec<serde_json::Value>,
}

/// Placement group snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlacementGroupInfo {
    /// Group name.
    pub name: String,
    /// Placement strategy (for example `cluster`).
    pub strategy: String,
    /// Lifecycle state (for example `available`).
    pub state: String,
}

/// CPU architecture of a machine image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Architecture {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM (Graviton).
    Arm64,
}

impl Architecture {
    /// Returns the provider spelling of the architecture.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine image snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    /// Image identifier (`ami-...`).
    pub id: String,
    /// Image name.
    pub name: String,
    /// Device name of the boot volume (for example `/dev/xvda`).
    pub root_device_name: String,
    /// Creation timestamp as reported by the provider (ISO 8601).
    pub creation_date: String,
    /// Image architecture string.
    pub architecture: String,
}

/// Filter used to look up the latest image of a class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageQuery {
    /// Image owner alias or account.
    pub owner: String,
    /// Name pattern, `*` wildcards allowed.
    pub name_pattern: String,
    /// Required architecture.
    pub architecture: Architecture,
}

/// Subnet snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubnetInfo {
    /// Subnet identifier.
    pub id: String,
    /// VPC containing the subnet.
    pub vpc_id: String,
    /// Availability zone of the subnet.
    pub availability_zone: String,
}

/// Instance snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceInfo {
    /// Instance identifier (`i-...`).
    pub id: String,
    /// Lifecycle state name (`pending`, `running`, ...).
    pub state: String,
    /// Public DNS name, when assigned.
    pub public_dns: Option<String>,
    /// Public IPv4 address, when assigned.
    pub public_ip: Option<String>,
    /// Size class.
    pub instance_type: String,
    /// Value of the `Name` tag.
    pub name: Option<String>,
    /// Launch timestamp as reported by the provider.
    pub launch_time: Option<String>,
}

impl InstanceInfo {
    /// Returns the best reachable network identity: public DNS, then IP.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.public_dns
            .as_deref()
            .filter(|dns| !dns.is_empty())
            .or_else(|| self.public_ip.as_deref().filter(|ip| !ip.is_empty()))
    }

    /// Returns `true` when the instance reports the `running` state.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Single "create instance" call.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunInstancesRequest {
    /// Machine image to boot.
    pub image_id: String,
    /// Size class.
    pub instance_type: String,
    /// Always one.
    pub min_count: u32,
    /// Always one.
    pub max_count: u32,
    /// Instance profile carrying the execution role.
    pub iam_instance_profile: IamInstanceProfileSpec,
    /// Security groups by name (default VPC launches only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    /// Security groups by identifier (subnet launches).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
    /// Target subnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    /// Availability zone and placement group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    /// Boot volume override.
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    /// Base64 encoded user data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Tags applied at creation.
    pub tag_specifications: Vec<TagSpecification>,
}

/// Instance profile reference.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IamInstanceProfileSpec {
    /// Profile name.
    pub name: String,
}

/// Placement section of a launch call.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Placement {
    /// Availability zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Placement group name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// Block device override.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockDeviceMapping {
    /// Device name taken from the image's root device.
    pub device_name: String,
    /// Volume parameters.
    pub ebs: EbsVolume,
}

/// Block storage parameters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EbsVolume {
    /// Size in GiB.
    pub volume_size: u32,
    /// Volume type (for example `gp3`).
    pub volume_type: String,
    /// Remove the volume with the instance.
    pub delete_on_termination: bool,
}

/// Tags applied to a resource type at creation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagSpecification {
    /// Resource type (`instance`, `volume`).
    pub resource_type: String,
    /// Tags to apply.
    pub tags: Vec<Tag>,
}

/// Key/value tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Builds a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Status of a dispatched remote command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvocationStatus {
    /// Queued on the provider side.
    Pending,
    /// Running on the instance.
    InProgress,
    /// Delivery delayed by the agent.
    Delayed,
    /// Finished with a zero exit code.
    Success,
    /// Finished with a non-zero exit code.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Cancellation in progress.
    Cancelling,
    /// The provider gave up waiting for the command.
    TimedOut,
}

impl InvocationStatus {
    /// Parses the provider spelling; unknown values count as pending.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "InProgress" => Self::InProgress,
            "Delayed" => Self::Delayed,
            "Success" => Self::Success,
            "Failed" => Self::Failed,
            "Cancelled" => Self::Cancelled,
            "Cancelling" => Self::Cancelling,
            "TimedOut" => Self::TimedOut,
            _ => Self::Pending,
        }
    }

    /// Returns `true` for states that will not change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Output and status of one remote command invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvocationSnapshot {
    /// Current status.
    pub status: InvocationStatus,
    /// Standard output captured so far.
    pub stdout: String,
    /// Standard error captured so far.
    pub stderr: String,
}

/// Image stored in a container registry repository.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryImage {
    /// Content digest (`sha256:...`).
    pub digest: String,
    /// Tags pointing at the digest.
    pub tags: Vec<String>,
    /// Push timestamp.
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Reference to a registry image for deletion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryImageRef {
    /// Content digest.
    pub image_digest: String,
}

/// One image the registry refused to delete.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageDeleteFailure {
    /// Digest of the image, when reported.
    pub digest: Option<String>,
    /// Failure code (for example `ImageReferencedByManifestList`).
    pub code: String,
    /// Human readable reason.
    pub reason: String,
}

/// Outcome of a batch image deletion.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchDeleteOutcome {
    /// Number of images deleted.
    pub deleted: usize,
    /// Images that could not be deleted.
    pub failures: Vec<ImageDeleteFailure>,
}

/// Container registry repository.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RepositoryInfo {
    /// Repository name.
    pub name: String,
    /// Push address, `<registry host>/<name>`.
    pub uri: String,
}

/// Short-lived registry login.
#[derive(Clone, Eq, PartialEq)]
pub struct RegistryToken {
    /// Base64 encoded `user:password` pair.
    pub token: String,
    /// Registry endpoint, usually with an `https://` scheme.
    pub endpoint: String,
    /// Absolute expiry, when reported.
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryToken")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Parameters for assuming a role.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssumeRoleRequest {
    /// Role to assume.
    pub role_arn: String,
    /// Session name recorded by the provider.
    pub session_name: String,
    /// Optional external identifier required by the trust policy.
    pub external_id: Option<String>,
    /// Requested session lifetime in seconds.
    pub duration_secs: u32,
}

/// Temporary credentials returned by assume-role.
#[derive(Clone, Eq, PartialEq)]
pub struct AssumedCredentials {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// Absolute expiry.
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for AssumedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssumedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Identity of the credentials in use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallerIdentity {
    /// Account of the caller.
    pub account: String,
    /// ARN of the caller.
    pub arn: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("123456789012", true)]
    #[case("12345678901", false)]
    #[case("1234567890123", false)]
    #[case("12345678901a", false)]
    #[case("", false)]
    fn account_ids_are_twelve_digits(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_account_id(value), expected);
    }

    #[rstest]
    #[case(
        Some("ec2-1-2-3-4.compute.amazonaws.com"),
        Some("1.2.3.4"),
        Some("ec2-1-2-3-4.compute.amazonaws.com")
    )]
    #[case(Some(""), Some("1.2.3.4"), Some("1.2.3.4"))]
    #[case(None, None, None)]
    fn address_prefers_dns(
        #[case] dns: Option<&str>,
        #[case] ip: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let info = InstanceInfo {
            id: String::from("i-1"),
            state: String::from("running"),
            public_dns: dns.map(str::to_owned),
            public_ip: ip.map(str::to_owned),
            instance_type: String::from("t3.micro"),
            name: None,
            launch_time: None,
        };
        assert_eq!(info.address(), expected);
    }

    #[test]
    fn run_request_serialises_pascal_case_without_empty_sections() {
        let request = RunInstancesRequest {
            image_id: String::from("ami-1"),
            instance_type: String::from("t3.micro"),
            min_count: 1,
            max_count: 1,
            iam_instance_profile: IamInstanceProfileSpec {
                name: String::from("profile"),
            },
            security_groups: vec![String::from("skiff-egress-only")],
            security_group_ids: Vec::new(),
            subnet_id: None,
            placement: Some(Placement {
                availability_zone: Some(String::from("us-east-2a")),
                group_name: Some(String::from("skiff-cluster")),
            }),
            block_device_mappings: Vec::new(),
            user_data: None,
            tag_specifications: Vec::new(),
        };
        let json = serde_json::to_value(&request).expect("serialise request");
        assert_eq!(json["ImageId"], "ami-1");
        assert_eq!(json["Placement"]["GroupName"], "skiff-cluster");
        assert_eq!(json["Placement"]["AvailabilityZone"], "us-east-2a");
        assert_eq!(json["SecurityGroups"][0], "skiff-egress-only");
        assert!(json.get("SecurityGroupIds").is_none());
        assert!(json.get("SubnetId").is_none());
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = AssumedCredentials {
            access_key_id: String::from("ASIAEXAMPLE"),
            secret_access_key: String::from("super-secret"),
            session_token: String::from("token-value"),
            expiration: DateTime::<Utc>::UNIX_EPOCH,
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("ASIAEXAMPLE"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("token-value"));
    }
}
