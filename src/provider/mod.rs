//! Capability interfaces consumed from the cloud provider.
//!
//! Each trait covers one provider service. Probe operations return
//! `Ok(None)` when the resource does not exist so callers can branch on
//! presence without inspecting error codes; every other failure surfaces as
//! a classified [`ProviderError`].

mod error;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;

pub use error::{ProviderError, ProviderErrorKind};
pub use types::{
    Architecture, AssumeRoleRequest, AssumedCredentials, BatchDeleteOutcome, BlockDeviceMapping,
    CallerIdentity, EbsVolume, IamInstanceProfileSpec, ImageDeleteFailure, ImageInfo, ImageQuery,
    InstanceInfo, InstanceProfileInfo, InvocationSnapshot, InvocationStatus, MANAGED_TAG_KEY,
    MANAGED_TAG_VALUE, Placement, PlacementGroupInfo, RegistryImage, RegistryImageRef,
    RegistryToken, RepositoryInfo, RoleInfo, RunInstancesRequest, SecurityGroupInfo, SubnetInfo,
    Tag, TagSpecification, is_account_id,
};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Role, policy and instance profile management.
pub trait IdentityApi: Send + Sync {
    /// Reads a role by name.
    fn get_role<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<RoleInfo>>;

    /// Creates a role with the given trust policy.
    fn create_role<'a>(
        &'a self,
        name: &'a str,
        trust_policy: &'a serde_json::Value,
    ) -> ProviderFuture<'a, RoleInfo>;

    /// Replaces the trust policy of an existing role.
    fn update_trust_policy<'a>(
        &'a self,
        name: &'a str,
        trust_policy: &'a serde_json::Value,
    ) -> ProviderFuture<'a, ()>;

    /// Lists the ARNs of managed policies attached to a role.
    fn list_attached_policies<'a>(&'a self, role: &'a str) -> ProviderFuture<'a, Vec<String>>;

    /// Attaches a managed policy to a role.
    fn attach_policy<'a>(&'a self, role: &'a str, policy_arn: &'a str) -> ProviderFuture<'a, ()>;

    /// Reads an instance profile by name.
    fn get_instance_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceProfileInfo>>;

    /// Creates an empty instance profile.
    fn create_instance_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, InstanceProfileInfo>;

    /// Binds a role to an instance profile.
    fn add_role_to_instance_profile<'a>(
        &'a self,
        profile: &'a str,
        role: &'a str,
    ) -> ProviderFuture<'a, ()>;

    /// Unbinds a role from an instance profile.
    fn remove_role_from_instance_profile<'a>(
        &'a self,
        profile: &'a str,
        role: &'a str,
    ) -> ProviderFuture<'a, ()>;
}

/// Networking, image and instance lifecycle management.
pub trait ComputeApi: Send + Sync {
    /// Reads a security group by name, optionally scoped to a VPC.
    fn describe_security_group<'a>(
        &'a self,
        name: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProviderFuture<'a, Option<SecurityGroupInfo>>;

    /// Creates a security group and returns its identifier.
    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProviderFuture<'a, String>;

    /// Revokes the given inbound permission entries.
    fn revoke_ingress<'a>(
        &'a self,
        group_id: &'a str,
        permissions: &'a [serde_json::Value],
    ) -> ProviderFuture<'a, ()>;

    /// Reads a placement group by name.
    fn describe_placement_group<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<PlacementGroupInfo>>;

    /// Creates a placement group with the given strategy.
    fn create_placement_group<'a>(
        &'a self,
        name: &'a str,
        strategy: &'a str,
    ) -> ProviderFuture<'a, ()>;

    /// Reads a machine image by identifier.
    fn describe_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, Option<ImageInfo>>;

    /// Lists images matching a filter.
    fn find_images<'a>(&'a self, query: &'a ImageQuery) -> ProviderFuture<'a, Vec<ImageInfo>>;

    /// Lists the availability zones offering a size class in the region.
    fn instance_type_zones<'a>(&'a self, instance_type: &'a str)
    -> ProviderFuture<'a, Vec<String>>;

    /// Reads a subnet by identifier.
    fn describe_subnet<'a>(&'a self, subnet_id: &'a str)
    -> ProviderFuture<'a, Option<SubnetInfo>>;

    /// Submits a create-instance call and returns the new instance id.
    fn run_instance<'a>(&'a self, request: &'a RunInstancesRequest) -> ProviderFuture<'a, String>;

    /// Reads an instance by identifier.
    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceInfo>>;

    /// Requests termination of an instance.
    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Lists live instances carrying the given tag.
    fn list_tagged_instances<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceInfo>>;
}

/// Asynchronous remote command dispatch.
pub trait CommandApi: Send + Sync {
    /// Dispatches a shell script and returns the command handle.
    fn send_command<'a>(
        &'a self,
        instance_id: &'a str,
        script: &'a str,
        timeout_secs: u64,
    ) -> ProviderFuture<'a, String>;

    /// Reads the status and output of a dispatched command.
    fn get_invocation<'a>(
        &'a self,
        command_id: &'a str,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, InvocationSnapshot>;
}

/// Container registry queries.
pub trait RegistryApi: Send + Sync {
    /// Reads a repository by name.
    fn describe_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, Option<RepositoryInfo>>;

    /// Creates a repository with mutable tags and scan-on-push enabled.
    fn create_repository<'a>(&'a self, repository: &'a str)
    -> ProviderFuture<'a, RepositoryInfo>;

    /// Issues a login token for the caller's registry.
    fn authorization_token(&self) -> ProviderFuture<'_, RegistryToken>;

    /// Lists the images stored in a repository.
    fn list_images<'a>(&'a self, repository: &'a str)
    -> ProviderFuture<'a, Vec<RegistryImage>>;

    /// Deletes the referenced images from a repository.
    fn batch_delete_images<'a>(
        &'a self,
        repository: &'a str,
        images: &'a [RegistryImageRef],
    ) -> ProviderFuture<'a, BatchDeleteOutcome>;
}

/// Object storage used to stage file transfers.
pub trait StorageApi: Send + Sync {
    /// Returns `true` when the bucket exists and is visible to the caller.
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> ProviderFuture<'a, bool>;

    /// Creates a bucket in the session region.
    fn create_bucket<'a>(&'a self, bucket: &'a str) -> ProviderFuture<'a, ()>;

    /// Replaces the bucket lifecycle with one rule expiring every object
    /// after `days`.
    fn put_expiration_rule<'a>(&'a self, bucket: &'a str, days: u32) -> ProviderFuture<'a, ()>;

    /// Uploads a local file as `key`.
    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        source: &'a Utf8Path,
    ) -> ProviderFuture<'a, ()>;

    /// Downloads `key` into a local file.
    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        destination: &'a Utf8Path,
    ) -> ProviderFuture<'a, ()>;

    /// Deletes `key`. Deleting a missing key succeeds.
    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> ProviderFuture<'a, ()>;

    /// Returns a URL that reads `key` without credentials until it expires.
    fn presign_get<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        expires_in: Duration,
    ) -> ProviderFuture<'a, String>;
}

/// Identity broker used for cross-account trust.
pub trait StsApi: Send + Sync {
    /// Assumes a role and returns temporary credentials.
    fn assume_role<'a>(
        &'a self,
        request: &'a AssumeRoleRequest,
    ) -> ProviderFuture<'a, AssumedCredentials>;

    /// Reports the identity of the credentials in use.
    fn caller_identity(&self) -> ProviderFuture<'_, CallerIdentity>;
}

/// Every capability the control plane needs from one provider session.
pub trait CloudProvider:
    IdentityApi + ComputeApi + CommandApi + RegistryApi + StorageApi + StsApi
{
}

impl<T> CloudProvider for T where
    T: IdentityApi + ComputeApi + CommandApi + RegistryApi + StorageApi + StsApi
{
}
