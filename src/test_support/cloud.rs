//! In-memory provider implementing every capability interface.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use chrono::{DateTime, Duration, Utc};

use crate::local_fs::open_parent;

use crate::provider::{
    AssumeRoleRequest, AssumedCredentials, BatchDeleteOutcome, CallerIdentity, CommandApi,
    ComputeApi, IdentityApi, ImageDeleteFailure, ImageInfo, ImageQuery, InstanceInfo,
    InstanceProfileInfo, InvocationSnapshot, InvocationStatus, PlacementGroupInfo,
    ProviderError, ProviderFuture, RegistryApi, RegistryImage, RegistryImageRef, RegistryToken,
    RepositoryInfo, RoleInfo, RunInstancesRequest, SecurityGroupInfo, StorageApi, StsApi,
    SubnetInfo,
};

/// Provider operations that change state.
const MUTATING_OPERATIONS: &[&str] = &[
    "create_role",
    "update_trust_policy",
    "attach_policy",
    "create_instance_profile",
    "add_role_to_instance_profile",
    "remove_role_from_instance_profile",
    "create_security_group",
    "revoke_ingress",
    "create_placement_group",
    "run_instance",
    "terminate_instance",
    "send_command",
    "create_repository",
    "batch_delete_images",
    "create_bucket",
    "put_expiration_rule",
    "put_object",
    "delete_object",
];

/// How a dispatched command behaves.
#[derive(Clone, Debug)]
pub enum CommandOutcome {
    /// Finishes with status `Success`.
    Succeed {
        /// Captured stdout.
        stdout: String,
    },
    /// Finishes with status `Failed`.
    Fail {
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Stays `InProgress` forever.
    Hang,
    /// Dispatch itself is rejected.
    Reject(ProviderError),
}

impl CommandOutcome {
    /// Successful command printing `stdout`.
    #[must_use]
    pub fn succeed(stdout: impl Into<String>) -> Self {
        Self::Succeed {
            stdout: stdout.into(),
        }
    }

    /// Failed command printing `stdout` and `stderr`.
    #[must_use]
    pub fn fail(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Fail {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Script dispatched through [`CommandApi::send_command`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchedCommand {
    /// Command handle returned to the caller.
    pub command_id: String,
    /// Target instance.
    pub instance_id: String,
    /// Shell script text.
    pub script: String,
}

#[derive(Debug)]
struct FakeInstance {
    info: InstanceInfo,
    tags: Vec<(String, String)>,
    describes_until_running: u32,
    describes_until_address: u32,
}

#[derive(Debug, Default)]
struct FakeRepository {
    images: Vec<RegistryImage>,
    blocked: BTreeMap<String, (String, u32)>,
}

#[derive(Debug, Default)]
struct FakeBucket {
    expiration_days: Option<u32>,
    objects: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FakeState {
    region: String,
    account: String,
    roles: BTreeMap<String, RoleInfo>,
    attached: BTreeMap<String, Vec<String>>,
    profiles: BTreeMap<String, InstanceProfileInfo>,
    security_groups: Vec<SecurityGroupInfo>,
    placement_groups: BTreeMap<String, PlacementGroupInfo>,
    images: Vec<ImageInfo>,
    offerings: BTreeMap<String, Vec<String>>,
    subnets: BTreeMap<String, SubnetInfo>,
    instances: BTreeMap<String, FakeInstance>,
    launches: Vec<RunInstancesRequest>,
    terminations: Vec<String>,
    command_rules: Vec<(String, CommandOutcome)>,
    dispatched: Vec<DispatchedCommand>,
    invocations: HashMap<String, InvocationSnapshot>,
    repositories: BTreeMap<String, FakeRepository>,
    buckets: BTreeMap<String, FakeBucket>,
    remote_files: Vec<(String, Vec<u8>)>,
    assume_results: VecDeque<Result<AssumedCredentials, ProviderError>>,
    assume_requests: Vec<AssumeRoleRequest>,
    caller: Option<CallerIdentity>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<ProviderError>>,
    hidden: BTreeMap<String, u32>,
    visibility_lag: u32,
    boot_delay: u32,
    address_delay: u32,
    next_id: u32,
}

impl FakeState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Returns `true` while a freshly created resource is still hidden.
    fn is_hidden(&mut self, key: &str) -> bool {
        match self.hidden.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn hide(&mut self, key: String) {
        if self.visibility_lag > 0 {
            self.hidden.insert(key, self.visibility_lag);
        }
    }

    fn default_zones(&self) -> Vec<String> {
        ["a", "b", "c"]
            .iter()
            .map(|suffix| format!("{}{suffix}", self.region))
            .collect()
    }
}

/// In-memory cloud used by unit and integration tests.
///
/// Every capability call is recorded by operation name. Failures can be
/// injected per operation with [`FakeCloud::fail_next`], newly created
/// resources can be made to lag behind their creation with
/// [`FakeCloud::set_visibility_lag`], and commands are scripted by matching
/// a substring of the dispatched script.
#[derive(Clone, Debug)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new("us-east-1")
    }
}

impl FakeCloud {
    /// Account identifier reported by the default caller identity.
    pub const ACCOUNT: &'static str = "123456789012";

    /// Creates an empty cloud for `region`.
    #[must_use]
    pub fn new(region: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                region: region.to_owned(),
                account: Self::ACCOUNT.to_owned(),
                ..FakeState::default()
            })),
        }
    }

    /// Creates a cloud preloaded with one CPU and one GPU image per
    /// architecture.
    #[must_use]
    pub fn with_standard_images(region: &str) -> Self {
        let cloud = Self::new(region);
        cloud.add_image(
            "ami-cpu-x86-old",
            "al2023-ami-2023.5.20240701.0-kernel-6.1-x86_64",
            "x86_64",
            "2024-07-01T00:00:00.000Z",
        );
        cloud.add_image(
            "ami-cpu-x86",
            "al2023-ami-2023.6.20250101.0-kernel-6.1-x86_64",
            "x86_64",
            "2025-01-01T00:00:00.000Z",
        );
        cloud.add_image(
            "ami-cpu-arm",
            "al2023-ami-2023.6.20250101.0-kernel-6.1-arm64",
            "arm64",
            "2025-01-01T00:00:00.000Z",
        );
        cloud.add_image(
            "ami-gpu-x86",
            "Deep Learning Base OSS Nvidia Driver GPU AMI (Amazon Linux 2023) 20250101",
            "x86_64",
            "2025-01-01T00:00:00.000Z",
        );
        cloud.add_image(
            "ami-gpu-arm",
            "Deep Learning ARM64 Base OSS Nvidia Driver GPU AMI (Amazon Linux 2023) 20250101",
            "arm64",
            "2025-01-01T00:00:00.000Z",
        );
        cloud
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a call and returns any injected failure for it.
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, FakeState>, ProviderError> {
        let mut state = self.state();
        state.calls.push(operation.to_owned());
        if let Some(err) = state
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(state)
    }

    // ----- seeding -----

    /// Makes the next call of `operation` fail with `err`. Repeated calls
    /// queue several failures.
    pub fn fail_next(&self, operation: &str, err: ProviderError) {
        self.state()
            .failures
            .entry(operation.to_owned())
            .or_default()
            .push_back(err);
    }

    /// Hides newly created resources from the next `probes` reads.
    pub fn set_visibility_lag(&self, probes: u32) {
        self.state().visibility_lag = probes;
    }

    /// Keeps launched instances `pending` for the first `describes` reads.
    pub fn set_boot_delay(&self, describes: u32) {
        self.state().boot_delay = describes;
    }

    /// Withholds the public address of running instances for `describes`
    /// reads.
    pub fn set_address_delay(&self, describes: u32) {
        self.state().address_delay = describes;
    }

    /// Adds an existing role.
    pub fn add_role(&self, name: &str, trust_policy: serde_json::Value) {
        let mut state = self.state();
        let arn = format!("arn:aws:iam::{}:role/{name}", state.account);
        state.roles.insert(
            name.to_owned(),
            RoleInfo {
                name: name.to_owned(),
                arn,
                trust_policy,
            },
        );
    }

    /// Attaches policies to an existing role.
    pub fn attach_existing_policies(&self, role: &str, policies: &[&str]) {
        self.state()
            .attached
            .entry(role.to_owned())
            .or_default()
            .extend(policies.iter().map(|policy| (*policy).to_owned()));
    }

    /// Adds an existing instance profile bound to `roles`.
    pub fn add_instance_profile(&self, name: &str, roles: &[&str]) {
        let mut state = self.state();
        let arn = format!("arn:aws:iam::{}:instance-profile/{name}", state.account);
        state.profiles.insert(
            name.to_owned(),
            InstanceProfileInfo {
                name: name.to_owned(),
                arn,
                roles: roles.iter().map(|role| (*role).to_owned()).collect(),
            },
        );
    }

    /// Adds an existing security group and returns its identifier.
    pub fn add_security_group(
        &self,
        name: &str,
        vpc_id: Option<&str>,
        ingress: Vec<serde_json::Value>,
    ) -> String {
        let mut state = self.state();
        let id = format!("sg-{:08x}", state.next_id());
        state.security_groups.push(SecurityGroupInfo {
            id: id.clone(),
            name: name.to_owned(),
            vpc_id: vpc_id.map(str::to_owned),
            ingress,
        });
        id
    }

    /// Hides an existing security group from the next `probes` reads, as
    /// if a concurrent creator had just made it.
    pub fn conceal_security_group(&self, name: &str, probes: u32) {
        self.state().hidden.insert(format!("sg:{name}"), probes);
    }

    /// Adds an existing placement group.
    pub fn add_placement_group(&self, name: &str, strategy: &str) {
        self.state().placement_groups.insert(
            name.to_owned(),
            PlacementGroupInfo {
                name: name.to_owned(),
                strategy: strategy.to_owned(),
                state: String::from("available"),
            },
        );
    }

    /// Adds a public machine image owned by `amazon`.
    pub fn add_image(&self, id: &str, name: &str, architecture: &str, creation_date: &str) {
        self.state().images.push(ImageInfo {
            id: id.to_owned(),
            name: name.to_owned(),
            root_device_name: String::from("/dev/xvda"),
            creation_date: creation_date.to_owned(),
            architecture: architecture.to_owned(),
        });
    }

    /// Restricts the zones offering `instance_type`; an empty list means
    /// the size class is not offered in the region.
    pub fn set_offerings(&self, instance_type: &str, zones: &[&str]) {
        self.state().offerings.insert(
            instance_type.to_owned(),
            zones.iter().map(|zone| (*zone).to_owned()).collect(),
        );
    }

    /// Adds a subnet.
    pub fn add_subnet(&self, id: &str, vpc_id: &str, availability_zone: &str) {
        self.state().subnets.insert(
            id.to_owned(),
            SubnetInfo {
                id: id.to_owned(),
                vpc_id: vpc_id.to_owned(),
                availability_zone: availability_zone.to_owned(),
            },
        );
    }

    /// Creates an empty registry repository.
    pub fn add_repository(&self, repository: &str) {
        self.state()
            .repositories
            .entry(repository.to_owned())
            .or_default();
    }

    /// Stores an image in a registry repository, creating it if needed.
    pub fn add_registry_image(
        &self,
        repository: &str,
        digest: &str,
        tags: &[&str],
        pushed_at: Option<DateTime<Utc>>,
    ) {
        self.state()
            .repositories
            .entry(repository.to_owned())
            .or_default()
            .images
            .push(RegistryImage {
                digest: digest.to_owned(),
                tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
                pushed_at,
            });
    }

    /// Makes deleting `digest` fail with `code` for the next `rounds`
    /// batch deletions.
    pub fn block_image_deletion(&self, repository: &str, digest: &str, code: &str, rounds: u32) {
        self.state()
            .repositories
            .entry(repository.to_owned())
            .or_default()
            .blocked
            .insert(digest.to_owned(), (code.to_owned(), rounds));
    }

    /// Creates an empty storage bucket.
    pub fn add_bucket(&self, bucket: &str) {
        self.state().buckets.entry(bucket.to_owned()).or_default();
    }

    /// Makes successful commands that mention `path` and an `s3://` target
    /// store `contents` at that target, as the instance's copy would.
    pub fn serve_remote_file(&self, path: &str, contents: &[u8]) {
        self.state()
            .remote_files
            .push((path.to_owned(), contents.to_vec()));
    }

    /// Scripts commands whose text contains `needle`. Earlier rules win.
    pub fn on_command(&self, needle: &str, outcome: CommandOutcome) {
        self.state()
            .command_rules
            .push((needle.to_owned(), outcome));
    }

    /// Queues the outcome of the next assume-role call. Once the queue is
    /// empty, calls succeed with one-hour credentials.
    pub fn push_assume_role(&self, result: Result<AssumedCredentials, ProviderError>) {
        self.state().assume_results.push_back(result);
    }

    /// Overrides the caller identity.
    pub fn set_caller_identity(&self, account: &str, arn: &str) {
        self.state().caller = Some(CallerIdentity {
            account: account.to_owned(),
            arn: arn.to_owned(),
        });
    }

    // ----- inspection -----

    /// Every call made so far, by operation name.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls that change provider state.
    #[must_use]
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| MUTATING_OPERATIONS.contains(&call.as_str()))
            .collect()
    }

    /// Index of the first call to `operation`, if made.
    #[must_use]
    pub fn position(&self, operation: &str) -> Option<usize> {
        self.state().calls.iter().position(|call| call == operation)
    }

    /// Launch requests submitted so far.
    #[must_use]
    pub fn launches(&self) -> Vec<RunInstancesRequest> {
        self.state().launches.clone()
    }

    /// Instances whose termination was requested.
    #[must_use]
    pub fn terminations(&self) -> Vec<String> {
        self.state().terminations.clone()
    }

    /// Commands dispatched so far.
    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchedCommand> {
        self.state().dispatched.clone()
    }

    /// Assume-role requests received so far.
    #[must_use]
    pub fn assume_role_requests(&self) -> Vec<AssumeRoleRequest> {
        self.state().assume_requests.clone()
    }

    /// Current state of a role.
    #[must_use]
    pub fn role(&self, name: &str) -> Option<RoleInfo> {
        self.state().roles.get(name).cloned()
    }

    /// Policies attached to a role.
    #[must_use]
    pub fn attached_policies(&self, role: &str) -> Vec<String> {
        self.state().attached.get(role).cloned().unwrap_or_default()
    }

    /// Current state of an instance profile.
    #[must_use]
    pub fn instance_profile(&self, name: &str) -> Option<InstanceProfileInfo> {
        self.state().profiles.get(name).cloned()
    }

    /// Current state of a security group.
    #[must_use]
    pub fn security_group(&self, name: &str) -> Option<SecurityGroupInfo> {
        self.state()
            .security_groups
            .iter()
            .find(|group| group.name == name)
            .cloned()
    }

    /// Current state of a placement group.
    #[must_use]
    pub fn placement_group(&self, name: &str) -> Option<PlacementGroupInfo> {
        self.state().placement_groups.get(name).cloned()
    }

    /// Current state of an instance.
    #[must_use]
    pub fn instance(&self, id: &str) -> Option<InstanceInfo> {
        self.state()
            .instances
            .get(id)
            .map(|instance| instance.info.clone())
    }

    /// Returns `true` when the registry holds `repository`.
    #[must_use]
    pub fn has_repository(&self, repository: &str) -> bool {
        self.state().repositories.contains_key(repository)
    }

    /// Returns `true` when storage holds `bucket`.
    #[must_use]
    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state().buckets.contains_key(bucket)
    }

    /// Expiry rule of a bucket, in days.
    #[must_use]
    pub fn bucket_expiration(&self, bucket: &str) -> Option<u32> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|stored| stored.expiration_days)
    }

    /// Keys currently stored in a bucket.
    #[must_use]
    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|stored| stored.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Contents of a stored object.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|stored| stored.objects.get(key).cloned())
    }

    /// Digests still stored in a repository.
    #[must_use]
    pub fn registry_digests(&self, repository: &str) -> Vec<String> {
        self.state()
            .repositories
            .get(repository)
            .map(|repo| repo.images.iter().map(|image| image.digest.clone()).collect())
            .unwrap_or_default()
    }
}

/// Matches `value` against a pattern where `*` matches any run of
/// characters.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return value.is_empty();
    };
    let Some(mut rest) = value.strip_prefix(first) else {
        return false;
    };
    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(index) => rest = rest.get(index + part.len()..).unwrap_or_default(),
            None => return false,
        }
    }
    rest.ends_with(last)
}

fn not_found(code: &str, message: String) -> ProviderError {
    ProviderError::new(code, message)
}

fn ready<'a, T: Send + 'a>(result: Result<T, ProviderError>) -> ProviderFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

impl IdentityApi for FakeCloud {
    fn get_role<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<RoleInfo>> {
        ready(self.enter("get_role").map(|mut state| {
            if state.is_hidden(&format!("role:{name}")) {
                return None;
            }
            state.roles.get(name).cloned()
        }))
    }

    fn create_role<'a>(
        &'a self,
        name: &'a str,
        trust_policy: &'a serde_json::Value,
    ) -> ProviderFuture<'a, RoleInfo> {
        ready(self.enter("create_role").and_then(|mut state| {
            if state.roles.contains_key(name) {
                return Err(ProviderError::new(
                    "EntityAlreadyExists",
                    format!("Role with name {name} already exists."),
                ));
            }
            let role = RoleInfo {
                name: name.to_owned(),
                arn: format!("arn:aws:iam::{}:role/{name}", state.account),
                trust_policy: trust_policy.clone(),
            };
            state.roles.insert(name.to_owned(), role.clone());
            state.hide(format!("role:{name}"));
            Ok(role)
        }))
    }

    fn update_trust_policy<'a>(
        &'a self,
        name: &'a str,
        trust_policy: &'a serde_json::Value,
    ) -> ProviderFuture<'a, ()> {
        ready(self.enter("update_trust_policy").and_then(|mut state| {
            let role = state.roles.get_mut(name).ok_or_else(|| {
                not_found("NoSuchEntity", format!("The role with name {name} cannot be found."))
            })?;
            role.trust_policy = trust_policy.clone();
            Ok(())
        }))
    }

    fn list_attached_policies<'a>(&'a self, role: &'a str) -> ProviderFuture<'a, Vec<String>> {
        ready(
            self.enter("list_attached_policies")
                .map(|state| state.attached.get(role).cloned().unwrap_or_default()),
        )
    }

    fn attach_policy<'a>(&'a self, role: &'a str, policy_arn: &'a str) -> ProviderFuture<'a, ()> {
        ready(self.enter("attach_policy").map(|mut state| {
            let attached = state.attached.entry(role.to_owned()).or_default();
            if !attached.iter().any(|arn| arn == policy_arn) {
                attached.push(policy_arn.to_owned());
            }
        }))
    }

    fn get_instance_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceProfileInfo>> {
        ready(self.enter("get_instance_profile").map(|mut state| {
            if state.is_hidden(&format!("profile:{name}")) {
                return None;
            }
            state.profiles.get(name).cloned()
        }))
    }

    fn create_instance_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, InstanceProfileInfo> {
        ready(self.enter("create_instance_profile").and_then(|mut state| {
            if state.profiles.contains_key(name) {
                return Err(ProviderError::new(
                    "EntityAlreadyExists",
                    format!("Instance Profile {name} already exists."),
                ));
            }
            let profile = InstanceProfileInfo {
                name: name.to_owned(),
                arn: format!("arn:aws:iam::{}:instance-profile/{name}", state.account),
                roles: Vec::new(),
            };
            state.profiles.insert(name.to_owned(), profile.clone());
            state.hide(format!("profile:{name}"));
            Ok(profile)
        }))
    }

    fn add_role_to_instance_profile<'a>(
        &'a self,
        profile: &'a str,
        role: &'a str,
    ) -> ProviderFuture<'a, ()> {
        ready(self.enter("add_role_to_instance_profile").and_then(|mut state| {
            let entry = state.profiles.get_mut(profile).ok_or_else(|| {
                not_found("NoSuchEntity", format!("Instance Profile {profile} cannot be found."))
            })?;
            if !entry.roles.is_empty() {
                return Err(ProviderError::new(
                    "LimitExceeded",
                    "Cannot exceed quota for InstanceSessionsPerInstanceProfile: 1",
                ));
            }
            entry.roles.push(role.to_owned());
            Ok(())
        }))
    }

    fn remove_role_from_instance_profile<'a>(
        &'a self,
        profile: &'a str,
        role: &'a str,
    ) -> ProviderFuture<'a, ()> {
        ready(
            self.enter("remove_role_from_instance_profile")
                .and_then(|mut state| {
                    let entry = state.profiles.get_mut(profile).ok_or_else(|| {
                        not_found(
                            "NoSuchEntity",
                            format!("Instance Profile {profile} cannot be found."),
                        )
                    })?;
                    entry.roles.retain(|bound| bound != role);
                    Ok(())
                }),
        )
    }
}

impl ComputeApi for FakeCloud {
    fn describe_security_group<'a>(
        &'a self,
        name: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProviderFuture<'a, Option<SecurityGroupInfo>> {
        ready(self.enter("describe_security_group").map(|mut state| {
            if state.is_hidden(&format!("sg:{name}")) {
                return None;
            }
            state
                .security_groups
                .iter()
                .find(|group| {
                    group.name == name
                        && vpc_id.is_none_or(|vpc| group.vpc_id.as_deref() == Some(vpc))
                })
                .cloned()
        }))
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        _description: &'a str,
        vpc_id: Option<&'a str>,
    ) -> ProviderFuture<'a, String> {
        ready(self.enter("create_security_group").and_then(|mut state| {
            let duplicate = state
                .security_groups
                .iter()
                .any(|group| group.name == name && group.vpc_id.as_deref() == vpc_id);
            if duplicate {
                return Err(ProviderError::new(
                    "InvalidGroup.Duplicate",
                    format!("The security group '{name}' already exists"),
                ));
            }
            let id = format!("sg-{:08x}", state.next_id());
            state.security_groups.push(SecurityGroupInfo {
                id: id.clone(),
                name: name.to_owned(),
                vpc_id: vpc_id.map(str::to_owned),
                ingress: Vec::new(),
            });
            state.hide(format!("sg:{name}"));
            Ok(id)
        }))
    }

    fn revoke_ingress<'a>(
        &'a self,
        group_id: &'a str,
        _permissions: &'a [serde_json::Value],
    ) -> ProviderFuture<'a, ()> {
        ready(self.enter("revoke_ingress").and_then(|mut state| {
            let group = state
                .security_groups
                .iter_mut()
                .find(|group| group.id == group_id)
                .ok_or_else(|| {
                    not_found(
                        "InvalidGroup.NotFound",
                        format!("The security group '{group_id}' does not exist"),
                    )
                })?;
            group.ingress.clear();
            Ok(())
        }))
    }

    fn describe_placement_group<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<PlacementGroupInfo>> {
        ready(self.enter("describe_placement_group").map(|mut state| {
            if state.is_hidden(&format!("pg:{name}")) {
                return None;
            }
            state.placement_groups.get(name).cloned()
        }))
    }

    fn create_placement_group<'a>(
        &'a self,
        name: &'a str,
        strategy: &'a str,
    ) -> ProviderFuture<'a, ()> {
        ready(self.enter("create_placement_group").and_then(|mut state| {
            if state.placement_groups.contains_key(name) {
                return Err(ProviderError::new(
                    "InvalidPlacementGroup.Duplicate",
                    format!("The Placement Group '{name}' already exists."),
                ));
            }
            state.placement_groups.insert(
                name.to_owned(),
                PlacementGroupInfo {
                    name: name.to_owned(),
                    strategy: strategy.to_owned(),
                    state: String::from("available"),
                },
            );
            state.hide(format!("pg:{name}"));
            Ok(())
        }))
    }

    fn describe_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, Option<ImageInfo>> {
        ready(
            self.enter("describe_image")
                .map(|state| state.images.iter().find(|image| image.id == image_id).cloned()),
        )
    }

    fn find_images<'a>(&'a self, query: &'a ImageQuery) -> ProviderFuture<'a, Vec<ImageInfo>> {
        ready(self.enter("find_images").map(|state| {
            state
                .images
                .iter()
                .filter(|image| {
                    query.owner == "amazon"
                        && image.architecture == query.architecture.as_str()
                        && wildcard_match(&query.name_pattern, &image.name)
                })
                .cloned()
                .collect()
        }))
    }

    fn instance_type_zones<'a>(
        &'a self,
        instance_type: &'a str,
    ) -> ProviderFuture<'a, Vec<String>> {
        ready(self.enter("instance_type_zones").map(|state| {
            state
                .offerings
                .get(instance_type)
                .cloned()
                .unwrap_or_else(|| state.default_zones())
        }))
    }

    fn describe_subnet<'a>(
        &'a self,
        subnet_id: &'a str,
    ) -> ProviderFuture<'a, Option<SubnetInfo>> {
        ready(
            self.enter("describe_subnet")
                .map(|state| state.subnets.get(subnet_id).cloned()),
        )
    }

    fn run_instance<'a>(&'a self, request: &'a RunInstancesRequest) -> ProviderFuture<'a, String> {
        ready(self.enter("run_instance").map(|mut state| {
            let id = format!("i-{:017x}", state.next_id());
            let tags: Vec<(String, String)> = request
                .tag_specifications
                .iter()
                .filter(|spec| spec.resource_type == "instance")
                .flat_map(|spec| spec.tags.iter())
                .map(|tag| (tag.key.clone(), tag.value.clone()))
                .collect();
            let name = tags
                .iter()
                .find(|(key, _)| key == "Name")
                .map(|(_, value)| value.clone());
            let instance = FakeInstance {
                info: InstanceInfo {
                    id: id.clone(),
                    state: String::from("pending"),
                    public_dns: None,
                    public_ip: None,
                    instance_type: request.instance_type.clone(),
                    name,
                    launch_time: Some(String::from("2025-01-01T00:00:00+00:00")),
                },
                tags,
                describes_until_running: state.boot_delay,
                describes_until_address: state.address_delay,
            };
            state.instances.insert(id.clone(), instance);
            state.launches.push(request.clone());
            id
        }))
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceInfo>> {
        ready(self.enter("describe_instance").map(|mut state| {
            let instance = state.instances.get_mut(instance_id)?;
            if instance.info.state == "pending" {
                if instance.describes_until_running > 0 {
                    instance.describes_until_running -= 1;
                } else {
                    instance.info.state = String::from("running");
                }
            }
            if instance.info.is_running() && instance.info.public_dns.is_none() {
                if instance.describes_until_address > 0 {
                    instance.describes_until_address -= 1;
                } else {
                    let host = instance.info.id.trim_start_matches("i-").to_owned();
                    instance.info.public_dns = Some(format!("ec2-{host}.compute.amazonaws.com"));
                    instance.info.public_ip = Some(String::from("203.0.113.10"));
                }
            }
            Some(instance.info.clone())
        }))
    }

    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        ready(self.enter("terminate_instance").and_then(|mut state| {
            state.terminations.push(instance_id.to_owned());
            let instance = state.instances.get_mut(instance_id).ok_or_else(|| {
                not_found(
                    "InvalidInstanceID.NotFound",
                    format!("The instance ID '{instance_id}' does not exist"),
                )
            })?;
            instance.info.state = String::from("terminated");
            Ok(())
        }))
    }

    fn list_tagged_instances<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, Vec<InstanceInfo>> {
        ready(self.enter("list_tagged_instances").map(|state| {
            state
                .instances
                .values()
                .filter(|instance| {
                    instance.info.state != "terminated"
                        && instance
                            .tags
                            .iter()
                            .any(|(tag_key, tag_value)| tag_key == key && tag_value == value)
                })
                .map(|instance| instance.info.clone())
                .collect()
        }))
    }
}

impl CommandApi for FakeCloud {
    fn send_command<'a>(
        &'a self,
        instance_id: &'a str,
        script: &'a str,
        _timeout_secs: u64,
    ) -> ProviderFuture<'a, String> {
        ready(self.enter("send_command").and_then(|mut state| {
            let outcome = state
                .command_rules
                .iter()
                .find(|(needle, _)| script.contains(needle.as_str()))
                .map_or_else(|| CommandOutcome::succeed(""), |(_, outcome)| outcome.clone());
            let snapshot = match outcome {
                CommandOutcome::Reject(err) => return Err(err),
                CommandOutcome::Succeed { stdout } => InvocationSnapshot {
                    status: InvocationStatus::Success,
                    stdout,
                    stderr: String::new(),
                },
                CommandOutcome::Fail { stdout, stderr } => InvocationSnapshot {
                    status: InvocationStatus::Failed,
                    stdout,
                    stderr,
                },
                CommandOutcome::Hang => InvocationSnapshot {
                    status: InvocationStatus::InProgress,
                    stdout: String::new(),
                    stderr: String::new(),
                },
            };
            if snapshot.status == InvocationStatus::Success {
                state.stage_remote_files(script);
            }
            let command_id = format!("cmd-{}", state.next_id());
            state.dispatched.push(DispatchedCommand {
                command_id: command_id.clone(),
                instance_id: instance_id.to_owned(),
                script: script.to_owned(),
            });
            state.invocations.insert(command_id.clone(), snapshot);
            Ok(command_id)
        }))
    }

    fn get_invocation<'a>(
        &'a self,
        command_id: &'a str,
        _instance_id: &'a str,
    ) -> ProviderFuture<'a, InvocationSnapshot> {
        ready(self.enter("get_invocation").and_then(|state| {
            state.invocations.get(command_id).cloned().ok_or_else(|| {
                ProviderError::new(
                    "InvocationDoesNotExist",
                    format!("command {command_id} is unknown"),
                )
            })
        }))
    }
}

/// Splits the first `s3://bucket/key` target named in `script`.
fn storage_target(script: &str) -> Option<(String, String)> {
    script.split_whitespace().find_map(|word| {
        let (bucket, key) = word.trim_matches('\'').strip_prefix("s3://")?.split_once('/')?;
        Some((bucket.to_owned(), key.to_owned()))
    })
}

impl FakeState {
    fn stage_remote_files(&mut self, script: &str) {
        let Some((bucket, key)) = storage_target(script) else {
            return;
        };
        let Some(contents) = self
            .remote_files
            .iter()
            .find(|(path, _)| script.contains(path.as_str()))
            .map(|(_, contents)| contents.clone())
        else {
            return;
        };
        if let Some(stored) = self.buckets.get_mut(&bucket) {
            stored.objects.insert(key, contents);
        }
    }

    fn bucket_mut(&mut self, bucket: &str) -> Result<&mut FakeBucket, ProviderError> {
        self.buckets.get_mut(bucket).ok_or_else(|| {
            not_found(
                "NoSuchBucket",
                format!("The specified bucket does not exist: {bucket}"),
            )
        })
    }

    fn repository_info(&self, name: &str) -> RepositoryInfo {
        RepositoryInfo {
            name: name.to_owned(),
            uri: format!("{}.dkr.ecr.{}.amazonaws.com/{name}", self.account, self.region),
        }
    }
}

impl RegistryApi for FakeCloud {
    fn describe_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, Option<RepositoryInfo>> {
        ready(self.enter("describe_repository").map(|state| {
            state
                .repositories
                .contains_key(repository)
                .then(|| state.repository_info(repository))
        }))
    }

    fn create_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, RepositoryInfo> {
        ready(self.enter("create_repository").and_then(|mut state| {
            if state.repositories.contains_key(repository) {
                return Err(ProviderError::new(
                    "RepositoryAlreadyExistsException",
                    format!("The repository with name '{repository}' already exists"),
                ));
            }
            state
                .repositories
                .insert(repository.to_owned(), FakeRepository::default());
            Ok(state.repository_info(repository))
        }))
    }

    fn authorization_token(&self) -> ProviderFuture<'_, RegistryToken> {
        ready(self.enter("authorization_token").map(|state| RegistryToken {
            token: STANDARD.encode("AWS:fake-registry-password"),
            endpoint: format!(
                "https://{}.dkr.ecr.{}.amazonaws.com",
                state.account, state.region
            ),
            expires_at: Some(Utc::now() + Duration::hours(12)),
        }))
    }

    fn list_images<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, Vec<RegistryImage>> {
        ready(self.enter("list_images").and_then(|state| {
            state
                .repositories
                .get(repository)
                .map(|repo| repo.images.clone())
                .ok_or_else(|| {
                    not_found(
                        "RepositoryNotFoundException",
                        format!("The repository with name '{repository}' does not exist"),
                    )
                })
        }))
    }

    fn batch_delete_images<'a>(
        &'a self,
        repository: &'a str,
        images: &'a [RegistryImageRef],
    ) -> ProviderFuture<'a, BatchDeleteOutcome> {
        ready(self.enter("batch_delete_images").and_then(|mut state| {
            let repo = state.repositories.get_mut(repository).ok_or_else(|| {
                not_found(
                    "RepositoryNotFoundException",
                    format!("The repository with name '{repository}' does not exist"),
                )
            })?;
            let mut outcome = BatchDeleteOutcome::default();
            for image in images {
                if let Some((code, rounds)) = repo.blocked.get_mut(&image.image_digest)
                    && *rounds > 0
                {
                    *rounds -= 1;
                    outcome.failures.push(ImageDeleteFailure {
                        digest: Some(image.image_digest.clone()),
                        code: code.clone(),
                        reason: String::from("deletion refused"),
                    });
                    continue;
                }
                let before = repo.images.len();
                repo.images.retain(|stored| stored.digest != image.image_digest);
                if repo.images.len() < before {
                    outcome.deleted += 1;
                } else {
                    outcome.failures.push(ImageDeleteFailure {
                        digest: Some(image.image_digest.clone()),
                        code: String::from("ImageNotFound"),
                        reason: String::from("Requested image not found"),
                    });
                }
            }
            Ok(outcome)
        }))
    }
}

impl StorageApi for FakeCloud {
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> ProviderFuture<'a, bool> {
        ready(
            self.enter("bucket_exists")
                .map(|state| state.buckets.contains_key(bucket)),
        )
    }

    fn create_bucket<'a>(&'a self, bucket: &'a str) -> ProviderFuture<'a, ()> {
        ready(self.enter("create_bucket").and_then(|mut state| {
            if state.buckets.contains_key(bucket) {
                return Err(ProviderError::new(
                    "BucketAlreadyOwnedByYou",
                    format!("Your previous request to create the named bucket succeeded: {bucket}"),
                ));
            }
            state.buckets.insert(bucket.to_owned(), FakeBucket::default());
            Ok(())
        }))
    }

    fn put_expiration_rule<'a>(&'a self, bucket: &'a str, days: u32) -> ProviderFuture<'a, ()> {
        ready(self.enter("put_expiration_rule").and_then(|mut state| {
            state.bucket_mut(bucket)?.expiration_days = Some(days);
            Ok(())
        }))
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        source: &'a Utf8Path,
    ) -> ProviderFuture<'a, ()> {
        ready(self.enter("put_object").and_then(|mut state| {
            let contents = open_parent(source)
                .and_then(|(dir, name)| dir.read(&name))
                .map_err(|err| ProviderError::transport(format!("read {source}: {err}")))?;
            state
                .bucket_mut(bucket)?
                .objects
                .insert(key.to_owned(), contents);
            Ok(())
        }))
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        destination: &'a Utf8Path,
    ) -> ProviderFuture<'a, ()> {
        ready(self.enter("get_object").and_then(|mut state| {
            let contents = state
                .bucket_mut(bucket)?
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| {
                    not_found("NoSuchKey", String::from("The specified key does not exist."))
                })?;
            open_parent(destination)
                .and_then(|(dir, name)| dir.write(&name, contents))
                .map_err(|err| ProviderError::transport(format!("write {destination}: {err}")))
        }))
    }

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> ProviderFuture<'a, ()> {
        ready(self.enter("delete_object").and_then(|mut state| {
            state.bucket_mut(bucket)?.objects.remove(key);
            Ok(())
        }))
    }

    fn presign_get<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        expires_in: std::time::Duration,
    ) -> ProviderFuture<'a, String> {
        ready(self.enter("presign_get").and_then(|mut state| {
            state.bucket_mut(bucket)?;
            Ok(format!(
                "https://{bucket}.s3.amazonaws.com/{key}?X-Amz-Expires={}&X-Amz-Signature=fake",
                expires_in.as_secs()
            ))
        }))
    }
}

impl StsApi for FakeCloud {
    fn assume_role<'a>(
        &'a self,
        request: &'a AssumeRoleRequest,
    ) -> ProviderFuture<'a, AssumedCredentials> {
        ready(self.enter("assume_role").and_then(|mut state| {
            state.assume_requests.push(request.clone());
            state.assume_results.pop_front().unwrap_or_else(|| {
                Ok(AssumedCredentials {
                    access_key_id: String::from("ASIAFAKEACCESSKEY"),
                    secret_access_key: String::from("fake-secret"),
                    session_token: String::from("fake-token"),
                    expiration: Utc::now() + Duration::hours(1),
                })
            })
        }))
    }

    fn caller_identity(&self) -> ProviderFuture<'_, CallerIdentity> {
        ready(self.enter("caller_identity").map(|state| {
            state.caller.clone().unwrap_or_else(|| CallerIdentity {
                account: state.account.clone(),
                arn: format!("arn:aws:iam::{}:user/operator", state.account),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("al2023-ami-2023.*-kernel-6.1-x86_64", "al2023-ami-2023.6.2025-kernel-6.1-x86_64", true)]
    #[case("al2023-ami-2023.*-kernel-6.1-x86_64", "al2023-ami-2023.6.2025-kernel-6.1-arm64", false)]
    #[case("Deep Learning *", "Deep Learning Base AMI", true)]
    #[case("exact", "exact", true)]
    #[case("exact", "exactly", false)]
    fn wildcard_patterns(#[case] pattern: &str, #[case] value: &str, #[case] expected: bool) {
        assert_eq!(wildcard_match(pattern, value), expected);
    }

    #[tokio::test]
    async fn instances_boot_after_configured_describes() {
        let cloud = FakeCloud::new("us-east-1");
        cloud.set_boot_delay(1);
        let request = RunInstancesRequest {
            image_id: String::from("ami-1"),
            instance_type: String::from("t3.micro"),
            min_count: 1,
            max_count: 1,
            iam_instance_profile: crate::provider::IamInstanceProfileSpec {
                name: String::from("profile"),
            },
            security_groups: vec![String::from("sg")],
            security_group_ids: Vec::new(),
            subnet_id: None,
            placement: None,
            block_device_mappings: Vec::new(),
            user_data: None,
            tag_specifications: Vec::new(),
        };
        let id = cloud.run_instance(&request).await.expect("launch");
        let first = cloud.describe_instance(&id).await.expect("describe");
        assert_eq!(first.map(|info| info.state).as_deref(), Some("pending"));
        let second = cloud
            .describe_instance(&id)
            .await
            .expect("describe")
            .expect("instance present");
        assert!(second.is_running());
        assert!(second.address().is_some());
    }
}
