//! Execution role and instance profile.

use serde_json::{Value, json};
use tracing::info;

use crate::provider::{IdentityApi, InstanceProfileInfo, ProviderError, RoleInfo};

use super::{EnsureError, ResourceEnsurer, provider_failure};

/// Managed policies the instance needs for the command channel, object
/// storage and registry pulls.
pub const EXECUTION_ROLE_POLICIES: [&str; 3] = [
    "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore",
    "arn:aws:iam::aws:policy/AmazonS3FullAccess",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
];

const EC2_SERVICE: &str = "ec2.amazonaws.com";
const ASSUME_ROLE: &str = "sts:AssumeRole";

/// Trust policy letting compute instances assume the execution role.
#[must_use]
pub fn ec2_trust_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": EC2_SERVICE },
            "Action": ASSUME_ROLE,
        }],
    })
}

/// Returns `true` when some statement of `policy` allows the compute
/// service to assume the role.
#[must_use]
pub fn trusts_ec2(policy: &Value) -> bool {
    let statements = match policy.get("Statement") {
        Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => return false,
    };
    statements.into_iter().any(|statement| {
        statement.get("Effect").and_then(Value::as_str) == Some("Allow")
            && contains_str(statement.get("Action"), ASSUME_ROLE)
            && contains_str(
                statement
                    .get("Principal")
                    .and_then(|principal| principal.get("Service")),
                EC2_SERVICE,
            )
    })
}

fn contains_str(value: Option<&Value>, needle: &str) -> bool {
    match value {
        Some(Value::String(item)) => item == needle,
        Some(Value::Array(items)) => items.iter().any(|item| item.as_str() == Some(needle)),
        _ => false,
    }
}

impl<P: IdentityApi + ?Sized> ResourceEnsurer<'_, P> {
    /// Ensures the execution role exists, trusts the compute service and
    /// carries every policy in [`EXECUTION_ROLE_POLICIES`]. Returns the role
    /// ARN.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError`] when a provider call fails or the role never
    /// becomes visible after creation.
    pub async fn ensure_execution_role(&self, name: &str) -> Result<String, EnsureError> {
        let existing = self
            .api
            .get_role(name)
            .await
            .map_err(provider_failure("role", name, "read"))?;
        let role = match existing {
            Some(role) => {
                if !trusts_ec2(&role.trust_policy) {
                    info!(role = name, "patching execution role trust policy");
                    self.api
                        .update_trust_policy(name, &ec2_trust_policy())
                        .await
                        .map_err(provider_failure("role", name, "update trust policy of"))?;
                    self.settle().await;
                }
                role
            }
            None => self.create_role(name).await?,
        };

        let attached = self
            .api
            .list_attached_policies(name)
            .await
            .map_err(provider_failure("role", name, "list policies of"))?;
        for policy in EXECUTION_ROLE_POLICIES {
            if attached.iter().any(|arn| arn == policy) {
                continue;
            }
            info!(role = name, policy, "attaching policy to execution role");
            self.api
                .attach_policy(name, policy)
                .await
                .map_err(provider_failure("role", name, "attach policy to"))?;
        }
        Ok(role.arn)
    }

    async fn create_role(&self, name: &str) -> Result<RoleInfo, EnsureError> {
        info!(role = name, "creating execution role");
        match self.api.create_role(name, &ec2_trust_policy()).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {
                info!(role = name, "execution role created concurrently");
            }
            Err(err) => return Err(provider_failure("role", name, "create")(err)),
        }
        self.propagation
            .poll("role visibility", |_| self.api.get_role(name))
            .await
            .map_err(provider_failure("role", name, "read"))?
            .ok_or_else(|| self.propagation_timeout("role", name.to_owned()))
    }

    /// Ensures the instance profile exists and binds exactly `role`.
    /// Returns the profile ARN.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError`] when a provider call fails or the binding
    /// never becomes visible.
    pub async fn ensure_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> Result<String, EnsureError> {
        let existing = self
            .api
            .get_instance_profile(profile)
            .await
            .map_err(provider_failure("instance profile", profile, "read"))?;
        let current = match existing {
            Some(found) => found,
            None => self.create_instance_profile(profile).await?,
        };

        let mut changed = false;
        for stale in current.roles.iter().filter(|bound| *bound != role) {
            info!(profile, role = %stale, "unbinding role from instance profile");
            self.api
                .remove_role_from_instance_profile(profile, stale)
                .await
                .map_err(provider_failure("instance profile", profile, "unbind role from"))?;
            changed = true;
        }
        if !current.roles.iter().any(|bound| bound == role) {
            info!(profile, role, "binding role to instance profile");
            match self.api.add_role_to_instance_profile(profile, role).await {
                Ok(()) => {}
                Err(err) if err.is_already_exists() => {}
                Err(err) => {
                    return Err(provider_failure("instance profile", profile, "bind role to")(err));
                }
            }
            changed = true;
        }
        if !changed {
            return Ok(current.arn);
        }

        self.propagation
            .poll("instance profile binding", |_| async move {
                let seen = self.api.get_instance_profile(profile).await?;
                Ok::<_, ProviderError>(seen.filter(|info| {
                    info.roles.len() == 1 && info.roles.iter().any(|bound| bound == role)
                }))
            })
            .await
            .map_err(provider_failure("instance profile", profile, "read"))?
            .map(|info| info.arn)
            .ok_or_else(|| self.propagation_timeout("instance profile", profile.to_owned()))
    }

    async fn create_instance_profile(
        &self,
        profile: &str,
    ) -> Result<InstanceProfileInfo, EnsureError> {
        info!(profile, "creating instance profile");
        match self.api.create_instance_profile(profile).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {
                info!(profile, "instance profile created concurrently");
            }
            Err(err) => return Err(provider_failure("instance profile", profile, "create")(err)),
        }
        self.propagation
            .poll("instance profile visibility", |_| {
                self.api.get_instance_profile(profile)
            })
            .await
            .map_err(provider_failure("instance profile", profile, "read"))?
            .ok_or_else(|| self.propagation_timeout("instance profile", profile.to_owned()))
    }
}
