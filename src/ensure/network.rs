//! Egress-only security group and cluster placement group.

use tracing::info;

use crate::provider::{ComputeApi, ProviderError};

use super::{EnsureError, ResourceEnsurer, provider_failure};

/// Description attached to security groups created here.
pub const SECURITY_GROUP_DESCRIPTION: &str =
    "Outbound-only access for instances managed through the command channel";

/// Placement strategy used for tight-networking size classes.
pub const CLUSTER_STRATEGY: &str = "cluster";

impl<P: ComputeApi + ?Sized> ResourceEnsurer<'_, P> {
    /// Ensures an outbound-only security group named `name` exists in
    /// `vpc_id` (or the default VPC) and returns its identifier. Any inbound
    /// rule found on an existing group is revoked.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError`] when a provider call fails or a new group is
    /// not visible before the propagation budget runs out.
    pub async fn ensure_security_group(
        &self,
        name: &str,
        vpc_id: Option<&str>,
    ) -> Result<String, EnsureError> {
        let existing = self
            .api
            .describe_security_group(name, vpc_id)
            .await
            .map_err(provider_failure("security group", name, "read"))?;

        if let Some(group) = existing {
            if !group.ingress.is_empty() {
                info!(
                    group_id = %group.id,
                    rules = group.ingress.len(),
                    "revoking inbound rules from security group"
                );
                self.api
                    .revoke_ingress(&group.id, &group.ingress)
                    .await
                    .map_err(provider_failure("security group", name, "revoke ingress on"))?;
                self.settle().await;
            }
            return Ok(group.id);
        }

        info!(group = name, vpc = vpc_id.unwrap_or("default"), "creating security group");
        match self
            .api
            .create_security_group(name, SECURITY_GROUP_DESCRIPTION, vpc_id)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {
                info!(group = name, "security group created concurrently");
            }
            Err(err) => return Err(provider_failure("security group", name, "create")(err)),
        }

        self.propagation
            .poll("security group visibility", |_| async move {
                let seen = self.api.describe_security_group(name, vpc_id).await?;
                Ok::<_, ProviderError>(seen.map(|group| group.id))
            })
            .await
            .map_err(provider_failure("security group", name, "read"))?
            .ok_or_else(|| self.propagation_timeout("security group", name.to_owned()))
    }

    /// Ensures a `cluster` placement group named `name` exists and is
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`EnsureError::PlacementStrategyMismatch`] when a group of
    /// that name uses another strategy, and other [`EnsureError`] variants
    /// for provider and propagation failures.
    pub async fn ensure_placement_group(&self, name: &str) -> Result<String, EnsureError> {
        let existing = self
            .api
            .describe_placement_group(name)
            .await
            .map_err(provider_failure("placement group", name, "read"))?;

        match existing {
            Some(group) if group.strategy != CLUSTER_STRATEGY => {
                return Err(EnsureError::PlacementStrategyMismatch {
                    name: group.name,
                    strategy: group.strategy,
                });
            }
            Some(group) if group.state == "available" => return Ok(group.name),
            Some(_) => {}
            None => {
                info!(group = name, "creating cluster placement group");
                match self.api.create_placement_group(name, CLUSTER_STRATEGY).await {
                    Ok(()) => {}
                    Err(err) if err.is_already_exists() => {
                        info!(group = name, "placement group created concurrently");
                    }
                    Err(err) => {
                        return Err(provider_failure("placement group", name, "create")(err));
                    }
                }
            }
        }

        self.propagation
            .poll("placement group availability", |_| async move {
                let seen = self.api.describe_placement_group(name).await?;
                Ok::<_, ProviderError>(
                    seen.filter(|group| group.state == "available")
                        .map(|group| group.name),
                )
            })
            .await
            .map_err(provider_failure("placement group", name, "read"))?
            .ok_or_else(|| self.propagation_timeout("placement group", name.to_owned()))
    }
}
