//! Idempotent get-or-create steps for the cloud resources a deployment
//! depends on.
//!
//! Every `ensure_*` method probes the resource by name first and returns
//! without mutating anything when it is already configured correctly. A
//! misconfigured resource is patched in place; a missing one is created,
//! treating a lost creation race as success, and then polled until the
//! provider reports it. Propagation waits use [`RetryPolicy`].

mod classify;
mod identity;
mod image;
mod network;

use thiserror::Error;

use crate::provider::{Architecture, ProviderError, ProviderErrorKind};
use crate::retry::RetryPolicy;

pub use classify::{WorkloadClass, architecture_for, instance_family, requires_placement_group};
pub use identity::{EXECUTION_ROLE_POLICIES, ec2_trust_policy, trusts_ec2};
pub use image::{DEFAULT_ROOT_DEVICE, ResolvedImage, image_query};
pub use network::{CLUSTER_STRATEGY, SECURITY_GROUP_DESCRIPTION};

/// Errors raised while ensuring a resource.
#[derive(Debug, Error)]
pub enum EnsureError {
    /// A provider call failed outright.
    #[error("failed to {operation} {resource} `{name}`: {source}")]
    Provider {
        /// Resource kind, for example `security group`.
        resource: &'static str,
        /// Resource name or identifier.
        name: String,
        /// Operation that failed, for example `create`.
        operation: &'static str,
        /// Underlying provider failure.
        #[source]
        source: ProviderError,
    },
    /// The resource never became visible after creation or patching.
    #[error("{resource} `{name}` did not become visible after {attempts} attempts")]
    PropagationTimeout {
        /// Resource kind.
        resource: &'static str,
        /// Resource name.
        name: String,
        /// Number of probes made.
        attempts: u32,
    },
    /// An explicitly requested machine image does not exist.
    #[error("machine image `{image_id}` was not found in this region")]
    ImageNotFound {
        /// Requested image identifier.
        image_id: String,
    },
    /// The latest-image lookup returned nothing for the workload class.
    #[error("no {class} machine image for {architecture} matched `{pattern}`")]
    NoImageForClass {
        /// Workload class being resolved.
        class: WorkloadClass,
        /// Architecture implied by the size class.
        architecture: Architecture,
        /// Name pattern that was queried.
        pattern: String,
    },
    /// A placement group of the right name exists with another strategy.
    #[error(
        "placement group `{name}` uses strategy `{strategy}`; delete it or configure another \
         placement group name so a `cluster` group can be created"
    )]
    PlacementStrategyMismatch {
        /// Group name.
        name: String,
        /// Strategy reported by the provider.
        strategy: String,
    },
}

impl EnsureError {
    /// Returns `true` when retrying the step later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::PropagationTimeout { .. } => true,
            Self::Provider { source, .. } => matches!(
                source.kind,
                ProviderErrorKind::Throttled | ProviderErrorKind::Unavailable
            ),
            _ => false,
        }
    }
}

/// Builds a mapper from a provider failure to [`EnsureError::Provider`].
fn provider_failure(
    resource: &'static str,
    name: &str,
    operation: &'static str,
) -> impl FnOnce(ProviderError) -> EnsureError {
    let owned = name.to_owned();
    move |source| EnsureError::Provider {
        resource,
        name: owned,
        operation,
        source,
    }
}

/// Applies the get-or-create state machine against one provider session.
#[derive(Debug)]
pub struct ResourceEnsurer<'p, P: ?Sized> {
    api: &'p P,
    propagation: RetryPolicy,
}

impl<'p, P: ?Sized> ResourceEnsurer<'p, P> {
    /// Creates an ensurer using [`RetryPolicy::PROPAGATION`].
    #[must_use]
    pub const fn new(api: &'p P) -> Self {
        Self {
            api,
            propagation: RetryPolicy::PROPAGATION,
        }
    }

    /// Overrides the propagation wait policy.
    #[must_use]
    pub const fn with_propagation(mut self, policy: RetryPolicy) -> Self {
        self.propagation = policy;
        self
    }

    /// Waits once for a patch to propagate.
    async fn settle(&self) {
        tokio::time::sleep(self.propagation.delay()).await;
    }

    const fn propagation_timeout(&self, resource: &'static str, name: String) -> EnsureError {
        EnsureError::PropagationTimeout {
            resource,
            name,
            attempts: self.propagation.attempts(),
        }
    }
}
