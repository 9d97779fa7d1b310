//! Instance launcher: composes ensured resources into one create-instance
//! call and waits until the instance is running with a public address.

mod request;
mod wait;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ensure::ResolvedImage;
use crate::progress::ProgressSink;
use crate::provider::{ComputeApi, ProviderError, SubnetInfo};
use crate::retry::RetryPolicy;

pub use request::{build_request, supported_regions};

/// Instance handed back once it is running and addressable.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedInstance {
    /// Provider instance identifier.
    pub id: String,
    /// Public DNS name, or public IP when no name was assigned.
    pub address: String,
    /// Size class.
    pub instance_type: String,
}

/// Everything needed for the create-instance call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Image and boot device to use.
    pub image: ResolvedImage,
    /// Size class.
    pub instance_type: String,
    /// Instance profile carrying the execution role.
    pub instance_profile: String,
    /// Security group name, used for default-VPC launches.
    pub security_group_name: String,
    /// Security group identifier, used for subnet launches.
    pub security_group_id: String,
    /// Requested subnet.
    pub subnet_id: Option<String>,
    /// Requested availability zone.
    pub availability_zone: Option<String>,
    /// Cluster placement group, when the size class needs one.
    pub placement_group: Option<String>,
    /// Boot volume size in GiB.
    pub volume_size_gb: u32,
    /// Boot volume type.
    pub volume_type: String,
    /// Plain-text user data script.
    pub user_data: Option<String>,
    /// Value of the `Name` tag.
    pub name_tag: String,
}

/// Waits applied by the launcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaunchTimings {
    /// Polls for the `running` state.
    pub running: RetryPolicy,
    /// Extra wait before rereading a missing address.
    pub address_retry: Duration,
    /// Retries of the create call while the instance profile propagates.
    pub profile_propagation: RetryPolicy,
}

impl Default for LaunchTimings {
    fn default() -> Self {
        Self {
            running: RetryPolicy::new(60, Duration::from_secs(5)),
            address_retry: Duration::from_secs(10),
            profile_propagation: RetryPolicy::PROPAGATION,
        }
    }
}

/// Errors raised while launching an instance.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The size class is not offered anywhere in the region.
    #[error(
        "instance type {instance_type} is not offered in {region}; {}",
        supported_hint(.supported)
    )]
    UnsupportedInRegion {
        /// Requested size class.
        instance_type: String,
        /// Requested region.
        region: String,
        /// Regions known to offer the size class.
        supported: Vec<String>,
    },
    /// The size class is offered in the region but not in the chosen zone.
    #[error(
        "instance type {instance_type} is not offered in {zone}; choose one of: {}",
        .offered.join(", ")
    )]
    ZoneNotOffered {
        /// Requested size class.
        instance_type: String,
        /// Requested or subnet-derived zone.
        zone: String,
        /// Zones that do offer the size class.
        offered: Vec<String>,
    },
    /// The requested subnet does not exist.
    #[error("subnet {subnet_id} was not found in this region")]
    SubnetNotFound {
        /// Requested subnet.
        subnet_id: String,
    },
    /// A provider call failed before an instance existed.
    #[error("failed to {operation}: {source}")]
    Provider {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying provider failure.
        #[source]
        source: ProviderError,
    },
    /// The instance profile never became usable for launches.
    #[error("instance profile {profile} was not accepted after {attempts} attempts")]
    ProfileNotPropagated {
        /// Instance profile name.
        profile: String,
        /// Create attempts made.
        attempts: u32,
    },
    /// Reading the launched instance failed.
    #[error("failed to read instance {instance_id}: {source}")]
    Describe {
        /// Launched instance.
        instance_id: String,
        /// Underlying provider failure.
        #[source]
        source: ProviderError,
    },
    /// The instance entered a state it will not recover from.
    #[error("instance {instance_id} entered state {state} while starting")]
    InstanceFailed {
        /// Launched instance.
        instance_id: String,
        /// State reported by the provider.
        state: String,
    },
    /// The instance did not reach `running` in time.
    #[error("instance {instance_id} was not running after {waited_secs}s")]
    NotRunning {
        /// Launched instance.
        instance_id: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },
    /// The instance is running but has no public address.
    #[error("instance {instance_id} is running but has no public DNS name or IP address")]
    MissingAddress {
        /// Launched instance.
        instance_id: String,
    },
}

fn supported_hint(supported: &[String]) -> String {
    if supported.is_empty() {
        String::from("check which regions offer this size class")
    } else {
        format!("it is available in: {}", supported.join(", "))
    }
}

impl LaunchError {
    /// Identifier of the created instance, when the failure happened after
    /// the create call succeeded.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Describe { instance_id, .. }
            | Self::InstanceFailed { instance_id, .. }
            | Self::NotRunning { instance_id, .. }
            | Self::MissingAddress { instance_id } => Some(instance_id.as_str()),
            _ => None,
        }
    }

    /// Returns `true` when retrying the launch later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProfileNotPropagated { .. }
                | Self::NotRunning { .. }
                | Self::MissingAddress { .. }
        )
    }
}

fn is_profile_propagation(err: &ProviderError) -> bool {
    err.code == "InvalidParameterValue"
        && err
            .message
            .to_ascii_lowercase()
            .contains("iam instance profile")
}

/// Submits create-instance calls and waits for the result.
#[derive(Debug)]
pub struct InstanceLauncher<'p, P: ?Sized> {
    api: &'p P,
    region: String,
    timings: LaunchTimings,
}

impl<'p, P: ComputeApi + ?Sized> InstanceLauncher<'p, P> {
    /// Creates a launcher for `region` with default timings.
    #[must_use]
    pub fn new(api: &'p P, region: impl Into<String>) -> Self {
        Self {
            api,
            region: region.into(),
            timings: LaunchTimings::default(),
        }
    }

    /// Overrides the wait timings.
    #[must_use]
    pub const fn with_timings(mut self, timings: LaunchTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Launches one instance and waits until it is running and addressable.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] on any failure. Errors raised after the
    /// create call succeeded carry the instance identifier so callers can
    /// clean up.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
        sink: &dyn ProgressSink,
    ) -> Result<ProvisionedInstance, LaunchError> {
        let offered = self.offered_zones(&spec.instance_type).await?;
        let subnet = self.subnet(spec.subnet_id.as_deref()).await?;
        let zone = self.placement_zone(spec, subnet.as_ref(), &offered)?;

        let request = build_request(spec, subnet.as_ref(), zone);
        let instance_id = self.submit(spec, &request).await?;
        info!(instance_id, instance_type = %spec.instance_type, "instance created");

        sink.log("Waiting for instance state running...");
        let running = self.wait_until_running(&instance_id).await?;
        let address = self.address_of(running).await?;
        sink.log(&format!("Instance launched: {instance_id}"));

        Ok(ProvisionedInstance {
            id: instance_id,
            address,
            instance_type: spec.instance_type.clone(),
        })
    }

    async fn offered_zones(&self, instance_type: &str) -> Result<Vec<String>, LaunchError> {
        let zones = self
            .api
            .instance_type_zones(instance_type)
            .await
            .map_err(|source| LaunchError::Provider {
                operation: "check instance type offerings",
                source,
            })?;
        if zones.is_empty() {
            return Err(LaunchError::UnsupportedInRegion {
                instance_type: instance_type.to_owned(),
                region: self.region.clone(),
                supported: supported_regions(instance_type)
                    .iter()
                    .filter(|region| **region != self.region)
                    .map(|region| (*region).to_owned())
                    .collect(),
            });
        }
        Ok(zones)
    }

    async fn subnet(&self, subnet_id: Option<&str>) -> Result<Option<SubnetInfo>, LaunchError> {
        let Some(id) = subnet_id else {
            return Ok(None);
        };
        self.api
            .describe_subnet(id)
            .await
            .map_err(|source| LaunchError::Provider {
                operation: "read subnet",
                source,
            })?
            .map(Some)
            .ok_or_else(|| LaunchError::SubnetNotFound {
                subnet_id: id.to_owned(),
            })
    }

    /// Picks the zone for the placement section: the subnet's zone, the
    /// requested zone, or the first offering zone when a placement group
    /// needs one.
    fn placement_zone(
        &self,
        spec: &LaunchSpec,
        subnet: Option<&SubnetInfo>,
        offered: &[String],
    ) -> Result<Option<String>, LaunchError> {
        let chosen = subnet
            .map(|info| info.availability_zone.clone())
            .or_else(|| spec.availability_zone.clone());
        match chosen {
            Some(zone) if !offered.contains(&zone) => Err(LaunchError::ZoneNotOffered {
                instance_type: spec.instance_type.clone(),
                zone,
                offered: offered.to_vec(),
            }),
            Some(zone) => Ok(Some(zone)),
            None if spec.placement_group.is_some() => {
                let first = offered.first().cloned();
                info!(
                    zone = first.as_deref().unwrap_or_default(),
                    region = %self.region,
                    "placing cluster group in first offering zone"
                );
                Ok(first)
            }
            None => Ok(None),
        }
    }

    async fn submit(
        &self,
        spec: &LaunchSpec,
        request: &crate::provider::RunInstancesRequest,
    ) -> Result<String, LaunchError> {
        let policy = self.timings.profile_propagation;
        policy
            .poll("create instance", |attempt| async move {
                match self.api.run_instance(request).await {
                    Ok(id) => Ok(Some(id)),
                    Err(err) if is_profile_propagation(&err) => {
                        warn!(
                            attempt,
                            profile = %spec.instance_profile,
                            "instance profile not usable yet"
                        );
                        Ok(None)
                    }
                    Err(source) => Err(LaunchError::Provider {
                        operation: "create instance",
                        source,
                    }),
                }
            })
            .await?
            .ok_or_else(|| LaunchError::ProfileNotPropagated {
                profile: spec.instance_profile.clone(),
                attempts: policy.attempts(),
            })
    }
}
