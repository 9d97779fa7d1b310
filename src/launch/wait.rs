//! Running-state and address waits.

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::provider::{ComputeApi, InstanceInfo};

use super::{InstanceLauncher, LaunchError};

/// States an instance never leaves for `running`.
const DEAD_STATES: &[&str] = &["shutting-down", "terminated", "stopping", "stopped"];

impl<P: ComputeApi + ?Sized> InstanceLauncher<'_, P> {
    async fn describe(&self, instance_id: &str) -> Result<Option<InstanceInfo>, LaunchError> {
        self.api
            .describe_instance(instance_id)
            .await
            .map_err(|source| LaunchError::Describe {
                instance_id: instance_id.to_owned(),
                source,
            })
    }

    pub(super) async fn wait_until_running(
        &self,
        instance_id: &str,
    ) -> Result<InstanceInfo, LaunchError> {
        let policy = self.timings.running;
        let started = Instant::now();
        for attempt in 1..=policy.attempts() {
            // A fresh instance can be briefly invisible to describe calls.
            if let Some(info) = self.describe(instance_id).await? {
                if info.is_running() {
                    return Ok(info);
                }
                if DEAD_STATES.contains(&info.state.as_str()) {
                    return Err(LaunchError::InstanceFailed {
                        instance_id: instance_id.to_owned(),
                        state: info.state,
                    });
                }
                debug!(instance_id, state = %info.state, attempt, "instance not running yet");
            }
            if attempt < policy.attempts() {
                sleep(policy.delay()).await;
            }
        }
        Err(LaunchError::NotRunning {
            instance_id: instance_id.to_owned(),
            waited_secs: started.elapsed().as_secs(),
        })
    }

    /// Returns the public address, rereading once after a short wait since
    /// address assignment can trail the running state.
    pub(super) async fn address_of(&self, running: InstanceInfo) -> Result<String, LaunchError> {
        if let Some(address) = running.address() {
            return Ok(address.to_owned());
        }
        info!(instance_id = %running.id, "public address not assigned yet; rereading");
        sleep(self.timings.address_retry).await;
        self.describe(&running.id)
            .await?
            .and_then(|info| info.address().map(str::to_owned))
            .ok_or(LaunchError::MissingAddress {
                instance_id: running.id,
            })
    }
}
