//! Core library for skiff, which deploys workload containers to cloud
//! instances without opening SSH sessions.
//!
//! A deployment verifies cross-account trust, ensures the shared network and
//! identity resources, launches an instance, and drives it through the
//! provider's remote command service until the workload container runs.
//! Progress is reported either as a buffered log or as a live event stream.

pub mod aws;
pub mod channel;
pub mod config;
pub mod ensure;
pub mod launch;
mod local_fs;
pub mod operations;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod test_support;
pub mod trust;
pub mod user_data;

pub use config::{ConfigError, SkiffConfig};
pub use pipeline::{DeployError, DeploymentPipeline, DeploymentRequest, ProvisionedInstance};
pub use progress::{ProgressEvent, ProgressSink};
pub use service::{ControlPlane, ServiceError};
pub use trust::{SessionId, TrustSession, TrustVerifier};
