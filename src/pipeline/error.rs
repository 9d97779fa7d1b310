//! Pipeline failures and their taxonomy.

use thiserror::Error;

use crate::channel::{ChannelError, StepStatus};
use crate::ensure::EnsureError;
use crate::launch::LaunchError;
use crate::provider::{ProviderError, ProviderErrorKind};

use super::PipelineStage;
use super::request::RequestError;

/// Broad class of a failure, used to decide whether a caller should retry,
/// fix configuration, or follow remediation steps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Retrying later may succeed.
    Transient,
    /// Retrying will fail the same way until configuration changes.
    Permanent,
    /// A domain condition the user can fix by following the message.
    Actionable,
}

/// Errors raised by a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The request failed validation.
    #[error("invalid deployment request: {0}")]
    Request(#[from] RequestError),
    /// A resource could not be ensured.
    #[error(transparent)]
    Ensure(#[from] EnsureError),
    /// The instance could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The command channel never answered the readiness probe.
    #[error(
        "command channel on {instance_id} was not reachable after {attempts} attempts; check that \
         the instance profile grants the managed instance core policy"
    )]
    ChannelUnavailable {
        /// Launched instance.
        instance_id: String,
        /// Probes sent.
        attempts: u32,
    },
    /// A remote step ran and did not succeed.
    #[error("{stage} {status}: {detail}")]
    StepFailed {
        /// Failing stage.
        stage: PipelineStage,
        /// Terminal status of the remote command.
        status: StepStatus,
        /// Tail of the command output.
        detail: String,
    },
    /// A remote step could not be dispatched or observed.
    #[error("{stage}: {source}")]
    Channel {
        /// Failing stage.
        stage: PipelineStage,
        /// Underlying channel failure.
        #[source]
        source: ChannelError,
    },
    /// The repository holds no image that can be pulled.
    #[error("no pushable image found in repository `{repository}`.\n{remediation}")]
    NoPushableImage {
        /// Repository that was searched.
        repository: String,
        /// Steps that publish an image.
        remediation: String,
    },
    /// The registry could not be queried.
    #[error("failed to list images in repository `{repository}`: {source}")]
    Registry {
        /// Repository that was queried.
        repository: String,
        /// Underlying provider failure.
        #[source]
        source: ProviderError,
    },
}

impl DeployError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoPushableImage { .. } => ErrorKind::Actionable,
            Self::ChannelUnavailable { .. } => ErrorKind::Transient,
            Self::Ensure(err) if err.is_transient() => ErrorKind::Transient,
            Self::Launch(err) if err.is_transient() => ErrorKind::Transient,
            Self::StepFailed {
                status: StepStatus::TimedOut,
                ..
            } => ErrorKind::Transient,
            Self::Registry { source, .. } if is_transient_provider(source) => {
                ErrorKind::Transient
            }
            Self::Channel {
                source: ChannelError::Dispatch { source, .. } | ChannelError::Poll { source, .. },
                ..
            } if is_transient_provider(source) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    /// Identifier of the instance the failure left behind, if any.
    pub(super) fn launched_instance(&self) -> Option<&str> {
        match self {
            Self::Launch(err) => err.instance_id(),
            _ => None,
        }
    }
}

const fn is_transient_provider(err: &ProviderError) -> bool {
    matches!(
        err.kind,
        ProviderErrorKind::Throttled | ProviderErrorKind::Unavailable
    )
}

/// Remediation shown when a repository has nothing to pull.
pub(super) fn push_remediation(registry_host: &str, repository: &str, region: &str) -> String {
    format!(
        "To publish an image:\n  \
         1. aws ecr get-login-password --region {region} | docker login --username AWS \
         --password-stdin {registry_host}\n  \
         2. docker tag <local-image> {registry_host}/{repository}:latest\n  \
         3. docker push {registry_host}/{repository}:latest\n\
         Then run the deployment again."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        DeployError::NoPushableImage {
            repository: String::from("solver"),
            remediation: String::new(),
        },
        ErrorKind::Actionable
    )]
    #[case(
        DeployError::ChannelUnavailable { instance_id: String::from("i-1"), attempts: 30 },
        ErrorKind::Transient
    )]
    #[case(
        DeployError::StepFailed {
            stage: PipelineStage::InstallRuntime,
            status: StepStatus::Failed,
            detail: String::from("dnf: not found"),
        },
        ErrorKind::Permanent
    )]
    #[case(
        DeployError::Request(RequestError::VolumeSize(0)),
        ErrorKind::Permanent
    )]
    #[case(
        DeployError::Registry {
            repository: String::from("solver"),
            source: ProviderError::new("ThrottlingException", "slow down"),
        },
        ErrorKind::Transient
    )]
    fn errors_are_classified(#[case] err: DeployError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn remediation_names_the_push_target() {
        let text = push_remediation(
            "123456789012.dkr.ecr.us-east-2.amazonaws.com",
            "solver",
            "us-east-2",
        );
        assert!(
            text.contains("docker push 123456789012.dkr.ecr.us-east-2.amazonaws.com/solver:latest")
        );
        assert!(text.contains("--region us-east-2"));
    }
}
