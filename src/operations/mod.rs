//! Post-deployment operations on managed instances and registries.
//!
//! Everything here talks to instances through the command channel; no
//! network session to an instance is opened.

mod listing;
mod push;
mod transfer;

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::scripts::{self, CONTAINER_STOPPED_MARKER};
use crate::channel::{ChannelError, CommandChannel, CommandTiming, StepResult};
use crate::progress::NullSink;
use crate::provider::{
    CommandApi, ComputeApi, InstanceInfo, MANAGED_TAG_KEY, MANAGED_TAG_VALUE, ProviderError,
    RegistryApi, RegistryImageRef, RepositoryInfo,
};

pub use listing::{FileEntry, normalise_path, parse_listing};
pub use push::{DEFAULT_DOCKER_BIN, LocalDocker, PushError, PushedImage, parse_loaded_image};
pub use transfer::{
    FileTransfer, PRESIGN_LIFETIME, STAGING_EXPIRY_DAYS, StagingBucket, TRANSFER_TIMING,
    TransferReceipt,
};

/// Timing of ad hoc commands.
pub const OPERATION_TIMING: CommandTiming = CommandTiming::short(Duration::from_secs(60));

/// States reported by [`InstanceOperations::list_instances`].
pub const LISTED_STATES: &[&str] = &["pending", "running", "stopping", "stopped"];

/// Failure code that clears once the referencing manifest list is deleted.
pub const MANIFEST_LIST_REFERENCE: &str = "ImageReferencedByManifestList";

/// Deletion rounds attempted by [`InstanceOperations::clear_repository`].
pub const CLEAR_ROUNDS: u32 = 5;

const CLEAR_ROUND_DELAY: Duration = Duration::from_secs(1);

/// Errors raised by post-deployment operations.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The command could not be dispatched or observed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// A provider call failed.
    #[error("failed to {operation}: {source}")]
    Provider {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: ProviderError,
    },
    /// The workload container does not exist on the instance.
    #[error("container `{container}` was not found on the instance")]
    ContainerNotFound {
        /// Container name.
        container: String,
    },
    /// The workload container exists but is not running.
    #[error("container `{container}` is stopped; redeploy or start it before browsing files")]
    ContainerStopped {
        /// Container name.
        container: String,
    },
    /// A local file does not exist.
    #[error("local file `{path}` does not exist")]
    LocalFileNotFound {
        /// Local path.
        path: String,
    },
    /// A local file could not be read or written.
    #[error("cannot use local file `{path}`: {message}")]
    LocalFile {
        /// Local path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// A remote path does not name a file.
    #[error("remote path `{path}` does not name a file")]
    InvalidRemotePath {
        /// Remote path as given.
        path: String,
    },
    /// A remote file does not exist on the instance or in the container.
    #[error("remote file `{path}` was not found")]
    RemoteFileNotFound {
        /// Remote path.
        path: String,
    },
    /// A remote command ran and failed.
    #[error("command failed: {detail}")]
    CommandFailed {
        /// Tail of the command output.
        detail: String,
    },
    /// The registry repository does not exist.
    #[error("repository `{repository}` does not exist")]
    RepositoryNotFound {
        /// Repository name.
        repository: String,
    },
    /// The registry issued a login token that is not a `user:password` pair.
    #[error("the registry issued an unusable login token")]
    InvalidRegistryToken,
    /// The registry refused to delete an image.
    #[error("could not delete {digest} from `{repository}`: {code}: {reason}")]
    DeleteFailed {
        /// Repository name.
        repository: String,
        /// Image digest, or `unknown`.
        digest: String,
        /// Failure code.
        code: String,
        /// Reason reported by the registry.
        reason: String,
    },
}

/// Where an ad hoc command runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecTarget {
    /// Directly on the instance.
    Host,
    /// Inside the named container.
    Container(String),
}

/// Result of an ad hoc command.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExecOutput {
    /// `0` on success, `1` otherwise.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Standard output followed by standard error.
    pub output: String,
}

impl From<StepResult> for ExecOutput {
    fn from(result: StepResult) -> Self {
        Self {
            exit_code: i32::from(!result.success),
            output: result.combined_output(),
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }
}

/// Recent container logs with the container's status.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ContainerLogs {
    /// Container name.
    pub container: String,
    /// Log text.
    pub logs: String,
    /// Status column reported by the runtime, for example `Up 5 minutes`.
    pub status: String,
    /// `true` when the container is running.
    pub is_running: bool,
}

/// Instance carrying the managed tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ManagedInstance {
    /// Instance identifier.
    pub id: String,
    /// Value of the `Name` tag.
    pub name: Option<String>,
    /// Lifecycle state.
    pub state: String,
    /// Public DNS name.
    pub public_dns: Option<String>,
    /// Size class.
    pub instance_type: String,
    /// Launch timestamp.
    pub launch_time: Option<String>,
}

impl From<InstanceInfo> for ManagedInstance {
    fn from(info: InstanceInfo) -> Self {
        Self {
            id: info.id,
            name: info.name,
            state: info.state,
            public_dns: info.public_dns.filter(|dns| !dns.is_empty()),
            instance_type: info.instance_type,
            launch_time: info.launch_time,
        }
    }
}

fn mentions_missing_container(text: &str) -> bool {
    text.contains("No such container") || text.contains("Container not found")
}

/// Everything a local `docker push` into a repository needs.
#[derive(Clone, Eq, PartialEq, Serialize)]
pub struct PushCredentials {
    /// Repository name.
    pub repository: String,
    /// Registry host to log in to.
    pub registry: String,
    /// Image address to tag and push, without a tag.
    pub image_uri: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Expiry of the login, when reported.
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for PushCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushCredentials")
            .field("repository", &self.repository)
            .field("registry", &self.registry)
            .field("image_uri", &self.image_uri)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Operations against instances and registries of one provider session.
#[derive(Debug)]
pub struct InstanceOperations<'p, P: ?Sized> {
    api: &'p P,
}

impl<'p, P: ?Sized> InstanceOperations<'p, P> {
    /// Wraps a provider session.
    #[must_use]
    pub const fn new(api: &'p P) -> Self {
        Self { api }
    }
}

impl<P: ComputeApi + ?Sized> InstanceOperations<'_, P> {
    /// Issues one termination call.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Provider`] when the call fails.
    pub async fn terminate(&self, instance_id: &str) -> Result<(), OperationError> {
        info!(instance_id, "terminating instance");
        self.api
            .terminate_instance(instance_id)
            .await
            .map_err(|source| OperationError::Provider {
                operation: "terminate instance",
                source,
            })
    }

    /// Lists live instances created by this tool.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Provider`] when the listing fails.
    pub async fn list_instances(&self) -> Result<Vec<ManagedInstance>, OperationError> {
        let instances = self
            .api
            .list_tagged_instances(MANAGED_TAG_KEY, MANAGED_TAG_VALUE)
            .await
            .map_err(|source| OperationError::Provider {
                operation: "list instances",
                source,
            })?;
        Ok(instances
            .into_iter()
            .filter(|info| LISTED_STATES.contains(&info.state.as_str()))
            .map(ManagedInstance::from)
            .collect())
    }
}

impl<P: CommandApi + ?Sized> InstanceOperations<'_, P> {
    async fn run(&self, instance_id: &str, script: &str) -> Result<StepResult, OperationError> {
        self.run_timed(instance_id, script, OPERATION_TIMING).await
    }

    async fn run_timed(
        &self,
        instance_id: &str,
        script: &str,
        timing: CommandTiming,
    ) -> Result<StepResult, OperationError> {
        Ok(CommandChannel::new(self.api)
            .execute(instance_id, script, timing, &NullSink)
            .await?)
    }

    /// Runs `command` on the host or inside a container.
    ///
    /// A command that runs and fails is reported through
    /// [`ExecOutput::exit_code`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Channel`] when the command cannot be
    /// dispatched or observed.
    pub async fn execute(
        &self,
        instance_id: &str,
        command: &str,
        target: &ExecTarget,
    ) -> Result<ExecOutput, OperationError> {
        let script = match target {
            ExecTarget::Host => command.to_owned(),
            ExecTarget::Container(name) => scripts::exec_in_container(name, command),
        };
        self.run(instance_id, &script).await.map(ExecOutput::from)
    }

    /// Returns the last `tail` log lines of `container` and its status.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::ContainerNotFound`] when the container
    /// does not exist.
    pub async fn container_logs(
        &self,
        instance_id: &str,
        container: &str,
        tail: u32,
    ) -> Result<ContainerLogs, OperationError> {
        let logs = self
            .run(instance_id, &scripts::container_logs(container, tail))
            .await?;
        let combined = logs.combined_output();
        if mentions_missing_container(&combined) {
            return Err(OperationError::ContainerNotFound {
                container: container.to_owned(),
            });
        }

        let status_result = self
            .run(instance_id, &scripts::container_status(container))
            .await?;
        let status = status_result
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_owned();
        if status.is_empty() {
            return Err(OperationError::ContainerNotFound {
                container: container.to_owned(),
            });
        }
        Ok(ContainerLogs {
            container: container.to_owned(),
            logs: combined,
            is_running: status.starts_with("Up"),
            status,
        })
    }

    /// Lists `path` on the host, or inside `container` when given.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::ContainerStopped`] when the container is
    /// not running and [`OperationError::CommandFailed`] when the listing
    /// fails.
    pub async fn list_files(
        &self,
        instance_id: &str,
        path: &str,
        container: Option<&str>,
    ) -> Result<Vec<FileEntry>, OperationError> {
        let directory = normalise_path(path);
        let result = self
            .run(instance_id, &scripts::list_directory(&directory, container))
            .await?;
        if let Some(name) = container
            && result.stdout.contains(CONTAINER_STOPPED_MARKER)
        {
            return Err(OperationError::ContainerStopped {
                container: name.to_owned(),
            });
        }
        if !result.success {
            let detail = result.failure_detail();
            if let Some(name) = container
                && mentions_missing_container(&detail)
            {
                return Err(OperationError::ContainerNotFound {
                    container: name.to_owned(),
                });
            }
            return Err(OperationError::CommandFailed { detail });
        }
        Ok(parse_listing(&result.stdout, &directory))
    }
}

impl<P: RegistryApi + ?Sized> InstanceOperations<'_, P> {
    /// Deletes every image in `repository` and returns how many were
    /// deleted.
    ///
    /// Images still referenced by a manifest list are retried for up to
    /// [`CLEAR_ROUNDS`] rounds, since deleting the list releases them.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::RepositoryNotFound`] for unknown
    /// repositories and [`OperationError::DeleteFailed`] for any other
    /// refusal, or when referenced images remain after the last round.
    pub async fn clear_repository(&self, repository: &str) -> Result<usize, OperationError> {
        let images = self
            .api
            .list_images(repository)
            .await
            .map_err(registry_failure(repository, "list images"))?;
        let mut pending: Vec<RegistryImageRef> = images
            .into_iter()
            .map(|image| RegistryImageRef {
                image_digest: image.digest,
            })
            .collect();
        let mut deleted = 0;

        for round in 1..=CLEAR_ROUNDS {
            if pending.is_empty() {
                break;
            }
            let outcome = self
                .api
                .batch_delete_images(repository, &pending)
                .await
                .map_err(registry_failure(repository, "delete images"))?;
            deleted += outcome.deleted;

            if let Some(failure) = outcome
                .failures
                .iter()
                .find(|failure| failure.code != MANIFEST_LIST_REFERENCE)
            {
                return Err(OperationError::DeleteFailed {
                    repository: repository.to_owned(),
                    digest: failure
                        .digest
                        .clone()
                        .unwrap_or_else(|| String::from("unknown")),
                    code: failure.code.clone(),
                    reason: failure.reason.clone(),
                });
            }
            pending = outcome
                .failures
                .into_iter()
                .filter_map(|failure| failure.digest)
                .map(|image_digest| RegistryImageRef { image_digest })
                .collect();
            if !pending.is_empty() && round < CLEAR_ROUNDS {
                warn!(
                    repository,
                    round,
                    remaining = pending.len(),
                    "images still referenced; retrying"
                );
                tokio::time::sleep(CLEAR_ROUND_DELAY).await;
            }
        }

        if let Some(image) = pending.first() {
            return Err(OperationError::DeleteFailed {
                repository: repository.to_owned(),
                digest: image.image_digest.clone(),
                code: String::from(MANIFEST_LIST_REFERENCE),
                reason: format!("still referenced after {CLEAR_ROUNDS} rounds"),
            });
        }
        info!(repository, deleted, "repository cleared");
        Ok(deleted)
    }
}

impl<P: RegistryApi + ?Sized> InstanceOperations<'_, P> {
    /// Makes sure `repository` exists and returns a registry login for
    /// pushing into it.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Provider`] when the repository cannot be
    /// read or created or no token is issued, and
    /// [`OperationError::InvalidRegistryToken`] for a malformed token.
    pub async fn prepare_push(
        &self,
        repository: &str,
    ) -> Result<PushCredentials, OperationError> {
        let repo = self.ensure_repository(repository).await?;
        let token = self
            .api
            .authorization_token()
            .await
            .map_err(|source| OperationError::Provider {
                operation: "issue registry token",
                source,
            })?;
        let decoded = STANDARD
            .decode(token.token.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(OperationError::InvalidRegistryToken)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(OperationError::InvalidRegistryToken)?;
        let registry = token
            .endpoint
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_owned();

        Ok(PushCredentials {
            repository: repo.name,
            registry,
            image_uri: repo.uri,
            username: username.to_owned(),
            password: password.to_owned(),
            expires_at: token.expires_at,
        })
    }

    async fn ensure_repository(
        &self,
        repository: &str,
    ) -> Result<RepositoryInfo, OperationError> {
        let describe = |source| OperationError::Provider {
            operation: "describe repository",
            source,
        };
        if let Some(repo) = self
            .api
            .describe_repository(repository)
            .await
            .map_err(describe)?
        {
            return Ok(repo);
        }
        info!(repository, "creating registry repository");
        match self.api.create_repository(repository).await {
            Ok(repo) => Ok(repo),
            Err(err) if err.is_already_exists() => self
                .api
                .describe_repository(repository)
                .await
                .map_err(describe)?
                .ok_or_else(|| OperationError::RepositoryNotFound {
                    repository: repository.to_owned(),
                }),
            Err(source) => Err(OperationError::Provider {
                operation: "create repository",
                source,
            }),
        }
    }
}

fn registry_failure(
    repository: &str,
    operation: &'static str,
) -> impl FnOnce(ProviderError) -> OperationError {
    let owned = repository.to_owned();
    move |source| {
        if source.is_not_found() {
            OperationError::RepositoryNotFound { repository: owned }
        } else {
            OperationError::Provider { operation, source }
        }
    }
}

#[cfg(test)]
mod tests;
