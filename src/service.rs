//! Caller-facing control plane.
//!
//! [`ControlPlane`] ties trust verification to deployments and the
//! post-deployment operations. Verifying trust stores a [`TrustSession`]
//! under a fresh [`SessionId`]; every other call names that id and runs
//! against a provider session built from the stored credentials.

use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;
use tracing::info;

use crate::aws::{AwsCli, AwsSettings};
use crate::config::SkiffConfig;
use crate::operations::{
    ContainerLogs, ExecOutput, ExecTarget, FileEntry, FileTransfer, InstanceOperations,
    LocalDocker, ManagedInstance, OperationError, PushCredentials, PushError, PushedImage,
    StagingBucket, TransferReceipt,
};
use crate::pipeline::{
    DeployError, DeploymentPipeline, DeploymentRequest, PipelineTimings, ProvisionedInstance,
    ResourceNames,
};
use crate::process::{CommandRunner, ProcessCommandRunner};
use crate::progress::{BufferSink, DeploymentStream, spawn_streaming};
use crate::provider::{AssumedCredentials, CloudProvider};
use crate::trust::{
    InMemorySessionStore, RoleRef, SessionError, SessionId, SessionStore, TrustError,
    TrustSession, TrustSettings, TrustVerifier,
};

/// Builds provider sessions for the control plane.
pub trait ProviderFactory: Send + Sync {
    /// Provider handed to pipelines and operations.
    type Provider: CloudProvider + 'static;

    /// Session acting as the deployment service itself.
    fn service_session(&self, region: &str) -> Arc<Self::Provider>;

    /// Session acting with the credentials of a verified trust session.
    fn trust_session(&self, session: &TrustSession, region: &str) -> Arc<Self::Provider>;
}

/// Factory of [`AwsCli`] sessions sharing one runner.
#[derive(Debug)]
pub struct AwsProviderFactory<R> {
    settings: AwsSettings,
    runner: Arc<R>,
}

impl<R> Clone for AwsProviderFactory<R> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<R: CommandRunner> AwsProviderFactory<R> {
    /// Creates a factory. The region in `settings` is replaced per session.
    #[must_use]
    pub const fn new(settings: AwsSettings, runner: Arc<R>) -> Self {
        Self { settings, runner }
    }
}

impl<R: CommandRunner + 'static> ProviderFactory for AwsProviderFactory<R> {
    type Provider = AwsCli<R>;

    fn service_session(&self, region: &str) -> Arc<Self::Provider> {
        let settings = AwsSettings {
            region: region.to_owned(),
            ..self.settings.clone()
        };
        Arc::new(AwsCli::new(settings, Arc::clone(&self.runner)))
    }

    fn trust_session(&self, session: &TrustSession, region: &str) -> Arc<Self::Provider> {
        let settings = AwsSettings {
            region: region.to_owned(),
            ..self.settings.clone()
        };
        let credentials = AssumedCredentials {
            access_key_id: session.access_key_id.clone(),
            secret_access_key: session.secret_access_key.clone(),
            session_token: session.session_token.clone(),
            expiration: session.expires_at,
        };
        Arc::new(AwsCli::new(settings, Arc::clone(&self.runner)).with_credentials(credentials))
    }
}

/// Errors raised by the control plane.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The session is unknown or expired.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Trust verification failed.
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// The deployment failed.
    #[error(transparent)]
    Deploy(#[from] DeployError),
    /// A post-deployment operation failed.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// Pushing a local image archive failed.
    #[error(transparent)]
    Push(#[from] PushError),
}

/// Result of a buffered deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentReport {
    /// The running instance.
    pub instance: ProvisionedInstance,
    /// Every progress line in order.
    pub logs: Vec<String>,
}

/// Deployment control plane.
#[derive(Debug)]
pub struct ControlPlane<F, S = InMemorySessionStore> {
    factory: F,
    sessions: S,
    names: ResourceNames,
    timings: PipelineTimings,
    trust: TrustSettings,
}

impl ControlPlane<AwsProviderFactory<ProcessCommandRunner>> {
    /// Control plane driving the real `aws` client as configured.
    #[must_use]
    pub fn from_config(config: &SkiffConfig) -> Self {
        let factory =
            AwsProviderFactory::new(config.aws_settings(), Arc::new(ProcessCommandRunner));
        Self::new(factory, config.trust_settings()).with_names(config.resource_names())
    }
}

impl<F: ProviderFactory> ControlPlane<F> {
    /// Creates a control plane with an in-memory session store.
    #[must_use]
    pub fn new(factory: F, trust: TrustSettings) -> Self {
        Self {
            factory,
            sessions: InMemorySessionStore::new(),
            names: ResourceNames::default(),
            timings: PipelineTimings::default(),
            trust,
        }
    }
}

impl<F: ProviderFactory, S: SessionStore> ControlPlane<F, S> {
    /// Replaces the session store.
    #[must_use]
    pub fn with_session_store<T: SessionStore>(self, sessions: T) -> ControlPlane<F, T> {
        ControlPlane {
            factory: self.factory,
            sessions,
            names: self.names,
            timings: self.timings,
            trust: self.trust,
        }
    }

    /// Overrides the shared resource names.
    #[must_use]
    pub fn with_names(mut self, names: ResourceNames) -> Self {
        self.names = names;
        self
    }

    /// Overrides pipeline waits and timeouts.
    #[must_use]
    pub const fn with_timings(mut self, timings: PipelineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Session store in use.
    #[must_use]
    pub const fn sessions(&self) -> &S {
        &self.sessions
    }

    /// Verifies that `role` in `account_id` trusts the service and stores
    /// the resulting session.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Trust`] when verification fails.
    pub async fn verify_trust(
        &self,
        account_id: &str,
        role: &RoleRef,
    ) -> Result<(SessionId, TrustSession), ServiceError> {
        let provider = self.factory.service_session(&self.trust.region);
        let session = TrustVerifier::new(provider.as_ref(), self.trust.clone())
            .verify(account_id, role)
            .await?;
        let id = SessionId::generate();
        self.sessions.put(id, session.clone());
        info!(session = %id, account_id = %session.account_id, "trust session stored");
        Ok((id, session))
    }

    /// Returns the live session stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthenticationRequired`] when the session is
    /// unknown or expired.
    pub fn session(&self, id: &SessionId) -> Result<TrustSession, SessionError> {
        self.sessions.get(id)
    }

    /// Forgets the session stored under `id`.
    pub fn end_session(&self, id: &SessionId) {
        self.sessions.remove(id);
    }

    fn pipeline(&self, session: &TrustSession, region: &str) -> DeploymentPipeline<F::Provider> {
        DeploymentPipeline::new(self.factory.trust_session(session, region))
            .with_names(self.names.clone())
            .with_timings(self.timings)
    }

    fn provider(&self, id: &SessionId) -> Result<Arc<F::Provider>, SessionError> {
        let session = self.session(id)?;
        Ok(self.factory.trust_session(&session, &session.region))
    }

    /// Runs a deployment to completion and returns the instance with every
    /// progress line.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Session`] for unknown or expired sessions and
    /// [`ServiceError::Deploy`] when the deployment fails.
    pub async fn deploy(
        &self,
        id: &SessionId,
        request: &DeploymentRequest,
    ) -> Result<DeploymentReport, ServiceError> {
        let session = self.session(id)?;
        let sink = BufferSink::new();
        let instance = self
            .pipeline(&session, &request.region)
            .run(request, &sink)
            .await?;
        Ok(DeploymentReport {
            instance,
            logs: sink.into_lines(),
        })
    }

    /// Starts a deployment on a detached task and returns its progress
    /// stream. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Session`] for unknown or expired sessions.
    /// Deployment failures arrive as the stream's terminal `error` event.
    pub fn deploy_streaming(
        &self,
        id: &SessionId,
        request: DeploymentRequest,
    ) -> Result<DeploymentStream, ServiceError> {
        let session = self.session(id)?;
        let pipeline = self.pipeline(&session, &request.region);
        Ok(spawn_streaming(move |sink| async move {
            pipeline.run(&request, &sink).await
        }))
    }

    /// Issues one termination call.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or a failed call.
    pub async fn terminate(&self, id: &SessionId, instance_id: &str) -> Result<(), ServiceError> {
        let provider = self.provider(id)?;
        InstanceOperations::new(provider.as_ref())
            .terminate(instance_id)
            .await?;
        Ok(())
    }

    /// Runs `command` on an instance or inside one of its containers.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or when the command
    /// cannot be dispatched.
    pub async fn execute(
        &self,
        id: &SessionId,
        instance_id: &str,
        command: &str,
        target: &ExecTarget,
    ) -> Result<ExecOutput, ServiceError> {
        let provider = self.provider(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .execute(instance_id, command, target)
            .await?)
    }

    /// Reads recent logs of a container.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or missing containers.
    pub async fn container_logs(
        &self,
        id: &SessionId,
        instance_id: &str,
        container: &str,
        tail: u32,
    ) -> Result<ContainerLogs, ServiceError> {
        let provider = self.provider(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .container_logs(instance_id, container, tail)
            .await?)
    }

    /// Lists a directory on an instance or inside one of its containers.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or failed listings.
    pub async fn list_files(
        &self,
        id: &SessionId,
        instance_id: &str,
        path: &str,
        container: Option<&str>,
    ) -> Result<Vec<FileEntry>, ServiceError> {
        let provider = self.provider(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .list_files(instance_id, path, container)
            .await?)
    }

    /// Deletes every image of a registry repository.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or refused deletions.
    pub async fn clear_repository(
        &self,
        id: &SessionId,
        repository: &str,
    ) -> Result<usize, ServiceError> {
        let provider = self.provider(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .clear_repository(repository)
            .await?)
    }

    /// Ensures a registry repository exists and returns a login for
    /// pushing workload images into it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or registry failures.
    pub async fn prepare_push(
        &self,
        id: &SessionId,
        repository: &str,
    ) -> Result<PushCredentials, ServiceError> {
        let provider = self.provider(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .prepare_push(repository)
            .await?)
    }

    /// Loads a saved image archive locally and pushes it into a registry
    /// repository, creating the repository when missing.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Operation`] for registry failures and
    /// [`ServiceError::Push`] when the local runtime fails.
    pub async fn push_image<R: CommandRunner + 'static>(
        &self,
        id: &SessionId,
        repository: &str,
        archive: &Utf8Path,
        tag: &str,
        docker: &LocalDocker<R>,
    ) -> Result<PushedImage, ServiceError> {
        let credentials = self.prepare_push(id, repository).await?;
        Ok(docker.push_archive(&credentials, archive, tag).await?)
    }

    /// Copies a local file onto an instance or into one of its containers.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or failed transfers.
    pub async fn upload(
        &self,
        id: &SessionId,
        transfer: &FileTransfer,
    ) -> Result<TransferReceipt, ServiceError> {
        let (provider, bucket) = self.staging(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .upload(&bucket, transfer)
            .await?)
    }

    /// Copies a file from an instance or one of its containers to the
    /// local machine.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or failed transfers.
    pub async fn download(
        &self,
        id: &SessionId,
        transfer: &FileTransfer,
    ) -> Result<TransferReceipt, ServiceError> {
        let (provider, bucket) = self.staging(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .download(&bucket, transfer)
            .await?)
    }

    fn staging(&self, id: &SessionId) -> Result<(Arc<F::Provider>, StagingBucket), SessionError> {
        let session = self.session(id)?;
        let bucket = StagingBucket::for_account(&session.account_id, &session.region);
        Ok((self.factory.trust_session(&session, &session.region), bucket))
    }

    /// Lists instances created by skiff.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for unknown sessions or a failed listing.
    pub async fn list_instances(
        &self,
        id: &SessionId,
    ) -> Result<Vec<ManagedInstance>, ServiceError> {
        let provider = self.provider(id)?;
        Ok(InstanceOperations::new(provider.as_ref())
            .list_instances()
            .await?)
    }
}
