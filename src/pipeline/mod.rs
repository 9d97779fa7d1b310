//! Provisioning pipeline: drives the resource ensurer, the instance
//! launcher and the command channel from a bare account to a running
//! workload container.
//!
//! Stages run strictly in order. Any failure after an instance exists
//! terminates that instance once before the original error is returned;
//! termination failures are logged and swallowed.

mod error;
mod request;
mod workload;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::channel::scripts::{self, WorkloadLaunch};
use crate::channel::{ChannelError, CommandChannel, CommandTiming, StepResult, StepStatus};
use crate::ensure::{ResolvedImage, ResourceEnsurer, requires_placement_group};
use crate::launch::{InstanceLauncher, LaunchError, LaunchSpec, LaunchTimings};
use crate::progress::{NullSink, ProgressSink};
use crate::provider::{CloudProvider, ProviderErrorKind};
use crate::retry::RetryPolicy;

pub use crate::launch::ProvisionedInstance;
pub use error::{DeployError, ErrorKind};
pub use request::{
    DeploymentRequest, DeploymentRequestBuilder, MAX_VOLUME_SIZE_GB, RequestError, VolumeType,
};
pub use workload::{PREFERRED_TAG, reports_missing_image, select_tag};

/// Ordered stages of one deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineStage {
    /// Pick the machine image.
    ResolveImage,
    /// Ensure the outbound-only security group.
    EnsureSecurityGroup,
    /// Ensure the execution role and its instance profile.
    EnsureInstanceProfile,
    /// Ensure the cluster placement group, for tight-networking classes.
    EnsurePlacementGroup,
    /// Create the instance and wait until it is addressable.
    LaunchInstance,
    /// Probe the command channel until the instance answers.
    AwaitCommandChannelReady,
    /// Install the container runtime.
    InstallRuntime,
    /// Write the region into the instance's CLI configuration.
    ConfigureCredentials,
    /// Pull the workload image and start its container.
    PullAndStartWorkload,
    /// Finished.
    Done,
}

impl PipelineStage {
    /// Human readable stage label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ResolveImage => "resolve image",
            Self::EnsureSecurityGroup => "ensure security group",
            Self::EnsureInstanceProfile => "ensure instance profile",
            Self::EnsurePlacementGroup => "ensure placement group",
            Self::LaunchInstance => "launch instance",
            Self::AwaitCommandChannelReady => "await command channel",
            Self::InstallRuntime => "install runtime",
            Self::ConfigureCredentials => "configure credentials",
            Self::PullAndStartWorkload => "pull and start workload",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Names of the shared resources every deployment ensures.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceNames {
    /// Execution role assumed by instances.
    pub instance_role: String,
    /// Instance profile binding the execution role.
    pub instance_profile: String,
    /// Outbound-only security group.
    pub security_group: String,
    /// Cluster placement group.
    pub placement_group: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            instance_role: String::from("skiff-instance-role"),
            instance_profile: String::from("skiff-instance-profile"),
            security_group: String::from("skiff-egress-only"),
            placement_group: String::from("skiff-cluster"),
        }
    }
}

/// Waits and timeouts applied by the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipelineTimings {
    /// Propagation waits of the ensure steps.
    pub propagation: RetryPolicy,
    /// Launcher waits.
    pub launch: LaunchTimings,
    /// Readiness probes of the command channel.
    pub readiness: RetryPolicy,
    /// Timing of one readiness probe.
    pub probe: CommandTiming,
    /// Runtime installation.
    pub install: CommandTiming,
    /// Credential configuration.
    pub credentials: CommandTiming,
    /// Image pull and container start.
    pub workload: CommandTiming,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            propagation: RetryPolicy::PROPAGATION,
            launch: LaunchTimings::default(),
            readiness: RetryPolicy::new(30, Duration::from_secs(10)),
            probe: CommandTiming::short(Duration::from_secs(30)),
            install: CommandTiming::long_running(Duration::from_secs(600)),
            credentials: CommandTiming::short(Duration::from_secs(120)),
            workload: CommandTiming::long_running(Duration::from_secs(600)),
        }
    }
}

/// Runs deployments against one provider session.
#[derive(Debug)]
pub struct DeploymentPipeline<P: ?Sized> {
    provider: Arc<P>,
    names: ResourceNames,
    timings: PipelineTimings,
}

impl<P: ?Sized> Clone for DeploymentPipeline<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            names: self.names.clone(),
            timings: self.timings,
        }
    }
}

impl<P: CloudProvider + ?Sized> DeploymentPipeline<P> {
    /// Creates a pipeline with default resource names and timings.
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            names: ResourceNames::default(),
            timings: PipelineTimings::default(),
        }
    }

    /// Overrides the shared resource names.
    #[must_use]
    pub fn with_names(mut self, names: ResourceNames) -> Self {
        self.names = names;
        self
    }

    /// Overrides the waits and timeouts.
    #[must_use]
    pub const fn with_timings(mut self, timings: PipelineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Provider session used by this pipeline.
    #[must_use]
    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Deploys the workload described by `request`, forwarding every log
    /// line to `sink` as it is produced.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] when any stage fails. When the failure
    /// happened after the instance was created, the instance has been
    /// terminated (best effort) before the error is returned.
    pub async fn run(
        &self,
        request: &DeploymentRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ProvisionedInstance, DeployError> {
        request.validate()?;
        info!(
            region = %request.region,
            repository = %request.repository,
            instance_type = %request.instance_type,
            "starting deployment"
        );

        let spec = self.prepare(request, sink).await?;
        let instance = match self.launch(request, &spec, sink).await {
            Ok(instance) => instance,
            Err(err) => {
                if let Some(instance_id) = err.launched_instance() {
                    self.rollback(instance_id, sink).await;
                }
                return Err(err);
            }
        };

        if let Err(err) = self.configure(request, &spec, &instance, sink).await {
            self.rollback(&instance.id, sink).await;
            return Err(err);
        }

        info!(stage = %PipelineStage::Done, instance_id = %instance.id, "deployment finished");
        sink.log(&format!(
            "Deployment completed successfully: {} ({})",
            instance.id, instance.address
        ));
        Ok(instance)
    }

    /// Ensures every resource the launch depends on.
    async fn prepare(
        &self,
        request: &DeploymentRequest,
        sink: &dyn ProgressSink,
    ) -> Result<LaunchSpec, DeployError> {
        let api = &*self.provider;
        let ensurer = ResourceEnsurer::new(api).with_propagation(self.timings.propagation);

        stage(sink, PipelineStage::ResolveImage, "Resolving machine image...");
        let image = ensurer
            .resolve_image(
                &request.instance_type,
                &request.repository,
                request.image_id.as_deref(),
            )
            .await?;
        sink.log(&format!(
            "Using machine image {} ({} workload, {})",
            image.image_id, image.class, image.architecture
        ));

        stage(
            sink,
            PipelineStage::EnsureSecurityGroup,
            &format!("Ensuring security group {}...", self.names.security_group),
        );
        let vpc_id = self.subnet_vpc(request.subnet_id.as_deref()).await?;
        let security_group_id = ensurer
            .ensure_security_group(&self.names.security_group, vpc_id.as_deref())
            .await?;

        stage(
            sink,
            PipelineStage::EnsureInstanceProfile,
            &format!("Ensuring instance profile {}...", self.names.instance_profile),
        );
        ensurer
            .ensure_execution_role(&self.names.instance_role)
            .await?;
        ensurer
            .ensure_instance_profile(&self.names.instance_profile, &self.names.instance_role)
            .await?;

        let placement_group = if requires_placement_group(&request.instance_type) {
            stage(
                sink,
                PipelineStage::EnsurePlacementGroup,
                &format!("Ensuring placement group {}...", self.names.placement_group),
            );
            Some(
                ensurer
                    .ensure_placement_group(&self.names.placement_group)
                    .await?,
            )
        } else {
            None
        };

        Ok(self.launch_spec(request, image, security_group_id, placement_group))
    }

    fn launch_spec(
        &self,
        request: &DeploymentRequest,
        image: ResolvedImage,
        security_group_id: String,
        placement_group: Option<String>,
    ) -> LaunchSpec {
        LaunchSpec {
            image,
            instance_type: request.instance_type.clone(),
            instance_profile: self.names.instance_profile.clone(),
            security_group_name: self.names.security_group.clone(),
            security_group_id,
            subnet_id: request.subnet_id.clone(),
            availability_zone: request.availability_zone.clone(),
            placement_group,
            volume_size_gb: request.volume_size_gb,
            volume_type: request.volume_type.as_str().to_owned(),
            user_data: request.user_data.clone(),
            name_tag: scripts::container_name(&request.repository),
        }
    }

    /// VPC of the requested subnet, so the security group lands beside it.
    async fn subnet_vpc(&self, subnet_id: Option<&str>) -> Result<Option<String>, DeployError> {
        let Some(id) = subnet_id else {
            return Ok(None);
        };
        let subnet = self
            .provider
            .describe_subnet(id)
            .await
            .map_err(|source| LaunchError::Provider {
                operation: "read subnet",
                source,
            })?
            .ok_or_else(|| LaunchError::SubnetNotFound {
                subnet_id: id.to_owned(),
            })?;
        Ok(Some(subnet.vpc_id))
    }

    async fn launch(
        &self,
        request: &DeploymentRequest,
        spec: &LaunchSpec,
        sink: &dyn ProgressSink,
    ) -> Result<ProvisionedInstance, DeployError> {
        stage(
            sink,
            PipelineStage::LaunchInstance,
            &format!("Launching instance ({})...", spec.instance_type),
        );
        let instance = InstanceLauncher::new(&*self.provider, request.region.as_str())
            .with_timings(self.timings.launch)
            .launch(spec, sink)
            .await?;
        sink.log(&format!("Instance address: {}", instance.address));
        Ok(instance)
    }

    /// Runs every stage that needs the launched instance.
    async fn configure(
        &self,
        request: &DeploymentRequest,
        spec: &LaunchSpec,
        instance: &ProvisionedInstance,
        sink: &dyn ProgressSink,
    ) -> Result<(), DeployError> {
        self.await_command_channel(&instance.id, sink).await?;

        let gpu = spec.image.class.is_gpu();
        stage(
            sink,
            PipelineStage::InstallRuntime,
            &format!("Installing Docker ({} runtime)...", spec.image.class),
        );
        self.run_step(
            PipelineStage::InstallRuntime,
            &instance.id,
            &scripts::install_runtime(gpu),
            self.timings.install,
            sink,
        )
        .await
        .and_then(|result| require_success(PipelineStage::InstallRuntime, &result))?;
        sink.log("Docker installation completed");

        if request.configure_credentials {
            stage(
                sink,
                PipelineStage::ConfigureCredentials,
                "Configuring AWS credentials...",
            );
            self.run_step(
                PipelineStage::ConfigureCredentials,
                &instance.id,
                &scripts::configure_credentials(&request.region),
                self.timings.credentials,
                sink,
            )
            .await
            .and_then(|result| require_success(PipelineStage::ConfigureCredentials, &result))?;
            sink.log("AWS credentials configured");
        }

        self.start_workload(request, &instance.id, gpu, sink).await
    }

    async fn await_command_channel(
        &self,
        instance_id: &str,
        sink: &dyn ProgressSink,
    ) -> Result<(), DeployError> {
        stage(
            sink,
            PipelineStage::AwaitCommandChannelReady,
            &format!("Waiting for command channel on {instance_id}..."),
        );
        let channel = CommandChannel::new(&*self.provider);
        let channel_ref = &channel;
        let probe = self.timings.probe;
        let policy = self.timings.readiness;
        let ready = policy
            .poll("command channel readiness", move |attempt| async move {
                match channel_ref
                    .execute(instance_id, scripts::readiness_probe(), probe, &NullSink)
                    .await
                {
                    // A failed command still proves the channel answers.
                    Ok(result)
                        if matches!(result.status, StepStatus::Succeeded | StepStatus::Failed) =>
                    {
                        Ok::<_, DeployError>(Some(()))
                    }
                    Ok(result) => {
                        warn!(
                            instance_id,
                            attempt,
                            status = %result.status,
                            "readiness probe unanswered"
                        );
                        Ok(None)
                    }
                    Err(err) if channel_not_ready(&err) => {
                        warn!(
                            instance_id,
                            attempt,
                            error = %err,
                            "command channel not reachable yet"
                        );
                        Ok(None)
                    }
                    Err(source) => Err(DeployError::Channel {
                        stage: PipelineStage::AwaitCommandChannelReady,
                        source,
                    }),
                }
            })
            .await?;
        if ready.is_none() {
            return Err(DeployError::ChannelUnavailable {
                instance_id: instance_id.to_owned(),
                attempts: policy.attempts(),
            });
        }
        sink.log("Command channel ready");
        Ok(())
    }

    async fn start_workload(
        &self,
        request: &DeploymentRequest,
        instance_id: &str,
        gpu: bool,
        sink: &dyn ProgressSink,
    ) -> Result<(), DeployError> {
        info!(stage = %PipelineStage::PullAndStartWorkload, instance_id, "pipeline stage started");
        let registry_host = request.registry_host();
        let tag = self.workload_tag(request, &registry_host).await?;
        let image_uri = format!("{registry_host}/{}:{tag}", request.repository);
        let container_name = scripts::container_name(&request.repository);

        sink.log(&format!("Pulling {image_uri}..."));
        let script = scripts::pull_and_start(&WorkloadLaunch {
            registry_host: &registry_host,
            region: &request.region,
            image_uri: &image_uri,
            container_name: &container_name,
            gpu,
        });
        let result = self
            .run_step(
                PipelineStage::PullAndStartWorkload,
                instance_id,
                &script,
                self.timings.workload,
                sink,
            )
            .await?;
        if !result.success && reports_missing_image(&result.combined_output(), &image_uri) {
            return Err(no_pushable_image(request, &registry_host));
        }
        require_success(PipelineStage::PullAndStartWorkload, &result)?;
        sink.log(&format!("Container deployment completed: {container_name}"));
        Ok(())
    }

    async fn workload_tag(
        &self,
        request: &DeploymentRequest,
        registry_host: &str,
    ) -> Result<String, DeployError> {
        let images = match self.provider.list_images(&request.repository).await {
            Ok(images) => images,
            Err(err) if err.is_not_found() => {
                return Err(no_pushable_image(request, registry_host));
            }
            Err(source) => {
                return Err(DeployError::Registry {
                    repository: request.repository.clone(),
                    source,
                });
            }
        };
        select_tag(&images).ok_or_else(|| no_pushable_image(request, registry_host))
    }

    async fn run_step(
        &self,
        stage: PipelineStage,
        instance_id: &str,
        script: &str,
        timing: CommandTiming,
        sink: &dyn ProgressSink,
    ) -> Result<StepResult, DeployError> {
        CommandChannel::new(&*self.provider)
            .execute(instance_id, script, timing, sink)
            .await
            .map_err(|source| DeployError::Channel { stage, source })
    }

    async fn rollback(&self, instance_id: &str, sink: &dyn ProgressSink) {
        warn!(instance_id, "deployment failed; terminating instance");
        sink.log(&format!("Deployment failed; terminating instance {instance_id}"));
        if let Err(err) = self.provider.terminate_instance(instance_id).await {
            warn!(instance_id, error = %err, "failed to terminate instance during rollback");
        }
    }
}

fn stage(sink: &dyn ProgressSink, current: PipelineStage, line: &str) {
    info!(stage = %current, "pipeline stage started");
    sink.log(line);
}

/// Dispatch failures that mean the agent has not registered yet. Anything
/// else will not clear up by waiting.
const fn channel_not_ready(err: &ChannelError) -> bool {
    let (ChannelError::Dispatch { source, .. } | ChannelError::Poll { source, .. }) = err;
    matches!(
        source.kind,
        ProviderErrorKind::Unavailable | ProviderErrorKind::Throttled | ProviderErrorKind::NotFound
    )
}

fn require_success(stage: PipelineStage, result: &StepResult) -> Result<(), DeployError> {
    if result.success {
        return Ok(());
    }
    Err(DeployError::StepFailed {
        stage,
        status: result.status,
        detail: result.failure_detail(),
    })
}

fn no_pushable_image(request: &DeploymentRequest, registry_host: &str) -> DeployError {
    DeployError::NoPushableImage {
        repository: request.repository.clone(),
        remediation: error::push_remediation(registry_host, &request.repository, &request.region),
    }
}
