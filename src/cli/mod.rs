//! Command-line interface definitions for the `skiff` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `skiff` binary.
#[derive(Debug, Parser)]
#[command(
    name = "skiff",
    about = "Deploy workload containers to cloud instances without SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision an instance and start the repository's workload on it.
    #[command(name = "deploy")]
    Deploy(DeployCommand),
    /// Terminate an instance.
    #[command(name = "terminate")]
    Terminate(TerminateCommand),
    /// Check that the account's role trusts the deployment service.
    #[command(name = "verify-trust")]
    VerifyTrust(TrustArgs),
    /// Run a command on an instance or inside its workload container.
    #[command(name = "exec")]
    Exec(ExecCommand),
    /// Show recent logs of a workload container.
    #[command(name = "logs")]
    Logs(LogsCommand),
    /// List a directory on an instance or inside its workload container.
    #[command(name = "ls")]
    Ls(LsCommand),
    /// List instances created by skiff.
    #[command(name = "instances")]
    Instances(TrustArgs),
    /// Delete every image in a registry repository.
    #[command(name = "clear-repository")]
    ClearRepository(ClearRepositoryCommand),
    /// Create a registry repository if needed and print a push login.
    #[command(name = "push-login")]
    PushLogin(PushLoginCommand),
    /// Load a saved image archive and push it into a registry repository.
    #[command(name = "push-image")]
    PushImage(PushImageCommand),
    /// Copy a local file onto an instance or into its workload container.
    #[command(name = "upload")]
    Upload(TransferCommand),
    /// Copy a file from an instance or its workload container to this machine.
    #[command(name = "download")]
    Download(TransferCommand),
}

/// Account and role whose trust is verified before any provider call.
#[derive(Clone, Debug, Args)]
pub(crate) struct TrustArgs {
    /// Twelve-digit account identifier.
    #[arg(long, value_name = "ACCOUNT_ID")]
    pub(crate) account: String,
    /// Role name or ARN to assume. Defaults to the configured trust role.
    #[arg(long, value_name = "ROLE")]
    pub(crate) role: Option<String>,
}

/// Arguments for `skiff deploy`.
#[derive(Debug, Args)]
pub(crate) struct DeployCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    /// Registry repository holding the workload image.
    #[arg(long, value_name = "REPOSITORY")]
    pub(crate) repository: String,
    /// Instance size class, for example `c5.large`.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: String,
    /// Region to deploy into. Defaults to the configured region.
    #[arg(long, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Boot volume size in GiB. Defaults to the configured size.
    #[arg(long, value_name = "GIB")]
    pub(crate) volume_size: Option<u32>,
    /// Boot volume type. Defaults to the configured type.
    #[arg(long, value_name = "TYPE")]
    pub(crate) volume_type: Option<String>,
    /// Availability zone to place the instance in.
    #[arg(long, value_name = "ZONE")]
    pub(crate) availability_zone: Option<String>,
    /// Subnet to launch into instead of the default network.
    #[arg(long, value_name = "SUBNET_ID")]
    pub(crate) subnet_id: Option<String>,
    /// Machine image to boot instead of the resolved default.
    #[arg(long, value_name = "IMAGE_ID")]
    pub(crate) image_id: Option<String>,
    /// Boot script passed inline.
    #[arg(long, value_name = "USER_DATA", conflicts_with = "user_data_file")]
    pub(crate) user_data: Option<String>,
    /// Boot script read from a local file.
    #[arg(long, value_name = "PATH", conflicts_with = "user_data")]
    pub(crate) user_data_file: Option<String>,
    /// Write the region into the instance's provider client configuration.
    #[arg(long)]
    pub(crate) configure_credentials: bool,
    /// Print progress as JSON events, one per line, while deploying.
    #[arg(long)]
    pub(crate) stream: bool,
}

/// Arguments for `skiff terminate`.
#[derive(Debug, Args)]
pub(crate) struct TerminateCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    /// Instance to terminate.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
}

/// Optional container selection, by name or by repository.
#[derive(Clone, Debug, Args)]
pub(crate) struct ContainerArgs {
    /// Container name.
    #[arg(long, value_name = "NAME", conflicts_with = "repository")]
    pub(crate) container: Option<String>,
    /// Repository whose workload container to use.
    #[arg(long, value_name = "REPOSITORY", conflicts_with = "container")]
    pub(crate) repository: Option<String>,
}

/// Arguments for `skiff exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    #[command(flatten)]
    pub(crate) container: ContainerArgs,
    /// Target instance.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
    /// Command to run (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `skiff logs`.
#[derive(Debug, Args)]
pub(crate) struct LogsCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    #[command(flatten)]
    pub(crate) container: ContainerArgs,
    /// Target instance.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
    /// Number of log lines to show.
    #[arg(long, default_value_t = 100)]
    pub(crate) tail: u32,
}

/// Arguments for `skiff ls`.
#[derive(Debug, Args)]
pub(crate) struct LsCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    #[command(flatten)]
    pub(crate) container: ContainerArgs,
    /// Target instance.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
    /// Directory to list.
    #[arg(value_name = "PATH", default_value = "/")]
    pub(crate) path: String,
}

/// Arguments for `skiff clear-repository`.
#[derive(Debug, Args)]
pub(crate) struct ClearRepositoryCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    /// Repository to empty.
    #[arg(value_name = "REPOSITORY")]
    pub(crate) repository: String,
}

/// Arguments for `skiff push-login`.
#[derive(Debug, Args)]
pub(crate) struct PushLoginCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    /// Repository the workload image will be pushed to.
    #[arg(value_name = "REPOSITORY")]
    pub(crate) repository: String,
}

/// Arguments for `skiff push-image`.
#[derive(Debug, Args)]
pub(crate) struct PushImageCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    /// Repository to push into. Created when missing.
    #[arg(value_name = "REPOSITORY")]
    pub(crate) repository: String,
    /// Archive written by `docker save`.
    #[arg(value_name = "ARCHIVE")]
    pub(crate) archive: String,
    /// Tag to push the image as.
    #[arg(long, default_value = "latest")]
    pub(crate) tag: String,
    /// Container runtime client to run.
    #[arg(long, value_name = "PROGRAM", default_value = "docker")]
    pub(crate) docker_bin: String,
}

/// Arguments for `skiff upload` and `skiff download`.
#[derive(Debug, Args)]
pub(crate) struct TransferCommand {
    #[command(flatten)]
    pub(crate) trust: TrustArgs,
    #[command(flatten)]
    pub(crate) container: ContainerArgs,
    /// Target instance.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
    /// File on this machine. A download into a directory keeps the remote
    /// file name.
    #[arg(value_name = "LOCAL_PATH")]
    pub(crate) local_path: String,
    /// File on the instance or in the container. An upload to a path ending
    /// in `/` keeps the local file name.
    #[arg(value_name = "REMOTE_PATH")]
    pub(crate) remote_path: String,
}
