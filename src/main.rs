//! Binary entry point for the skiff CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use skiff::channel::scripts::container_name;
use skiff::config::{ConfigError, SkiffConfig};
use skiff::operations::{ExecTarget, FileTransfer, LocalDocker};
use skiff::pipeline::{DeploymentRequest, RequestError, VolumeType};
use skiff::process::ProcessCommandRunner;
use skiff::progress::{DEFAULT_RELAY_POLL, ProgressEvent, StreamOutcome};
use skiff::service::{AwsProviderFactory, ControlPlane, ServiceError};
use skiff::trust::{RoleRef, SessionId, TrustSession};
use skiff::user_data::{UserDataError, resolve_user_data};

use cli::{
    ClearRepositoryCommand, Cli, ContainerArgs, DeployCommand, ExecCommand, LogsCommand,
    LsCommand, PushImageCommand, PushLoginCommand, TerminateCommand, TransferCommand, TrustArgs,
};

type Plane = ControlPlane<AwsProviderFactory<ProcessCommandRunner>>;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid deployment request: {0}")]
    Request(#[from] RequestError),
    #[error(transparent)]
    UserData(#[from] UserDataError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0}")]
    Usage(&'static str),
    #[error("failed to write output: {0}")]
    Output(String),
    #[error("deployment failed: {0}")]
    StreamFailed(String),
    #[error("progress stream closed before the deployment finished")]
    StreamClosed,
}

#[derive(Debug, Serialize)]
struct SessionSummary<'a> {
    account_id: &'a str,
    role_arn: &'a str,
    region: &'a str,
    expires_at: DateTime<Utc>,
}

impl<'a> From<&'a TrustSession> for SessionSummary<'a> {
    fn from(session: &'a TrustSession) -> Self {
        Self {
            account_id: &session.account_id,
            role_arn: &session.role_arn,
            region: &session.region,
            expires_at: session.expires_at,
        }
    }
}

#[tokio::main]
async fn main() {
    skiff::telemetry::init();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = SkiffConfig::load_without_cli_args()?;
    config.validate()?;
    let plane = ControlPlane::from_config(&config);

    match cli {
        Cli::Deploy(command) => deploy(&plane, &config, &command).await,
        Cli::Terminate(command) => terminate(&plane, &config, &command).await,
        Cli::VerifyTrust(args) => {
            let role = role_for(&config, &args);
            let (_, session) = plane.verify_trust(&args.account, &role).await?;
            print_json(&SessionSummary::from(&session))?;
            Ok(0)
        }
        Cli::Exec(command) => exec(&plane, &config, &command).await,
        Cli::Logs(command) => logs(&plane, &config, &command).await,
        Cli::Ls(command) => list_files(&plane, &config, &command).await,
        Cli::Instances(args) => {
            let id = open_session(&plane, &config, &args).await?;
            print_json(&plane.list_instances(&id).await?)?;
            Ok(0)
        }
        Cli::ClearRepository(command) => clear_repository(&plane, &config, &command).await,
        Cli::PushLogin(command) => push_login(&plane, &config, &command).await,
        Cli::PushImage(command) => push_image(&plane, &config, &command).await,
        Cli::Upload(command) => {
            let id = open_session(&plane, &config, &command.trust).await?;
            print_json(&plane.upload(&id, &file_transfer(&command)).await?)?;
            Ok(0)
        }
        Cli::Download(command) => {
            let id = open_session(&plane, &config, &command.trust).await?;
            print_json(&plane.download(&id, &file_transfer(&command)).await?)?;
            Ok(0)
        }
    }
}

fn role_for(config: &SkiffConfig, args: &TrustArgs) -> RoleRef {
    RoleRef::parse(args.role.as_deref().unwrap_or(&config.trust_role_name))
}

async fn open_session(
    plane: &Plane,
    config: &SkiffConfig,
    args: &TrustArgs,
) -> Result<SessionId, CliError> {
    let (id, _) = plane
        .verify_trust(&args.account, &role_for(config, args))
        .await?;
    Ok(id)
}

fn build_request(
    config: &SkiffConfig,
    command: &DeployCommand,
) -> Result<DeploymentRequest, CliError> {
    let user_data = resolve_user_data(
        command.user_data.as_deref(),
        command.user_data_file.as_deref(),
    )?;
    let mut builder = config
        .request_builder()?
        .account_id(command.trust.account.as_str())
        .repository(command.repository.as_str())
        .instance_type(command.instance_type.as_str())
        .availability_zone(command.availability_zone.clone())
        .subnet_id(command.subnet_id.clone())
        .image_id(command.image_id.clone())
        .user_data(user_data)
        .configure_credentials(command.configure_credentials);
    if let Some(region) = &command.region {
        builder = builder.region(region.as_str());
    }
    if let Some(size) = command.volume_size {
        builder = builder.volume_size_gb(size);
    }
    if let Some(kind) = &command.volume_type {
        builder = builder.volume_type(kind.parse::<VolumeType>()?);
    }
    Ok(builder.build()?)
}

async fn deploy(
    plane: &Plane,
    config: &SkiffConfig,
    command: &DeployCommand,
) -> Result<i32, CliError> {
    let request = build_request(config, command)?;
    let id = open_session(plane, config, &command.trust).await?;
    if command.stream {
        return stream_deployment(plane, &id, request).await;
    }
    let report = plane.deploy(&id, &request).await?;
    print_json(&json!({ "instance": report.instance, "logs": report.logs }))?;
    Ok(0)
}

async fn stream_deployment(
    plane: &Plane,
    id: &SessionId,
    request: DeploymentRequest,
) -> Result<i32, CliError> {
    let stream = plane.deploy_streaming(id, request)?;
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(event) = rx.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "could not encode progress event");
                    continue;
                }
            };
            // A closed stdout ends the stream; the relay notices the drop.
            if writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_err() {
                break;
            }
        }
    });

    let outcome = stream.relay(&tx, DEFAULT_RELAY_POLL).await;
    drop(tx);
    join_printer(printer).await;

    match outcome {
        StreamOutcome::Completed(_) => Ok(0),
        StreamOutcome::Failed(message) => Err(CliError::StreamFailed(message)),
        StreamOutcome::Disconnected => Err(CliError::StreamClosed),
    }
}

/// Waits for the event printer; returns `false` when it panicked or was
/// cancelled.
async fn join_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "progress printer stopped abnormally");
            false
        }
    }
}

async fn terminate(
    plane: &Plane,
    config: &SkiffConfig,
    command: &TerminateCommand,
) -> Result<i32, CliError> {
    let id = open_session(plane, config, &command.trust).await?;
    plane.terminate(&id, &command.instance_id).await?;
    print_json(&json!({ "terminated": command.instance_id }))?;
    Ok(0)
}

fn selected_container(args: &ContainerArgs) -> Option<String> {
    args.container
        .clone()
        .or_else(|| args.repository.as_deref().map(container_name))
}

async fn exec(
    plane: &Plane,
    config: &SkiffConfig,
    command: &ExecCommand,
) -> Result<i32, CliError> {
    let target =
        selected_container(&command.container).map_or(ExecTarget::Host, ExecTarget::Container);
    let id = open_session(plane, config, &command.trust).await?;
    let output = plane
        .execute(&id, &command.instance_id, &command.command.join(" "), &target)
        .await?;
    print_json(&output)?;
    Ok(output.exit_code)
}

async fn logs(
    plane: &Plane,
    config: &SkiffConfig,
    command: &LogsCommand,
) -> Result<i32, CliError> {
    let container = selected_container(&command.container)
        .ok_or(CliError::Usage("logs needs --container or --repository"))?;
    let id = open_session(plane, config, &command.trust).await?;
    let logs = plane
        .container_logs(&id, &command.instance_id, &container, command.tail)
        .await?;
    print_json(&logs)?;
    Ok(0)
}

async fn list_files(
    plane: &Plane,
    config: &SkiffConfig,
    command: &LsCommand,
) -> Result<i32, CliError> {
    let container = selected_container(&command.container);
    let id = open_session(plane, config, &command.trust).await?;
    let entries = plane
        .list_files(&id, &command.instance_id, &command.path, container.as_deref())
        .await?;
    print_json(&entries)?;
    Ok(0)
}

async fn clear_repository(
    plane: &Plane,
    config: &SkiffConfig,
    command: &ClearRepositoryCommand,
) -> Result<i32, CliError> {
    let id = open_session(plane, config, &command.trust).await?;
    let deleted = plane.clear_repository(&id, &command.repository).await?;
    print_json(&json!({ "repository": command.repository, "deleted": deleted }))?;
    Ok(0)
}

async fn push_login(
    plane: &Plane,
    config: &SkiffConfig,
    command: &PushLoginCommand,
) -> Result<i32, CliError> {
    let id = open_session(plane, config, &command.trust).await?;
    let creds = plane.prepare_push(&id, &command.repository).await?;
    print_json(&creds)?;
    Ok(0)
}

async fn push_image(
    plane: &Plane,
    config: &SkiffConfig,
    command: &PushImageCommand,
) -> Result<i32, CliError> {
    let id = open_session(plane, config, &command.trust).await?;
    let docker = LocalDocker::with_process_runner(command.docker_bin.as_str());
    let pushed = plane
        .push_image(
            &id,
            &command.repository,
            Utf8Path::new(&command.archive),
            &command.tag,
            &docker,
        )
        .await?;
    print_json(&pushed)?;
    Ok(0)
}

fn file_transfer(command: &TransferCommand) -> FileTransfer {
    FileTransfer {
        instance_id: command.instance_id.clone(),
        local_path: Utf8PathBuf::from(&command.local_path),
        remote_path: command.remote_path.clone(),
        container: selected_container(&command.container),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let body =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{body}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments parse")
    }

    #[rstest]
    #[case(&["skiff", "exec", "--account", "123456789012", "i-1", "ls"], None)]
    #[case(
        &["skiff", "exec", "--account", "123456789012", "--repository", "team/Solver", "i-1", "ls"],
        Some("skiff-team-solver")
    )]
    #[case(
        &["skiff", "exec", "--account", "123456789012", "--container", "web", "i-1", "ls"],
        Some("web")
    )]
    fn container_is_selected_by_name_or_repository(
        #[case] args: &[&str],
        #[case] expected: Option<&str>,
    ) {
        let Cli::Exec(command) = parse(args) else {
            panic!("expected exec");
        };
        assert_eq!(selected_container(&command.container).as_deref(), expected);
    }

    #[test]
    fn container_and_repository_conflict() {
        let result = Cli::try_parse_from([
            "skiff",
            "logs",
            "--account",
            "123456789012",
            "--container",
            "a",
            "--repository",
            "b",
            "i-1",
        ]);
        assert!(result.is_err());
    }

    fn config() -> SkiffConfig {
        SkiffConfig {
            aws_bin: String::from("aws"),
            profile: None,
            region: String::from("us-east-1"),
            instance_role_name: String::from("skiff-instance-role"),
            instance_profile_name: String::from("skiff-instance-profile"),
            security_group_name: String::from("skiff-egress-only"),
            placement_group_name: String::from("skiff-cluster"),
            trust_role_name: String::from("SkiffDeployerRole"),
            external_id: None,
            trust_principal_arn: None,
            default_volume_size_gb: 30,
            default_volume_type: String::from("gp3"),
        }
    }

    #[test]
    fn deploy_flags_override_config_defaults() {
        let Cli::Deploy(command) = parse(&[
            "skiff",
            "deploy",
            "--account",
            "123456789012",
            "--repository",
            "solver",
            "--instance-type",
            "c5.large",
            "--region",
            "eu-west-1",
            "--volume-size",
            "80",
            "--volume-type",
            "io2",
            "--user-data",
            "#!/bin/sh\necho hi",
        ]) else {
            panic!("expected deploy");
        };

        let request = build_request(&config(), &command).expect("request");

        assert_eq!(request.region, "eu-west-1");
        assert_eq!(request.volume_size_gb, 80);
        assert_eq!(request.volume_type, VolumeType::Io2);
        assert_eq!(request.user_data.as_deref(), Some("#!/bin/sh\necho hi"));
        assert!(!command.stream);
    }

    #[test]
    fn unknown_volume_type_is_a_request_error() {
        let Cli::Deploy(command) = parse(&[
            "skiff",
            "deploy",
            "--account",
            "123456789012",
            "--repository",
            "solver",
            "--instance-type",
            "c5.large",
            "--volume-type",
            "floppy",
        ]) else {
            panic!("expected deploy");
        };

        let err = build_request(&config(), &command).expect_err("bad volume type");

        assert!(matches!(err, CliError::Request(RequestError::VolumeType(_))));
    }

    #[test]
    fn configured_trust_role_is_the_default() {
        let args = TrustArgs {
            account: String::from("123456789012"),
            role: None,
        };
        assert_eq!(
            role_for(&config(), &args),
            RoleRef::Name(String::from("SkiffDeployerRole"))
        );
    }

    #[test]
    fn transfer_targets_the_repository_container() {
        let Cli::Upload(command) = parse(&[
            "skiff",
            "upload",
            "--account",
            "123456789012",
            "--repository",
            "solver",
            "i-1",
            "input.csv",
            "/workspace/",
        ]) else {
            panic!("expected upload");
        };

        let transfer = file_transfer(&command);

        assert_eq!(transfer.local_path, Utf8PathBuf::from("input.csv"));
        assert_eq!(transfer.remote_path, "/workspace/");
        assert_eq!(transfer.container.as_deref(), Some("skiff-solver"));
    }

    #[test]
    fn push_image_defaults_to_latest() {
        let Cli::PushImage(command) = parse(&[
            "skiff",
            "push-image",
            "--account",
            "123456789012",
            "solver",
            "solver.tar",
        ]) else {
            panic!("expected push-image");
        };

        assert_eq!(command.tag, "latest");
        assert_eq!(command.docker_bin, skiff::operations::DEFAULT_DOCKER_BIN);
        assert_eq!(command.archive, "solver.tar");
    }

    #[tokio::test]
    async fn printer_panic_is_reported_not_ignored() {
        let printer = tokio::spawn(async { panic!("stdout vanished") });
        assert!(!join_printer(printer).await);
        assert!(join_printer(tokio::spawn(async {})).await);
    }

    #[test]
    fn write_error_renders_message() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::StreamClosed);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("progress stream closed"), "{rendered}");
    }
}
