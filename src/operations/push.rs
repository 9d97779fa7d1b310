//! Publishing a saved image archive into a registry repository with the
//! local container runtime.

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8Path;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::local_fs::open_parent;
use crate::process::{CommandOutput, CommandRunner, ProcessCommandRunner};

use super::PushCredentials;

/// Default name of the container runtime client.
pub const DEFAULT_DOCKER_BIN: &str = "docker";

const LOADED_IMAGE: &str = "Loaded image: ";
const LOADED_IMAGE_ID: &str = "Loaded image ID: ";

/// Errors raised while pushing an image archive.
#[derive(Debug, Error)]
pub enum PushError {
    /// The runtime client could not be started.
    #[error("the container runtime is not available: {0}")]
    Unavailable(String),
    /// The client runs but its daemon does not answer.
    #[error("the container runtime daemon is not running: {0}")]
    DaemonStopped(String),
    /// The archive does not exist or is not a file.
    #[error("image archive `{path}` is not a readable file")]
    ArchiveMissing {
        /// Archive path as given.
        path: String,
    },
    /// The image tag is blank.
    #[error("image tag must not be empty")]
    EmptyTag,
    /// A runtime command failed.
    #[error("docker {step} failed: {detail}")]
    Step {
        /// Failing subcommand.
        step: &'static str,
        /// Trimmed error output.
        detail: String,
    },
    /// `docker load` printed no image reference.
    #[error("the archive did not name an image; create it with `docker save <image> -o <file>`")]
    NoLoadedImage,
}

/// An image pushed into a repository.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PushedImage {
    /// Reference the image was pushed as.
    pub image_uri: String,
    /// Reference loaded from the archive.
    pub source_image: String,
    /// Output of `docker push`.
    pub output: String,
}

/// Drives the local container runtime client.
#[derive(Debug)]
pub struct LocalDocker<R> {
    bin: String,
    runner: Arc<R>,
}

impl LocalDocker<ProcessCommandRunner> {
    /// Client wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(bin: impl Into<String>) -> Self {
        Self::new(bin, Arc::new(ProcessCommandRunner))
    }
}

impl<R: CommandRunner + 'static> LocalDocker<R> {
    /// Creates a client running `bin` through `runner`.
    #[must_use]
    pub fn new(bin: impl Into<String>, runner: Arc<R>) -> Self {
        Self {
            bin: bin.into(),
            runner,
        }
    }

    async fn docker(
        &self,
        args: Vec<OsString>,
        input: Option<String>,
    ) -> Result<CommandOutput, PushError> {
        let runner = Arc::clone(&self.runner);
        let program = self.bin.clone();
        tokio::task::spawn_blocking(move || match input {
            Some(text) => runner.run_with_input(&program, &args, &[], &text),
            None => runner.run(&program, &args, &[]),
        })
        .await
        .map_err(|err| PushError::Unavailable(format!("client task failed: {err}")))?
        .map_err(|err| PushError::Unavailable(err.to_string()))
    }

    async fn step(
        &self,
        step: &'static str,
        args: Vec<OsString>,
        input: Option<String>,
    ) -> Result<String, PushError> {
        debug!(step, "running container runtime client");
        let output = self.docker(args, input).await?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        Err(PushError::Step {
            step,
            detail: detail.to_owned(),
        })
    }

    /// Loads `archive` (a `docker save` tarball), tags it as `tag` in the
    /// repository named by `credentials` and pushes it.
    ///
    /// # Errors
    ///
    /// Returns [`PushError`] when the runtime is unavailable, the archive is
    /// missing or unnamed, or any runtime step fails.
    pub async fn push_archive(
        &self,
        credentials: &PushCredentials,
        archive: &Utf8Path,
        tag: &str,
    ) -> Result<PushedImage, PushError> {
        if tag.trim().is_empty() {
            return Err(PushError::EmptyTag);
        }
        require_file(archive)?;
        self.require_daemon().await?;

        self.step(
            "login",
            args([
                "login",
                "--username",
                credentials.username.as_str(),
                "--password-stdin",
                credentials.registry.as_str(),
            ]),
            Some(credentials.password.clone()),
        )
        .await?;
        let loaded = self
            .step("load", args(["load", "-i", archive.as_str()]), None)
            .await?;
        let source_image = parse_loaded_image(&loaded).ok_or(PushError::NoLoadedImage)?;
        let image_uri = format!("{}:{}", credentials.image_uri, tag.trim());
        self.step(
            "tag",
            args(["tag", source_image.as_str(), image_uri.as_str()]),
            None,
        )
        .await?;
        let output = self
            .step("push", args(["push", image_uri.as_str()]), None)
            .await?;

        info!(image_uri = %image_uri, source_image = %source_image, "image pushed");
        Ok(PushedImage {
            image_uri,
            source_image,
            output,
        })
    }

    async fn require_daemon(&self) -> Result<(), PushError> {
        let output = self
            .docker(args(["info", "--format", "{{.ServerVersion}}"]), None)
            .await?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PushError::DaemonStopped(output.stderr.trim().to_owned()))
        }
    }
}

fn args<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<OsString> {
    parts.into_iter().map(OsString::from).collect()
}

fn require_file(path: &Utf8Path) -> Result<(), PushError> {
    let is_file = open_parent(path)
        .and_then(|(dir, name)| dir.metadata(&name))
        .is_ok_and(|metadata| metadata.is_file());
    if is_file {
        Ok(())
    } else {
        Err(PushError::ArchiveMissing {
            path: path.to_string(),
        })
    }
}

/// Image reference reported by `docker load`, preferring the last named
/// image over a bare image id.
#[must_use]
pub fn parse_loaded_image(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    lines
        .iter()
        .rev()
        .copied()
        .find_map(|line| line.strip_prefix(LOADED_IMAGE))
        .or_else(|| {
            lines
                .iter()
                .rev()
                .copied()
                .find_map(|line| line.strip_prefix(LOADED_IMAGE_ID))
        })
        .map(str::trim)
        .filter(|reference| !reference.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use cap_std::{ambient_authority, fs_utf8::Dir};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use crate::test_support::ScriptedRunner;

    fn credentials() -> PushCredentials {
        PushCredentials {
            repository: String::from("solver"),
            registry: String::from("123456789012.dkr.ecr.us-east-1.amazonaws.com"),
            image_uri: String::from("123456789012.dkr.ecr.us-east-1.amazonaws.com/solver"),
            username: String::from("AWS"),
            password: String::from("registry-password"),
            expires_at: None,
        }
    }

    struct Archive {
        _tmp: TempDir,
        path: Utf8PathBuf,
    }

    #[fixture]
    fn archive() -> Archive {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        Dir::open_ambient_dir(&root, ambient_authority())
            .expect("open temp dir")
            .write("solver.tar", b"tar")
            .expect("write archive");
        Archive {
            path: root.join("solver.tar"),
            _tmp: tmp,
        }
    }

    #[rstest]
    #[case("Loaded image: solver:latest\n", Some("solver:latest"))]
    #[case(
        "Loaded image: base:1\nLoaded image: solver:dev\n",
        Some("solver:dev")
    )]
    #[case("Loaded image ID: sha256:abc\n", Some("sha256:abc"))]
    #[case("nothing useful\n", None)]
    fn loaded_image_is_parsed(#[case] output: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_loaded_image(output).as_deref(), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn archive_is_loaded_tagged_and_pushed(archive: Archive) {
        let runner = ScriptedRunner::new();
        runner.push_json("27.0.1\n");
        runner.push_json("Login Succeeded\n");
        runner.push_json("Loaded image: solver:dev\n");
        runner.push_success();
        runner.push_json("latest: digest: sha256:abc size: 1234\n");

        let pushed = LocalDocker::new("docker", Arc::new(runner.clone()))
            .push_archive(&credentials(), &archive.path, "v2")
            .await
            .expect("push succeeds");

        assert_eq!(
            pushed.image_uri,
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/solver:v2"
        );
        assert_eq!(pushed.source_image, "solver:dev");
        let invocations = runner.invocations();
        let commands: Vec<String> = invocations
            .iter()
            .map(|invocation| invocation.command_string())
            .collect();
        assert_eq!(
            commands,
            vec![
                String::from("docker info --format {{.ServerVersion}}"),
                String::from(
                    "docker login --username AWS --password-stdin \
                     123456789012.dkr.ecr.us-east-1.amazonaws.com"
                ),
                format!("docker load -i {}", archive.path),
                String::from(
                    "docker tag solver:dev 123456789012.dkr.ecr.us-east-1.amazonaws.com/solver:v2"
                ),
                String::from("docker push 123456789012.dkr.ecr.us-east-1.amazonaws.com/solver:v2"),
            ]
        );
        assert_eq!(invocations[1].input.as_deref(), Some("registry-password"));
        assert!(commands.iter().all(|command| !command.contains("registry-password")));
    }

    #[rstest]
    #[tokio::test]
    async fn stopped_daemon_stops_before_login(archive: Archive) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "Cannot connect to the Docker daemon\n");

        let err = LocalDocker::new("docker", Arc::new(runner.clone()))
            .push_archive(&credentials(), &archive.path, "latest")
            .await
            .expect_err("daemon is down");

        assert!(matches!(err, PushError::DaemonStopped(ref detail) if detail.contains("daemon")));
        assert_eq!(runner.invocations().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn unnamed_archive_is_rejected_before_tagging(archive: Archive) {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_success();
        runner.push_json("open /var/lib/docker/tmp: no such file\n");

        let err = LocalDocker::new("docker", Arc::new(runner.clone()))
            .push_archive(&credentials(), &archive.path, "latest")
            .await
            .expect_err("nothing loaded");

        assert!(matches!(err, PushError::NoLoadedImage));
        assert_eq!(runner.invocations().len(), 3);
    }

    #[tokio::test]
    async fn missing_archive_runs_nothing() {
        let runner = ScriptedRunner::new();
        let err = LocalDocker::new("docker", Arc::new(runner.clone()))
            .push_archive(
                &credentials(),
                Utf8Path::new("/definitely/missing/solver.tar"),
                "latest",
            )
            .await
            .expect_err("archive is missing");

        assert!(matches!(err, PushError::ArchiveMissing { .. }));
        assert!(runner.invocations().is_empty());
    }
}
