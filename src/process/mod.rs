//! Local process execution and the runner seam used by CLI-backed providers.

use std::ffi::OsString;
use std::io::Write;
use std::process::{Command, Stdio};

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while starting a local process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when the program cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that could not be started.
        program: String,
        /// Operating system error message.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments and extra environment
    /// variables, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> Result<CommandOutput, ProcessError>;

    /// Like [`CommandRunner::run`], but writes `input` to the program's
    /// standard input and closes it.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started or
    /// its input cannot be written.
    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
        input: &str,
    ) -> Result<CommandOutput, ProcessError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> Result<CommandOutput, ProcessError> {
        let output = Command::new(program)
            .args(args)
            .envs(envs.iter().map(|(key, value)| (key, value)))
            .output()
            .map_err(|err| ProcessError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(captured(&output))
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
        input: &str,
    ) -> Result<CommandOutput, ProcessError> {
        let spawn_error = |err: std::io::Error| ProcessError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        };
        let mut child = Command::new(program)
            .args(args)
            .envs(envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).map_err(spawn_error)?;
        }
        let output = child.wait_with_output().map_err(spawn_error)?;
        Ok(captured(&output))
    }
}

fn captured(output: &std::process::Output) -> CommandOutput {
    CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), true, "0")]
    #[case(Some(254), false, "254")]
    #[case(None, false, "unknown")]
    fn output_reports_status(
        #[case] code: Option<i32>,
        #[case] success: bool,
        #[case] text: &str,
    ) {
        let output = CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.is_success(), success);
        assert_eq!(output.status_text(), text);
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_feeds_standard_input() {
        let output = ProcessCommandRunner
            .run_with_input("cat", &[], &[], "secret-from-stdin")
            .expect("cat should run");
        assert!(output.is_success());
        assert_eq!(output.stdout, "secret-from-stdin");
    }

    #[test]
    fn process_runner_reports_missing_program() {
        let err = ProcessCommandRunner
            .run("skiff-definitely-missing-binary", &[], &[])
            .expect_err("missing binary should fail to spawn");
        let ProcessError::Spawn { program, .. } = err;
        assert_eq!(program, "skiff-definitely-missing-binary");
    }
}
