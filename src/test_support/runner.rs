//! Scripted process runner.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use crate::process::{CommandOutput, CommandRunner, ProcessError};

/// Exit status the `aws` client uses for service errors.
const CLIENT_ERROR_STATUS: i32 = 254;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share the same queue and invocation log, so a test can keep one
/// handle while the code under test owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    inner: Arc<Mutex<RunnerState>>,
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables passed to the program.
    pub envs: Vec<(OsString, OsString)>,
    /// Text written to standard input, if any.
    pub input: Option<String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the value following `flag`, if present.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<String> {
        self.args
            .iter()
            .skip_while(|arg| arg.as_os_str() != flag)
            .nth(1)
            .map(|value| value.to_string_lossy().into_owned())
    }

    /// Returns the value of an exported environment variable, if present.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<String> {
        self.envs
            .iter()
            .find(|(name, _)| name.as_os_str() == key)
            .map(|(_, value)| value.to_string_lossy().into_owned())
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state().invocations.clone()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.state().responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status whose stdout is `body`.
    pub fn push_json(&self, body: impl Into<String>) {
        self.push_output(Some(0), body, "");
    }

    /// Pushes a failure formatted the way the `aws` client reports service
    /// errors on stderr.
    pub fn push_provider_error(&self, code: &str, operation: &str, message: &str) {
        self.push_output(
            Some(CLIENT_ERROR_STATUS),
            "",
            format!("\nAn error occurred ({code}) when calling the {operation} operation: {message}\n"),
        );
    }
}

impl ScriptedRunner {
    fn respond(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
        input: Option<&str>,
    ) -> Result<CommandOutput, ProcessError> {
        let mut state = self.state();
        state.invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            envs: envs.to_vec(),
            input: input.map(str::to_owned),
        });
        state
            .responses
            .pop_front()
            .ok_or_else(|| ProcessError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
    ) -> Result<CommandOutput, ProcessError> {
        self.respond(program, args, envs, None)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(OsString, OsString)],
        input: &str,
    ) -> Result<CommandOutput, ProcessError> {
        self.respond(program, args, envs, Some(input))
    }
}
