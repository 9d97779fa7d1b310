//! Provider binding that shells out to the `aws` command-line client.
//!
//! Every capability call becomes one `aws <service> <operation>` invocation
//! with `--output json`. Failures are recovered from the client's stderr,
//! which reports provider error codes as
//! `An error occurred (<Code>) when calling the <Op> operation: <message>`.

mod command;
mod compute;
mod identity;
mod registry;
mod storage;
mod sts;

use std::ffi::OsString;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::process::{CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::provider::{AssumedCredentials, ProviderError, ProviderErrorKind};

/// Default name of the provider client binary.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Connection settings shared by every call made through [`AwsCli`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AwsSettings {
    /// Path or name of the `aws` binary.
    pub bin: String,
    /// Region passed with `--region`.
    pub region: String,
    /// Named profile passed with `--profile`, when set.
    pub profile: Option<String>,
}

impl AwsSettings {
    /// Creates settings for a region using the default binary and profile.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            bin: DEFAULT_AWS_BIN.to_owned(),
            region: region.into(),
            profile: None,
        }
    }
}

/// Implements every provider capability by running the `aws` client.
#[derive(Debug)]
pub struct AwsCli<R: CommandRunner> {
    settings: AwsSettings,
    credentials: Option<AssumedCredentials>,
    runner: Arc<R>,
}

impl<R: CommandRunner> Clone for AwsCli<R> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            credentials: self.credentials.clone(),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl AwsCli<ProcessCommandRunner> {
    /// Creates a binding wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(settings: AwsSettings) -> Self {
        Self::new(settings, Arc::new(ProcessCommandRunner))
    }
}

impl<R: CommandRunner + 'static> AwsCli<R> {
    /// Creates a binding using the provided runner.
    #[must_use]
    pub const fn new(settings: AwsSettings, runner: Arc<R>) -> Self {
        Self {
            settings,
            credentials: None,
            runner,
        }
    }

    /// Uses temporary credentials instead of the ambient profile.
    #[must_use]
    pub fn with_credentials(mut self, credentials: AssumedCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Returns the settings in use.
    #[must_use]
    pub const fn settings(&self) -> &AwsSettings {
        &self.settings
    }

    fn credential_env(&self) -> Vec<(OsString, OsString)> {
        self.credentials
            .as_ref()
            .map(|creds| {
                vec![
                    (
                        OsString::from("AWS_ACCESS_KEY_ID"),
                        OsString::from(&creds.access_key_id),
                    ),
                    (
                        OsString::from("AWS_SECRET_ACCESS_KEY"),
                        OsString::from(&creds.secret_access_key),
                    ),
                    (
                        OsString::from("AWS_SESSION_TOKEN"),
                        OsString::from(&creds.session_token),
                    ),
                ]
            })
            .unwrap_or_default()
    }

    fn build_args(&self, service: &str, operation: &str, args: Vec<OsString>) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(args.len() + 8);
        argv.push(OsString::from(service));
        argv.push(OsString::from(operation));
        argv.extend(args);
        argv.push(OsString::from("--output"));
        argv.push(OsString::from("json"));
        argv.push(OsString::from("--region"));
        argv.push(OsString::from(&self.settings.region));
        // Explicit session credentials take precedence over any profile.
        if let (None, Some(profile)) = (&self.credentials, &self.settings.profile) {
            argv.push(OsString::from("--profile"));
            argv.push(OsString::from(profile));
        }
        argv
    }

    /// Runs one provider operation and returns its stdout.
    async fn invoke(
        &self,
        service: &str,
        operation: &str,
        args: Vec<OsString>,
    ) -> Result<String, ProviderError> {
        let argv = self.build_args(service, operation, args);
        let envs = self.credential_env();
        let runner = Arc::clone(&self.runner);
        let program = self.settings.bin.clone();
        debug!(service, operation, "invoking provider client");

        let output = tokio::task::spawn_blocking(move || runner.run(&program, &argv, &envs))
            .await
            .map_err(|err| ProviderError::transport(format!("client task failed: {err}")))?
            .map_err(|err| ProviderError::transport(err.to_string()))?;

        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(parse_failure(&self.settings.bin, &output))
        }
    }

    /// Runs one provider operation and decodes its JSON response.
    async fn invoke_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: Vec<OsString>,
    ) -> Result<T, ProviderError> {
        let body = self.invoke(service, operation, args).await?;
        decode(operation, &body)
    }
}

/// Builds an argument vector from string slices.
fn argv<I, S>(parts: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    parts.into_iter().map(Into::into).collect()
}

fn decode<T: DeserializeOwned>(operation: &str, body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|err| {
        ProviderError::with_kind(
            ProviderErrorKind::Other,
            "MalformedResponse",
            format!("failed to parse {operation} output: {err}"),
        )
    })
}

fn encode(value: &impl serde::Serialize) -> Result<String, ProviderError> {
    serde_json::to_string(value).map_err(|err| {
        ProviderError::with_kind(
            ProviderErrorKind::Other,
            "MalformedRequest",
            format!("failed to encode request: {err}"),
        )
    })
}

/// Converts a failed client run into a classified provider error.
pub(crate) fn parse_failure(program: &str, output: &CommandOutput) -> ProviderError {
    let stderr = output.stderr.trim();
    if let Some((code, message)) = parse_error_line(stderr) {
        return ProviderError::new(code, message);
    }
    ProviderError::with_kind(
        ProviderErrorKind::Other,
        "CommandFailed",
        format!(
            "{program} exited with status {}: {stderr}",
            output.status_text()
        ),
    )
}

fn parse_error_line(stderr: &str) -> Option<(&str, &str)> {
    let marker = "An error occurred (";
    let start = stderr.find(marker)? + marker.len();
    let rest = stderr.get(start..)?;
    let end = rest.find(')')?;
    let code = rest.get(..end)?;
    let tail = rest.get(end + 1..)?;
    let message = tail
        .split_once("operation: ")
        .map_or_else(|| tail.trim_start_matches(':').trim(), |(_, msg)| msg.trim());
    Some((code, message))
}

#[cfg(test)]
mod tests;
