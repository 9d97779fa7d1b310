//! Remote command service (`aws ssm`) operations.

use serde::{Deserialize, Serialize};

use crate::process::CommandRunner;
use crate::provider::{
    CommandApi, InvocationSnapshot, InvocationStatus, ProviderError, ProviderFuture,
};

use super::{AwsCli, argv, encode};

/// Document that runs a list of shell commands on Linux instances.
const SHELL_DOCUMENT: &str = "AWS-RunShellScript";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandInput<'a> {
    instance_ids: [&'a str; 1],
    document_name: &'static str,
    parameters: ShellParameters<'a>,
    timeout_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShellParameters<'a> {
    commands: [&'a str; 1],
    execution_timeout: [String; 1],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandOutput {
    command: CommandRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandRecord {
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvocationRecord {
    status: String,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

impl<R: CommandRunner + 'static> CommandApi for AwsCli<R> {
    fn send_command<'a>(
        &'a self,
        instance_id: &'a str,
        script: &'a str,
        timeout_secs: u64,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let input = encode(&SendCommandInput {
                instance_ids: [instance_id],
                document_name: SHELL_DOCUMENT,
                parameters: ShellParameters {
                    commands: [script],
                    execution_timeout: [timeout_secs.to_string()],
                },
                // Delivery deadline; the service enforces a 30s minimum.
                timeout_seconds: timeout_secs.max(30),
            })?;
            let output: SendCommandOutput = self
                .invoke_json(
                    "ssm",
                    "send-command",
                    argv(["--cli-input-json", input.as_str()]),
                )
                .await?;
            if output.command.command_id.is_empty() {
                return Err(ProviderError::transport(
                    "send-command returned an empty command identifier",
                ));
            }
            Ok(output.command.command_id)
        })
    }

    fn get_invocation<'a>(
        &'a self,
        command_id: &'a str,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, InvocationSnapshot> {
        Box::pin(async move {
            let record: InvocationRecord = self
                .invoke_json(
                    "ssm",
                    "get-command-invocation",
                    argv(["--command-id", command_id, "--instance-id", instance_id]),
                )
                .await?;
            Ok(InvocationSnapshot {
                status: InvocationStatus::parse(&record.status),
                stdout: record.standard_output_content,
                stderr: record.standard_error_content,
            })
        })
    }
}
