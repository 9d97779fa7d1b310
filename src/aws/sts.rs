//! Identity broker (`aws sts`) operations.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::process::CommandRunner;
use crate::provider::{
    AssumeRoleRequest, AssumedCredentials, CallerIdentity, ProviderFuture, StsApi,
};

use super::{AwsCli, argv};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleOutput {
    credentials: CredentialsRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsRecord {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityRecord {
    account: String,
    arn: String,
}

impl<R: CommandRunner + 'static> StsApi for AwsCli<R> {
    fn assume_role<'a>(
        &'a self,
        request: &'a AssumeRoleRequest,
    ) -> ProviderFuture<'a, AssumedCredentials> {
        Box::pin(async move {
            let duration = request.duration_secs.to_string();
            let mut args = argv([
                "--role-arn",
                request.role_arn.as_str(),
                "--role-session-name",
                request.session_name.as_str(),
                "--duration-seconds",
                duration.as_str(),
            ]);
            if let Some(external_id) = &request.external_id {
                args.extend(argv(["--external-id", external_id.as_str()]));
            }
            let output: AssumeRoleOutput = self.invoke_json("sts", "assume-role", args).await?;
            let creds = output.credentials;
            Ok(AssumedCredentials {
                access_key_id: creds.access_key_id,
                secret_access_key: creds.secret_access_key,
                session_token: creds.session_token,
                expiration: creds.expiration,
            })
        })
    }

    fn caller_identity(&self) -> ProviderFuture<'_, CallerIdentity> {
        Box::pin(async move {
            let record: IdentityRecord = self
                .invoke_json("sts", "get-caller-identity", Vec::new())
                .await?;
            Ok(CallerIdentity {
                account: record.account,
                arn: record.arn,
            })
        })
    }
}
