//! Identity service (`aws iam`) operations.

use serde::Deserialize;

use crate::process::CommandRunner;
use crate::provider::{IdentityApi, InstanceProfileInfo, ProviderFuture, RoleInfo};

use super::{AwsCli, argv, encode};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleEnvelope {
    role: RoleRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleRecord {
    role_name: String,
    arn: String,
    #[serde(default)]
    assume_role_policy_document: serde_json::Value,
}

impl From<RoleRecord> for RoleInfo {
    fn from(record: RoleRecord) -> Self {
        // Older clients return the document URL-decoded but still as a string.
        let trust_policy = match record.assume_role_policy_document {
            serde_json::Value::String(raw) => {
                serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
            }
            other => other,
        };
        Self {
            name: record.role_name,
            arn: record.arn,
            trust_policy,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicies {
    #[serde(default)]
    attached_policies: Vec<AttachedPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicy {
    policy_arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileEnvelope {
    instance_profile: ProfileRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileRecord {
    instance_profile_name: String,
    arn: String,
    #[serde(default)]
    roles: Vec<ProfileRole>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileRole {
    role_name: String,
}

impl From<ProfileRecord> for InstanceProfileInfo {
    fn from(record: ProfileRecord) -> Self {
        Self {
            name: record.instance_profile_name,
            arn: record.arn,
            roles: record.roles.into_iter().map(|role| role.role_name).collect(),
        }
    }
}

impl<R: CommandRunner + 'static> IdentityApi for AwsCli<R> {
    fn get_role<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<RoleInfo>> {
        Box::pin(async move {
            match self
                .invoke_json::<RoleEnvelope>("iam", "get-role", argv(["--role-name", name]))
                .await
            {
                Ok(envelope) => Ok(Some(envelope.role.into())),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn create_role<'a>(
        &'a self,
        name: &'a str,
        trust_policy: &'a serde_json::Value,
    ) -> ProviderFuture<'a, RoleInfo> {
        Box::pin(async move {
            let document = encode(trust_policy)?;
            let envelope: RoleEnvelope = self
                .invoke_json(
                    "iam",
                    "create-role",
                    argv([
                        "--role-name",
                        name,
                        "--assume-role-policy-document",
                        document.as_str(),
                    ]),
                )
                .await?;
            Ok(envelope.role.into())
        })
    }

    fn update_trust_policy<'a>(
        &'a self,
        name: &'a str,
        trust_policy: &'a serde_json::Value,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let document = encode(trust_policy)?;
            self.invoke(
                "iam",
                "update-assume-role-policy",
                argv(["--role-name", name, "--policy-document", document.as_str()]),
            )
            .await?;
            Ok(())
        })
    }

    fn list_attached_policies<'a>(&'a self, role: &'a str) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            let listing: AttachedPolicies = self
                .invoke_json(
                    "iam",
                    "list-attached-role-policies",
                    argv(["--role-name", role]),
                )
                .await?;
            Ok(listing
                .attached_policies
                .into_iter()
                .map(|policy| policy.policy_arn)
                .collect())
        })
    }

    fn attach_policy<'a>(&'a self, role: &'a str, policy_arn: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "iam",
                "attach-role-policy",
                argv(["--role-name", role, "--policy-arn", policy_arn]),
            )
            .await?;
            Ok(())
        })
    }

    fn get_instance_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceProfileInfo>> {
        Box::pin(async move {
            match self
                .invoke_json::<ProfileEnvelope>(
                    "iam",
                    "get-instance-profile",
                    argv(["--instance-profile-name", name]),
                )
                .await
            {
                Ok(envelope) => Ok(Some(envelope.instance_profile.into())),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn create_instance_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, InstanceProfileInfo> {
        Box::pin(async move {
            let envelope: ProfileEnvelope = self
                .invoke_json(
                    "iam",
                    "create-instance-profile",
                    argv(["--instance-profile-name", name]),
                )
                .await?;
            Ok(envelope.instance_profile.into())
        })
    }

    fn add_role_to_instance_profile<'a>(
        &'a self,
        profile: &'a str,
        role: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "iam",
                "add-role-to-instance-profile",
                argv(["--instance-profile-name", profile, "--role-name", role]),
            )
            .await?;
            Ok(())
        })
    }

    fn remove_role_from_instance_profile<'a>(
        &'a self,
        profile: &'a str,
        role: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "iam",
                "remove-role-from-instance-profile",
                argv(["--instance-profile-name", profile, "--role-name", role]),
            )
            .await?;
            Ok(())
        })
    }
}
