//! Container registry (`aws ecr`) operations.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::process::CommandRunner;
use crate::provider::{
    BatchDeleteOutcome, ImageDeleteFailure, ProviderError, ProviderFuture, RegistryApi,
    RegistryImage, RegistryImageRef, RegistryToken, RepositoryInfo,
};

use super::{AwsCli, argv, encode};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageDetails {
    #[serde(default)]
    image_details: Vec<ImageDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageDetail {
    image_digest: String,
    #[serde(default)]
    image_tags: Vec<String>,
    image_pushed_at: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchDeleteRecord {
    #[serde(default)]
    image_ids: Vec<serde_json::Value>,
    #[serde(default)]
    failures: Vec<FailureRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailureRecord {
    image_id: Option<FailedImageId>,
    #[serde(default)]
    failure_code: String,
    #[serde(default)]
    failure_reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedImageId {
    image_digest: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Repositories {
    #[serde(default)]
    repositories: Vec<RepositoryRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRepository {
    repository: RepositoryRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryRecord {
    repository_name: String,
    repository_uri: String,
}

impl From<RepositoryRecord> for RepositoryInfo {
    fn from(record: RepositoryRecord) -> Self {
        Self {
            name: record.repository_name,
            uri: record.repository_uri,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationData {
    #[serde(default)]
    authorization_data: Vec<AuthorizationRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationRecord {
    authorization_token: String,
    proxy_endpoint: String,
    expires_at: Option<serde_json::Value>,
}

/// Registry timestamps arrive as ISO 8601 strings (v2 clients) or epoch seconds.
fn parse_timestamp(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    match value? {
        serde_json::Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|stamp| stamp.with_timezone(&Utc)),
        serde_json::Value::Number(number) => {
            number.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0))
        }
        _ => None,
    }
}

impl<R: CommandRunner + 'static> RegistryApi for AwsCli<R> {
    fn describe_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, Option<RepositoryInfo>> {
        Box::pin(async move {
            let found: Repositories = match self
                .invoke_json(
                    "ecr",
                    "describe-repositories",
                    argv(["--repository-names", repository]),
                )
                .await
            {
                Ok(found) => found,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            Ok(found.repositories.into_iter().next().map(RepositoryInfo::from))
        })
    }

    fn create_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, RepositoryInfo> {
        Box::pin(async move {
            let created: CreatedRepository = self
                .invoke_json(
                    "ecr",
                    "create-repository",
                    argv([
                        "--repository-name",
                        repository,
                        "--image-scanning-configuration",
                        "scanOnPush=true",
                        "--image-tag-mutability",
                        "MUTABLE",
                    ]),
                )
                .await?;
            Ok(created.repository.into())
        })
    }

    fn authorization_token(&self) -> ProviderFuture<'_, RegistryToken> {
        Box::pin(async move {
            let data: AuthorizationData = self
                .invoke_json("ecr", "get-authorization-token", Vec::new())
                .await?;
            let record = data.authorization_data.into_iter().next().ok_or_else(|| {
                ProviderError::transport("get-authorization-token returned no token")
            })?;
            Ok(RegistryToken {
                expires_at: parse_timestamp(record.expires_at.as_ref()),
                token: record.authorization_token,
                endpoint: record.proxy_endpoint,
            })
        })
    }

    fn list_images<'a>(
        &'a self,
        repository: &'a str,
    ) -> ProviderFuture<'a, Vec<RegistryImage>> {
        Box::pin(async move {
            let details: ImageDetails = self
                .invoke_json(
                    "ecr",
                    "describe-images",
                    argv(["--repository-name", repository]),
                )
                .await?;
            Ok(details
                .image_details
                .into_iter()
                .map(|detail| RegistryImage {
                    pushed_at: parse_timestamp(detail.image_pushed_at.as_ref()),
                    digest: detail.image_digest,
                    tags: detail.image_tags,
                })
                .collect())
        })
    }

    fn batch_delete_images<'a>(
        &'a self,
        repository: &'a str,
        images: &'a [RegistryImageRef],
    ) -> ProviderFuture<'a, BatchDeleteOutcome> {
        Box::pin(async move {
            let ids = encode(&images)?;
            let record: BatchDeleteRecord = self
                .invoke_json(
                    "ecr",
                    "batch-delete-image",
                    argv([
                        "--repository-name",
                        repository,
                        "--image-ids",
                        ids.as_str(),
                    ]),
                )
                .await?;
            Ok(BatchDeleteOutcome {
                deleted: record.image_ids.len(),
                failures: record
                    .failures
                    .into_iter()
                    .map(|failure| ImageDeleteFailure {
                        digest: failure.image_id.and_then(|id| id.image_digest),
                        code: failure.failure_code,
                        reason: failure.failure_reason,
                    })
                    .collect(),
            })
        })
    }
}
