//! File transfers between the caller and an instance or its container.
//!
//! Files are staged in an account-owned bucket. Uploads hand the instance a
//! presigned URL to fetch; downloads have the instance copy the file to the
//! bucket with its own role before the caller fetches it. The staged object
//! is deleted afterwards, and a bucket expiry rule removes anything a failed
//! cleanup leaves behind.

use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::scripts;
use crate::channel::{CommandTiming, StepResult};
use crate::local_fs::{is_dir, open_parent};
use crate::provider::{CommandApi, ProviderError, StorageApi};

use super::{InstanceOperations, OperationError, mentions_missing_container};

/// Days after which staged objects expire.
pub const STAGING_EXPIRY_DAYS: u32 = 1;

/// Lifetime of the URL an instance fetches an upload from.
pub const PRESIGN_LIFETIME: Duration = Duration::from_secs(3600);

/// Timing of the instance side of a transfer.
pub const TRANSFER_TIMING: CommandTiming =
    CommandTiming::long_running(Duration::from_secs(300));

/// Bucket staging transfers for one account and region.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagingBucket {
    /// Bucket name.
    pub name: String,
    /// Region the bucket and the instances live in.
    pub region: String,
}

impl StagingBucket {
    /// The staging bucket of `account_id` in `region`.
    #[must_use]
    pub fn for_account(account_id: &str, region: &str) -> Self {
        Self {
            name: format!("skiff-transfers-{account_id}-{region}"),
            region: region.to_owned(),
        }
    }
}

/// A file moving between the caller and an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileTransfer {
    /// Target instance.
    pub instance_id: String,
    /// File on the caller's machine. A download into an existing directory
    /// keeps the remote file name.
    pub local_path: Utf8PathBuf,
    /// File on the instance or in the container. An upload to a path ending
    /// in `/` keeps the local file name.
    pub remote_path: String,
    /// Container to copy into or out of, instead of the host.
    pub container: Option<String>,
}

/// Outcome of a completed transfer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TransferReceipt {
    /// Instance involved.
    pub instance_id: String,
    /// Where the file came from.
    pub source: String,
    /// Where the file was written.
    pub destination: String,
    /// Container involved, if any.
    pub container: Option<String>,
    /// Size of the transferred file.
    pub bytes: u64,
}

impl<P: CommandApi + StorageApi + ?Sized> InstanceOperations<'_, P> {
    /// Copies a local file onto the instance, or into one of its
    /// containers.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::LocalFileNotFound`] when the local file is
    /// missing, [`OperationError::ContainerNotFound`] when the container
    /// does not exist, [`OperationError::CommandFailed`] when the instance
    /// cannot fetch the file, and [`OperationError::Provider`] for storage
    /// failures.
    pub async fn upload(
        &self,
        bucket: &StagingBucket,
        transfer: &FileTransfer,
    ) -> Result<TransferReceipt, OperationError> {
        let (bytes, file_name) = local_file(&transfer.local_path)?;
        let destination = remote_destination(&transfer.remote_path, &file_name);
        self.ensure_bucket(bucket).await?;

        let transfer_id = transfer_id();
        let key = format!(
            "uploads/{}/{transfer_id}/{file_name}",
            transfer.instance_id
        );
        self.api
            .put_object(&bucket.name, &key, &transfer.local_path)
            .await
            .map_err(provider_failure("stage upload"))?;
        let delivered = self
            .deliver(bucket, &key, transfer, &destination, &transfer_id)
            .await;
        self.discard(bucket, &key).await;
        delivered?;

        info!(
            instance_id = %transfer.instance_id,
            destination = %destination,
            bytes,
            "upload complete"
        );
        Ok(TransferReceipt {
            instance_id: transfer.instance_id.clone(),
            source: transfer.local_path.to_string(),
            destination,
            container: transfer.container.clone(),
            bytes,
        })
    }

    /// Copies a file from the instance, or from one of its containers, to
    /// the caller's machine.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::InvalidRemotePath`] when the remote path
    /// names no file, [`OperationError::RemoteFileNotFound`] or
    /// [`OperationError::ContainerNotFound`] when the source is missing,
    /// [`OperationError::LocalFile`] when the local copy cannot be written,
    /// and [`OperationError::Provider`] for storage failures.
    pub async fn download(
        &self,
        bucket: &StagingBucket,
        transfer: &FileTransfer,
    ) -> Result<TransferReceipt, OperationError> {
        let file_name = remote_file_name(&transfer.remote_path)?;
        let destination = if is_dir(&transfer.local_path) {
            transfer.local_path.join(file_name)
        } else {
            transfer.local_path.clone()
        };
        self.ensure_bucket(bucket).await?;

        let transfer_id = transfer_id();
        let key = format!(
            "downloads/{}/{transfer_id}/{file_name}",
            transfer.instance_id
        );
        let collected = self
            .collect(bucket, &key, transfer, &destination, &transfer_id)
            .await;
        self.discard(bucket, &key).await;
        collected?;

        let (bytes, _) = local_file(&destination)?;
        info!(
            instance_id = %transfer.instance_id,
            destination = %destination,
            bytes,
            "download complete"
        );
        Ok(TransferReceipt {
            instance_id: transfer.instance_id.clone(),
            source: transfer.remote_path.clone(),
            destination: destination.into_string(),
            container: transfer.container.clone(),
            bytes,
        })
    }

    async fn deliver(
        &self,
        bucket: &StagingBucket,
        key: &str,
        transfer: &FileTransfer,
        destination: &str,
        transfer_id: &str,
    ) -> Result<(), OperationError> {
        let url = self
            .api
            .presign_get(&bucket.name, key, PRESIGN_LIFETIME)
            .await
            .map_err(provider_failure("presign staged upload"))?;
        let script = scripts::fetch_from_url(
            &url,
            destination,
            transfer.container.as_deref(),
            transfer_id,
        );
        let result = self
            .run_timed(&transfer.instance_id, &script, TRANSFER_TIMING)
            .await?;
        transfer_outcome(&result, transfer, destination)
    }

    async fn collect(
        &self,
        bucket: &StagingBucket,
        key: &str,
        transfer: &FileTransfer,
        destination: &Utf8Path,
        transfer_id: &str,
    ) -> Result<(), OperationError> {
        let target = format!("s3://{}/{key}", bucket.name);
        let script = scripts::push_to_storage(
            &transfer.remote_path,
            &target,
            &bucket.region,
            transfer.container.as_deref(),
            transfer_id,
        );
        let result = self
            .run_timed(&transfer.instance_id, &script, TRANSFER_TIMING)
            .await?;
        transfer_outcome(&result, transfer, &transfer.remote_path)?;
        self.api
            .get_object(&bucket.name, key, destination)
            .await
            .map_err(|source| {
                if source.is_not_found() {
                    OperationError::CommandFailed {
                        detail: format!("the instance reported success but {target} is missing"),
                    }
                } else {
                    OperationError::Provider {
                        operation: "fetch staged download",
                        source,
                    }
                }
            })
    }

    async fn ensure_bucket(&self, bucket: &StagingBucket) -> Result<(), OperationError> {
        if self
            .api
            .bucket_exists(&bucket.name)
            .await
            .map_err(provider_failure("check staging bucket"))?
        {
            return Ok(());
        }
        info!(bucket = %bucket.name, "creating staging bucket");
        match self.api.create_bucket(&bucket.name).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => return Ok(()),
            Err(source) => {
                return Err(OperationError::Provider {
                    operation: "create staging bucket",
                    source,
                });
            }
        }
        self.api
            .put_expiration_rule(&bucket.name, STAGING_EXPIRY_DAYS)
            .await
            .map_err(provider_failure("set staging expiry"))
    }

    async fn discard(&self, bucket: &StagingBucket, key: &str) {
        if let Err(err) = self.api.delete_object(&bucket.name, key).await {
            warn!(bucket = %bucket.name, key, error = %err, "failed to delete staged object");
        }
    }
}

fn provider_failure(operation: &'static str) -> impl FnOnce(ProviderError) -> OperationError {
    move |source| OperationError::Provider { operation, source }
}

fn transfer_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn transfer_outcome(
    result: &StepResult,
    transfer: &FileTransfer,
    remote_path: &str,
) -> Result<(), OperationError> {
    if result.success {
        return Ok(());
    }
    let detail = result.failure_detail();
    if let Some(name) = transfer.container.as_deref()
        && mentions_missing_container(&detail)
    {
        return Err(OperationError::ContainerNotFound {
            container: name.to_owned(),
        });
    }
    if mentions_missing_file(&detail) {
        return Err(OperationError::RemoteFileNotFound {
            path: remote_path.to_owned(),
        });
    }
    Err(OperationError::CommandFailed { detail })
}

fn mentions_missing_file(text: &str) -> bool {
    text.contains("No such file") || text.contains("Could not find the file")
}

/// Size and file name of a readable local file.
fn local_file(path: &Utf8Path) -> Result<(u64, String), OperationError> {
    let local_error = |err: &io::Error| {
        if err.kind() == io::ErrorKind::NotFound {
            OperationError::LocalFileNotFound {
                path: path.to_string(),
            }
        } else {
            OperationError::LocalFile {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    };
    let (dir, name) = open_parent(path).map_err(|err| local_error(&err))?;
    let metadata = dir.metadata(&name).map_err(|err| local_error(&err))?;
    if metadata.is_dir() {
        return Err(OperationError::LocalFile {
            path: path.to_string(),
            message: String::from("is a directory"),
        });
    }
    Ok((metadata.len(), name))
}

/// Last component of a remote path.
fn remote_file_name(remote_path: &str) -> Result<&str, OperationError> {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .ok_or_else(|| OperationError::InvalidRemotePath {
            path: remote_path.to_owned(),
        })
}

/// Appends `file_name` when `remote_path` names a directory.
fn remote_destination(remote_path: &str, file_name: &str) -> String {
    if remote_path.ends_with('/') {
        format!("{remote_path}{file_name}")
    } else {
        remote_path.to_owned()
    }
}
