//! Object storage (`aws s3api`, `aws s3 presign`) operations.

use std::time::Duration;

use camino::Utf8Path;
use serde_json::json;

use crate::process::CommandRunner;
use crate::provider::{ProviderFuture, StorageApi};

use super::{AwsCli, argv, encode};

/// Region whose buckets take no location constraint.
const DEFAULT_BUCKET_REGION: &str = "us-east-1";

impl<R: CommandRunner + 'static> StorageApi for AwsCli<R> {
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            match self
                .invoke("s3api", "head-bucket", argv(["--bucket", bucket]))
                .await
            {
                Ok(_) => Ok(true),
                Err(err) if err.is_not_found() => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn create_bucket<'a>(&'a self, bucket: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut args = argv(["--bucket", bucket]);
            let region = self.settings.region.as_str();
            if region != DEFAULT_BUCKET_REGION {
                args.extend(argv([
                    String::from("--create-bucket-configuration"),
                    format!("LocationConstraint={region}"),
                ]));
            }
            self.invoke("s3api", "create-bucket", args).await?;
            Ok(())
        })
    }

    fn put_expiration_rule<'a>(&'a self, bucket: &'a str, days: u32) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let lifecycle = encode(&json!({
                "Rules": [{
                    "ID": "expire-staged-transfers",
                    "Status": "Enabled",
                    "Filter": { "Prefix": "" },
                    "Expiration": { "Days": days },
                }]
            }))?;
            self.invoke(
                "s3api",
                "put-bucket-lifecycle-configuration",
                argv([
                    "--bucket",
                    bucket,
                    "--lifecycle-configuration",
                    lifecycle.as_str(),
                ]),
            )
            .await?;
            Ok(())
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        source: &'a Utf8Path,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "s3api",
                "put-object",
                argv(["--bucket", bucket, "--key", key, "--body", source.as_str()]),
            )
            .await?;
            Ok(())
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        destination: &'a Utf8Path,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "s3api",
                "get-object",
                argv(["--bucket", bucket, "--key", key, destination.as_str()]),
            )
            .await?;
            Ok(())
        })
    }

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.invoke(
                "s3api",
                "delete-object",
                argv(["--bucket", bucket, "--key", key]),
            )
            .await?;
            Ok(())
        })
    }

    fn presign_get<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        expires_in: Duration,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let url = self
                .invoke(
                    "s3",
                    "presign",
                    argv([
                        format!("s3://{bucket}/{key}"),
                        String::from("--expires-in"),
                        expires_in.as_secs().to_string(),
                    ]),
                )
                .await?;
            Ok(url.trim().to_owned())
        })
    }
}
