//! S3 object storage for backups.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use dblab_common::backup::ObjectStore;
use dblab_common::Error;

use crate::aws::{args, decode, AwsRunner};
use crate::ProvisionError;

/// [`ObjectStore`] for one bucket over `aws s3` / `aws s3api`.
#[derive(Clone)]
pub struct S3Store {
    aws: Arc<dyn AwsRunner>,
    bucket: String,
}

impl S3Store {
    /// Store objects in `bucket`
    pub fn new(aws: Arc<dyn AwsRunner>, bucket: impl Into<String>) -> Self {
        Self {
            aws,
            bucket: bucket.into(),
        }
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `s3://bucket/key`
    pub fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    fn s3(&self, cmd: Vec<String>) -> dblab_common::Result<()> {
        self.aws.text(&cmd).map(|_| ()).map_err(store_err)
    }
}

fn store_err(e: ProvisionError) -> Error {
    Error::ObjectStore(e.to_string())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn dir_key(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<S3Object>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3Object {
    key: String,
}

impl ObjectStore for S3Store {
    fn upload_file(&self, local: &Path, key: &str) -> dblab_common::Result<()> {
        debug!(key = %key, "Uploading to s3");
        self.s3(args([
            "s3".to_string(),
            "cp".to_string(),
            path_arg(local),
            self.url(key),
            "--only-show-errors".to_string(),
        ]))
    }

    fn upload_directory(&self, local: &Path, prefix: &str) -> dblab_common::Result<()> {
        debug!(prefix = %prefix, "Syncing directory to s3");
        self.s3(args([
            "s3".to_string(),
            "sync".to_string(),
            path_arg(local),
            self.url(&dir_key(prefix)),
            "--delete".to_string(),
            "--only-show-errors".to_string(),
        ]))
    }

    fn download_file(&self, key: &str, local: &Path) -> dblab_common::Result<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        self.s3(args([
            "s3".to_string(),
            "cp".to_string(),
            self.url(key),
            path_arg(local),
            "--only-show-errors".to_string(),
        ]))
    }

    fn download_directory(&self, prefix: &str, local: &Path) -> dblab_common::Result<()> {
        fs::create_dir_all(local)
            .map_err(|e| Error::io(format!("failed to create {}", local.display()), e))?;
        self.s3(args([
            "s3".to_string(),
            "sync".to_string(),
            self.url(&dir_key(prefix)),
            path_arg(local),
            "--only-show-errors".to_string(),
        ]))
    }

    fn exists(&self, key: &str) -> dblab_common::Result<bool> {
        let value = self
            .aws
            .json(&args([
                "s3api",
                "list-objects-v2",
                "--bucket",
                self.bucket.as_str(),
                "--prefix",
                key,
                "--max-items",
                "2",
            ]))
            .map_err(store_err)?;
        let listing: ListObjectsOutput = if value.is_null() {
            ListObjectsOutput::default()
        } else {
            decode("s3api list-objects-v2", value).map_err(store_err)?
        };

        let is_prefix = key.ends_with('/');
        Ok(listing
            .contents
            .iter()
            .any(|o| if is_prefix { o.key.starts_with(key) } else { o.key == key }))
    }
}
