use crate::datetime_utils::now_utc;
use crate::error_utils::{parse_json_with_context, serialize_to_json_with_context};
use crate::filename_utils::{backup_record_filename, failed_upload_filename, sanitized_file_path};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Marks a tweet whose media have all been attempted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub tweet_id: String,
    /// Screen name of the tweet's author
    pub owner_id: String,
    /// `created_at` of the tweet as the source reported it
    pub tweet_timestamp: String,
    pub recorded_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn new(tweet_id: &str, owner_id: &str, tweet_timestamp: &str) -> Self {
        Self {
            tweet_id: tweet_id.to_string(),
            owner_id: owner_id.to_string(),
            tweet_timestamp: tweet_timestamp.to_string(),
            recorded_at: now_utc(),
        }
    }
}

/// A media item whose save failed; the URL is the key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FailedUpload {
    pub url: String,
    pub description: String,
    pub owner_id: String,
}

/// Durable record of what has been backed up and what still needs a retry.
/// Every operation is idempotent for the same key.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn insert_backup_record(&self, record: &BackupRecord) -> Result<()>;

    /// Insert or replace the failed upload with the same URL
    async fn insert_failed_upload(&self, failed: &FailedUpload) -> Result<()>;

    /// The subset of `tweet_ids` with no backup record
    async fn fetch_not_backed_up(&self, tweet_ids: &[String]) -> Result<HashSet<String>>;

    async fn fetch_failed_uploads(&self) -> Result<Vec<FailedUpload>>;

    /// Deleting an absent URL is not an error
    async fn delete_failed_upload(&self, url: &str) -> Result<()>;
}

/// JSON files under the data directory:
/// `backed_up/{tweet_id}.json` and `failed_uploads/{sha256(url)}.json`
pub struct FileStore {
    backed_up_dir: PathBuf,
    failed_dir: PathBuf,
}

impl FileStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let backed_up_dir = data_dir.join("backed_up");
        let failed_dir = data_dir.join("failed_uploads");

        for dir in [&backed_up_dir, &failed_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
        }

        debug!("Using file store at {path}", path = data_dir.display());

        Ok(Self {
            backed_up_dir,
            failed_dir,
        })
    }

    fn backup_record_path(&self, tweet_id: &str) -> PathBuf {
        sanitized_file_path(&self.backed_up_dir, &backup_record_filename(tweet_id))
    }

    fn failed_upload_path(&self, url: &str) -> PathBuf {
        self.failed_dir.join(failed_upload_filename(url))
    }
}

/// Write via a temporary sibling and rename, so readers never see half a file
async fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp_path, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("Failed to move record into {}", path.display()));
    }

    Ok(())
}

#[async_trait]
impl BackupStore for FileStore {
    async fn insert_backup_record(&self, record: &BackupRecord) -> Result<()> {
        debug!(
            "Recording backup of tweet {tweet_id} by {owner}",
            tweet_id = record.tweet_id,
            owner = record.owner_id
        );
        let json = serialize_to_json_with_context(record, "backup record")?;
        write_atomically(&self.backup_record_path(&record.tweet_id), &json).await
    }

    async fn insert_failed_upload(&self, failed: &FailedUpload) -> Result<()> {
        debug!("Recording failed upload {url}", url = failed.url);
        let json = serialize_to_json_with_context(failed, "failed upload")?;
        write_atomically(&self.failed_upload_path(&failed.url), &json).await
    }

    async fn fetch_not_backed_up(&self, tweet_ids: &[String]) -> Result<HashSet<String>> {
        let mut missing = HashSet::new();
        for tweet_id in tweet_ids {
            let exists = tokio::fs::try_exists(self.backup_record_path(tweet_id))
                .await
                .with_context(|| format!("Failed to check backup record for {tweet_id}"))?;
            if !exists {
                missing.insert(tweet_id.clone());
            }
        }
        Ok(missing)
    }

    async fn fetch_failed_uploads(&self) -> Result<Vec<FailedUpload>> {
        let dir = self
            .failed_dir
            .to_str()
            .context("Store directory path contains invalid UTF-8")?;
        let pattern = format!("{dir}/*.json");

        let mut failed_uploads = Vec::new();
        for path in glob::glob(&pattern)?.flatten() {
            let json = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;

            match parse_json_with_context::<FailedUpload>(&json, "failed upload") {
                Ok(failed) => failed_uploads.push(failed),
                Err(e) => warn!("Skipping unreadable record {path}: {e:#}", path = path.display()),
            }
        }

        // glob yields paths sorted by hash; sort by URL for stable output
        failed_uploads.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(failed_uploads)
    }

    async fn delete_failed_upload(&self, url: &str) -> Result<()> {
        match tokio::fs::remove_file(self.failed_upload_path(url)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete failed upload {url}")),
        }
    }
}
