use crate::download::MediaDownloader;
use crate::filename_utils::staging_path;
use crate::media::{normalize_media_url, ResolvedTweet};
use crate::retry::{with_retry, RetryPolicy, TransferError};
use crate::sink::MediaSink;
use crate::store::{BackupRecord, BackupStore, FailedUpload};
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Resolved tweets for one cycle, keyed by tweet id. Later inserts for the
/// same id replace earlier ones; entries without media are never stored.
#[derive(Debug, Default, Clone)]
pub struct MediaBatch {
    entries: BTreeMap<String, ResolvedTweet>,
}

impl MediaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resolved: ResolvedTweet) {
        if !resolved.has_media() {
            return;
        }
        self.entries.insert(resolved.id().to_string(), resolved);
    }

    pub fn extend(&mut self, resolved: impl IntoIterator<Item = ResolvedTweet>) {
        for entry in resolved {
            self.insert(entry);
        }
    }

    pub fn get(&self, tweet_id: &str) -> Option<&ResolvedTweet> {
        self.entries.get(tweet_id)
    }

    pub fn contains(&self, tweet_id: &str) -> bool {
        self.entries.contains_key(tweet_id)
    }

    /// Entries whose id is absent from `previous`
    pub fn difference(&self, previous: &MediaBatch) -> MediaBatch {
        let mut new_entries = MediaBatch::new();
        new_entries.extend(
            self.iter()
                .filter(|entry| !previous.contains(entry.id()))
                .cloned(),
        );
        new_entries
    }

    pub fn merge(&mut self, other: MediaBatch) {
        self.entries.extend(other.entries);
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedTweet> {
        self.entries.values()
    }
}

/// Outcome of one `backup_media` call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupSummary {
    pub tweets_recorded: usize,
    pub media_saved: usize,
    pub media_failed: usize,
    pub store_errors: usize,
}

/// Downloads, uploads and records media. Shared by the poll loop and the
/// failed upload queue.
pub struct BackupService {
    store: Arc<dyn BackupStore>,
    sink: Arc<dyn MediaSink>,
    downloader: MediaDownloader,
    download_dir: PathBuf,
    policy: RetryPolicy,
}

impl BackupService {
    pub fn new(
        store: Arc<dyn BackupStore>,
        sink: Arc<dyn MediaSink>,
        downloader: MediaDownloader,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            sink,
            downloader,
            download_dir,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &dyn BackupStore {
        self.store.as_ref()
    }

    pub fn sink(&self) -> &dyn MediaSink {
        self.sink.as_ref()
    }

    /// Stage one media item and hand it to the sink. Returns whether the
    /// item reached the sink; failures are logged, never propagated.
    pub async fn save_media(&self, url: &str, description: &str, owner: &str) -> bool {
        let download_url = normalize_media_url(url);
        let staged = staging_path(&self.download_dir, owner, url);

        let downloaded = with_retry(&self.policy, "download", || {
            self.downloader.download(&download_url, &staged)
        })
        .await;

        if let Err(e) = downloaded {
            error!("Download failed for {url}: {e}");
            return false;
        }

        let uploaded: Result<(), TransferError> = with_retry(&self.policy, "upload", || {
            self.sink.upload(&staged, description)
        })
        .await;

        if !self.sink.keeps_staged_files() {
            if let Err(e) = tokio::fs::remove_file(&staged).await {
                warn!(
                    "Failed to remove staged file {path}: {e}",
                    path = staged.display()
                );
            }
        }

        match uploaded {
            Ok(()) => {
                info!(
                    "Saved {url} for {owner} via {sink}",
                    sink = self.sink.name()
                );
                true
            }
            Err(e) => {
                error!("Upload failed for {url}: {e}");
                false
            }
        }
    }

    /// The ids among `tweet_ids` that have no backup record yet
    pub async fn not_yet_backed_up(&self, tweet_ids: &[String]) -> Result<HashSet<String>> {
        if tweet_ids.is_empty() {
            return Ok(HashSet::new());
        }
        self.store.fetch_not_backed_up(tweet_ids).await
    }

    /// Back up every tweet in `batch` that has not been backed up before.
    ///
    /// Each tweet is recorded once all its media were attempted, whatever the
    /// outcome; media that could not be saved go to the failed upload queue.
    pub async fn backup_media(&self, batch: &MediaBatch) -> BackupSummary {
        let mut summary = BackupSummary::default();

        if batch.is_empty() {
            info!("No media found in this cycle");
            return summary;
        }

        let targets = match self.not_yet_backed_up(&batch.ids()).await {
            Ok(targets) => targets,
            Err(e) => {
                error!("Failed to look up backed up tweets: {e:#}");
                summary.store_errors += 1;
                return summary;
            }
        };

        if targets.is_empty() {
            info!(
                "All {count} tweets with media are already backed up",
                count = batch.len()
            );
            return summary;
        }

        if let Err(e) = self.sink.prepare().await {
            // Uploads may still work without the album, so keep going
            warn!("Failed to prepare {sink}: {e:#}", sink = self.sink.name());
        }

        info!(
            "Backing up {new} of {total} tweets with media",
            new = targets.len(),
            total = batch.len()
        );

        for resolved in batch.iter().filter(|entry| targets.contains(entry.id())) {
            let tweet = &resolved.tweet;
            let owner = resolved.owner();
            let description = tweet.description();
            let mut failed_urls = Vec::new();

            for url in &resolved.urls {
                if self.save_media(url, &description, owner).await {
                    summary.media_saved += 1;
                } else {
                    summary.media_failed += 1;
                    failed_urls.push(url.clone());
                }
            }

            let record = BackupRecord::new(tweet.id_str.as_str(), owner, &tweet.created_at);
            // Failed media are queued even when the record could not be written
            match self.store.insert_backup_record(&record).await {
                Ok(()) => summary.tweets_recorded += 1,
                Err(e) => {
                    error!(
                        "Failed to record backup of tweet {tweet_id}: {e:#}",
                        tweet_id = tweet.id_str
                    );
                    summary.store_errors += 1;
                }
            }

            if failed_urls.is_empty() {
                debug!(
                    "All media of tweet {tweet_id} saved",
                    tweet_id = tweet.id_str
                );
                continue;
            }

            for url in failed_urls {
                let failed = FailedUpload {
                    url,
                    description: description.clone(),
                    owner_id: owner.to_string(),
                };
                if let Err(e) = self.store.insert_failed_upload(&failed).await {
                    error!(
                        "Failed to queue {url} of tweet {tweet_id} for retry: {e:#}",
                        url = failed.url,
                        tweet_id = tweet.id_str
                    );
                    summary.store_errors += 1;
                }
            }
        }

        summary
    }
}
