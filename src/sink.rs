use crate::retry::TransferError;
use anyhow::Result;
use async_trait::async_trait;
use clap::ValueEnum;
use std::path::Path;
use tracing::debug;

/// Where staged media ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SaveMode {
    /// Keep the downloaded file in the download directory
    Local,
    /// Upload to Google Photos and remove the staged file
    Google,
}

/// Destination for staged media files
#[async_trait]
pub trait MediaSink: Send + Sync {
    fn name(&self) -> &str;

    /// True when the staged file is the backup itself and must not be removed
    fn keeps_staged_files(&self) -> bool {
        false
    }

    /// Once-per-cycle setup (album lookup and similar)
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, file_path: &Path, description: &str) -> Result<(), TransferError>;
}

/// Local mode: the staged download is the backup
#[derive(Debug, Default)]
pub struct LocalSink;

#[async_trait]
impl MediaSink for LocalSink {
    fn name(&self) -> &str {
        "local"
    }

    fn keeps_staged_files(&self) -> bool {
        true
    }

    async fn upload(&self, file_path: &Path, _description: &str) -> Result<(), TransferError> {
        debug!("Keeping {path} locally", path = file_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_sink_keeps_files() {
        let sink = LocalSink;
        assert!(sink.keeps_staged_files());
        assert_eq!(sink.name(), "local");
        sink.prepare().await.unwrap();
        sink.upload(Path::new("/nonexistent"), "desc").await.unwrap();
    }
}
