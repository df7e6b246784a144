use anyhow::Result;
use tracing::info;

use crate::backup::BackupService;
use crate::retry_queue::drain_failed_uploads;

/// One pass over the failed upload queue, outside the daemon loop
pub async fn execute(service: &BackupService) -> Result<()> {
    let summary = drain_failed_uploads(service).await;

    info!(
        "Retried {attempted} failed uploads: {recovered} recovered, {still_failing} still queued",
        attempted = summary.attempted,
        recovered = summary.recovered,
        still_failing = summary.still_failing
    );

    Ok(())
}
