use crate::backup::BackupService;
use tracing::{debug, error, info, warn};

/// Outcome of one pass over the failed upload queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
}

/// Retry every queued failed upload once. Recovered items leave the queue;
/// the rest stay for the next pass.
pub async fn drain_failed_uploads(service: &BackupService) -> DrainSummary {
    let mut summary = DrainSummary::default();

    let failed_uploads = match service.store().fetch_failed_uploads().await {
        Ok(failed_uploads) => failed_uploads,
        Err(e) => {
            error!("Failed to fetch queued failed uploads: {e:#}");
            return summary;
        }
    };

    if failed_uploads.is_empty() {
        debug!("No failed uploads to retry");
        return summary;
    }

    info!(
        "Retrying {count} failed uploads",
        count = failed_uploads.len()
    );

    if let Err(e) = service.sink().prepare().await {
        warn!(
            "Failed to prepare {sink}: {e:#}",
            sink = service.sink().name()
        );
    }

    for failed in failed_uploads {
        summary.attempted += 1;

        if !service
            .save_media(&failed.url, &failed.description, &failed.owner_id)
            .await
        {
            warn!("Retry failed for {url}, keeping it queued", url = failed.url);
            summary.still_failing += 1;
            continue;
        }

        match service.store().delete_failed_upload(&failed.url).await {
            Ok(()) => summary.recovered += 1,
            Err(e) => {
                // Saved, but the record stays and will be retried again
                error!(
                    "Saved {url} but failed to remove it from the queue: {e:#}",
                    url = failed.url
                );
                summary.still_failing += 1;
            }
        }
    }

    info!(
        "Failed upload retry: {recovered} recovered, {still_failing} still failing",
        recovered = summary.recovered,
        still_failing = summary.still_failing
    );

    summary
}
