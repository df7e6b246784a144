use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{oneshot, RwLock};
use tokio::time;
use tracing::{error, info};

use crate::backup::{BackupService, BackupSummary};
use crate::instagram::EmbedResolver;
use crate::media::MediaLocator;
use crate::retry_queue::{drain_failed_uploads, DrainSummary};
use crate::targets::{collect_targets, AccountState, CrawlMode};
use crate::twitter::TweetSource;

/// Configuration for the daemon
pub struct DaemonConfig {
    pub accounts: Vec<String>,
    pub mode: CrawlMode,
    pub interval: Duration,
}

/// Global daemon statistics
#[derive(Clone, Debug)]
pub struct DaemonStats {
    pub start_time: Instant,
    pub cycles: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub tweets_recorded: u64,
    pub media_saved: u64,
    pub media_failed: u64,
    pub media_recovered: u64,
}

impl DaemonStats {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: 0,
            successful_polls: 0,
            failed_polls: 0,
            tweets_recorded: 0,
            media_saved: 0,
            media_failed: 0,
            media_recovered: 0,
        }
    }

    fn record(&mut self, cycle: &AccountCycle) {
        if cycle.fetched {
            self.successful_polls += 1;
        } else {
            self.failed_polls += 1;
        }
        self.tweets_recorded += cycle.backup.tweets_recorded as u64;
        self.media_saved += cycle.backup.media_saved as u64;
        self.media_failed += cycle.backup.media_failed as u64;
        self.media_recovered += cycle.drain.recovered as u64;
    }
}

/// What one account's cycle did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccountCycle {
    /// False when the source could not be read this cycle
    pub fetched: bool,
    pub backup: BackupSummary,
    pub drain: DrainSummary,
}

/// One account's cycle: collect targets, back them up, then retry the
/// failed upload queue. The queue is drained even when fetching failed.
pub async fn poll_account(
    source: &dyn TweetSource,
    locator: &MediaLocator<'_>,
    service: &BackupService,
    mode: CrawlMode,
    state: &mut AccountState,
) -> AccountCycle {
    let mut cycle = AccountCycle::default();

    info!(
        "Crawling {account} in {mode} mode",
        account = state.account
    );

    match collect_targets(source, locator, mode, state).await {
        Ok(batch) => {
            cycle.fetched = true;
            cycle.backup = service.backup_media(&batch).await;
        }
        Err(e) => error!("Crawling {account} failed: {e:#}", account = state.account),
    }

    cycle.drain = drain_failed_uploads(service).await;
    cycle
}

/// Main entry point for daemon mode
pub async fn execute(
    config: DaemonConfig,
    source: Arc<dyn TweetSource>,
    embed_resolver: Arc<dyn EmbedResolver>,
    service: Arc<BackupService>,
) -> Result<()> {
    info!(
        "Starting daemon for {account_count} accounts in {mode} mode, every {minutes} minutes",
        account_count = config.accounts.len(),
        mode = config.mode,
        minutes = config.interval.as_secs() / 60
    );

    let stats = Arc::new(RwLock::new(DaemonStats::new()));

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal (Ctrl+C)");
        let _ = shutdown_tx.send(());
    });

    let stats_handle = spawn_stats_reporter(stats.clone());

    tokio::select! {
        _ = run_daemon(&config, source.as_ref(), embed_resolver.as_ref(), &service, &stats) => {
            Ok(())
        }
        _ = shutdown_rx => {
            info!("Received shutdown signal, gracefully shutting down daemon...");
            stats_handle.abort();
            print_final_stats(&stats).await;
            info!("Daemon shutdown complete");
            Ok(())
        }
    }
}

/// Poll every account, sleep, repeat. Never returns on its own.
async fn run_daemon(
    config: &DaemonConfig,
    source: &dyn TweetSource,
    embed_resolver: &dyn EmbedResolver,
    service: &BackupService,
    stats: &RwLock<DaemonStats>,
) {
    let locator = MediaLocator::new(embed_resolver);
    let mut states: Vec<AccountState> = config
        .accounts
        .iter()
        .map(|account| AccountState::new(account))
        .collect();

    loop {
        for state in states.iter_mut() {
            let cycle = poll_account(source, &locator, service, config.mode, state).await;
            stats.write().await.record(&cycle);
        }
        stats.write().await.cycles += 1;

        info!(
            "Interval. Sleeping {minutes} minutes",
            minutes = config.interval.as_secs() / 60
        );
        time::sleep(config.interval).await;
    }
}

/// Spawn a task that logs statistics every minute
fn spawn_stats_reporter(stats: Arc<RwLock<DaemonStats>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));

        loop {
            interval.tick().await;

            let stats = stats.read().await;
            let uptime = stats.start_time.elapsed();
            let hours = uptime.as_secs() / 3600;
            let minutes = (uptime.as_secs() % 3600) / 60;

            info!(
                "Stats | Uptime: {hours}h{minutes}m | Cycles: {cycles} | Polls: ok {successful_polls} failed {failed_polls} | Tweets: {tweets_recorded} | Media: saved {media_saved} failed {media_failed} recovered {media_recovered}",
                cycles = stats.cycles,
                successful_polls = stats.successful_polls,
                failed_polls = stats.failed_polls,
                tweets_recorded = stats.tweets_recorded,
                media_saved = stats.media_saved,
                media_failed = stats.media_failed,
                media_recovered = stats.media_recovered
            );
        }
    })
}

/// Print final statistics on shutdown
async fn print_final_stats(stats: &RwLock<DaemonStats>) {
    let stats = stats.read().await;
    let uptime = stats.start_time.elapsed();

    info!("=== Final Daemon Statistics ===");
    info!(
        "Uptime: {uptime:.2} hours",
        uptime = uptime.as_secs_f64() / 3600.0
    );
    info!("Cycles: {cycles}", cycles = stats.cycles);
    info!(
        "Polls: {successful_polls} successful, {failed_polls} failed",
        successful_polls = stats.successful_polls,
        failed_polls = stats.failed_polls
    );
    info!(
        "Tweets recorded: {tweets_recorded}",
        tweets_recorded = stats.tweets_recorded
    );
    info!(
        "Media saved: {media_saved}, failed: {media_failed}, recovered: {media_recovered}",
        media_saved = stats.media_saved,
        media_failed = stats.media_failed,
        media_recovered = stats.media_recovered
    );
    info!("===============================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_cycle() {
        let mut stats = DaemonStats::new();
        stats.record(&AccountCycle {
            fetched: true,
            backup: BackupSummary {
                tweets_recorded: 2,
                media_saved: 3,
                media_failed: 1,
                store_errors: 0,
            },
            drain: DrainSummary {
                attempted: 2,
                recovered: 1,
                still_failing: 1,
            },
        });
        stats.record(&AccountCycle::default());

        assert_eq!(stats.successful_polls, 1);
        assert_eq!(stats.failed_polls, 1);
        assert_eq!(stats.tweets_recorded, 2);
        assert_eq!(stats.media_saved, 3);
        assert_eq!(stats.media_failed, 1);
        assert_eq!(stats.media_recovered, 1);
    }
}
