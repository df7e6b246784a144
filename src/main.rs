use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use tweet_media_backup::backup::BackupService;
use tweet_media_backup::commands;
use tweet_media_backup::commands::show_media::{ShowAccountMediaCommand, ShowMediaCommand};
use tweet_media_backup::download::MediaDownloader;
use tweet_media_backup::google_photos::{GooglePhotosConfig, GooglePhotosSink};
use tweet_media_backup::instagram::InstagramResolver;
use tweet_media_backup::pg_store::PgStore;
use tweet_media_backup::sink::{LocalSink, MediaSink, SaveMode};
use tweet_media_backup::store::{BackupStore, FileStore};
use tweet_media_backup::targets::CrawlMode;
use tweet_media_backup::twitter::TwitterClient;

#[derive(Parser, Debug)]
#[command(
    name = "tweet-media-backup",
    version,
    about = "Back up media from retweets and likes",
    long_about = "Polls Twitter accounts and copies the photos and videos they retweet or like to a backup destination, exactly once"
)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every command
#[derive(Args, Debug)]
struct Settings {
    /// Directory holding backup records and the failed upload queue
    #[arg(long, env = "BACKUP_DATA_DIR", default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Directory media is staged in before upload (the backup itself in local mode)
    #[arg(long, env = "DOWNLOAD_DIR", default_value = "./download", global = true)]
    download_dir: PathBuf,

    /// Twitter API bearer token
    #[arg(long, env = "TWITTER_BEARER_TOKEN", hide_env_values = true, global = true)]
    bearer_token: Option<String>,

    /// Pages fetched per listing
    #[arg(long, env = "TWEET_PAGES", default_value = "25", global = true)]
    pages: u32,

    /// Statuses per page
    #[arg(long, env = "TWEET_COUNT", default_value = "200", global = true)]
    count: u32,

    /// Where media is saved
    #[arg(long, env = "SAVE_MODE", value_enum, default_value_t = SaveMode::Local, global = true)]
    save_mode: SaveMode,

    /// Postgres connection string; backup records go to files when unset
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    database_url: Option<String>,

    /// Google OAuth client id (google save mode)
    #[arg(long, env = "GOOGLE_CLIENT_ID", hide_env_values = true, global = true)]
    google_client_id: Option<String>,

    /// Google OAuth client secret (google save mode)
    #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true, global = true)]
    google_client_secret: Option<String>,

    /// Google OAuth refresh token (google save mode)
    #[arg(long, env = "GOOGLE_REFRESH_TOKEN", hide_env_values = true, global = true)]
    google_refresh_token: Option<String>,

    /// Google Photos album uploads are added to
    #[arg(long, env = "GOOGLE_ALBUM_TITLE", global = true)]
    album_title: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll accounts forever, backing up new media
    Daemon {
        /// Accounts to monitor (screen names or numeric ids, comma-separated)
        #[arg(
            short,
            long = "user",
            env = "TWITTER_USER_IDS",
            required = true,
            value_delimiter = ','
        )]
        users: Vec<String>,

        /// Which statuses are backed up
        #[arg(short, long, env = "MODE_SPECIFIED", value_enum, default_value_t = CrawlMode::Retweet)]
        mode: CrawlMode,

        /// Minutes between polling cycles
        #[arg(short, long, env = "INTERVAL", default_value = "5")]
        interval: u64,
    },

    /// Retry the failed upload queue once
    RetryFailed,

    /// Resolve and print the media of one tweet
    ShowMedia(ShowMediaCommand),

    /// Resolve and print the media of an account's retweets or likes
    ShowAccountMedia(ShowAccountMediaCommand),
}

fn init_logging(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn twitter_client(settings: &Settings) -> Result<TwitterClient> {
    let bearer_token = settings.bearer_token.as_deref().context(
        "Twitter bearer token not specified. Please set --bearer-token or TWITTER_BEARER_TOKEN environment variable",
    )?;
    TwitterClient::new(bearer_token, settings.count, settings.pages)
        .context("Failed to initialize Twitter client")
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn BackupStore>> {
    match &settings.database_url {
        Some(database_url) => Ok(Arc::new(PgStore::connect(database_url).await?)),
        None => {
            info!(
                "DATABASE_URL not set, keeping records in {path}",
                path = settings.data_dir.display()
            );
            Ok(Arc::new(FileStore::open(&settings.data_dir)?))
        }
    }
}

fn open_sink(settings: &Settings) -> Result<Arc<dyn MediaSink>> {
    match settings.save_mode {
        SaveMode::Local => Ok(Arc::new(LocalSink)),
        SaveMode::Google => {
            let config = GooglePhotosConfig {
                client_id: settings
                    .google_client_id
                    .clone()
                    .context("GOOGLE_CLIENT_ID is required in google save mode")?,
                client_secret: settings
                    .google_client_secret
                    .clone()
                    .context("GOOGLE_CLIENT_SECRET is required in google save mode")?,
                refresh_token: settings
                    .google_refresh_token
                    .clone()
                    .context("GOOGLE_REFRESH_TOKEN is required in google save mode")?,
                album_title: settings.album_title.clone(),
            };
            Ok(Arc::new(GooglePhotosSink::new(config)?))
        }
    }
}

async fn backup_service(settings: &Settings) -> Result<BackupService> {
    ensure_dir(&settings.download_dir)?;

    let store = open_store(settings).await?;
    let sink = open_sink(settings)?;
    info!("Saving media via {sink}", sink = sink.name());

    Ok(BackupService::new(
        store,
        sink,
        MediaDownloader::new()?,
        settings.download_dir.clone(),
    ))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        info!("Created directory: {path}", path = dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    let args = Cli::parse();
    init_logging(args.verbose);

    if args.verbose {
        debug!("Verbose mode enabled");
    }

    let settings = &args.settings;

    match args.command {
        Commands::Daemon {
            users,
            mode,
            interval,
        } => {
            let source = Arc::new(twitter_client(settings)?);
            let service = Arc::new(backup_service(settings).await?);
            let config = commands::daemon::DaemonConfig {
                accounts: users
                    .iter()
                    .map(|user| user.trim().to_string())
                    .filter(|user| !user.is_empty())
                    .collect(),
                mode,
                interval: Duration::from_secs(interval * 60),
            };
            let resolver = Arc::new(InstagramResolver::new()?);
            commands::daemon::execute(config, source, resolver, service).await?
        }
        Commands::RetryFailed => {
            let service = backup_service(settings).await?;
            commands::retry_failed::execute(&service).await?
        }
        Commands::ShowMedia(cmd) => {
            let source = twitter_client(settings)?;
            cmd.execute(&source, &InstagramResolver::new()?).await?
        }
        Commands::ShowAccountMedia(cmd) => {
            let source = twitter_client(settings)?;
            cmd.execute(&source, &InstagramResolver::new()?).await?
        }
    }

    Ok(())
}
