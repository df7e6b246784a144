use crate::store::{BackupRecord, BackupStore, FailedUpload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashSet;
use tracing::{debug, info};

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS uploaded_media_tweet (
        tweet_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        tweet_date TEXT NOT NULL,
        add_date TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS failed_upload_media (
        url TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        user_id TEXT NOT NULL
    )
    "#,
];

/// Backup store in Postgres
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and make sure both tables exist
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to create backup tables")?;
        }

        info!("Connected to Postgres backup store");
        Ok(Self { pool })
    }
}

#[async_trait]
impl BackupStore for PgStore {
    async fn insert_backup_record(&self, record: &BackupRecord) -> Result<()> {
        debug!(
            "Insert tweet_id={tweet_id} user_id={owner} into uploaded_media_tweet",
            tweet_id = record.tweet_id,
            owner = record.owner_id
        );

        sqlx::query(
            r#"
            INSERT INTO uploaded_media_tweet (tweet_id, user_id, tweet_date, add_date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tweet_id) DO NOTHING
            "#,
        )
        .bind(&record.tweet_id)
        .bind(&record.owner_id)
        .bind(&record.tweet_timestamp)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record backup of tweet {}", record.tweet_id))?;

        Ok(())
    }

    async fn insert_failed_upload(&self, failed: &FailedUpload) -> Result<()> {
        debug!("Insert url={url} into failed_upload_media", url = failed.url);

        sqlx::query(
            r#"
            INSERT INTO failed_upload_media (url, description, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (url) DO UPDATE SET
                description = $2,
                user_id = $3
            "#,
        )
        .bind(&failed.url)
        .bind(&failed.description)
        .bind(&failed.owner_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record failed upload {}", failed.url))?;

        Ok(())
    }

    async fn fetch_not_backed_up(&self, tweet_ids: &[String]) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT candidate.tweet_id
            FROM unnest($1::text[]) AS candidate(tweet_id)
            LEFT JOIN uploaded_media_tweet uploaded
                ON uploaded.tweet_id = candidate.tweet_id
            WHERE uploaded.tweet_id IS NULL
            "#,
        )
        .bind(tweet_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query backed up tweets")?;

        Ok(rows.into_iter().map(|(tweet_id,)| tweet_id).collect())
    }

    async fn fetch_failed_uploads(&self) -> Result<Vec<FailedUpload>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT url, description, user_id
            FROM failed_upload_media
            ORDER BY url
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch failed uploads")?;

        Ok(rows
            .into_iter()
            .map(|(url, description, owner_id)| FailedUpload {
                url,
                description,
                owner_id,
            })
            .collect())
    }

    async fn delete_failed_upload(&self, url: &str) -> Result<()> {
        debug!("Delete url={url} from failed_upload_media");

        sqlx::query("DELETE FROM failed_upload_media WHERE url = $1")
            .bind(url)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete failed upload {url}"))?;

        Ok(())
    }
}
