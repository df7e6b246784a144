use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use tracing::info;

use crate::backup::MediaBatch;
use crate::datetime_utils;
use crate::instagram::EmbedResolver;
use crate::media::{normalize_media_url, MediaLocator, ResolvedTweet};
use crate::targets::{collect_targets, AccountState, CrawlMode};
use crate::twitter::{self, TweetSource};

#[derive(Args, Debug)]
pub struct ShowMediaCommand {
    /// Tweet ID or URL to resolve
    #[arg(value_name = "TWEET_ID_OR_URL")]
    tweet: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

impl ShowMediaCommand {
    pub async fn execute(
        self,
        source: &dyn TweetSource,
        embed_resolver: &dyn EmbedResolver,
    ) -> Result<()> {
        let tweet_id = twitter::parse_tweet_id(&self.tweet).with_context(|| {
            format!("Failed to parse tweet ID from: {tweet}", tweet = self.tweet)
        })?;

        info!("Resolving media of tweet {tweet_id}");
        let tweet = source
            .tweet(&tweet_id)
            .await
            .context("Failed to download tweet")?;

        let locator = MediaLocator::new(embed_resolver);
        let resolved = locator.resolve(&tweet).await;

        print_resolved(resolved.iter(), self.json)
    }
}

#[derive(Args, Debug)]
pub struct ShowAccountMediaCommand {
    /// Account screen name or numeric id
    #[arg(value_name = "ACCOUNT")]
    account: String,

    /// Resolve the account's favorites instead of its retweets
    #[arg(long)]
    favorites: bool,

    /// Which statuses to resolve; --favorites is the same as --mode fav
    #[arg(long, value_enum, default_value_t = CrawlMode::Retweet)]
    mode: CrawlMode,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

impl ShowAccountMediaCommand {
    /// Resolve without backing anything up
    pub async fn execute(
        self,
        source: &dyn TweetSource,
        embed_resolver: &dyn EmbedResolver,
    ) -> Result<()> {
        let locator = MediaLocator::new(embed_resolver);
        let mode = if self.favorites {
            CrawlMode::Favorite
        } else {
            self.mode
        };

        let batch = account_media(source, &locator, &self.account, mode).await?;

        info!(
            "{count} tweets with media for {account}",
            count = batch.len(),
            account = self.account
        );

        print_resolved(batch.iter(), self.json)
    }
}

/// Everything a first cycle in `mode` would back up for `account`
pub async fn account_media(
    source: &dyn TweetSource,
    locator: &MediaLocator<'_>,
    account: &str,
    mode: CrawlMode,
) -> Result<MediaBatch> {
    let mut state = AccountState::new(account);
    collect_targets(source, locator, mode, &mut state).await
}

/// Lines describing one resolved tweet, download URLs included
pub fn describe_resolved(resolved: &ResolvedTweet) -> Vec<String> {
    let tweet = &resolved.tweet;
    let mut lines = vec![format!(
        "{id} @{owner} {date} {link}",
        id = tweet.id_str,
        owner = resolved.owner(),
        date = datetime_utils::display_tweet_date(&tweet.created_at),
        link = tweet.permalink()
    )];

    lines.extend(
        resolved
            .urls
            .iter()
            .map(|url| format!("  {}", normalize_media_url(url))),
    );
    lines
}

fn print_resolved<'a>(
    resolved: impl Iterator<Item = &'a ResolvedTweet>,
    as_json: bool,
) -> Result<()> {
    let with_media: Vec<&ResolvedTweet> = resolved.filter(|entry| entry.has_media()).collect();

    if as_json {
        let entries: Vec<_> = with_media
            .iter()
            .map(|entry| {
                json!({
                    "tweet_id": entry.id(),
                    "owner": entry.owner(),
                    "created_at": entry.tweet.created_at,
                    "urls": entry.urls,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("Failed to serialize media list")?
        );
        return Ok(());
    }

    if with_media.is_empty() {
        println!("No media found");
        return Ok(());
    }

    for entry in with_media {
        for line in describe_resolved(entry) {
            println!("{line}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitter::{ExtendedEntities, Media, Tweet, User};
    use anyhow::bail;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct NoEmbeds;

    #[async_trait]
    impl EmbedResolver for NoEmbeds {
        async fn resolve_media_urls(&self, _post_url: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    /// Empty timeline, one liked photo
    struct LikesOnly;

    #[async_trait]
    impl TweetSource for LikesOnly {
        async fn user_timeline(&self, _account: &str, _since_id: u64) -> Result<Vec<Tweet>> {
            Ok(Vec::new())
        }

        async fn favorites(&self, _account: &str) -> Result<Vec<Tweet>> {
            Ok(vec![Tweet {
                id: 5,
                id_str: "5".to_string(),
                extended_entities: Some(ExtendedEntities {
                    media: vec![Media {
                        type_field: "photo".to_string(),
                        media_url_https: Some("https://pbs.twimg.com/media/liked.jpg".to_string()),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }])
        }

        async fn tweet(&self, tweet_id: &str) -> Result<Tweet> {
            bail!("no tweet {tweet_id}")
        }
    }

    #[tokio::test]
    async fn test_fav_mode_lists_likes() {
        let resolver = NoEmbeds;
        let locator = MediaLocator::new(&resolver);

        let favorites = account_media(&LikesOnly, &locator, "someone", CrawlMode::Favorite)
            .await
            .unwrap();
        assert_eq!(favorites.ids(), vec!["5".to_string()]);

        let retweets = account_media(&LikesOnly, &locator, "someone", CrawlMode::Retweet)
            .await
            .unwrap();
        assert!(retweets.is_empty());
    }

    #[test]
    fn test_describe_resolved_lists_download_urls() {
        let resolved = ResolvedTweet {
            tweet: Tweet {
                id_str: "42".to_string(),
                created_at: "Wed Oct 10 20:19:24 +0000 2018".to_string(),
                user: User {
                    screen_name: "poster".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            urls: vec![
                "https://pbs.twimg.com/media/a.jpg".to_string(),
                "https://video.twimg.com/v.mp4".to_string(),
            ],
        };

        let lines = describe_resolved(&resolved);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("42 @poster "));
        assert!(lines[0].ends_with("https://twitter.com/poster/status/42"));
        assert_eq!(lines[1], "  https://pbs.twimg.com/media/a.jpg?name=orig");
        assert_eq!(lines[2], "  https://video.twimg.com/v.mp4");
    }
}
