use crate::backup::MediaBatch;
use crate::media::MediaLocator;
use crate::twitter::{Tweet, TweetSource};
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::fmt;
use tracing::{debug, info};

/// Which statuses of an account count as backup targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CrawlMode {
    /// Retweets in the account's timeline
    #[value(name = "rt")]
    Retweet,
    /// Newly liked statuses
    #[value(name = "fav")]
    Favorite,
    /// Retweets the account has also liked
    #[value(name = "mixed")]
    Mixed,
    /// Retweets plus newly liked statuses
    #[value(name = "rt-fav")]
    RetweetAndFavorite,
}

impl CrawlMode {
    pub fn scans_timeline(self) -> bool {
        !matches!(self, CrawlMode::Favorite)
    }

    pub fn scans_favorites(self) -> bool {
        matches!(self, CrawlMode::Favorite | CrawlMode::RetweetAndFavorite)
    }

    /// Whether a timeline status qualifies
    pub fn accepts_timeline_tweet(self, tweet: &Tweet) -> bool {
        match self {
            CrawlMode::Retweet | CrawlMode::RetweetAndFavorite => tweet.is_retweet(),
            CrawlMode::Mixed => tweet.is_retweet() && tweet.is_favorited(),
            CrawlMode::Favorite => false,
        }
    }
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrawlMode::Retweet => "rt",
            CrawlMode::Favorite => "fav",
            CrawlMode::Mixed => "mixed",
            CrawlMode::RetweetAndFavorite => "rt-fav",
        };
        f.write_str(name)
    }
}

/// Per-account progress kept between cycles
#[derive(Debug, Clone)]
pub struct AccountState {
    pub account: String,
    /// Highest timeline id already scanned
    pub cursor: u64,
    /// Favorites with media seen in the previous cycle
    favorites_snapshot: MediaBatch,
}

impl AccountState {
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            cursor: 1,
            favorites_snapshot: MediaBatch::new(),
        }
    }

    /// Move the cursor to the highest id among `tweets`; it never goes back
    pub fn advance_cursor(&mut self, tweets: &[Tweet]) {
        if let Some(max_id) = tweets.iter().map(Tweet::numeric_id).max() {
            self.cursor = self.cursor.max(max_id);
        }
    }

    /// Replace the snapshot with `current`, returning the entries it did not have
    pub fn swap_favorites_snapshot(&mut self, current: MediaBatch) -> MediaBatch {
        let new_entries = current.difference(&self.favorites_snapshot);
        self.favorites_snapshot = current;
        new_entries
    }
}

/// Resolve every status in `tweets` into one batch
pub async fn resolve_all<'a>(
    locator: &MediaLocator<'_>,
    tweets: impl IntoIterator<Item = &'a Tweet>,
) -> MediaBatch {
    let mut batch = MediaBatch::new();
    for tweet in tweets {
        batch.extend(locator.resolve(tweet).await);
    }
    batch
}

/// Timeline statuses newer than the cursor that qualify under `mode`
pub async fn timeline_targets(
    source: &dyn TweetSource,
    locator: &MediaLocator<'_>,
    mode: CrawlMode,
    state: &mut AccountState,
) -> Result<MediaBatch> {
    info!(
        "Fetching timeline of {account} since {cursor}",
        account = state.account,
        cursor = state.cursor
    );

    let tweets = source
        .user_timeline(&state.account, state.cursor)
        .await
        .with_context(|| format!("Failed to fetch timeline of {}", state.account))?;
    state.advance_cursor(&tweets);

    let qualifying: Vec<&Tweet> = tweets
        .iter()
        .filter(|tweet| mode.accepts_timeline_tweet(tweet))
        .collect();

    debug!(
        "{qualifying} of {total} timeline statuses qualify in {mode} mode",
        qualifying = qualifying.len(),
        total = tweets.len()
    );

    Ok(resolve_all(locator, qualifying).await)
}

/// Favorites that were not in the previous cycle's snapshot
pub async fn favorite_targets(
    source: &dyn TweetSource,
    locator: &MediaLocator<'_>,
    state: &mut AccountState,
) -> Result<MediaBatch> {
    info!("Fetching favorites of {account}", account = state.account);

    let tweets = source
        .favorites(&state.account)
        .await
        .with_context(|| format!("Failed to fetch favorites of {}", state.account))?;

    let current = resolve_all(locator, &tweets).await;
    let new_entries = state.swap_favorites_snapshot(current);

    debug!(
        "{new} new favorites with media for {account}",
        new = new_entries.len(),
        account = state.account
    );
    Ok(new_entries)
}

/// Everything one cycle should back up for an account
pub async fn collect_targets(
    source: &dyn TweetSource,
    locator: &MediaLocator<'_>,
    mode: CrawlMode,
    state: &mut AccountState,
) -> Result<MediaBatch> {
    let mut batch = MediaBatch::new();

    if mode.scans_favorites() {
        batch.merge(favorite_targets(source, locator, state).await?);
    }

    if mode.scans_timeline() {
        batch.merge(timeline_targets(source, locator, mode, state).await?);
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instagram::EmbedResolver;
    use crate::twitter::{ExtendedEntities, Media, User};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct NoEmbeds;

    #[async_trait]
    impl EmbedResolver for NoEmbeds {
        async fn resolve_media_urls(&self, _post_url: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeSource {
        timeline: Vec<Tweet>,
        favorites: Mutex<Vec<Vec<Tweet>>>,
        since_ids: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl TweetSource for FakeSource {
        async fn user_timeline(&self, _account: &str, since_id: u64) -> Result<Vec<Tweet>> {
            self.since_ids.lock().unwrap().push(since_id);
            Ok(self
                .timeline
                .iter()
                .filter(|tweet| tweet.numeric_id() > since_id)
                .cloned()
                .collect())
        }

        async fn favorites(&self, _account: &str) -> Result<Vec<Tweet>> {
            let mut pages = self.favorites.lock().unwrap();
            if pages.is_empty() {
                anyhow::bail!("no more favorites");
            }
            Ok(pages.remove(0))
        }

        async fn tweet(&self, tweet_id: &str) -> Result<Tweet> {
            anyhow::bail!("unknown tweet {tweet_id}")
        }
    }

    fn photo_tweet(id: u64, favorited: bool) -> Tweet {
        Tweet {
            id,
            id_str: id.to_string(),
            favorited,
            user: User {
                name: "Poster".to_string(),
                screen_name: "poster".to_string(),
                ..Default::default()
            },
            extended_entities: Some(ExtendedEntities {
                media: vec![Media {
                    type_field: "photo".to_string(),
                    media_url_https: Some(format!("https://pbs.twimg.com/media/{id}.jpg")),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }
    }

    fn retweet(id: u64, original: Tweet) -> Tweet {
        Tweet {
            id,
            id_str: id.to_string(),
            user: User {
                screen_name: "me".to_string(),
                ..Default::default()
            },
            retweeted_status: Some(Box::new(original)),
            ..Default::default()
        }
    }

    #[test]
    fn test_mode_predicates() {
        let plain = photo_tweet(1, true);
        let rt_liked = retweet(2, photo_tweet(3, true));
        let rt_unliked = retweet(4, photo_tweet(5, false));

        assert!(!CrawlMode::Retweet.accepts_timeline_tweet(&plain));
        assert!(CrawlMode::Retweet.accepts_timeline_tweet(&rt_unliked));
        assert!(CrawlMode::Mixed.accepts_timeline_tweet(&rt_liked));
        assert!(!CrawlMode::Mixed.accepts_timeline_tweet(&rt_unliked));
        assert!(!CrawlMode::Mixed.accepts_timeline_tweet(&plain));

        assert!(CrawlMode::RetweetAndFavorite.scans_favorites());
        assert!(CrawlMode::RetweetAndFavorite.scans_timeline());
        assert!(!CrawlMode::Favorite.scans_timeline());
        assert!(!CrawlMode::Mixed.scans_favorites());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(
            CrawlMode::from_str("rt-fav", false).unwrap(),
            CrawlMode::RetweetAndFavorite
        );
        assert_eq!(CrawlMode::Mixed.to_string(), "mixed");
    }

    #[tokio::test]
    async fn test_mixed_mode_keeps_only_favorited_retweets() {
        let mut timeline: Vec<Tweet> = (0..7u64)
            .map(|i| retweet(100 + i, photo_tweet(200 + i, i < 3)))
            .collect();
        timeline.push(photo_tweet(300, true));

        let source = FakeSource {
            timeline,
            ..Default::default()
        };
        let resolver = NoEmbeds;
        let locator = MediaLocator::new(&resolver);
        let mut state = AccountState::new("me");

        let batch = collect_targets(&source, &locator, CrawlMode::Mixed, &mut state)
            .await
            .unwrap();

        assert_eq!(
            batch.ids(),
            vec!["200".to_string(), "201".to_string(), "202".to_string()]
        );
        assert_eq!(state.cursor, 300);
    }

    #[tokio::test]
    async fn test_cursor_limits_next_fetch() {
        let source = FakeSource {
            timeline: vec![retweet(10, photo_tweet(5, false)), retweet(12, photo_tweet(6, false))],
            ..Default::default()
        };
        let resolver = NoEmbeds;
        let locator = MediaLocator::new(&resolver);
        let mut state = AccountState::new("me");

        let first = collect_targets(&source, &locator, CrawlMode::Retweet, &mut state)
            .await
            .unwrap();
        let second = collect_targets(&source, &locator, CrawlMode::Retweet, &mut state)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(*source.since_ids.lock().unwrap(), vec![1, 12]);
    }

    #[tokio::test]
    async fn test_favorites_only_new_entries() {
        let source = FakeSource {
            favorites: Mutex::new(vec![
                vec![photo_tweet(1, true), photo_tweet(2, true)],
                vec![photo_tweet(1, true), photo_tweet(2, true), photo_tweet(3, true)],
            ]),
            ..Default::default()
        };
        let resolver = NoEmbeds;
        let locator = MediaLocator::new(&resolver);
        let mut state = AccountState::new("me");

        let first = collect_targets(&source, &locator, CrawlMode::Favorite, &mut state)
            .await
            .unwrap();
        let second = collect_targets(&source, &locator, CrawlMode::Favorite, &mut state)
            .await
            .unwrap();

        assert_eq!(first.ids(), vec!["1".to_string(), "2".to_string()]);
        assert_eq!(second.ids(), vec!["3".to_string()]);

        // a failed fetch leaves the snapshot alone
        assert!(collect_targets(&source, &locator, CrawlMode::Favorite, &mut state)
            .await
            .is_err());
        assert_eq!(state.favorites_snapshot.len(), 3);
    }
}
