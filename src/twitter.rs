use crate::error_utils::{create_http_client_with_context, parse_http_response_json};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Twitter API specific errors with structured information
#[derive(Debug, Error)]
pub enum TwitterError {
    #[error("Rate limit exceeded (reset at {reset_time:?}, remaining: {remaining:?})")]
    RateLimit {
        reset_time: Option<u64>,
        remaining: Option<u64>,
    },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub const TWITTER_API_BASE: &str = "https://api.twitter.com/1.1";

/// Twitter API rate limit information extracted from response headers
#[derive(Debug, Clone, Default)]
struct RateLimits {
    /// Maximum number of requests allowed in the current time window
    limit: Option<u64>,
    /// Number of requests remaining in the current time window
    remaining: Option<u64>,
    /// Unix timestamp when the rate limit resets
    reset: Option<u64>,
}

/// A status object as returned by the v1.1 REST API in extended mode.
///
/// A status may wrap another one (`retweeted_status`) or reference one
/// (`quoted_status`); both are resolved recursively by the media locator.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Tweet {
    #[serde(default)]
    pub id: u64,

    pub id_str: String,

    #[serde(default)]
    pub created_at: String,

    /// Untruncated text (present with `tweet_mode=extended`)
    #[serde(default)]
    pub full_text: Option<String>,

    /// Legacy, possibly truncated text
    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub user: User,

    pub entities: Option<Entities>,

    /// Native photos and videos
    pub extended_entities: Option<ExtendedEntities>,

    pub retweeted_status: Option<Box<Tweet>>,

    pub quoted_status: Option<Box<Tweet>>,

    /// Whether the authenticating account liked this status
    #[serde(default)]
    pub favorited: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct User {
    #[serde(default)]
    pub id_str: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub screen_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Entities {
    #[serde(default)]
    pub urls: Vec<UrlEntity>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UrlEntity {
    pub url: Option<String>,
    pub expanded_url: Option<String>,
    pub display_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ExtendedEntities {
    #[serde(default)]
    pub media: Vec<Media>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Media {
    #[serde(rename = "type")]
    pub type_field: String,
    pub media_url_https: Option<String>,
    pub media_url: Option<String>,
    pub video_info: Option<VideoInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VideoInfo {
    #[serde(default)]
    pub variants: Vec<MediaVariant>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MediaVariant {
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub content_type: String,
    pub url: String,
}

impl Tweet {
    /// True when this status is a retweet wrapper around another status
    pub fn is_retweet(&self) -> bool {
        self.retweeted_status.is_some()
    }

    /// The status that actually carries content: the wrapped one for retweets
    pub fn original(&self) -> &Tweet {
        self.retweeted_status.as_deref().unwrap_or(self)
    }

    /// Favorite flag of the original status (a retweet wrapper has its own flag)
    pub fn is_favorited(&self) -> bool {
        self.original().favorited
    }

    pub fn quoted(&self) -> Option<&Tweet> {
        self.quoted_status.as_deref()
    }

    /// Numeric identifier, used for cursor comparisons
    pub fn numeric_id(&self) -> u64 {
        if self.id != 0 {
            self.id
        } else {
            self.id_str.parse().unwrap_or(0)
        }
    }

    pub fn display_text(&self) -> &str {
        self.full_text
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
    }

    pub fn permalink(&self) -> String {
        format!(
            "https://twitter.com/{screen_name}/status/{id}",
            screen_name = self.user.screen_name,
            id = self.id_str
        )
    }

    /// Human-readable description attached to every uploaded media item
    pub fn description(&self) -> String {
        format!(
            "{name}\n@{screen_name}\n{text}",
            name = self.user.name,
            screen_name = self.user.screen_name,
            text = self.display_text()
        )
    }
}

/// Where tweets come from. Pagination and rate limiting are the
/// implementation's concern; callers only see the yielded statuses.
#[async_trait]
pub trait TweetSource: Send + Sync {
    /// Statuses posted by `account` newer than `since_id`
    async fn user_timeline(&self, account: &str, since_id: u64) -> Result<Vec<Tweet>>;

    /// Statuses liked by `account`
    async fn favorites(&self, account: &str) -> Result<Vec<Tweet>>;

    /// A single status by id
    async fn tweet(&self, tweet_id: &str) -> Result<Tweet>;
}

/// Twitter v1.1 API client
pub struct TwitterClient {
    client: Client,
    bearer_token: String,
    api_base: String,
    /// Statuses requested per page
    page_size: u32,
    /// Maximum number of pages fetched per listing
    max_pages: u32,
}

impl TwitterClient {
    pub fn new(bearer_token: &str, page_size: u32, max_pages: u32) -> Result<Self> {
        let client = create_http_client_with_context(Duration::from_secs(30))?;

        debug!("Twitter client settings: page_size={page_size}, max_pages={max_pages}");

        Ok(Self {
            client,
            bearer_token: bearer_token.to_string(),
            api_base: TWITTER_API_BASE.to_string(),
            page_size,
            max_pages,
        })
    }

    /// Point the client at another API root (used against mock servers)
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Parses rate limit headers from a response
    fn parse_rate_limit_headers(&self, response: &reqwest::Response) -> RateLimits {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        };

        RateLimits {
            limit: header("x-rate-limit-limit"),
            remaining: header("x-rate-limit-remaining"),
            reset: header("x-rate-limit-reset"),
        }
    }

    /// Calculates a sleep duration with random jitter to avoid thundering herd effects
    fn calculate_sleep_duration_with_jitter(&self, base_duration: Duration) -> Duration {
        let jitter = rand::random::<u64>() % 1000;
        base_duration + Duration::from_millis(jitter)
    }

    /// Creates an exponential backoff configuration for API request retries
    fn create_backoff_config(&self) -> impl Backoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(60))
            .with_multiplier(2.0)
            .with_max_elapsed_time(Some(Duration::from_secs(900)))
            .build()
    }

    /// Makes a Twitter API request, waiting out rate limits and retrying timeouts
    async fn api_request(&self, resource_id: &str, url: &Url) -> Result<reqwest::Response> {
        let mut backoff = self.create_backoff_config();

        let mut attempt = 0;
        let max_attempts = 5;

        loop {
            debug!(%resource_id, %url, "Making request to Twitter API");

            let response = match self
                .client
                .get(url.clone())
                .bearer_auth(&self.bearer_token)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    attempt += 1;

                    if attempt >= max_attempts {
                        return Err(anyhow::Error::new(err)).with_context(|| {
                            format!(
                                "Failed to send request to Twitter API after {attempt} attempts"
                            )
                        });
                    }

                    if err.is_timeout() || err.is_connect() {
                        let backoff_time = backoff
                            .next_backoff()
                            .unwrap_or(Duration::from_secs(5 * (attempt as u64)));
                        let sleep_duration =
                            self.calculate_sleep_duration_with_jitter(backoff_time);

                        debug!("Network error reaching Twitter API for {resource_id}. Retrying in {sleep_duration:?} (attempt {attempt}/{max_attempts})");
                        tokio::time::sleep(sleep_duration).await;
                        continue;
                    }

                    return Err(
                        anyhow::Error::new(err).context("Failed to send request to Twitter API")
                    );
                }
            };

            let rate_limits = self.parse_rate_limit_headers(&response);

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                attempt += 1;

                if attempt >= max_attempts {
                    return Err(TwitterError::RateLimit {
                        reset_time: rate_limits.reset,
                        remaining: rate_limits.remaining,
                    }
                    .into());
                }

                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();

                // Prefer the reset header, then Retry-After, then our own backoff
                let rate_limit_wait = rate_limits
                    .reset
                    .filter(|reset_time| *reset_time > now)
                    .map(|reset_time| reset_time - now);

                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());

                let base_wait_secs = rate_limit_wait.or(retry_after).unwrap_or_else(|| {
                    backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(5 * (attempt as u64)))
                        .as_secs()
                });

                let sleep_duration =
                    self.calculate_sleep_duration_with_jitter(Duration::from_secs(base_wait_secs));

                info!(
                    "Rate limited by Twitter API for {resource_id}. Limit: {limit:?}, Remaining: {remaining:?}. Waiting {sleep_duration:?} (attempt {attempt}/{max_attempts})",
                    limit = rate_limits.limit,
                    remaining = rate_limits.remaining
                );
                tokio::time::sleep(sleep_duration).await;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();

                return Err(match status {
                    StatusCode::NOT_FOUND => TwitterError::NotFound {
                        resource: resource_id.to_string(),
                    },
                    _ => TwitterError::ApiError {
                        status: status.as_u16(),
                        message: body,
                    },
                }
                .into());
            }

            debug!(
                "Received Twitter API response for {resource_id} with limits: {limit:?}/{remaining:?} until {reset:?}",
                limit = rate_limits.limit,
                remaining = rate_limits.remaining,
                reset = rate_limits.reset
            );

            return Ok(response);
        }
    }

    fn endpoint_url(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        let base = format!("{base}/{path}", base = self.api_base);
        Url::parse_with_params(&base, params)
            .with_context(|| format!("Failed to build Twitter API URL for {path}"))
    }

    /// Walks a status listing backwards with `max_id` until it runs dry or
    /// the page budget is spent.
    async fn fetch_pages(
        &self,
        resource_id: &str,
        path: &str,
        base_params: Vec<(&str, String)>,
    ) -> Result<Vec<Tweet>> {
        let mut all_tweets = Vec::new();
        let mut max_id: Option<u64> = None;

        for page in 0..self.max_pages {
            let mut params = base_params.clone();
            params.push(("count", self.page_size.to_string()));
            params.push(("tweet_mode", "extended".to_string()));
            if let Some(max_id) = max_id {
                params.push(("max_id", max_id.to_string()));
            }

            let url = self.endpoint_url(path, &params)?;
            let response = self.api_request(resource_id, &url).await?;
            let page_tweets: Vec<Tweet> =
                parse_http_response_json(response, "Twitter API status listing").await?;

            debug!(
                "Fetched page {page} of {path} for {resource_id}: {count} statuses",
                count = page_tweets.len()
            );

            let Some(oldest) = page_tweets.iter().map(Tweet::numeric_id).min() else {
                break;
            };
            let short_page = page_tweets.len() < self.page_size as usize;
            all_tweets.extend(page_tweets);

            if short_page || oldest <= 1 {
                break;
            }
            max_id = Some(oldest - 1);
        }

        Ok(all_tweets)
    }
}

/// v1.1 accepts either a numeric user id or a screen name
fn account_param(account: &str) -> (&'static str, String) {
    let account = account.trim_start_matches('@');
    if !account.is_empty() && account.chars().all(|c| c.is_ascii_digit()) {
        ("user_id", account.to_string())
    } else {
        ("screen_name", account.to_string())
    }
}

#[async_trait]
impl TweetSource for TwitterClient {
    async fn user_timeline(&self, account: &str, since_id: u64) -> Result<Vec<Tweet>> {
        info!(
            "Fetching timeline of {account} since {since_id} ({pages} pages x {count})",
            pages = self.max_pages,
            count = self.page_size
        );
        let mut params = vec![account_param(account)];
        params.push(("since_id", since_id.max(1).to_string()));
        params.push(("include_rts", "true".to_string()));

        self.fetch_pages(account, "statuses/user_timeline.json", params)
            .await
            .with_context(|| format!("Failed to fetch timeline for {account}"))
    }

    async fn favorites(&self, account: &str) -> Result<Vec<Tweet>> {
        info!(
            "Fetching favorites of {account} ({pages} pages x {count})",
            pages = self.max_pages,
            count = self.page_size
        );
        let params = vec![account_param(account)];

        self.fetch_pages(account, "favorites/list.json", params)
            .await
            .with_context(|| format!("Failed to fetch favorites for {account}"))
    }

    async fn tweet(&self, tweet_id: &str) -> Result<Tweet> {
        let params = [
            ("id", tweet_id.to_string()),
            ("tweet_mode", "extended".to_string()),
        ];
        let url = self.endpoint_url("statuses/show.json", &params)?;
        let response = self.api_request(tweet_id, &url).await?;
        parse_http_response_json(response, "Twitter API status").await
    }
}

/// Extracts a tweet ID from a URL or returns the ID if it's already an ID
pub fn parse_tweet_id(url_or_id: &str) -> Result<String> {
    if url_or_id.is_empty() {
        bail!("Tweet ID cannot be empty");
    }

    if url_or_id.chars().all(|c| c.is_ascii_digit()) {
        return Ok(url_or_id.to_string());
    }

    if let Ok(parsed_url) = Url::parse(url_or_id) {
        if parsed_url
            .host_str()
            .is_some_and(|h| h.contains("twitter.com") || h.contains("x.com"))
        {
            let path_segments: Vec<&str> = parsed_url
                .path_segments()
                .map_or(Vec::new(), |s| s.collect());

            // Path format should be /username/status/tweet_id
            if path_segments.len() >= 3 && path_segments[1] == "status" {
                return Ok(path_segments[2].to_string());
            }
        }
    }

    let re = Regex::new(r"(?:twitter\.com|x\.com)/\w+/status/(\d+)")
        .context("Failed to compile tweet ID regex")?;
    if let Some(id_match) = re.captures(url_or_id).and_then(|c| c.get(1)) {
        return Ok(id_match.as_str().to_string());
    }

    bail!("Could not extract tweet ID from: {url_or_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tweet_id_from_url() {
        assert_eq!(
            parse_tweet_id("https://twitter.com/user/status/1234567890").unwrap(),
            "1234567890"
        );
        assert_eq!(
            parse_tweet_id("https://x.com/user/status/1234567890?s=20").unwrap(),
            "1234567890"
        );
        assert_eq!(
            parse_tweet_id("https://mobile.twitter.com/user/status/1234567890").unwrap(),
            "1234567890"
        );
        assert_eq!(parse_tweet_id("1234567890").unwrap(), "1234567890");

        assert!(parse_tweet_id("https://twitter.com/user").is_err());
        assert!(parse_tweet_id("not-a-url").is_err());
        assert!(parse_tweet_id("").is_err());
    }

    #[test]
    fn test_parse_retweet_with_quote() {
        let tweet_json = serde_json::json!({
            "id": 300,
            "id_str": "300",
            "created_at": "Wed Oct 10 20:19:24 +0000 2018",
            "full_text": "RT @someone: look",
            "user": {"id_str": "1", "name": "Me", "screen_name": "me"},
            "favorited": false,
            "retweeted_status": {
                "id": 200,
                "id_str": "200",
                "full_text": "look",
                "favorited": true,
                "user": {"id_str": "2", "name": "Someone", "screen_name": "someone"},
                "quoted_status": {
                    "id_str": "100",
                    "full_text": "original"
                }
            }
        });

        let tweet: Tweet = serde_json::from_value(tweet_json).unwrap();
        assert!(tweet.is_retweet());
        assert!(tweet.is_favorited());
        assert_eq!(tweet.original().id_str, "200");
        assert_eq!(tweet.original().quoted().unwrap().id_str, "100");
        assert_eq!(tweet.original().quoted().unwrap().numeric_id(), 100);
    }

    #[test]
    fn test_parse_video_media() {
        let media_json = serde_json::json!({
            "type": "video",
            "media_url_https": "https://pbs.twimg.com/ext_tw_video_thumb/1/pu/img/a.jpg",
            "video_info": {
                "variants": [
                    {"content_type": "application/x-mpegURL", "url": "https://video.twimg.com/a.m3u8"},
                    {"bitrate": 832000, "content_type": "video/mp4", "url": "https://video.twimg.com/a.mp4"}
                ]
            }
        });

        let media: Media = serde_json::from_value(media_json).unwrap();
        let variants = media.video_info.unwrap().variants;
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].bitrate, None);
        assert_eq!(variants[1].bitrate, Some(832000));
    }

    #[test]
    fn test_description_and_permalink() {
        let tweet = Tweet {
            id_str: "42".to_string(),
            full_text: Some("hello world".to_string()),
            user: User {
                id_str: "7".to_string(),
                name: "Alice".to_string(),
                screen_name: "alice".to_string(),
            },
            ..Default::default()
        };

        assert_eq!(tweet.description(), "Alice\n@alice\nhello world");
        assert_eq!(tweet.permalink(), "https://twitter.com/alice/status/42");
    }

    #[test]
    fn test_display_text_falls_back_to_legacy_text() {
        let tweet = Tweet {
            id_str: "1".to_string(),
            text: Some("short".to_string()),
            ..Default::default()
        };
        assert_eq!(tweet.display_text(), "short");
    }

    #[test]
    fn test_account_param() {
        assert_eq!(account_param("12345"), ("user_id", "12345".to_string()));
        assert_eq!(account_param("@TwitterJP"), ("screen_name", "TwitterJP".to_string()));
    }

    #[tokio::test]
    async fn test_user_timeline_paginates_with_max_id() {
        let mut server = mockito::Server::new_async().await;

        let first_page = server
            .mock("GET", "/statuses/user_timeline.json")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("screen_name".into(), "someone".into()),
                mockito::Matcher::UrlEncoded("since_id".into(), "5".into()),
                mockito::Matcher::Regex("tweet_mode=extended$".into()),
            ]))
            .with_status(200)
            .with_body(r#"[{"id": 20, "id_str": "20"}, {"id": 18, "id_str": "18"}]"#)
            .create_async()
            .await;

        let second_page = server
            .mock("GET", "/statuses/user_timeline.json")
            .match_query(mockito::Matcher::UrlEncoded("max_id".into(), "17".into()))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = TwitterClient::new("token", 2, 5)
            .unwrap()
            .with_api_base(&server.url());

        let tweets = client.user_timeline("someone", 5).await.unwrap();
        assert_eq!(tweets.len(), 2);

        first_page.assert_async().await;
        second_page.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_maps_to_typed_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/statuses/show.json")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let client = TwitterClient::new("token", 1, 1)
            .unwrap()
            .with_api_base(&server.url());

        let err = client.tweet("999").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TwitterError>(),
            Some(TwitterError::NotFound { .. })
        ));
    }
}
