use crate::error_utils::{create_http_client_with_context, parse_json_with_context};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Turns a third-party post URL into the raw media URLs it shows.
/// An empty list is a valid answer.
#[async_trait]
pub trait EmbedResolver: Send + Sync {
    async fn resolve_media_urls(&self, post_url: &str) -> Result<Vec<String>>;
}

/// Scrapes the JSON blob an Instagram post page ships in `window._sharedData`
pub struct InstagramResolver {
    client: Client,
}

impl InstagramResolver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: create_http_client_with_context(Duration::from_secs(30))?,
        })
    }
}

#[async_trait]
impl EmbedResolver for InstagramResolver {
    async fn resolve_media_urls(&self, post_url: &str) -> Result<Vec<String>> {
        debug!("Fetching Instagram post {post_url}");

        let body = self
            .client
            .get(post_url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch Instagram post {post_url}"))?
            .error_for_status()
            .with_context(|| format!("Instagram returned an error for {post_url}"))?
            .text()
            .await
            .context("Failed to read Instagram page body")?;

        let shared_data = extract_shared_data(&body)?;
        let urls = media_urls_from_shared_data(&shared_data);

        debug!(
            "Instagram post {post_url} has {count} media items",
            count = urls.len()
        );
        Ok(urls)
    }
}

/// Pull the `window._sharedData = {...};` object out of a post page
pub fn extract_shared_data(html: &str) -> Result<Value> {
    let re = Regex::new(r"(?s)window\._sharedData = (\{.*?\});")
        .context("Failed to compile shared data regex")?;

    let json = re
        .captures(html)
        .and_then(|c| c.get(1))
        .context("Instagram page has no window._sharedData")?;

    parse_json_with_context(json.as_str(), "Instagram shared data")
}

/// Video URL for video nodes, display URL otherwise
fn node_media_url(node: &Value) -> Option<String> {
    let is_video = node.get("is_video").and_then(Value::as_bool).unwrap_or(false);

    let video_url = node.get("video_url").and_then(Value::as_str);
    let display_url = node.get("display_url").and_then(Value::as_str);

    match (is_video, video_url) {
        (true, Some(url)) => Some(url.to_string()),
        _ => display_url.map(str::to_string),
    }
}

/// Walk `entry_data.PostPage[].graphql.shortcode_media`, expanding sidecars
pub fn media_urls_from_shared_data(shared_data: &Value) -> Vec<String> {
    let Some(post_pages) = shared_data
        .get("entry_data")
        .and_then(|entry| entry.get("PostPage"))
        .and_then(Value::as_array)
    else {
        debug!("Instagram: no entry_data.PostPage");
        return Vec::new();
    };

    let mut media_urls = Vec::new();

    for page in post_pages {
        let Some(shortcode_media) = page
            .get("graphql")
            .and_then(|graphql| graphql.get("shortcode_media"))
        else {
            continue;
        };

        match shortcode_media.get("edge_sidecar_to_children") {
            Some(sidecar) => {
                let edges = sidecar
                    .get("edges")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();

                media_urls.extend(
                    edges
                        .iter()
                        .filter_map(|edge| edge.get("node"))
                        .filter_map(node_media_url),
                );
            }
            None => media_urls.extend(node_media_url(shortcode_media)),
        }
    }

    media_urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_single_photo_post() {
        let data = json!({
            "entry_data": {"PostPage": [{
                "graphql": {"shortcode_media": {
                    "is_video": false,
                    "display_url": "https://scontent.cdninstagram.com/photo.jpg"
                }}
            }]}
        });
        assert_eq!(
            media_urls_from_shared_data(&data),
            vec!["https://scontent.cdninstagram.com/photo.jpg".to_string()]
        );
    }

    #[test]
    fn test_video_post_prefers_video_url() {
        let data = json!({
            "entry_data": {"PostPage": [{
                "graphql": {"shortcode_media": {
                    "is_video": true,
                    "video_url": "https://scontent.cdninstagram.com/clip.mp4",
                    "display_url": "https://scontent.cdninstagram.com/poster.jpg"
                }}
            }]}
        });
        assert_eq!(
            media_urls_from_shared_data(&data),
            vec!["https://scontent.cdninstagram.com/clip.mp4".to_string()]
        );
    }

    #[test]
    fn test_sidecar_post_expands_children() {
        let data = json!({
            "entry_data": {"PostPage": [{
                "graphql": {"shortcode_media": {
                    "display_url": "cover.jpg",
                    "edge_sidecar_to_children": {"edges": [
                        {"node": {"is_video": false, "display_url": "one.jpg"}},
                        {"node": {"is_video": true, "video_url": "two.mp4", "display_url": "two.jpg"}},
                        {"other": {}}
                    ]}
                }}
            }]}
        });
        assert_eq!(
            media_urls_from_shared_data(&data),
            vec!["one.jpg".to_string(), "two.mp4".to_string()]
        );
    }

    #[test]
    fn test_missing_post_page_yields_nothing() {
        assert!(media_urls_from_shared_data(&json!({})).is_empty());
        assert!(media_urls_from_shared_data(&json!({"entry_data": {}})).is_empty());
    }

    #[test]
    fn test_extract_shared_data() {
        let html = r#"<html><script type="text/javascript">window._sharedData = {"entry_data": {"PostPage": []}};</script></html>"#;
        let data = extract_shared_data(html).unwrap();
        assert!(data["entry_data"]["PostPage"].is_array());

        assert!(extract_shared_data("<html></html>").is_err());
    }

    #[tokio::test]
    async fn test_resolver_fetches_and_parses_page() {
        let mut server = mockito::Server::new_async().await;
        let page = server
            .mock("GET", "/p/abc/")
            .with_status(200)
            .with_body(
                r#"<script>window._sharedData = {"entry_data":{"PostPage":[{"graphql":{"shortcode_media":{"display_url":"https://cdn/x.jpg"}}}]}};</script>"#,
            )
            .create_async()
            .await;

        let resolver = InstagramResolver::new().unwrap();
        let urls = resolver
            .resolve_media_urls(&format!("{}/p/abc/", server.url()))
            .await
            .unwrap();

        assert_eq!(urls, vec!["https://cdn/x.jpg".to_string()]);
        page.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolver_reports_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _page = server
            .mock("GET", "/p/gone/")
            .with_status(404)
            .create_async()
            .await;

        let resolver = InstagramResolver::new().unwrap();
        assert!(resolver
            .resolve_media_urls(&format!("{}/p/gone/", server.url()))
            .await
            .is_err());
    }
}
