use crate::error_utils::{create_http_client_with_context, parse_http_response_json};
use crate::retry::TransferError;
use crate::sink::MediaSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const PHOTOS_API_BASE: &str = "https://photoslibrary.googleapis.com";

/// Google Photos caps media item descriptions at this many characters
const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Refresh the access token this long before Google says it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GooglePhotosConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Album every upload is added to; created on first use
    pub album_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Album {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AlbumList {
    #[serde(default)]
    albums: Vec<Album>,
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    album_id: Option<&'a str>,
    new_media_items: Vec<NewMediaItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewMediaItem<'a> {
    description: String,
    simple_media_item: SimpleMediaItem<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimpleMediaItem<'a> {
    upload_token: &'a str,
    file_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreateResponse {
    #[serde(default)]
    new_media_item_results: Vec<NewMediaItemResult>,
}

#[derive(Debug, Deserialize)]
struct NewMediaItemResult {
    #[serde(default)]
    status: ItemStatus,
}

#[derive(Debug, Deserialize, Default)]
struct ItemStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Uploads staged media into a Google Photos library
pub struct GooglePhotosSink {
    client: Client,
    config: GooglePhotosConfig,
    token_url: String,
    api_base: String,
    token: Mutex<Option<AccessToken>>,
    album_id: Mutex<Option<String>>,
}

impl GooglePhotosSink {
    pub fn new(config: GooglePhotosConfig) -> Result<Self> {
        Ok(Self {
            client: create_http_client_with_context(Duration::from_secs(300))?,
            config,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            api_base: PHOTOS_API_BASE.to_string(),
            token: Mutex::new(None),
            album_id: Mutex::new(None),
        })
    }

    /// Point the sink at different endpoints (used by tests)
    pub fn with_endpoints(mut self, token_url: &str, api_base: &str) -> Self {
        self.token_url = token_url.to_string();
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// A valid access token, exchanging the refresh token when needed
    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;

        if let Some(current) = token.as_ref() {
            if Instant::now() < current.expires_at {
                return Ok(current.value.clone());
            }
        }

        debug!("Exchanging refresh token for a Google access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("Failed to reach Google token endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Google token exchange failed with status {status}: {body}");
        }

        let parsed: TokenResponse =
            parse_http_response_json(response, "Google token response").await?;

        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *token = Some(AccessToken {
            value: parsed.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(parsed.access_token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    async fn find_album(&self, access_token: &str, title: &str) -> Result<Option<Album>> {
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/v1/albums", self.api_base))
                .bearer_auth(access_token)
                .query(&[("pageSize", "50")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request
                .send()
                .await
                .context("Failed to list Google Photos albums")?
                .error_for_status()
                .context("Google Photos rejected album listing")?;

            let page: AlbumList = parse_http_response_json(response, "album list").await?;

            if let Some(album) = page.albums.into_iter().find(|album| album.title == title) {
                return Ok(Some(album));
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(None),
            }
        }
    }

    async fn create_album(&self, access_token: &str, title: &str) -> Result<Album> {
        let response = self
            .client
            .post(format!("{}/v1/albums", self.api_base))
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "album": { "title": title } }))
            .send()
            .await
            .context("Failed to create Google Photos album")?
            .error_for_status()
            .context("Google Photos rejected album creation")?;

        parse_http_response_json(response, "created album").await
    }

    /// Send the raw bytes, receiving an upload token
    async fn upload_bytes(
        &self,
        access_token: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, TransferError> {
        let response = self
            .client
            .post(format!("{}/v1/uploads", self.api_base))
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Goog-Upload-File-Name", file_name)
            .header("X-Goog-Upload-Protocol", "raw")
            .body(bytes)
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.forget_token().await;
            return Err(TransferError::transient(anyhow::anyhow!(
                "Google Photos rejected the access token"
            )));
        }
        if !status.is_success() {
            return Err(TransferError::from_status(
                status,
                format!("Upload of {file_name} to Google Photos"),
            ));
        }

        response
            .text()
            .await
            .map_err(TransferError::from_reqwest)
    }

    async fn create_media_item(
        &self,
        access_token: &str,
        upload_token: &str,
        file_name: &str,
        description: &str,
    ) -> Result<(), TransferError> {
        let album_id = self.album_id.lock().await.clone();
        let request = BatchCreateRequest {
            album_id: album_id.as_deref(),
            new_media_items: vec![NewMediaItem {
                description: truncate_description(description),
                simple_media_item: SimpleMediaItem {
                    upload_token,
                    file_name,
                },
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/mediaItems:batchCreate", self.api_base))
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::from_status(
                status,
                format!("Creating media item for {file_name}"),
            ));
        }

        let created: BatchCreateResponse = parse_http_response_json(response, "batchCreate response")
            .await
            .map_err(TransferError::permanent)?;

        let result = created
            .new_media_item_results
            .first()
            .context("Google Photos returned no media item result")
            .map_err(TransferError::permanent)?;

        if result.status.code != 0 {
            return Err(TransferError::permanent(anyhow::anyhow!(
                "Google Photos refused {file_name}: {message} (code {code})",
                message = result.status.message,
                code = result.status.code
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl MediaSink for GooglePhotosSink {
    fn name(&self) -> &str {
        "google-photos"
    }

    /// Resolve (or create) the configured album once per cycle
    async fn prepare(&self) -> Result<()> {
        let Some(title) = self.config.album_title.as_deref() else {
            return Ok(());
        };

        if self.album_id.lock().await.is_some() {
            return Ok(());
        }

        let access_token = self.access_token().await?;
        let album = match self.find_album(&access_token, title).await? {
            Some(album) => album,
            None => {
                info!("Creating Google Photos album {title}");
                self.create_album(&access_token, title).await?
            }
        };

        debug!("Using Google Photos album {title} ({id})", id = album.id);
        *self.album_id.lock().await = Some(album.id);
        Ok(())
    }

    async fn upload(&self, file_path: &Path, description: &str) -> Result<(), TransferError> {
        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("media")
            .to_string();

        let bytes = tokio::fs::read(file_path)
            .await
            .with_context(|| format!("Failed to read staged file {}", file_path.display()))
            .map_err(TransferError::permanent)?;

        let access_token = self
            .access_token()
            .await
            .map_err(TransferError::transient)?;

        info!("Uploading {file_name} to Google Photos");
        let upload_token = self.upload_bytes(&access_token, &file_name, bytes).await?;
        self.create_media_item(&access_token, &upload_token, &file_name, description)
            .await
    }
}

fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tempfile::TempDir;

    fn config(album_title: Option<&str>) -> GooglePhotosConfig {
        GooglePhotosConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
            album_title: album_title.map(str::to_string),
        }
    }

    async fn token_mock(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.token","expires_in":3599}"#)
            .expect(1)
            .create_async()
            .await
    }

    #[test]
    fn test_truncate_description() {
        let long = "x".repeat(1500);
        assert_eq!(truncate_description(&long).chars().count(), 1000);
        assert_eq!(truncate_description("short"), "short");
    }

    #[tokio::test]
    async fn test_upload_creates_media_item_in_album() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server).await;

        let list = server
            .mock("GET", "/v1/albums")
            .match_query(Matcher::UrlEncoded("pageSize".into(), "50".into()))
            .with_status(200)
            .with_body(r#"{"albums":[{"id":"other","title":"Other"}]}"#)
            .create_async()
            .await;
        let create_album = server
            .mock("POST", "/v1/albums")
            .match_body(Matcher::PartialJsonString(
                r#"{"album":{"title":"Tweets"}}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"id":"album-1","title":"Tweets"}"#)
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/v1/uploads")
            .match_header("authorization", "Bearer ya29.token")
            .match_header("x-goog-upload-protocol", "raw")
            .match_header("x-goog-upload-file-name", "pic.jpg")
            .with_status(200)
            .with_body("upload-token-1")
            .create_async()
            .await;
        let batch = server
            .mock("POST", "/v1/mediaItems:batchCreate")
            .match_body(Matcher::PartialJsonString(
                r#"{"albumId":"album-1","newMediaItems":[{"description":"Name\n@name\nhello","simpleMediaItem":{"uploadToken":"upload-token-1"}}]}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"newMediaItemResults":[{"status":{"message":"Success"}}]}"#)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("pic.jpg");
        std::fs::write(&file, b"bytes").unwrap();

        let sink = GooglePhotosSink::new(config(Some("Tweets")))
            .unwrap()
            .with_endpoints(&format!("{}/token", server.url()), &server.url());

        sink.prepare().await.unwrap();
        // second prepare reuses the resolved album
        sink.prepare().await.unwrap();
        sink.upload(&file, "Name\n@name\nhello").await.unwrap();

        token.assert_async().await;
        list.assert_async().await;
        create_album.assert_async().await;
        upload.assert_async().await;
        batch.assert_async().await;
        assert!(!sink.keeps_staged_files());
    }

    #[tokio::test]
    async fn test_rejected_item_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let _upload = server
            .mock("POST", "/v1/uploads")
            .with_status(200)
            .with_body("upload-token")
            .create_async()
            .await;
        let _batch = server
            .mock("POST", "/v1/mediaItems:batchCreate")
            .with_status(200)
            .with_body(r#"{"newMediaItemResults":[{"status":{"code":3,"message":"Invalid media"}}]}"#)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("clip.mp4");
        std::fs::write(&file, b"bytes").unwrap();

        let sink = GooglePhotosSink::new(config(None))
            .unwrap()
            .with_endpoints(&format!("{}/token", server.url()), &server.url());

        let err = sink.upload(&file, "desc").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_upload_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let _upload = server
            .mock("POST", "/v1/uploads")
            .with_status(500)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("pic.png");
        std::fs::write(&file, b"bytes").unwrap();

        let sink = GooglePhotosSink::new(config(None))
            .unwrap()
            .with_endpoints(&format!("{}/token", server.url()), &server.url());

        let err = sink.upload(&file, "desc").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_staged_file_is_permanent() {
        let sink = GooglePhotosSink::new(config(None)).unwrap();
        let err = sink
            .upload(Path::new("/definitely/not/here.jpg"), "desc")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
