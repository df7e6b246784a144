use crate::error_utils::create_http_client_with_context;
use crate::retry::TransferError;
use anyhow::Context;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use reqwest::Client;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Fetches media URLs into local staging files
pub struct MediaDownloader {
    client: Client,
}

impl MediaDownloader {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: create_http_client_with_context(Duration::from_secs(120))?,
        })
    }

    /// Download `url` into `file_path`, creating parent directories.
    /// A partial file is removed when the download fails.
    pub async fn download(&self, url: &str, file_path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))
                .map_err(TransferError::permanent)?;
        }

        debug!("Downloading {url} to {path}", path = file_path.display());

        let response = build_media_request(&self.client, url)
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(handle_download_error(response, url).await);
        }

        let mut file = File::create(file_path)
            .await
            .with_context(|| format!("Failed to create file {}", file_path.display()))
            .map_err(TransferError::permanent)?;

        if let Err(e) = stream_response_to_file(response, &mut file).await {
            drop(file);
            remove_partial_file(file_path).await;
            return Err(e);
        }

        Ok(())
    }
}

fn build_media_request(client: &Client, download_url: &str) -> reqwest::RequestBuilder {
    client
        .get(download_url)
        .header(
            "User-Agent",
            "Mozilla/5.0 (X11; Linux x86_64; rv:139.0) Gecko/20100101 Firefox/139.0",
        )
        .header("Accept-Language", "en-US,en;q=0.5")
        .header("Accept", "image/*,video/*;q=0.9,*/*;q=0.5")
}

/// Log the failed response (gzip-decoding the body when needed) and classify it
async fn handle_download_error(response: reqwest::Response, download_url: &str) -> TransferError {
    let status = response.status();
    let is_gzipped = response
        .headers()
        .get(reqwest::header::CONTENT_ENCODING)
        .is_some_and(|h| h == "gzip");

    let body_text = match response.bytes().await {
        Ok(bytes) => {
            let mut decoded_bytes = Vec::new();
            if is_gzipped && GzDecoder::new(&bytes[..]).read_to_end(&mut decoded_bytes).is_ok() {
                String::from_utf8(decoded_bytes)
                    .unwrap_or_else(|e| format!("Non-UTF8 gzipped body: {e}"))
            } else {
                String::from_utf8(bytes.to_vec()).unwrap_or_else(|e| {
                    format!(
                        "Non-UTF8 binary body ({bytes_len} bytes): {e}",
                        bytes_len = bytes.len()
                    )
                })
            }
        }
        Err(e) => format!("Could not read response body: {e}"),
    };

    warn!("Failed media download. Status: {status}. URL: {download_url}. Body: {body_text}");

    TransferError::from_status(status, format!("Failed to download {download_url}"))
}

async fn stream_response_to_file(
    response: reqwest::Response,
    file: &mut File,
) -> Result<(), TransferError> {
    let total_size = response.content_length().unwrap_or(0);

    let stream = response.bytes_stream();
    let mut reader = StreamReader::new(stream.map(|result| result.map_err(std::io::Error::other)));

    let mut buffer = vec![0u8; 8192];
    let mut downloaded = 0u64;

    loop {
        // A broken body stream is a network problem, so it is worth another attempt
        let n = reader
            .read(&mut buffer)
            .await
            .context("Failed to read media stream")
            .map_err(TransferError::transient)?;
        if n == 0 {
            break;
        }

        file.write_all(&buffer[..n])
            .await
            .context("Failed to write media data to file")
            .map_err(TransferError::permanent)?;

        downloaded += n as u64;
        if total_size > 0 {
            let progress = (downloaded * 100) / total_size;
            debug!("Download progress: {progress}%");
        }
    }

    file.flush()
        .await
        .context("Failed to flush file")
        .map_err(TransferError::permanent)?;
    Ok(())
}

async fn remove_partial_file(file_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(file_path).await {
        warn!(
            "Failed to remove partially downloaded file {path}: {e}",
            path = file_path.display()
        );
    }
}
