use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{error, warn};

use crate::utils::http::get_http_client;

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("media is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("media download failed")]
    Failed,
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn retry_delay(attempt: usize) -> Duration {
    Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << attempt)
}

/// Downloads `url` with retries on transient failures. Bodies larger than
/// `max_bytes` are refused, by `Content-Length` when the server sends one.
pub async fn download_media(url: &str, max_bytes: u64) -> Result<Vec<u8>, DownloadError> {
    let client = get_http_client();
    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        let last_attempt = attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS;
        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch media: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                if !should_retry_error(&err) || last_attempt {
                    return Err(DownloadError::Failed);
                }
                tokio::time::sleep(retry_delay(attempt)).await;
                continue;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Media download failed with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            if !should_retry_status(status) || last_attempt {
                return Err(DownloadError::Failed);
            }
            tokio::time::sleep(retry_delay(attempt)).await;
            continue;
        }

        if let Some(size) = response.content_length() {
            if size > max_bytes {
                return Err(DownloadError::TooLarge { size, max: max_bytes });
            }
        }

        match response.bytes().await {
            Ok(bytes) => {
                let size = bytes.len() as u64;
                if size > max_bytes {
                    return Err(DownloadError::TooLarge { size, max: max_bytes });
                }
                return Ok(bytes.to_vec());
            }
            Err(err) => {
                error!(
                    "Failed to read media bytes: {err} (attempt={}/{})",
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                if last_attempt {
                    return Err(DownloadError::Failed);
                }
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }
    }

    Err(DownloadError::Failed)
}
