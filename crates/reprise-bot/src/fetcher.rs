//! Downloads remote attachments into the media directory.
//!
//! Each download lands at `<media_dir>/<uuid><ext>` with a freshly minted
//! id, so it can never collide with an existing file. Transient failures
//! are retried with capped exponential backoff; anything written by a
//! failed attempt is removed before the error is returned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use reprise_shared::constants::{
    extension_for_mime, DOWNLOAD_BACKOFF_BASE_MS, DOWNLOAD_BACKOFF_CAP_MS, DOWNLOAD_MAX_ATTEMPTS,
    DOWNLOAD_TIMEOUT_SECS,
};
use reprise_shared::{MediaDescriptor, MediaKind, ValidationError};
use reprise_store::media::remove_file_best_effort;

use crate::config::BotConfig;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Download timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("File is too large ({size} bytes, limit {max})")]
    TooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Extension(#[from] ValidationError),

    #[error("Downloaded size mismatch (expected {expected}, got {actual})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Worth another attempt: timeouts, connection failures and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status(code) => *code >= 500,
            _ => false,
        }
    }

    /// The input itself was rejected; retrying cannot help.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Extension(_) | Self::TooLarge { .. })
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub media_dir: PathBuf,
    pub max_size: u64,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Lowercase, with leading dot.
    pub allowed_extensions: Vec<String>,
}

impl FetcherConfig {
    pub fn from_bot_config(config: &BotConfig) -> Self {
        Self {
            media_dir: config.media_dir.clone(),
            max_size: config.max_file_size,
            timeout: Duration::from_secs(DOWNLOAD_TIMEOUT_SECS),
            max_attempts: DOWNLOAD_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DOWNLOAD_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DOWNLOAD_BACKOFF_CAP_MS),
            allowed_extensions: config.allowed_extensions.clone(),
        }
    }
}

/// One attachment to download.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Direct download URL.
    pub url: String,
    /// Platform reference recorded in the descriptor.
    pub source: String,
    pub kind: MediaKind,
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
}

pub struct BlobFetcher {
    client: Client,
    config: FetcherConfig,
}

impl BlobFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, DownloadError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        info!(
            media_dir = %config.media_dir.display(),
            max_size = config.max_size,
            "Blob fetcher initialized"
        );
        Ok(Self { client, config })
    }

    /// Download `request` with retries and return its descriptor.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<MediaDescriptor, DownloadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.fetch_once(request).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.config.max_attempts {
                warn!(url = %request.url, attempts = attempt, error = %err, "Download failed");
                return Err(DownloadError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff_delay(attempt - 1);
            warn!(
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Download attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `base * 2^retry`, capped.
    fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_cap)
    }

    async fn fetch_once(&self, request: &FetchRequest) -> Result<MediaDescriptor, DownloadError> {
        let response = self.client.get(&request.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let declared = response.content_length();
        if let Some(len) = declared {
            if len > self.config.max_size {
                return Err(DownloadError::TooLarge {
                    size: len,
                    max: self.config.max_size,
                });
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let extension = self.resolve_extension(
            &request.url,
            content_type.as_deref().or(request.mime_type.as_deref()),
        )?;

        let id = Uuid::new_v4();
        let file_name = format!("{id}{extension}");
        let local_path = self.config.media_dir.join(&file_name);

        let size = match self.write_body(response, &local_path, declared).await {
            Ok(size) => size,
            Err(e) => {
                remove_file_best_effort(&local_path).await;
                return Err(e);
            }
        };

        debug!(id = %id, size, kind = request.kind.name(), "Media downloaded");
        Ok(MediaDescriptor {
            id,
            kind: request.kind.clone(),
            source: request.source.clone(),
            local_path,
            original_name: request
                .original_name
                .clone()
                .unwrap_or_else(|| file_name.clone()),
            file_name,
            size,
            mime_type: request.mime_type.clone().or(content_type),
            created_at: Utc::now(),
        })
    }

    /// Extension from the URL path, else from the content type.
    fn resolve_extension(&self, url: &str, content_type: Option<&str>) -> Result<String, DownloadError> {
        let from_path = Url::parse(url)
            .ok()
            .and_then(|u| u.path_segments()?.last().map(str::to_owned))
            .and_then(|segment| {
                Path::new(&segment)
                    .extension()
                    .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
            });
        let extension = from_path
            .or_else(|| content_type.and_then(extension_for_mime).map(str::to_owned))
            .unwrap_or_default();

        if extension.is_empty() || !self.config.allowed_extensions.contains(&extension) {
            return Err(ValidationError::DisallowedExtension(extension).into());
        }
        Ok(extension)
    }

    /// Stream the body to `path`, enforcing the size limit, then verify the
    /// size on disk.
    async fn write_body(
        &self,
        response: Response,
        path: &Path,
        declared: Option<u64>,
    ) -> Result<u64, DownloadError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > self.config.max_size {
                return Err(DownloadError::TooLarge {
                    size: received,
                    max: self.config.max_size,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let on_disk = tokio::fs::metadata(path).await?.len();
        if on_disk != received {
            return Err(DownloadError::SizeMismatch {
                expected: received,
                actual: on_disk,
            });
        }
        if let Some(expected) = declared {
            if expected != received {
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: received,
                });
            }
        }
        Ok(received)
    }
}
