//! Remote download with multi-endpoint fallback and bounded retry.
//!
//! Each attempt walks the candidate URLs in priority order. A body is streamed
//! into a staged temp file (and kept in memory) and validated before it is
//! handed on; staged files are deleted as soon as their candidate is rejected.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::source::candidate_urls;
use super::validator;
use crate::models::SourceItem;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request error: {0}")]
    Request(String),
    #[error("Body read error: {0}")]
    Body(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Locator has no resolvable source id")]
    InvalidSource,
    #[error("Download failed after {attempts} attempts")]
    Exhausted { attempts: usize },
    #[error("No endpoint returned a valid image after {attempts} attempts")]
    InvalidAsset { attempts: usize },
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Status plus a streaming body.
pub struct TransportResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

/// Network transport used by the [`Fetcher`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("photofinder/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map_err(|e| TransportError::Body(e.to_string()))
            .boxed();

        Ok(TransportResponse { status, body })
    }
}

/// A validated download. The staged file is removed when the asset is dropped.
#[derive(Debug)]
pub struct DownloadedAsset {
    pub item: SourceItem,
    staged: NamedTempFile,
    bytes: Vec<u8>,
    pub size: u64,
}

impl DownloadedAsset {
    pub fn path(&self) -> &Path {
        self.staged.path()
    }

    /// The validated body, as streamed.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Move the body out without touching the staged file.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

enum CandidateResult {
    Valid {
        staged: NamedTempFile,
        bytes: Vec<u8>,
    },
    Invalid,
    Rejected(u16),
    Failed(String),
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    max_retries: usize,
    retry_delay: Duration,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, max_retries: usize, retry_delay: Duration) -> Self {
        Self {
            transport,
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// Download and validate the asset behind `item`.
    pub async fn fetch(&self, item: &SourceItem) -> Result<DownloadedAsset, FetchError> {
        let Some(drive_id) = item.drive_id.as_deref() else {
            return Err(FetchError::InvalidSource);
        };
        let candidates = candidate_urls(drive_id);
        let mut saw_success_status = false;

        for attempt in 1..=self.max_retries {
            for url in &candidates {
                match self.try_candidate(url).await {
                    CandidateResult::Valid { staged, bytes } => {
                        let size = bytes.len() as u64;
                        tracing::debug!(
                            "Fetcher: {} downloaded ({} bytes) on attempt {}",
                            item.locator,
                            size,
                            attempt
                        );
                        return Ok(DownloadedAsset {
                            item: item.clone(),
                            staged,
                            bytes,
                            size,
                        });
                    }
                    CandidateResult::Invalid => {
                        saw_success_status = true;
                        tracing::debug!("Fetcher: {} returned a non-image body", url);
                    }
                    CandidateResult::Rejected(status) => {
                        tracing::debug!("Fetcher: {} returned status {}", url, status);
                    }
                    CandidateResult::Failed(e) => {
                        tracing::debug!("Fetcher: request error on attempt {}: {}", attempt, e);
                    }
                }
            }

            if attempt < self.max_retries {
                tracing::info!(
                    "Fetcher: all endpoints failed for {}, retrying in {:?} ({}/{})",
                    item.locator,
                    self.retry_delay,
                    attempt,
                    self.max_retries
                );
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        tracing::warn!(
            "Fetcher: giving up on {} after {} attempts",
            item.locator,
            self.max_retries
        );
        if saw_success_status {
            Err(FetchError::InvalidAsset {
                attempts: self.max_retries,
            })
        } else {
            Err(FetchError::Exhausted {
                attempts: self.max_retries,
            })
        }
    }

    async fn try_candidate(&self, url: &str) -> CandidateResult {
        let response = match self.transport.get(url).await {
            Ok(r) => r,
            Err(e) => return CandidateResult::Failed(e.to_string()),
        };
        if !(200..300).contains(&response.status) {
            return CandidateResult::Rejected(response.status);
        }

        let staged = match create_staged_file().await {
            Ok(f) => f,
            Err(e) => return CandidateResult::Failed(format!("cannot stage download: {}", e)),
        };

        let bytes = match stream_to_file(response.body, staged.path()).await {
            Ok(b) => b,
            Err(e) => return CandidateResult::Failed(e),
        };

        if validator::validate(&bytes) {
            CandidateResult::Valid { staged, bytes }
        } else {
            // staged file dropped (and deleted) here
            CandidateResult::Invalid
        }
    }
}

async fn create_staged_file() -> std::io::Result<NamedTempFile> {
    tokio::task::spawn_blocking(|| {
        tempfile::Builder::new()
            .prefix("photofinder-")
            .suffix(".img")
            .tempfile()
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Write the body to `path` and return it.
async fn stream_to_file(
    mut body: BoxStream<'static, Result<Bytes, TransportError>>,
    path: &Path,
) -> Result<Vec<u8>, String> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| format!("cannot open staged file: {}", e))?;

    let mut contents = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("cannot write staged file: {}", e))?;
        contents.extend_from_slice(&chunk);
    }
    file.flush()
        .await
        .map_err(|e| format!("cannot flush staged file: {}", e))?;

    Ok(contents)
}
