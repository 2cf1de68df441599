//! Firmware image download.

use std::path::Path;

use async_trait::async_trait;

use crate::resource::FirmwareUpdateStatus;

/// A failed firmware operation, mapped onto the status reported to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareFailure {
    pub status: FirmwareUpdateStatus,
    pub message: String,
}

impl FirmwareFailure {
    pub fn new(status: FirmwareUpdateStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_uri(message: impl Into<String>) -> Self {
        Self::new(FirmwareUpdateStatus::InvalidUri, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(FirmwareUpdateStatus::ConnectionLost, message)
    }

    /// Local storage could not hold the image.
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(FirmwareUpdateStatus::OutOfMemory, message)
    }
}

/// Download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadProgress {
    /// Content length known.
    Percent(u8),
    /// Content length unknown.
    Bytes(u64),
}

impl DownloadProgress {
    /// Text of the diagnostic log entry.
    pub fn message(&self) -> String {
        match self {
            DownloadProgress::Percent(p) => format!("Firmware Download progress: {}%", p),
            DownloadProgress::Bytes(n) => format!("Downloaded : {} bytes so far", n),
        }
    }
}

/// Tracks when progress should be reported.
#[derive(Debug)]
pub struct ProgressTracker {
    total: Option<u64>,
    step_bytes: u64,
    received: u64,
    last_percent: u8,
    next_mark: u64,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>, step_bytes: u64) -> Self {
        let step_bytes = step_bytes.max(1);
        Self {
            total: total.filter(|t| *t > 0),
            step_bytes,
            received: 0,
            last_percent: 0,
            next_mark: step_bytes,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Account for `n` more bytes; returns a report when one is due.
    pub fn advance(&mut self, n: u64) -> Option<DownloadProgress> {
        self.received += n;
        match self.total {
            Some(total) => {
                let percent = (self.received.saturating_mul(100) / total).min(100) as u8;
                if percent > self.last_percent {
                    self.last_percent = percent;
                    Some(DownloadProgress::Percent(percent))
                } else {
                    None
                }
            }
            None => {
                if self.received >= self.next_mark {
                    self.next_mark = self.received + self.step_bytes;
                    Some(DownloadProgress::Bytes(self.received))
                } else {
                    None
                }
            }
        }
    }
}

/// Fetches a firmware image into local storage.
#[async_trait]
pub trait FirmwareDownloader: Send + Sync {
    /// Stream `url` into `dest`, calling `progress` along the way.
    /// Returns the number of bytes written.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64, FirmwareFailure>;
}

#[cfg(feature = "http")]
pub use http::HttpDownloader;

#[cfg(feature = "http")]
mod http {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tracing::debug;

    use super::{DownloadProgress, FirmwareDownloader, FirmwareFailure, ProgressTracker};
    use crate::error::{Error, Result};

    /// Downloads over HTTP(S) with reqwest.
    pub struct HttpDownloader {
        client: reqwest::Client,
        progress_step_bytes: u64,
    }

    impl HttpDownloader {
        pub fn new(progress_step_bytes: u64) -> Result<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
            Ok(Self {
                client,
                progress_step_bytes,
            })
        }
    }

    #[async_trait]
    impl FirmwareDownloader for HttpDownloader {
        async fn download(
            &self,
            url: &str,
            dest: &Path,
            progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        ) -> std::result::Result<u64, FirmwareFailure> {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| FirmwareFailure::invalid_uri(format!("{}: {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(FirmwareFailure::invalid_uri(format!(
                    "unsupported scheme {}",
                    parsed.scheme()
                )));
            }

            let response = self
                .client
                .get(parsed)
                .send()
                .await
                .map_err(|e| FirmwareFailure::connection_lost(e.to_string()))?;
            let status = response.status();
            if status.is_client_error() {
                return Err(FirmwareFailure::invalid_uri(format!("HTTP {}", status)));
            }
            if !status.is_success() {
                return Err(FirmwareFailure::connection_lost(format!("HTTP {}", status)));
            }

            let mut tracker = ProgressTracker::new(response.content_length(), self.progress_step_bytes);
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| FirmwareFailure::out_of_memory(format!("{}: {}", dest.display(), e)))?;

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| FirmwareFailure::connection_lost(e.to_string()))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| FirmwareFailure::out_of_memory(e.to_string()))?;
                if let Some(report) = tracker.advance(chunk.len() as u64) {
                    progress(report);
                }
            }
            file.flush()
                .await
                .map_err(|e| FirmwareFailure::out_of_memory(e.to_string()))?;

            if tracker.received() == 0 {
                return Err(FirmwareFailure::invalid_uri("empty response body"));
            }
            debug!(url, bytes = tracker.received(), "firmware downloaded");
            Ok(tracker.received())
        }
    }
}
