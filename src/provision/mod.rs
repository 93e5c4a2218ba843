//! Model file acquisition.
//!
//! Provisioning is a collaborator behind [`ModelProvisioner`]: given a URL
//! and a destination it streams bytes to disk, reports progress, and either
//! hands back the final path or an error. The bundled HTTP implementation
//! writes through a `.part` sibling so a cancelled or failed download never
//! leaves a half-written file at the destination path.

use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProvisionProgress {
    pub bytes_downloaded: u64,
    /// Unknown when the server does not send a content length.
    pub total_bytes: Option<u64>,
}

impl ProvisionProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.bytes_downloaded as f64 / total as f64),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionErrorKind {
    Transport,
    /// The server answered with something that is not model bytes, e.g. an
    /// HTML confirmation page.
    InvalidPayload,
    Io,
    Cancelled,
}

#[derive(Debug)]
pub struct ProvisionError {
    pub kind: ProvisionErrorKind,
    pub message: String,
}

impl ProvisionError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ProvisionErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self {
            kind: ProvisionErrorKind::InvalidPayload,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: ProvisionErrorKind::Io,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ProvisionErrorKind::Cancelled,
            message: "download cancelled".to_string(),
        }
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for ProvisionError {}

#[async_trait]
pub trait ModelProvisioner: Send + Sync {
    /// Download `url` into `dest`, streaming progress events along the way.
    /// On cancellation the partial output is deleted and
    /// [`ProvisionErrorKind::Cancelled`] is returned.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: mpsc::UnboundedSender<ProvisionProgress>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ProvisionError>;
}

pub struct HttpModelProvisioner {
    client: reqwest::Client,
}

impl HttpModelProvisioner {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

enum TransferEnd {
    Done,
    Cancelled,
    Failed(ProvisionError),
}

#[async_trait]
impl ModelProvisioner for HttpModelProvisioner {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: mpsc::UnboundedSender<ProvisionProgress>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ProvisionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProvisionError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::transport(format!(
                "HTTP {} fetching model",
                status.as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.contains("text/html") {
            return Err(ProvisionError::invalid_payload(
                "server answered with an HTML page instead of model bytes",
            ));
        }

        let total_bytes = response.content_length();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProvisionError::io(e.to_string()))?;
        }
        let part_path = partial_path(dest);
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| ProvisionError::io(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut first_chunk = true;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break TransferEnd::Cancelled,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if first_chunk {
                            first_chunk = false;
                            if looks_like_html(&bytes) {
                                break TransferEnd::Failed(ProvisionError::invalid_payload(
                                    "server answered with an HTML page instead of model bytes",
                                ));
                            }
                        }
                        if let Err(e) = file.write_all(&bytes).await {
                            break TransferEnd::Failed(ProvisionError::io(e.to_string()));
                        }
                        downloaded += bytes.len() as u64;
                        let _ = progress.send(ProvisionProgress {
                            bytes_downloaded: downloaded,
                            total_bytes,
                        });
                    }
                    Some(Err(e)) => break TransferEnd::Failed(ProvisionError::transport(e.to_string())),
                    None => break TransferEnd::Done,
                }
            }
        };

        match end {
            TransferEnd::Done => {
                file.flush()
                    .await
                    .map_err(|e| ProvisionError::io(e.to_string()))?;
                drop(file);
                tokio::fs::rename(&part_path, dest)
                    .await
                    .map_err(|e| ProvisionError::io(e.to_string()))?;
                tracing::debug!("model downloaded to {}", dest.display());
                Ok(dest.to_path_buf())
            }
            TransferEnd::Cancelled => {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(ProvisionError::cancelled())
            }
            TransferEnd::Failed(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }
}

pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "model.bin".into());
    name.push(".part");
    dest.with_file_name(name)
}

/// Sniff the first bytes of a download for an HTML document. Some hosts
/// answer a GET for large binaries with a confirmation landing page and
/// status 200.
pub(crate) fn looks_like_html(bytes: &[u8]) -> bool {
    let head: Vec<u8> = bytes
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(16)
        .collect();
    let lower = head.to_ascii_lowercase();
    lower.starts_with(b"<!doctype") || lower.starts_with(b"<html")
}

/// Derive a destination file name from the download URL.
pub fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("model.bin")
        .to_string()
}
