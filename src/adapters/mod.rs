use std::error::Error as StdError;
use std::fmt;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::conversation::Turn;

pub mod anthropic;
pub mod gemini;
pub mod local;
pub mod openai;

/// Normalized output of every adapter, regardless of wire dialect.
#[derive(Clone, Debug)]
pub enum TokenEvent {
    Chunk(String),
    End,
    Failed(AdapterError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Connection, timeout, or non-2xx response.
    Transport,
    /// Unparseable envelope. Recovered line-by-line during SSE streaming;
    /// only fatal when the whole exchange cannot be framed.
    Protocol,
    /// Missing credential, model, or uninitialized backend.
    Configuration,
    /// Not a failure; the consumer went away.
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Protocol,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Configuration,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: AdapterErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for AdapterError {}

/// Everything an adapter needs to run one streaming exchange. `history`
/// excludes the in-flight user+assistant pair; each adapter composes its own
/// request from `history` plus `new_message`.
pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub credential: String,
    pub model: String,
    pub history: Vec<Turn>,
    pub new_message: String,
    pub max_output_tokens: u32,
    pub cancel: CancellationToken,
}

/// One streaming request against one backend. Implementations spawn the
/// transfer themselves and report every failure in-band as
/// [`TokenEvent::Failed`]; the returned receiver is the whole contract.
pub trait StreamingAdapter: Send + Sync {
    fn stream(&self, params: StreamParams) -> mpsc::UnboundedReceiver<TokenEvent>;
}

pub(crate) fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// What a dialect makes of one SSE data payload.
pub(crate) enum SsePayload {
    Token(String),
    Done,
    Skip,
}

/// Drive an SSE response body to completion, handing each `data:` payload to
/// the dialect parser. Lines that are blank, non-data, or invalid UTF-8 are
/// skipped. Stream close without an explicit terminator counts as completion.
pub(crate) async fn pump_sse<F>(
    response: reqwest::Response,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<TokenEvent>,
    mut parse: F,
) where
    F: FnMut(&str) -> SsePayload,
{
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return;
        }

        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(TokenEvent::Failed(AdapterError::transport(format!(
                    "stream read failed: {e}"
                ))));
                return;
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let action = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(line) => match extract_data_payload(line.trim()) {
                    Some(payload) if !payload.is_empty() => parse(payload),
                    _ => SsePayload::Skip,
                },
                Err(e) => {
                    tracing::debug!("invalid UTF-8 in stream: {e}");
                    SsePayload::Skip
                }
            };
            buffer.drain(..=newline_pos);

            match action {
                SsePayload::Token(token) => {
                    let _ = tx.send(TokenEvent::Chunk(token));
                }
                SsePayload::Done => {
                    let _ = tx.send(TokenEvent::End);
                    return;
                }
                SsePayload::Skip => {}
            }
        }
    }

    let _ = tx.send(TokenEvent::End);
}

/// Turn a non-2xx response into a fatal adapter error carrying the status
/// and a one-line summary of the body.
pub(crate) async fn status_failure(response: reqwest::Response) -> AdapterError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<no body>".to_string());
    AdapterError::transport(format!(
        "HTTP {}: {}",
        status.as_u16(),
        summarize_error_body(&body)
    ))
}

/// Dig a human-readable message out of a provider error body. Providers
/// mostly agree on `{"error": {"message": ...}}`-shaped JSON; anything else
/// is collapsed to a single trimmed line.
pub(crate) fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let summary = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or_else(|| {
                value
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            })
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            });

        if let Some(summary) = summary {
            let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
            if !collapsed.is_empty() {
                return collapsed;
            }
        }
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > 200 {
        let mut clipped: String = collapsed.chars().take(200).collect();
        clipped.push('…');
        clipped
    } else {
        collapsed
    }
}
