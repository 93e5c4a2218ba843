//! Payloads for the Anthropic messages API.
//!
//! Requests reuse the plain role/content message shape; the streaming reply
//! is a sequence of typed SSE events of which only `content_block_delta`
//! carries text.

use serde::{Deserialize, Serialize};

use super::ChatMessage;

#[derive(Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub text: Option<String>,
}
