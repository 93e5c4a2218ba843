use tokio::sync::mpsc;

use crate::api::anthropic::{MessagesRequest, StreamEvent};
use crate::api::ChatMessage;
use crate::core::conversation::Turn;
use crate::utils::url::construct_api_url;

use super::{
    pump_sse, status_failure, AdapterError, SsePayload, StreamParams, StreamingAdapter, TokenEvent,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages SSE dialect. The envelope differs from the
/// OpenAI-compatible wire: text rides on `content_block_delta` events and
/// every other event type is ignored.
pub struct AnthropicSse;

impl StreamingAdapter for AnthropicSse {
    fn stream(&self, params: StreamParams) -> mpsc::UnboundedReceiver<TokenEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = params.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = run(params, tx) => {}
                _ = cancel.cancelled() => {}
            }
        });
        rx
    }
}

async fn run(params: StreamParams, tx: mpsc::UnboundedSender<TokenEvent>) {
    let request = MessagesRequest {
        model: params.model.clone(),
        max_tokens: params.max_output_tokens,
        messages: build_messages(&params.history, &params.new_message),
        stream: true,
    };
    let url = construct_api_url(&params.base_url, "messages");

    match params
        .client
        .post(url)
        .header("Content-Type", "application/json")
        .header("x-api-key", &params.credential)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&request)
        .send()
        .await
    {
        Ok(response) if !response.status().is_success() => {
            let _ = tx.send(TokenEvent::Failed(status_failure(response).await));
        }
        Ok(response) => pump_sse(response, &params.cancel, &tx, parse_payload).await,
        Err(e) => {
            let _ = tx.send(TokenEvent::Failed(AdapterError::transport(e.to_string())));
        }
    }
}

fn build_messages(history: &[Turn], new_message: &str) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = history
        .iter()
        .map(|turn| ChatMessage {
            role: turn.speaker.chat_role().to_string(),
            content: turn.content.clone(),
        })
        .collect();
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: new_message.to_string(),
    });
    messages
}

fn parse_payload(payload: &str) -> SsePayload {
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) if event.kind == "content_block_delta" => {
            match event.delta.and_then(|d| d.text) {
                Some(text) if !text.is_empty() => SsePayload::Token(text),
                _ => SsePayload::Skip,
            }
        }
        Ok(_) => SsePayload::Skip,
        Err(e) => {
            tracing::debug!("skipping malformed SSE payload: {e}");
            SsePayload::Skip
        }
    }
}
