use tokio::sync::mpsc;

use crate::api::gemini::{Content, GenerateRequest, GenerationConfig, Part, StreamChunk};
use crate::core::conversation::Turn;
use crate::utils::url::construct_api_url;

use super::{
    pump_sse, status_failure, AdapterError, SsePayload, StreamParams, StreamingAdapter, TokenEvent,
};

/// Gemini streaming chat: a chat session opened over the prior history with
/// the new message sent into it, which on the wire is one
/// `streamGenerateContent` call with `contents` = history + new message.
/// Assistant turns are tagged `model` on this wire.
pub struct GeminiChat;

impl StreamingAdapter for GeminiChat {
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
    let request = GenerateRequest {
        contents: build_contents(&params.history, &params.new_message),
        generation_config: Some(GenerationConfig {
            max_output_tokens: params.max_output_tokens,
        }),
    };
    let endpoint = format!("models/{}:streamGenerateContent", params.model);
    let url = format!(
        "{}?alt=sse",
        construct_api_url(&params.base_url, &endpoint)
    );

    match params
        .client
        .post(url)
        .header("Content-Type", "application/json")
        .header("x-goog-api-key", &params.credential)
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

fn build_contents(history: &[Turn], new_message: &str) -> Vec<Content> {
    let mut contents: Vec<Content> = history
        .iter()
        .map(|turn| Content {
            role: turn.speaker.tagged_role().to_string(),
            parts: vec![Part {
                text: turn.content.clone(),
            }],
        })
        .collect();
    contents.push(Content {
        role: "user".to_string(),
        parts: vec![Part {
            text: new_message.to_string(),
        }],
    });
    contents
}

fn parse_payload(payload: &str) -> SsePayload {
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => {
            let text: String = chunk
                .candidates
                .first()
                .and_then(|c| c.content.as_ref())
                .map(|content| {
                    content
                        .parts
                        .iter()
                        .map(|part| part.text.as_str())
                        .collect()
                })
                .unwrap_or_default();
            if text.is_empty() {
                SsePayload::Skip
            } else {
                SsePayload::Token(text)
            }
        }
        Err(e) => {
            tracing::debug!("skipping malformed SSE payload: {e}");
            SsePayload::Skip
        }
    }
}
