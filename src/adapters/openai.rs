use tokio::sync::mpsc;

use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::core::conversation::Turn;
use crate::utils::url::construct_api_url;

use super::{
    pump_sse, status_failure, AdapterError, SsePayload, StreamParams, StreamingAdapter, TokenEvent,
};

/// OpenAI-compatible `chat/completions` SSE dialect. Also serves any host
/// that speaks the same wire (Groq, local proxies, and friends).
pub struct OpenAiSse;

impl StreamingAdapter for OpenAiSse {
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
    let request = ChatRequest {
        model: params.model.clone(),
        messages: build_messages(&params.history, &params.new_message),
        stream: true,
    };
    let url = construct_api_url(&params.base_url, "chat/completions");

    match params
        .client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", params.credential))
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

/// Every prior turn plus the new user message, in wire order. The streaming
/// placeholder never goes upstream.
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
    if payload == "[DONE]" {
        return SsePayload::Done;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => match response
            .choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
        {
            Some(content) if !content.is_empty() => SsePayload::Token(content.to_string()),
            _ => SsePayload::Skip,
        },
        Err(e) => {
            // Best-effort streaming over unreliable SSE proxies: drop the
            // line, keep the stream.
            tracing::debug!("skipping malformed SSE payload: {e}");
            SsePayload::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::Origin;

    #[test]
    fn payload_sequence_yields_tokens_then_done() {
        let lines = [
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
            "garbage",
            "[DONE]",
        ];

        let mut tokens = Vec::new();
        let mut done = false;
        for line in lines {
            match parse_payload(line) {
                SsePayload::Token(t) => tokens.push(t),
                SsePayload::Done => done = true,
                SsePayload::Skip => {}
            }
        }

        assert_eq!(tokens, vec!["Hi"]);
        assert!(done);
    }

    #[test]
    fn empty_deltas_are_skipped() {
        assert!(matches!(
            parse_payload(r#"{"choices":[{"delta":{"content":""}}]}"#),
            SsePayload::Skip
        ));
        assert!(matches!(
            parse_payload(r#"{"choices":[{"delta":{}}]}"#),
            SsePayload::Skip
        ));
        assert!(matches!(parse_payload(r#"{"choices":[]}"#), SsePayload::Skip));
    }

    #[test]
    fn messages_cover_history_plus_new_message() {
        let history = vec![
            Turn::user(1, "first question"),
            {
                let mut t = Turn::placeholder(2, Origin::Online);
                t.content = "first answer".to_string();
                t.streaming = false;
                t
            },
        ];

        let messages = build_messages(&history, "second question");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "first answer");
        assert_eq!(messages[2].role, "user");
        assert_eq!(messages[2].content, "second question");
    }
}
