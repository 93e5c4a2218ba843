//! Bridges the engine's callback-driven generate call into the same
//! token-event stream the hosted adapters produce. Completion is a one-shot
//! resolved by the first `done=true`; cancellation just drops the bridge, so
//! a late callback lands in a closed channel instead of deadlocking.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::core::conversation::Turn;
use crate::local::{LocalEngine, TokenCallback};

use super::{AdapterError, StreamParams, StreamingAdapter, TokenEvent};

pub struct LocalStream {
    pub engine: Arc<dyn LocalEngine>,
}

impl StreamingAdapter for LocalStream {
    fn stream(&self, params: StreamParams) -> mpsc::UnboundedReceiver<TokenEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.engine.clone();
        let prompt = build_prompt(&params.history, &params.new_message);
        let cancel = params.cancel;

        tokio::spawn(async move {
            let (done_tx, done_rx) = oneshot::channel::<()>();
            let chunk_tx = tx.clone();
            let mut done_slot = Some(done_tx);
            let callback: TokenCallback = Box::new(move |partial, done| {
                if !partial.is_empty() {
                    let _ = chunk_tx.send(TokenEvent::Chunk(partial.to_owned()));
                }
                if done {
                    // Resolve at most once; engines have been seen to repeat
                    // the done signal.
                    if let Some(sender) = done_slot.take() {
                        let _ = sender.send(());
                    }
                }
            });

            let generate = tokio::task::spawn_blocking(move || engine.generate(&prompt, callback));

            match generate.await {
                Ok(Ok(())) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        outcome = done_rx => {
                            if outcome.is_ok() {
                                let _ = tx.send(TokenEvent::End);
                            } else {
                                let _ = tx.send(TokenEvent::Failed(AdapterError::transport(
                                    "local engine dropped its completion callback",
                                )));
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    let _ = tx.send(TokenEvent::Failed(AdapterError::transport(format!(
                        "local generation failed: {e}"
                    ))));
                }
                Err(e) => {
                    let _ = tx.send(TokenEvent::Failed(AdapterError::transport(format!(
                        "local generation task failed: {e}"
                    ))));
                }
            }
        });

        rx
    }
}

/// Flatten the conversation into the engine's turn-tagged prompt format,
/// ending with an open model turn for the reply.
pub(crate) fn build_prompt(history: &[Turn], new_message: &str) -> String {
    let mut prompt = String::new();
    for turn in history {
        push_turn(&mut prompt, turn.speaker.tagged_role(), &turn.content);
    }
    push_turn(&mut prompt, "user", new_message);
    prompt.push_str("<start_of_turn>model\n");
    prompt
}

fn push_turn(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<start_of_turn>");
    prompt.push_str(role);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str("<end_of_turn>\n");
}
