#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    /// Role string used by the OpenAI-compatible and Anthropic wires.
    pub fn chat_role(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }

    /// Role string used by the Gemini wire and the local prompt format,
    /// where the assistant side is tagged `model`.
    pub fn tagged_role(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "model",
        }
    }
}

/// Which backend produced (or is producing) a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Online,
    Local,
    Unset,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub speaker: Speaker,
    pub content: String,
    pub streaming: bool,
    pub origin: Origin,
    pub error: Option<String>,
}

impl Turn {
    pub fn user(id: u64, content: impl Into<String>) -> Self {
        Self {
            id,
            speaker: Speaker::User,
            content: content.into(),
            streaming: false,
            origin: Origin::Unset,
            error: None,
        }
    }

    /// An empty assistant turn that tokens will be appended into.
    pub fn placeholder(id: u64, origin: Origin) -> Self {
        Self {
            id,
            speaker: Speaker::Assistant,
            content: String::new(),
            streaming: true,
            origin,
            error: None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.speaker == Speaker::Assistant
    }
}

/// Ordered log of conversation turns. Insertion order is chronological order
/// and is the order sent upstream. The session is the only writer; token
/// arrival, finalization, and replacement all happen on its call path, so no
/// further locking is needed here.
#[derive(Debug, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
    next_id: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Swap the most recent turn. Used when a failed streaming turn is
    /// demoted to a fresh local attempt. Pushes on an empty log.
    pub fn replace_last(&mut self, turn: Turn) {
        match self.turns.last_mut() {
            Some(last) => *last = turn,
            None => self.turns.push(turn),
        }
    }

    /// Append a token to the most recent assistant turn. No-op when the log
    /// holds no assistant turn.
    pub fn append_token(&mut self, token: &str) {
        if let Some(turn) = self.turns.iter_mut().rev().find(|t| t.is_assistant()) {
            turn.content.push_str(token);
        }
    }

    /// Stop every turn that is still streaming. Idempotent; safe on an
    /// empty log.
    pub fn finalize_streaming(&mut self) {
        for turn in &mut self.turns {
            turn.streaming = false;
        }
    }

    /// Record an error on the most recent assistant turn and stop it
    /// streaming. No-op when the log holds no assistant turn.
    pub fn fail_last(&mut self, message: impl Into<String>) {
        if let Some(turn) = self.turns.iter_mut().rev().find(|t| t.is_assistant()) {
            turn.error = Some(message.into());
            turn.streaming = false;
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_assistant(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.is_assistant())
    }

    pub fn streaming_count(&self) -> usize {
        self.turns.iter().filter(|t| t.streaming).count()
    }

    /// The turns to send upstream for the current exchange: everything
    /// before the in-flight user+placeholder pair.
    pub fn history_for_send(&self) -> Vec<Turn> {
        let keep = self.turns.len().saturating_sub(2);
        self.turns[..keep].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_exchange() -> ConversationLog {
        let mut log = ConversationLog::new();
        let id = log.allocate_id();
        log.push(Turn::user(id, "hello"));
        let id = log.allocate_id();
        log.push(Turn::placeholder(id, Origin::Online));
        log
    }

    #[test]
    fn append_token_concatenates_in_call_order() {
        let mut log = log_with_exchange();
        for token in ["Hel", "lo", " there"] {
            log.append_token(token);
        }
        assert_eq!(log.last_assistant().unwrap().content, "Hello there");
    }

    #[test]
    fn append_token_without_assistant_turn_is_a_noop() {
        let mut log = ConversationLog::new();
        log.append_token("lost");
        assert!(log.is_empty());

        let id = log.allocate_id();
        log.push(Turn::user(id, "only a user turn"));
        log.append_token("still lost");
        assert_eq!(log.turns()[0].content, "only a user turn");
    }

    #[test]
    fn finalize_streaming_is_idempotent_and_safe_on_empty() {
        let mut empty = ConversationLog::new();
        empty.finalize_streaming();
        assert!(empty.is_empty());

        let mut log = log_with_exchange();
        log.finalize_streaming();
        assert_eq!(log.streaming_count(), 0);
        log.finalize_streaming();
        assert_eq!(log.streaming_count(), 0);
    }

    #[test]
    fn at_most_one_streaming_turn() {
        let log = log_with_exchange();
        assert_eq!(log.streaming_count(), 1);
    }

    #[test]
    fn replace_last_swaps_the_placeholder() {
        let mut log = log_with_exchange();
        log.append_token("partial online output");
        let id = log.allocate_id();
        log.replace_last(Turn::placeholder(id, Origin::Local));

        let last = log.last_assistant().unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.origin, Origin::Local);
        assert!(last.streaming);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn fail_last_records_error_and_stops_streaming() {
        let mut log = log_with_exchange();
        log.fail_last("connection reset");
        let last = log.last_assistant().unwrap();
        assert_eq!(last.error.as_deref(), Some("connection reset"));
        assert!(!last.streaming);

        let mut empty = ConversationLog::new();
        empty.fail_last("nothing to mark");
        assert!(empty.is_empty());
    }

    #[test]
    fn history_excludes_the_in_flight_pair() {
        let mut log = log_with_exchange();
        log.append_token("first answer");
        log.finalize_streaming();
        let id = log.allocate_id();
        log.push(Turn::user(id, "second question"));
        let id = log.allocate_id();
        log.push(Turn::placeholder(id, Origin::Online));

        let history = log.history_for_send();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, "first answer");
    }

    #[test]
    fn turn_ids_are_unique() {
        let mut log = ConversationLog::new();
        let a = log.allocate_id();
        let b = log.allocate_id();
        assert_ne!(a, b);
    }
}
