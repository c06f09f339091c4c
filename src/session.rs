//! Session context manager: history, token budget, compression bookkeeping.
//!
//! Token counts use a crude `chars/4` heuristic plus a small per-message
//! overhead; exactness against any provider tokenizer is out of contract,
//! the estimate only drives the compression threshold. Exact counts from
//! provider `usage` payloads are tracked separately as running totals.

use crate::types::{Attachment, Message, Role};
use serde::{Deserialize, Serialize};

/// Estimate how many tokens a set of messages would consume.
///
/// ~1 token per 4 characters, plus framing overhead per message.
pub fn estimate_messages(messages: &[Message]) -> usize {
    let mut chars = 0usize;
    for msg in messages {
        // Per-message overhead (~4 tokens for role + framing).
        chars += 16;
        chars += msg.content.len();
        for attachment in &msg.attachments {
            chars += match attachment {
                Attachment::Image { data, .. } => data.len(),
                Attachment::ImageUrl { url } => url.len(),
            };
        }
    }
    chars / 4
}

// ---------------------------------------------------------------------------
// Usage totals
// ---------------------------------------------------------------------------

/// Exact token counts accumulated from provider `usage` payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Running total of input tokens sent.
    pub total_input_tokens: u64,
    /// Running total of output tokens received.
    pub total_output_tokens: u64,
    /// Input tokens in the most recent exchange.
    pub last_input_tokens: u64,
    /// Output tokens in the most recent exchange.
    pub last_output_tokens: u64,
}

impl UsageTotals {
    /// Record counts from one exchange's `usage` payload.
    pub fn record(&mut self, input_tokens: u64, output_tokens: u64) {
        self.last_input_tokens = input_tokens;
        self.last_output_tokens = output_tokens;
        self.total_input_tokens = self.total_input_tokens.saturating_add(input_tokens);
        self.total_output_tokens = self.total_output_tokens.saturating_add(output_tokens);
    }

    /// Total tokens consumed across the whole session.
    pub fn session_total(&self) -> u64 {
        self.total_input_tokens
            .saturating_add(self.total_output_tokens)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One conversation's history and token bookkeeping.
///
/// The facade takes `&mut Session` for the duration of one exchange, which
/// makes at-most-one outstanding request per session a compile-time
/// property. Independent sessions run in parallel freely.
#[derive(Debug, Clone, Default)]
pub struct Session {
    messages: Vec<Message>,
    usage: UsageTotals,
    /// Set once compression was attempted this exchange, successful or not,
    /// so a single turn never compresses twice.
    compression_attempted: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated history, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Exact usage totals recorded so far.
    pub fn usage(&self) -> &UsageTotals {
        &self.usage
    }

    /// Current token estimate for the stored history.
    pub fn estimated_tokens(&self) -> usize {
        estimate_messages(&self.messages)
    }

    /// Reset per-exchange state. Called by the facade at the start of a turn.
    pub fn begin_exchange(&mut self) {
        self.compression_attempted = false;
    }

    /// Whether history plus the pending turn crosses the compression
    /// threshold. The model's input ceiling tightens the threshold when
    /// declared; compression fires at most once per exchange and never on
    /// an empty history.
    pub fn should_compress(
        &self,
        pending: &[Message],
        compress_threshold: usize,
        max_input_tokens: Option<usize>,
    ) -> bool {
        if self.compression_attempted || self.messages.is_empty() {
            return false;
        }
        let effective = match max_input_tokens {
            Some(cap) => compress_threshold.min(cap),
            None => compress_threshold,
        };
        self.estimated_tokens() + estimate_messages(pending) >= effective
    }

    /// Message list for the non-streamed summarization sub-request: the
    /// full stored history with the instruction appended as a user turn.
    pub fn summarization_messages(&self, summarize_prompt: &str) -> Vec<Message> {
        let mut messages = self.messages.clone();
        messages.push(Message::user(summarize_prompt));
        messages
    }

    /// Replace the stored history with one synthetic summary message.
    ///
    /// The triggering user message is never part of stored history at this
    /// point, so it is preserved verbatim by construction. Marks the turn
    /// as compressed.
    pub fn apply_summary(&mut self, summary_prompt: &str, summary: &str) {
        self.messages = vec![Message {
            role: Role::User,
            content: format!("{summary_prompt}{summary}"),
            attachments: Vec::new(),
        }];
        self.compression_attempted = true;
    }

    /// Record a failed compression attempt so the turn proceeds
    /// uncompressed without retrying.
    pub fn mark_compression_attempted(&mut self) {
        self.compression_attempted = true;
    }

    /// Append a completed exchange. Called only after a successful `Done`
    /// terminal, never for errored or cancelled streams.
    pub fn record_exchange(&mut self, user_messages: &[Message], assistant_reply: Message) {
        self.messages.extend_from_slice(user_messages);
        self.messages.push(assistant_reply);
    }

    /// Fold one exchange's exact token counts into the running totals.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.usage.record(input_tokens, output_tokens);
    }

    /// Serializable view for the external persistence collaborator.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.messages.clone(),
            usage: self.usage.clone(),
        }
    }

    /// Rebuild a session from a persisted snapshot.
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        Self {
            messages: snapshot.messages,
            usage: snapshot.usage,
            compression_attempted: false,
        }
    }
}

/// Persistable session state. Saving and loading it is the caller's job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub usage: UsageTotals,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_history(pairs: usize) -> Session {
        let mut session = Session::new();
        for i in 0..pairs {
            session.record_exchange(
                &[Message::user(format!("question {i}"))],
                Message::assistant(format!("answer {i}")),
            );
        }
        session
    }

    // Heuristic estimation produces plausible non-zero token counts and
    // charges attachments by payload size.
    #[test]
    fn estimate_counts_content_and_attachments() {
        let est = estimate_messages(&[
            Message::system("You are helpful."),
            Message::user("Hello world"),
        ]);
        assert!(est > 0 && est < 100, "got {est}");

        let mut with_image = Message::user("what is this?");
        with_image
            .attachments
            .push(Attachment::image("image/png", &[0u8; 4000]));
        assert!(
            estimate_messages(&[with_image]) > estimate_messages(&[Message::user("what is this?")])
        );
    }

    // Usage totals accumulate with saturation; last counts are per-exchange.
    #[test]
    fn usage_totals_record_and_saturate() {
        let mut usage = UsageTotals::default();
        usage.record(50, 20);
        usage.record(100, 30);
        assert_eq!(usage.session_total(), 200);
        assert_eq!(usage.last_input_tokens, 100);

        usage.total_input_tokens = u64::MAX - 3;
        usage.record(10, 10);
        assert_eq!(usage.total_input_tokens, u64::MAX);
    }

    // Threshold check includes the pending turn and honors the model's
    // tighter input ceiling.
    #[test]
    fn should_compress_threshold_logic() {
        let mut session = Session::new();
        session.record_exchange(
            &[Message::user("x".repeat(5000))],
            Message::assistant("ok"),
        );
        let pending = [Message::user("next question")];

        assert!(session.should_compress(&pending, 1000, None));
        assert!(!session.should_compress(&pending, 100_000, None));
        // A declared model cap below the threshold tightens it.
        assert!(session.should_compress(&pending, 100_000, Some(1000)));
    }

    // Empty history never compresses: there is nothing to summarize.
    #[test]
    fn empty_session_never_compresses() {
        let session = Session::new();
        assert!(!session.should_compress(&[Message::user("x".repeat(9000))], 1000, None));
    }

    // Compression runs at most once per exchange; begin_exchange rearms it.
    #[test]
    fn compression_is_once_per_exchange() {
        let mut session = session_with_history(50);
        let pending = [Message::user("next")];
        assert!(session.should_compress(&pending, 1000, Some(1)));

        session.apply_summary("Recap: ", "we discussed many questions");
        assert!(!session.should_compress(&pending, 1000, Some(1)));

        session.record_exchange(&pending, Message::assistant("sure"));
        session.begin_exchange();
        assert!(session.should_compress(&pending, 1000, Some(1)));
    }

    // A failed sub-request also arms the once-per-turn latch.
    #[test]
    fn failed_compression_leaves_history_intact() {
        let mut session = session_with_history(3);
        let before = session.messages().to_vec();
        session.mark_compression_attempted();
        assert_eq!(session.messages(), before.as_slice());
        assert!(!session.should_compress(&[Message::user("next")], 1000, Some(1)));
    }

    // apply_summary collapses all stored history into one framed message.
    #[test]
    fn apply_summary_replaces_history() {
        let mut session = session_with_history(4);
        session.apply_summary("This is a recap: ", "they asked four things");
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::User);
        assert_eq!(
            session.messages()[0].content,
            "This is a recap: they asked four things"
        );
    }

    // The summarization sub-request is history + instruction, leaving the
    // stored history untouched.
    #[test]
    fn summarization_messages_append_instruction() {
        let session = session_with_history(2);
        let messages = session.summarization_messages("Summarize briefly.");
        assert_eq!(messages.len(), session.messages().len() + 1);
        assert_eq!(messages.last().unwrap().content, "Summarize briefly.");
        assert_eq!(session.messages().len(), 4);
    }

    // Snapshots round-trip through serde for external persistence.
    #[test]
    fn snapshot_round_trips() {
        let mut session = session_with_history(2);
        session.record_usage(120, 45);
        let json = serde_json::to_string(&session.snapshot()).unwrap();
        let restored = Session::restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.messages(), session.messages());
        assert_eq!(restored.usage(), session.usage());
    }
}
