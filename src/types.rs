//! Unified request/response data model shared by every provider dialect.
//!
//! One `ChatRequest` goes in, one normalized sequence of [`ResponseEvent`]
//! comes out, regardless of which backend served the exchange.

use base64::Engine;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message roles
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction message.
    System,
    /// End-user message.
    User,
    /// Assistant/model message.
    Assistant,
}

impl Role {
    /// Wire name used by OpenAI-style message arrays.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Image attachment carried alongside message text.
///
/// Dialect-specific encoding (data URL, base64 source block, inline_data,
/// raw base64 array) happens in the request translator, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// Inline image bytes, already base64-encoded.
    Image { media_type: String, data: String },
    /// Remote image reference for dialects that accept URLs.
    ImageUrl { url: String },
}

impl Attachment {
    /// Build an inline image attachment from raw bytes.
    pub fn image(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Image {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Render as an RFC 2397 data URL (`data:<type>;base64,<data>`).
    ///
    /// URL attachments pass through unchanged.
    pub fn as_data_url(&self) -> String {
        match self {
            Self::Image { media_type, data } => format!("data:{media_type};base64,{data}"),
            Self::ImageUrl { url } => url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Author role for this conversation turn.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Image attachments; empty for plain text turns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    /// True when any attachment is present.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Chat request
// ---------------------------------------------------------------------------

/// One unified chat exchange request. Immutable once dispatched.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Target model: either `"provider:model"` or a bare model name that is
    /// looked up across declared provider model lists.
    pub model: String,
    /// New messages for this turn (session history is prepended by the facade).
    pub messages: Vec<Message>,
    /// Sampling temperature. `None` means "use the provider default" and is
    /// omitted from the wire body entirely.
    pub temperature: Option<f64>,
    /// Nucleus sampling parameter, same `None` semantics as `temperature`.
    pub top_p: Option<f64>,
    /// Request token-level streaming where the dialect supports it.
    pub stream: bool,
}

impl ChatRequest {
    /// Convenience constructor for a single-user-message streaming request.
    pub fn user(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user(content)],
            temperature: None,
            top_p: None,
            stream: true,
        }
    }

    /// True when any message in this request carries an attachment.
    pub fn has_attachments(&self) -> bool {
        self.messages.iter().any(Message::has_attachments)
    }
}

// ---------------------------------------------------------------------------
// Response events
// ---------------------------------------------------------------------------

/// Error flavor attached to an in-stream [`ResponseEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Malformed wire frame.
    Parse,
    /// The overall exchange deadline elapsed.
    Timeout,
    /// Connection-level failure mid-stream.
    Transport,
    /// Well-formed error payload from the backend.
    Provider,
}

/// Normalized streaming event emitted by every decoder variant.
///
/// Ordering guarantee per exchange: zero or more `ContentDelta`/`ToolCall`,
/// at most one `Usage`, optional `Error` diagnostics, then exactly one
/// closing `Done` or `Cancelled`. A stream is never left unterminated.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// Incremental assistant text.
    ContentDelta(String),
    /// Tool invocation requested by the model.
    ToolCall { name: String, arguments: String },
    /// Token usage reported by the provider.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Failure observed while the stream was active.
    Error {
        kind: StreamErrorKind,
        message: String,
    },
    /// Successful end of stream.
    Done,
    /// Caller-initiated abort.
    Cancelled,
}

impl ResponseEvent {
    /// True for the events that close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}
