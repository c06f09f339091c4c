//! Provider descriptor registry.
//!
//! Every supported backend is a closed [`ProviderKind`] variant mapping to a
//! static [`ProviderDescriptor`]: which wire dialect it speaks, how requests
//! are authenticated, where the chat endpoint lives, and which streaming
//! decoder applies. Adding a backend is a new variant arm; unknown kind
//! strings fail at configuration load, never mid-stream.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Provider kinds
// ---------------------------------------------------------------------------

/// Supported provider types, one per configurable `kind` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    OpenAi,
    OpenAiCompatible,
    AzureOpenAi,
    Gemini,
    VertexAi,
    Claude,
    Bedrock,
    Cohere,
    Ollama,
    Cloudflare,
    Replicate,
    Ernie,
    Qianwen,
}

impl ProviderKind {
    /// Canonical configuration string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai-compatible",
            Self::AzureOpenAi => "azure-openai",
            Self::Gemini => "gemini",
            Self::VertexAi => "vertexai",
            Self::Claude => "claude",
            Self::Bedrock => "bedrock",
            Self::Cohere => "cohere",
            Self::Ollama => "ollama",
            Self::Cloudflare => "cloudflare",
            Self::Replicate => "replicate",
            Self::Ernie => "ernie",
            Self::Qianwen => "qianwen",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "openai-compatible" => Ok(Self::OpenAiCompatible),
            "azure-openai" => Ok(Self::AzureOpenAi),
            "gemini" => Ok(Self::Gemini),
            "vertexai" => Ok(Self::VertexAi),
            "claude" => Ok(Self::Claude),
            "bedrock" => Ok(Self::Bedrock),
            "cohere" => Ok(Self::Cohere),
            "ollama" => Ok(Self::Ollama),
            "cloudflare" => Ok(Self::Cloudflare),
            "replicate" => Ok(Self::Replicate),
            "ernie" => Ok(Self::Ernie),
            "qianwen" => Ok(Self::Qianwen),
            other => Err(ConfigError::UnsupportedProviderType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Dialects and wire behavior
// ---------------------------------------------------------------------------

/// Request/response body family shared by one or more provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// OpenAI `/chat/completions` shape (openai, resellers, azure).
    OpenAi,
    /// Anthropic messages shape (claude, bedrock).
    Claude,
    /// Google `generateContent` shape (gemini, vertexai).
    Gemini,
    /// Cohere chat shape.
    Cohere,
    /// Ollama local-model shape.
    Ollama,
    /// Cloudflare Workers-AI run shape.
    Cloudflare,
    /// Baidu Ernie shape.
    Ernie,
    /// Alibaba DashScope (Qianwen) shape.
    Qianwen,
    /// Replicate blocking-prediction shape.
    Replicate,
}

/// Streaming frame format the decoder must apply for a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `data:`-prefixed JSON frames, blank-line delimited.
    Sse,
    /// One JSON object per line.
    JsonLines,
    /// Single non-streamed JSON body synthesized into one delta + done.
    JsonOnce,
}

/// How credentials are attached to the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <api_key>`.
    Bearer,
    /// Custom header carrying the key, e.g. `api-key` (Azure),
    /// `x-api-key` (Anthropic).
    Header(&'static str),
    /// Key appended as a URL query parameter, e.g. `?key=` (Gemini).
    QueryParam(&'static str),
    /// No credentials (local servers).
    None,
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Immutable metadata describing how to talk to one provider kind.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub dialect: Dialect,
    pub auth: AuthScheme,
    /// Default base URL, when the service has a well-known one.
    pub default_api_base: Option<&'static str>,
    /// Default chat endpoint suffix, overridable via `chat_endpoint` config.
    /// Dialects that route by model name compose the path in the translator.
    pub chat_path: &'static str,
    /// Frame format used when `stream: true` is requested. Dialects without
    /// token-level streaming stay on [`WireFormat::JsonOnce`].
    pub stream_format: WireFormat,
    /// The model name must appear in the provider's declared `models` list
    /// (local-model and cloud-deployment dialects); open catalogs defer the
    /// check to the backend.
    pub requires_declared_models: bool,
}

/// Look up the immutable descriptor for a provider kind.
pub fn describe(kind: ProviderKind) -> ProviderDescriptor {
    match kind {
        ProviderKind::OpenAi => ProviderDescriptor {
            kind,
            dialect: Dialect::OpenAi,
            auth: AuthScheme::Bearer,
            default_api_base: Some("https://api.openai.com/v1"),
            chat_path: "/chat/completions",
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
        ProviderKind::OpenAiCompatible => ProviderDescriptor {
            kind,
            dialect: Dialect::OpenAi,
            auth: AuthScheme::Bearer,
            default_api_base: None,
            chat_path: "/chat/completions",
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
        ProviderKind::AzureOpenAi => ProviderDescriptor {
            kind,
            dialect: Dialect::OpenAi,
            auth: AuthScheme::Header("api-key"),
            default_api_base: None,
            chat_path: "/chat/completions",
            stream_format: WireFormat::Sse,
            requires_declared_models: true,
        },
        ProviderKind::Gemini => ProviderDescriptor {
            kind,
            dialect: Dialect::Gemini,
            auth: AuthScheme::QueryParam("key"),
            default_api_base: Some("https://generativelanguage.googleapis.com/v1beta"),
            chat_path: "", // path is composed from the model name
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
        ProviderKind::VertexAi => ProviderDescriptor {
            kind,
            dialect: Dialect::Gemini,
            auth: AuthScheme::Bearer,
            default_api_base: None,
            chat_path: "",
            stream_format: WireFormat::Sse,
            requires_declared_models: true,
        },
        ProviderKind::Claude => ProviderDescriptor {
            kind,
            dialect: Dialect::Claude,
            auth: AuthScheme::Header("x-api-key"),
            default_api_base: Some("https://api.anthropic.com/v1"),
            chat_path: "/messages",
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
        ProviderKind::Bedrock => ProviderDescriptor {
            kind,
            dialect: Dialect::Claude,
            auth: AuthScheme::Bearer,
            default_api_base: None,
            chat_path: "", // /model/{model}/invoke, composed in the translator
            stream_format: WireFormat::JsonOnce,
            requires_declared_models: true,
        },
        ProviderKind::Cohere => ProviderDescriptor {
            kind,
            dialect: Dialect::Cohere,
            auth: AuthScheme::Bearer,
            default_api_base: Some("https://api.cohere.ai/v1"),
            chat_path: "/chat",
            stream_format: WireFormat::JsonLines,
            requires_declared_models: false,
        },
        ProviderKind::Ollama => ProviderDescriptor {
            kind,
            dialect: Dialect::Ollama,
            auth: AuthScheme::None,
            default_api_base: Some("http://localhost:11434"),
            chat_path: "/api/chat",
            stream_format: WireFormat::JsonLines,
            requires_declared_models: true,
        },
        ProviderKind::Cloudflare => ProviderDescriptor {
            kind,
            dialect: Dialect::Cloudflare,
            auth: AuthScheme::Bearer,
            default_api_base: Some("https://api.cloudflare.com/client/v4"),
            chat_path: "", // /accounts/{account_id}/ai/run/{model}
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
        ProviderKind::Replicate => ProviderDescriptor {
            kind,
            dialect: Dialect::Replicate,
            auth: AuthScheme::Bearer,
            default_api_base: Some("https://api.replicate.com/v1"),
            chat_path: "", // /models/{model}/predictions
            stream_format: WireFormat::JsonOnce,
            requires_declared_models: false,
        },
        ProviderKind::Ernie => ProviderDescriptor {
            kind,
            dialect: Dialect::Ernie,
            auth: AuthScheme::QueryParam("access_token"),
            default_api_base: Some("https://aip.baidubce.com"),
            chat_path: "", // /rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{model}
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
        ProviderKind::Qianwen => ProviderDescriptor {
            kind,
            dialect: Dialect::Qianwen,
            auth: AuthScheme::Bearer,
            default_api_base: Some("https://dashscope.aliyuncs.com/api/v1"),
            chat_path: "/services/aigc/text-generation/generation",
            stream_format: WireFormat::Sse,
            requires_declared_models: false,
        },
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible reseller catalog
// ---------------------------------------------------------------------------

/// Known OpenAI-compatible platforms and their base URLs.
///
/// An `openai-compatible` provider whose `name` matches an entry inherits
/// the platform base URL without an explicit `api_base`.
pub const OPENAI_COMPATIBLE_PLATFORMS: [(&str, &str); 10] = [
    ("anyscale", "https://api.endpoints.anyscale.com/v1"),
    ("deepinfra", "https://api.deepinfra.com/v1/openai"),
    ("fireworks", "https://api.fireworks.ai/inference/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
    ("mistral", "https://api.mistral.ai/v1"),
    ("moonshot", "https://api.moonshot.cn/v1"),
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("octoai", "https://text.octoai.run/v1"),
    ("perplexity", "https://api.perplexity.ai"),
    ("together", "https://api.together.xyz/v1"),
];

/// Base URL for a known OpenAI-compatible platform name.
pub fn compatible_platform_base(name: &str) -> Option<&'static str> {
    OPENAI_COMPATIBLE_PLATFORMS
        .iter()
        .find(|(platform, _)| *platform == name)
        .map(|(_, base)| *base)
}
