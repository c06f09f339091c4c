//! Configuration data model.
//!
//! The external config loader parses files and hands the core a
//! [`GatewayConfig`]; this module holds the typed surface plus the fail-fast
//! `validate()` pass that must succeed before any network call.

use crate::error::ConfigError;
use crate::provider::{describe, ProviderKind};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Minimum permitted `compress_threshold` (tokens).
pub const MIN_COMPRESS_THRESHOLD: usize = 1000;

/// Default `compress_threshold` when the loader supplies none.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 4000;

/// Default instruction appended to history for the summarization sub-request.
pub const DEFAULT_SUMMARIZE_PROMPT: &str =
    "Summarize the discussion briefly in 200 words or less to use as a prompt for future context.";

/// Default framing prefix for the synthetic summary message.
pub const DEFAULT_SUMMARY_PROMPT: &str =
    "This is a summary of the chat history as a recap: ";

/// Default ceiling for one whole exchange, in seconds.
pub const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Model specs
// ---------------------------------------------------------------------------

/// One declared model under a provider.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelSpec {
    /// Model identifier as the provider knows it.
    pub name: String,
    /// Input token ceiling driving compression decisions. Absent means
    /// "unbounded, do not compress on the model's account".
    #[serde(default)]
    pub max_input_tokens: Option<usize>,
    /// Output token ceiling forwarded to dialects that require one.
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    /// Whether the model accepts image attachments.
    #[serde(default)]
    pub supports_vision: bool,
    /// Opaque key/values shallow-merged into the outgoing request body.
    /// Explicit fields (model, messages, sampling params) win on conflict.
    #[serde(default)]
    pub extra_fields: BTreeMap<String, serde_json::Value>,
}

impl ModelSpec {
    /// Bare spec with just a name, for open-catalog providers.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_input_tokens: None,
            max_output_tokens: None,
            supports_vision: false,
            extra_fields: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider configs
// ---------------------------------------------------------------------------

/// Transport knobs and pass-through fields for one provider instance.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtraConfig {
    /// Proxy URL (`socks5://...` or `http://...`), applied per transport
    /// instance so different providers can use different proxies.
    pub proxy: Option<String>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Arbitrary pass-through fields kept for forward compatibility.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// One configured provider instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider dialect; unknown strings fail at deserialization.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Disambiguator when multiple instances share a kind. Also the
    /// environment-variable prefix when present.
    #[serde(default)]
    pub name: Option<String>,
    /// Base URL override; falls back to the descriptor default.
    #[serde(default)]
    pub api_base: Option<String>,
    /// Primary credential literal (env vars take precedence).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Secondary credential for dialects that need one (ernie).
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Account scope for dialects that route by account (cloudflare).
    #[serde(default)]
    pub account_id: Option<String>,
    /// Chat endpoint suffix override, replacing the dialect default.
    #[serde(default)]
    pub chat_endpoint: Option<String>,
    /// Declared models. Mandatory for closed-catalog dialects.
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    /// Proxy/timeout/pass-through settings.
    #[serde(default)]
    pub extra: ExtraConfig,
}

impl ProviderConfig {
    /// Minimal config for a kind, used by tests and programmatic setup.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            name: None,
            api_base: None,
            api_key: None,
            secret_key: None,
            account_id: None,
            chat_endpoint: None,
            models: Vec::new(),
            extra: ExtraConfig::default(),
        }
    }

    /// Identifier used for routing and env-var prefixes: the `name` field
    /// when set, otherwise the kind string.
    pub fn identifier(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.as_str())
    }

    /// Find a declared model spec by name.
    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }
}

// ---------------------------------------------------------------------------
// Gateway config
// ---------------------------------------------------------------------------

/// Top-level configuration consumed by the gateway core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Configured provider instances.
    pub providers: Vec<ProviderConfig>,
    /// Token estimate at which session history is summarized.
    pub compress_threshold: usize,
    /// Instruction appended to history for the summarization sub-request.
    pub summarize_prompt: String,
    /// Prefix framing the synthetic summary message.
    pub summary_prompt: String,
    /// Ceiling for one whole exchange; an in-progress stream past this is
    /// aborted and reported as a timeout error event.
    pub exchange_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            summarize_prompt: DEFAULT_SUMMARIZE_PROMPT.to_string(),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            exchange_timeout_secs: DEFAULT_EXCHANGE_TIMEOUT_SECS,
        }
    }
}

impl GatewayConfig {
    /// Fail-fast shape validation, run before any network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compress_threshold < MIN_COMPRESS_THRESHOLD {
            return Err(ConfigError::Invalid(format!(
                "compress_threshold must be >= {MIN_COMPRESS_THRESHOLD}, got {}",
                self.compress_threshold
            )));
        }
        let mut seen = Vec::new();
        for provider in &self.providers {
            let id = provider.identifier();
            if seen.contains(&id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider identifier `{id}`; set a distinct `name`"
                )));
            }
            seen.push(id);

            if describe(provider.kind).requires_declared_models && provider.models.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider `{id}` ({}) requires an explicit `models` list",
                    provider.kind
                )));
            }
            for model in &provider.models {
                if model.max_input_tokens == Some(0) {
                    return Err(ConfigError::Invalid(format!(
                        "model `{}` under `{id}`: max_input_tokens must be > 0 when set",
                        model.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a provider instance by identifier (name or kind string).
    pub fn provider(&self, identifier: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.identifier() == identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama_with_model() -> ProviderConfig {
        let mut p = ProviderConfig::new(ProviderKind::Ollama);
        p.models.push(ModelSpec::named("llama3.2"));
        p
    }

    // The full provider surface deserializes from the loader's TOML.
    #[test]
    fn provider_config_deserializes_from_toml() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            compress_threshold = 2000

            [[providers]]
            type = "ollama"
            name = "local"
            api_base = "http://127.0.0.1:11434"
            chat_endpoint = "/api/chat"

            [[providers.models]]
            name = "llama3.2"
            max_input_tokens = 8192
            supports_vision = false

            [providers.extra]
            proxy = "socks5://127.0.0.1:1080"
            connect_timeout_secs = 10
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        let p = cfg.provider("local").unwrap();
        assert_eq!(p.kind, ProviderKind::Ollama);
        assert_eq!(p.chat_endpoint.as_deref(), Some("/api/chat"));
        assert_eq!(p.extra.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(p.model("llama3.2").unwrap().max_input_tokens, Some(8192));
    }

    // Unknown `type` strings are rejected at deserialization time.
    #[test]
    fn unknown_provider_type_fails_at_load() {
        let err = toml::from_str::<GatewayConfig>(
            r#"
            [[providers]]
            type = "watsonx"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("watsonx"), "got: {err}");
    }

    // compress_threshold below the documented floor fails fast.
    #[test]
    fn compress_threshold_floor_is_enforced() {
        let cfg = GatewayConfig {
            compress_threshold: 999,
            ..GatewayConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("compress_threshold"), "got: {err}");

        let ok = GatewayConfig {
            compress_threshold: 1000,
            ..GatewayConfig::default()
        };
        ok.validate().unwrap();
    }

    // Closed-catalog dialects must declare their models up front.
    #[test]
    fn closed_catalog_requires_models_list() {
        let cfg = GatewayConfig {
            providers: vec![ProviderConfig::new(ProviderKind::Ollama)],
            ..GatewayConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("models"), "got: {err}");

        let cfg = GatewayConfig {
            providers: vec![ollama_with_model()],
            ..GatewayConfig::default()
        };
        cfg.validate().unwrap();
    }

    // Zero is not a legal input-token ceiling.
    #[test]
    fn zero_max_input_tokens_is_rejected() {
        let mut provider = ollama_with_model();
        provider.models[0].max_input_tokens = Some(0);
        let cfg = GatewayConfig {
            providers: vec![provider],
            ..GatewayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    // Two instances of a kind need distinct names.
    #[test]
    fn duplicate_identifiers_are_rejected() {
        let cfg = GatewayConfig {
            providers: vec![
                ProviderConfig::new(ProviderKind::OpenAi),
                ProviderConfig::new(ProviderKind::OpenAi),
            ],
            ..GatewayConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got: {err}");
    }

    // `name` disambiguates both routing and env prefixes.
    #[test]
    fn identifier_prefers_name_over_kind() {
        let mut p = ProviderConfig::new(ProviderKind::OpenAiCompatible);
        assert_eq!(p.identifier(), "openai-compatible");
        p.name = Some("groq".into());
        assert_eq!(p.identifier(), "groq");
    }
}
