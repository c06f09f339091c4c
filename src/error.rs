//! Unified error types for the gateway core.
//!
//! Configuration-shape failures (`ConfigError`) surface before any network
//! call. `GatewayError` covers everything the facade can report while an
//! exchange is being prepared or in flight.

use crate::credentials::CredentialField;
use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors detected while validating the configuration handed to the core.
#[derive(Debug)]
pub enum ConfigError {
    /// The `kind` string does not name a known provider dialect.
    UnsupportedProviderType(String),
    /// Any other shape violation (threshold too low, missing model list, ...).
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedProviderType(kind) => {
                write!(f, "unsupported provider type `{kind}`")
            }
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// GatewayError
// ---------------------------------------------------------------------------

/// Errors from credential resolution, translation, and the HTTP layer.
#[derive(Debug)]
pub enum GatewayError {
    /// Configuration-shape failure (see [`ConfigError`]).
    Config(ConfigError),
    /// No value could be resolved for a required credential field.
    MissingCredential {
        provider: String,
        field: CredentialField,
    },
    /// The request asks for something the resolved model cannot do
    /// (e.g. image attachments on a text-only model).
    UnsupportedCapability(String),
    /// Network / reqwest-level failure.
    Http(reqwest::Error),
    /// The overall exchange deadline elapsed.
    Timeout,
    /// Well-formed error payload from the backend, carried verbatim.
    Provider { status: u16, message: String },
    /// Malformed wire frame.
    Parse(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::MissingCredential { provider, field } => {
                write!(f, "missing credential `{field}` for provider `{provider}`")
            }
            Self::UnsupportedCapability(msg) => write!(f, "unsupported capability: {msg}"),
            Self::Http(e) => write!(f, "http: {e}"),
            Self::Timeout => write!(f, "exchange timed out"),
            Self::Provider { status, message } => {
                write!(f, "provider error (status {status}): {message}")
            }
            Self::Parse(msg) => write!(f, "malformed wire frame: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl GatewayError {
    /// HTTP status carried by a provider error payload, if any.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        assert_eq!(
            ConfigError::UnsupportedProviderType("watson".into()).to_string(),
            "unsupported provider type `watson`"
        );
        assert_eq!(
            ConfigError::Invalid("compress_threshold must be >= 1000".into()).to_string(),
            "invalid config: compress_threshold must be >= 1000"
        );
    }

    #[test]
    fn missing_credential_names_provider_and_field() {
        let e = GatewayError::MissingCredential {
            provider: "openai".into(),
            field: CredentialField::ApiKey,
        };
        let s = e.to_string();
        assert!(s.contains("api_key"), "got: {s}");
        assert!(s.contains("openai"), "got: {s}");
    }

    #[test]
    fn provider_error_carries_status() {
        let e = GatewayError::Provider {
            status: 429,
            message: "rate limited".into(),
        };
        assert_eq!(e.provider_status(), Some(429));
        assert!(e.to_string().contains("429"));
        assert_eq!(GatewayError::Timeout.provider_status(), None);
    }

    #[test]
    fn gateway_error_from_config_error() {
        let e = GatewayError::from(ConfigError::Invalid("boom".into()));
        assert!(e.to_string().starts_with("config:"), "got: {e}");
    }
}
