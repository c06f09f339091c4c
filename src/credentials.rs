//! Credential resolution with environment-variable precedence.
//!
//! Lookup order, highest first: `{PROVIDER_NAME_OR_TYPE}_{FIELD}` env var →
//! config literal → provider default (base URLs only). The environment is an
//! injectable lookup so tests substitute a fixed mapping instead of process
//! state; resolution happens on demand and is never cached, tolerating
//! rotation between calls. Secret values are never logged.

use crate::config::ProviderConfig;
use crate::error::GatewayError;
use crate::provider::{compatible_platform_base, describe, ProviderKind};
use std::fmt;

/// Generic proxy env vars honored when no provider-specific proxy is set.
const GENERIC_PROXY_VARS: [&str; 4] = ["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"];

/// Credential fields a dialect may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    ApiKey,
    SecretKey,
    ApiBase,
    AccountId,
    Proxy,
}

impl CredentialField {
    /// Suffix used when composing the env var name.
    pub fn env_suffix(self) -> &'static str {
        match self {
            Self::ApiKey => "API_KEY",
            Self::SecretKey => "SECRET_KEY",
            Self::ApiBase => "API_BASE",
            Self::AccountId => "ACCOUNT_ID",
            Self::Proxy => "PROXY",
        }
    }
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ApiKey => "api_key",
            Self::SecretKey => "secret_key",
            Self::ApiBase => "api_base",
            Self::AccountId => "account_id",
            Self::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// Env var name for a provider/field pair: identifier uppercased with
/// non-alphanumerics collapsed to `_` (e.g. `azure-openai` → `AZURE_OPENAI_API_KEY`).
pub fn env_var_name(provider: &ProviderConfig, field: CredentialField) -> String {
    let prefix: String = provider
        .identifier()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}_{}", field.env_suffix())
}

/// Resolve one credential field for a provider.
pub fn resolve<FEnv>(
    provider: &ProviderConfig,
    field: CredentialField,
    env: &FEnv,
) -> Result<String, GatewayError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(value) = env(&env_var_name(provider, field)) {
        return Ok(value);
    }
    let literal = match field {
        CredentialField::ApiKey => provider.api_key.as_deref(),
        CredentialField::SecretKey => provider.secret_key.as_deref(),
        CredentialField::ApiBase => provider.api_base.as_deref(),
        CredentialField::AccountId => provider.account_id.as_deref(),
        CredentialField::Proxy => provider.extra.proxy.as_deref(),
    };
    if let Some(value) = literal.filter(|v| !v.trim().is_empty()) {
        return Ok(value.to_string());
    }
    if let Some(default) = field_default(provider, field, env) {
        return Ok(default);
    }
    Err(GatewayError::MissingCredential {
        provider: provider.identifier().to_string(),
        field,
    })
}

/// Resolve the proxy for a provider, treating absence as "no proxy".
pub fn resolve_proxy<FEnv>(provider: &ProviderConfig, env: &FEnv) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    match resolve(provider, CredentialField::Proxy, env) {
        Ok(proxy) => Some(proxy),
        Err(_) => None,
    }
}

/// Provider-specific defaults, currently base URLs only.
fn field_default<FEnv>(
    provider: &ProviderConfig,
    field: CredentialField,
    env: &FEnv,
) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    match field {
        CredentialField::ApiBase => {
            if let Some(base) = describe(provider.kind).default_api_base {
                return Some(base.to_string());
            }
            // Named openai-compatible instances inherit the platform catalog URL.
            if provider.kind == ProviderKind::OpenAiCompatible {
                if let Some(base) = provider.name.as_deref().and_then(compatible_platform_base) {
                    return Some(base.to_string());
                }
            }
            None
        }
        // Proxy falls back to the generic env vars shared by all providers.
        CredentialField::Proxy => GENERIC_PROXY_VARS.iter().find_map(|var| env(var)),
        _ => None,
    }
}
