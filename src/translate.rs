//! Request translation: unified [`ChatRequest`] → provider wire payload.
//!
//! One body builder per dialect. Shared rules live here: `chat_endpoint`
//! overrides replace the descriptor's default suffix, `extra_fields` from the
//! model spec shallow-merge into the body with explicit fields winning, and
//! `None` sampling parameters are omitted from the wire entirely.

use crate::config::{ModelSpec, ProviderConfig};
use crate::credentials::{resolve, CredentialField};
use crate::error::GatewayError;
use crate::provider::{describe, AuthScheme, Dialect, ProviderKind, WireFormat};
use crate::types::{Attachment, ChatRequest, Message, Role};
use serde_json::{json, Map, Value};

/// Anthropic wire protocol version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Azure OpenAI REST api-version pinned by this dialect.
const AZURE_API_VERSION: &str = "2024-02-01";
/// Claude requires max_tokens; used when the model spec leaves it unset.
const CLAUDE_DEFAULT_MAX_TOKENS: u64 = 4096;

/// A fully composed provider request, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    /// Decoder variant the response must be fed through.
    pub wire_format: WireFormat,
    pub dialect: Dialect,
}

/// Translate a unified request into the provider's wire shape.
///
/// Fails before any I/O on missing credentials or attachments sent to a
/// model without vision support.
pub fn translate<FEnv>(
    request: &ChatRequest,
    provider: &ProviderConfig,
    model: &ModelSpec,
    env: &FEnv,
) -> Result<WireRequest, GatewayError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if request.has_attachments() && !model.supports_vision {
        return Err(GatewayError::UnsupportedCapability(format!(
            "model `{}` does not support image attachments",
            model.name
        )));
    }

    let descriptor = describe(provider.kind);
    let streaming = request.stream && descriptor.stream_format != WireFormat::JsonOnce;
    let api_base = resolve(provider, CredentialField::ApiBase, env)?;
    let api_base = api_base.trim_end_matches('/');

    let mut url = compose_url(provider, model, api_base, streaming, env)?;
    let mut headers = Vec::new();

    match descriptor.auth {
        AuthScheme::Bearer => {
            let key = resolve(provider, CredentialField::ApiKey, env)?;
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        AuthScheme::Header(name) => {
            let key = resolve(provider, CredentialField::ApiKey, env)?;
            headers.push((name.to_string(), key));
        }
        AuthScheme::QueryParam(name) => {
            let key = resolve(provider, CredentialField::ApiKey, env)?;
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str(name);
            url.push('=');
            url.push_str(&key);
        }
        AuthScheme::None => {}
    }

    match descriptor.dialect {
        Dialect::Claude if provider.kind == ProviderKind::Claude => {
            headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
        }
        Dialect::Qianwen if streaming => {
            headers.push(("X-DashScope-SSE".to_string(), "enable".to_string()));
        }
        Dialect::Replicate => {
            // Blocking prediction mode: the response carries the final output.
            headers.push(("Prefer".to_string(), "wait".to_string()));
        }
        _ => {}
    }

    let mut body = build_body(descriptor.dialect, provider.kind, request, model, streaming);
    merge_extra_fields(&mut body, model);

    tracing::debug!(
        provider = provider.identifier(),
        model = model.name.as_str(),
        dialect = ?descriptor.dialect,
        streaming,
        "translated chat request"
    );

    Ok(WireRequest {
        method: reqwest::Method::POST,
        url,
        headers,
        body,
        wire_format: if streaming {
            descriptor.stream_format
        } else {
            WireFormat::JsonOnce
        },
        dialect: descriptor.dialect,
    })
}

// ---------------------------------------------------------------------------
// URL composition
// ---------------------------------------------------------------------------

fn compose_url<FEnv>(
    provider: &ProviderConfig,
    model: &ModelSpec,
    api_base: &str,
    streaming: bool,
    env: &FEnv,
) -> Result<String, GatewayError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    // A configured chat_endpoint replaces the dialect's documented suffix.
    if let Some(endpoint) = provider.chat_endpoint.as_deref() {
        let suffix = endpoint.replace("{model}", &model.name);
        return Ok(format!("{api_base}{suffix}"));
    }

    let descriptor = describe(provider.kind);
    let url = match provider.kind {
        ProviderKind::AzureOpenAi => format!(
            "{api_base}/openai/deployments/{}{}?api-version={AZURE_API_VERSION}",
            model.name, descriptor.chat_path
        ),
        ProviderKind::Gemini => format!(
            "{api_base}/models/{}:{}",
            model.name,
            gemini_action(streaming)
        ),
        ProviderKind::VertexAi => format!(
            "{api_base}/publishers/google/models/{}:{}",
            model.name,
            gemini_action(streaming)
        ),
        ProviderKind::Bedrock => format!("{api_base}/model/{}/invoke", model.name),
        ProviderKind::Cloudflare => {
            let account = resolve(provider, CredentialField::AccountId, env)?;
            format!("{api_base}/accounts/{account}/ai/run/{}", model.name)
        }
        ProviderKind::Replicate => format!("{api_base}/models/{}/predictions", model.name),
        ProviderKind::Ernie => format!(
            "{api_base}/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{}",
            model.name
        ),
        _ => format!("{api_base}{}", descriptor.chat_path),
    };
    Ok(url)
}

fn gemini_action(streaming: bool) -> &'static str {
    if streaming {
        "streamGenerateContent?alt=sse"
    } else {
        "generateContent"
    }
}

// ---------------------------------------------------------------------------
// Body builders, one per dialect
// ---------------------------------------------------------------------------

fn build_body(
    dialect: Dialect,
    kind: ProviderKind,
    request: &ChatRequest,
    model: &ModelSpec,
    streaming: bool,
) -> Value {
    match dialect {
        Dialect::OpenAi => openai_body(request, model, streaming),
        Dialect::Claude => claude_body(request, model, streaming, kind),
        Dialect::Gemini => gemini_body(request, model),
        Dialect::Cohere => cohere_body(request, model, streaming),
        Dialect::Ollama => ollama_body(request, model, streaming),
        Dialect::Cloudflare => cloudflare_body(request, streaming),
        Dialect::Ernie => ernie_body(request, streaming),
        Dialect::Qianwen => qianwen_body(request, model, streaming),
        Dialect::Replicate => replicate_body(request),
    }
}

/// Insert a key only when the optional parameter is present; `None` means
/// "provider default" and never reaches the wire.
fn set_optional(body: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        body.insert(key.to_string(), json!(v));
    }
}

fn openai_body(request: &ChatRequest, model: &ModelSpec, streaming: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|msg| {
            if msg.has_attachments() {
                // Vision content is a part array: text plus image_url entries
                // carrying data URLs or plain URLs.
                let mut parts = vec![json!({"type": "text", "text": msg.content})];
                for att in &msg.attachments {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": att.as_data_url()},
                    }));
                }
                json!({"role": msg.role.as_str(), "content": parts})
            } else {
                json!({"role": msg.role.as_str(), "content": msg.content})
            }
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".into(), json!(model.name));
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(streaming));
    set_optional(&mut body, "temperature", request.temperature);
    set_optional(&mut body, "top_p", request.top_p);
    if let Some(max) = model.max_output_tokens {
        body.insert("max_tokens".into(), json!(max));
    }
    Value::Object(body)
}

fn claude_body(
    request: &ChatRequest,
    model: &ModelSpec,
    streaming: bool,
    kind: ProviderKind,
) -> Value {
    let (system, turns) = split_system(&request.messages);
    let messages: Vec<Value> = turns
        .iter()
        .map(|msg| {
            if msg.has_attachments() {
                let mut blocks = Vec::new();
                for att in &msg.attachments {
                    let source = match att {
                        Attachment::Image { media_type, data } => json!({
                            "type": "base64",
                            "media_type": media_type,
                            "data": data,
                        }),
                        Attachment::ImageUrl { url } => json!({"type": "url", "url": url}),
                    };
                    blocks.push(json!({"type": "image", "source": source}));
                }
                blocks.push(json!({"type": "text", "text": msg.content}));
                json!({"role": msg.role.as_str(), "content": blocks})
            } else {
                json!({"role": msg.role.as_str(), "content": msg.content})
            }
        })
        .collect();

    let mut body = Map::new();
    body.insert("messages".into(), json!(messages));
    body.insert(
        "max_tokens".into(),
        json!(model.max_output_tokens.unwrap_or(CLAUDE_DEFAULT_MAX_TOKENS)),
    );
    if let Some(system) = system {
        body.insert("system".into(), json!(system));
    }
    set_optional(&mut body, "temperature", request.temperature);
    set_optional(&mut body, "top_p", request.top_p);
    if kind == ProviderKind::Bedrock {
        // Bedrock routes by URL and versions the body instead of a header.
        body.insert("anthropic_version".into(), json!("bedrock-2023-05-31"));
    } else {
        body.insert("model".into(), json!(model.name));
        body.insert("stream".into(), json!(streaming));
    }
    Value::Object(body)
}

fn gemini_body(request: &ChatRequest, model: &ModelSpec) -> Value {
    let (system, turns) = split_system(&request.messages);
    let contents: Vec<Value> = turns
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut parts = vec![json!({"text": msg.content})];
            for att in &msg.attachments {
                match att {
                    Attachment::Image { media_type, data } => parts.push(json!({
                        "inline_data": {"mime_type": media_type, "data": data},
                    })),
                    Attachment::ImageUrl { url } => parts.push(json!({
                        "file_data": {"file_uri": url},
                    })),
                }
            }
            json!({"role": role, "parts": parts})
        })
        .collect();

    let mut body = Map::new();
    body.insert("contents".into(), json!(contents));
    if let Some(system) = system {
        body.insert(
            "systemInstruction".into(),
            json!({"parts": [{"text": system}]}),
        );
    }
    let mut generation = Map::new();
    set_optional(&mut generation, "temperature", request.temperature);
    set_optional(&mut generation, "topP", request.top_p);
    if let Some(max) = model.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }
    Value::Object(body)
}

fn cohere_body(request: &ChatRequest, model: &ModelSpec, streaming: bool) -> Value {
    // Cohere separates the live message from prior history.
    let message = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let history: Vec<Value> = request
        .messages
        .iter()
        .take(
            request
                .messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .unwrap_or(0),
        )
        .map(|msg| {
            let role = match msg.role {
                Role::System => "SYSTEM",
                Role::User => "USER",
                Role::Assistant => "CHATBOT",
            };
            json!({"role": role, "message": msg.content})
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".into(), json!(model.name));
    body.insert("message".into(), json!(message));
    if !history.is_empty() {
        body.insert("chat_history".into(), json!(history));
    }
    body.insert("stream".into(), json!(streaming));
    set_optional(&mut body, "temperature", request.temperature);
    set_optional(&mut body, "p", request.top_p);
    Value::Object(body)
}

fn ollama_body(request: &ChatRequest, model: &ModelSpec, streaming: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|msg| {
            let mut entry = Map::new();
            entry.insert("role".into(), json!(msg.role.as_str()));
            entry.insert("content".into(), json!(msg.content));
            // Ollama takes raw base64 strings, no data-URL wrapper.
            let images: Vec<&str> = msg
                .attachments
                .iter()
                .filter_map(|att| match att {
                    Attachment::Image { data, .. } => Some(data.as_str()),
                    Attachment::ImageUrl { .. } => None,
                })
                .collect();
            if !images.is_empty() {
                entry.insert("images".into(), json!(images));
            }
            Value::Object(entry)
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".into(), json!(model.name));
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(streaming));
    let mut options = Map::new();
    set_optional(&mut options, "temperature", request.temperature);
    set_optional(&mut options, "top_p", request.top_p);
    if !options.is_empty() {
        body.insert("options".into(), Value::Object(options));
    }
    Value::Object(body)
}

fn cloudflare_body(request: &ChatRequest, streaming: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|msg| json!({"role": msg.role.as_str(), "content": msg.content}))
        .collect();
    let mut body = Map::new();
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(streaming));
    set_optional(&mut body, "temperature", request.temperature);
    set_optional(&mut body, "top_p", request.top_p);
    Value::Object(body)
}

fn ernie_body(request: &ChatRequest, streaming: bool) -> Value {
    let (system, turns) = split_system(&request.messages);
    let messages: Vec<Value> = turns
        .iter()
        .map(|msg| json!({"role": msg.role.as_str(), "content": msg.content}))
        .collect();
    let mut body = Map::new();
    body.insert("messages".into(), json!(messages));
    body.insert("stream".into(), json!(streaming));
    if let Some(system) = system {
        body.insert("system".into(), json!(system));
    }
    set_optional(&mut body, "temperature", request.temperature);
    set_optional(&mut body, "top_p", request.top_p);
    Value::Object(body)
}

fn qianwen_body(request: &ChatRequest, model: &ModelSpec, streaming: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|msg| json!({"role": msg.role.as_str(), "content": msg.content}))
        .collect();
    let mut parameters = Map::new();
    parameters.insert("result_format".into(), json!("message"));
    if streaming {
        parameters.insert("incremental_output".into(), json!(true));
    }
    set_optional(&mut parameters, "temperature", request.temperature);
    set_optional(&mut parameters, "top_p", request.top_p);

    json!({
        "model": model.name,
        "input": {"messages": messages},
        "parameters": parameters,
    })
}

fn replicate_body(request: &ChatRequest) -> Value {
    let (system, turns) = split_system(&request.messages);
    // Replicate language models take a flattened prompt transcript.
    let prompt = turns
        .iter()
        .map(|msg| format!("{}: {}", msg.role.as_str(), msg.content))
        .collect::<Vec<_>>()
        .join("\n");
    let mut input = Map::new();
    input.insert("prompt".into(), json!(prompt));
    if let Some(system) = system {
        input.insert("system_prompt".into(), json!(system));
    }
    set_optional(&mut input, "temperature", request.temperature);
    set_optional(&mut input, "top_p", request.top_p);
    json!({"input": input})
}

/// Pull system messages out for dialects that carry them separately.
fn split_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n"))
    };
    (system, turns)
}

/// Shallow-merge model `extra_fields` into the body. Explicit fields win so
/// user-declared extras cannot corrupt the required request shape.
fn merge_extra_fields(body: &mut Value, model: &ModelSpec) {
    let Value::Object(map) = body else {
        return;
    };
    for (key, value) in &model.extra_fields {
        if !map.contains_key(key) {
            map.insert(key.clone(), value.clone());
        }
    }
}
