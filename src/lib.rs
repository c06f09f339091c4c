//! Switchboard — one chat contract over many incompatible LLM backends.
//!
//! This crate normalizes authentication, endpoint construction, request
//! bodies, and streaming response framing across provider dialects
//! (OpenAI-style REST, Gemini, Claude, Cohere, Ollama, Azure OpenAI,
//! Vertex AI, Bedrock, Cloudflare Workers AI, Replicate, Ernie, Qianwen,
//! and OpenAI-compatible resellers), and manages conversation sessions
//! with token-budget-driven history compression.
//!
//! # Quick start
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use switchboard::client::Gateway;
//! use switchboard::config::GatewayConfig;
//! use switchboard::session::Session;
//! use switchboard::types::{ChatRequest, ResponseEvent};
//!
//! # async fn example(config: GatewayConfig) {
//! let gateway = Gateway::new(config).unwrap();
//! let mut session = Session::new();
//! let request = ChatRequest::user("openai:gpt-4o", "Hello!");
//! let mut stream = gateway.send(&request, Some(&mut session)).await.unwrap();
//! while let Some(event) = stream.next().await {
//!     if let ResponseEvent::ContentDelta(text) = event {
//!         print!("{text}");
//!     }
//! }
//! # }
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod decode;
pub mod error;
pub mod provider;
pub mod session;
#[cfg(test)]
pub mod testsupport;
pub mod translate;
pub mod transport;
pub mod types;
