//! Shared test fixtures for config/credential/decode/facade test modules.
//!
//! Tiny reusable helpers so each test module does not rebuild ad-hoc env
//! mocks, SSE fixtures, and chunked byte streams.

use crate::error::GatewayError;
use crate::types::ResponseEvent;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;

/// Fixed environment lookup built from a literal table.
///
/// Substitutes for `std::env::var` so credential tests never touch process
/// state and stay parallel-safe.
pub fn fixed_env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

/// Build one SSE block carrying a single `data:` line.
pub fn sse_data_block(data: &str) -> String {
    format!("data: {data}\n\n")
}

/// SSE stream terminator block used by OpenAI-compatible streams.
pub fn sse_done_block() -> &'static str {
    "data: [DONE]\n\n"
}

/// Turn literal text chunks into the byte stream shape the decoder consumes.
pub fn byte_stream(
    chunks: &[&str],
) -> impl Stream<Item = Result<Bytes, GatewayError>> + Send + 'static {
    let owned: Vec<Result<Bytes, GatewayError>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::from(chunk.to_string())))
        .collect();
    futures_util::stream::iter(owned)
}

/// Like [`byte_stream`], but chunked at arbitrary byte boundaries, not
/// character boundaries.
pub fn raw_byte_stream(
    chunks: &[&[u8]],
) -> impl Stream<Item = Result<Bytes, GatewayError>> + Send + 'static {
    let owned: Vec<Result<Bytes, GatewayError>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures_util::stream::iter(owned)
}

/// Drain an event stream into a vector for assertions.
pub async fn collect_events<S>(stream: S) -> Vec<ResponseEvent>
where
    S: Stream<Item = ResponseEvent>,
{
    let mut stream = std::pin::pin!(stream);
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_env_returns_only_known_keys() {
        let env = fixed_env(&[("OPENAI_API_KEY", "sk-test")]);
        assert_eq!(env("OPENAI_API_KEY").as_deref(), Some("sk-test"));
        assert_eq!(env("COHERE_API_KEY"), None);
    }

    #[test]
    fn sse_helpers_emit_expected_wire_format() {
        let block = sse_data_block(r#"{"id":"chunk_1"}"#);
        assert!(block.starts_with("data: "));
        assert!(block.ends_with("\n\n"));
        assert_eq!(sse_done_block(), "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn byte_stream_preserves_chunk_boundaries() {
        let mut stream = std::pin::pin!(byte_stream(&["ab", "cd"]));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("ab"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("cd"));
        assert!(stream.next().await.is_none());
    }
}
