//! Streaming response decoders.
//!
//! One decode call per request turns the transport's raw byte stream into
//! the normalized [`ResponseEvent`] sequence. Three frame formats cover all
//! dialects: `data:`-prefixed SSE, newline-delimited JSON, and single-shot
//! JSON synthesized into one delta. The decoder suspends while awaiting
//! bytes, honors cancellation, and always closes the sequence with exactly
//! one terminal event — a malformed frame produces one parse error followed
//! by a forced `Done` instead of an unterminated stream.

use crate::error::GatewayError;
use crate::provider::{Dialect, WireFormat};
use crate::types::{ResponseEvent, StreamErrorKind};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Boxed event sequence produced by [`decode`].
pub type EventStream = Pin<Box<dyn Stream<Item = ResponseEvent> + Send>>;

/// SSE sentinel closing OpenAI-style and Cloudflare streams.
const SSE_DONE_SENTINEL: &str = "[DONE]";

/// Decode a raw byte stream into normalized response events.
///
/// Not restartable: a fresh call is required per request.
pub fn decode<S>(
    format: WireFormat,
    dialect: Dialect,
    byte_stream: S,
    cancel: CancellationToken,
) -> EventStream
where
    S: Stream<Item = Result<Bytes, GatewayError>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = std::pin::pin!(byte_stream);
        let mut parser = FrameParser::new(dialect);
        let mut buffer = BytesMut::new();
        let mut data_lines: Vec<String> = Vec::new();
        let mut whole_body = BytesMut::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    yield ResponseEvent::Cancelled;
                    return;
                }
                next = bytes.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield ResponseEvent::Error {
                        kind: StreamErrorKind::Transport,
                        message: err.to_string(),
                    };
                    yield ResponseEvent::Done;
                    return;
                }
            };

            if format == WireFormat::JsonOnce {
                whole_body.extend_from_slice(&chunk);
                continue;
            }

            // Chunks split on byte boundaries, so buffer raw bytes and only
            // decode complete lines; a multibyte character straddling two
            // chunks stays in the buffer until its line is whole.
            buffer.extend_from_slice(&chunk);
            while let Some(line_end) = buffer.iter().position(|&b| b == b'\n') {
                let raw = buffer.split_to(line_end + 1);
                let raw = String::from_utf8_lossy(&raw);
                let line = raw.trim_end_matches(['\n', '\r']);

                let payload = match format {
                    WireFormat::Sse => {
                        let Some(payload) = sse_line(line, &mut data_lines) else {
                            continue;
                        };
                        payload
                    }
                    WireFormat::JsonLines => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        line.to_string()
                    }
                    WireFormat::JsonOnce => unreachable!("handled above"),
                };

                if format == WireFormat::Sse && payload == SSE_DONE_SENTINEL {
                    for event in parser.finish() {
                        yield event;
                    }
                    yield ResponseEvent::Done;
                    return;
                }
                match parser.parse_frame(&payload) {
                    Ok(frame) => {
                        for event in frame.events {
                            yield event;
                        }
                        if frame.terminal {
                            for event in parser.finish() {
                                yield event;
                            }
                            yield ResponseEvent::Done;
                            return;
                        }
                    }
                    Err(message) => {
                        yield ResponseEvent::Error {
                            kind: StreamErrorKind::Parse,
                            message,
                        };
                        yield ResponseEvent::Done;
                        return;
                    }
                }
            }
        }

        // Transport closed without a dialect terminator.
        if format == WireFormat::JsonOnce {
            match parse_single(dialect, &String::from_utf8_lossy(&whole_body)) {
                Ok(events) => {
                    for event in events {
                        yield event;
                    }
                }
                Err(message) => {
                    yield ResponseEvent::Error {
                        kind: StreamErrorKind::Parse,
                        message,
                    };
                }
            }
        } else if let Some(payload) = flush_pending(format, &mut data_lines, &buffer) {
            // A final frame may lack its trailing newline/blank line.
            if payload != SSE_DONE_SENTINEL {
                match parser.parse_frame(&payload) {
                    Ok(frame) => {
                        for event in frame.events {
                            yield event;
                        }
                    }
                    Err(message) => {
                        yield ResponseEvent::Error {
                            kind: StreamErrorKind::Parse,
                            message,
                        };
                        yield ResponseEvent::Done;
                        return;
                    }
                }
            }
        }
        for event in parser.finish() {
            yield event;
        }
        yield ResponseEvent::Done;
    };
    Box::pin(stream)
}

/// Feed one SSE line into the frame assembler. Returns a complete `data`
/// payload when a blank line closes an event block. Multi-line `data:`
/// fields are joined with `\n`; comment lines are skipped.
fn sse_line(line: &str, data_lines: &mut Vec<String>) -> Option<String> {
    if line.is_empty() {
        if data_lines.is_empty() {
            return None;
        }
        let payload = data_lines.join("\n");
        data_lines.clear();
        return Some(payload);
    }
    if line.starts_with(':') {
        return None;
    }
    let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    };
    if field == "data" {
        data_lines.push(value.to_string());
    }
    None
}

/// Assemble any frame left in the buffers when the transport closes.
fn flush_pending(
    format: WireFormat,
    data_lines: &mut Vec<String>,
    buffer: &[u8],
) -> Option<String> {
    let tail = String::from_utf8_lossy(buffer);
    match format {
        WireFormat::Sse => {
            let tail = tail.trim();
            if let Some(value) = tail.strip_prefix("data:") {
                data_lines.push(value.trim_start_matches(' ').to_string());
            }
            if data_lines.is_empty() {
                None
            } else {
                let payload = data_lines.join("\n");
                data_lines.clear();
                Some(payload)
            }
        }
        WireFormat::JsonLines => {
            let tail = tail.trim();
            (!tail.is_empty()).then(|| tail.to_string())
        }
        WireFormat::JsonOnce => None,
    }
}

// ---------------------------------------------------------------------------
// Per-dialect frame parsing
// ---------------------------------------------------------------------------

/// Events extracted from one frame, plus whether it closed the stream.
struct Frame {
    events: Vec<ResponseEvent>,
    terminal: bool,
}

impl Frame {
    fn events(events: Vec<ResponseEvent>) -> Self {
        Self {
            events,
            terminal: false,
        }
    }

    fn terminal(events: Vec<ResponseEvent>) -> Self {
        Self {
            events,
            terminal: true,
        }
    }
}

/// Stateful per-request frame parser.
///
/// Usage numbers and tool-call fragments arrive across frames in most
/// dialects, so the parser buffers them and flushes on close.
struct FrameParser {
    dialect: Dialect,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    tool_name: Option<String>,
    tool_args: String,
}

impl FrameParser {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            input_tokens: None,
            output_tokens: None,
            tool_name: None,
            tool_args: String::new(),
        }
    }

    fn record_usage(&mut self, input: Option<u64>, output: Option<u64>) {
        if input.is_some() {
            self.input_tokens = input;
        }
        if output.is_some() {
            self.output_tokens = output;
        }
    }

    /// Flush buffered tool call and usage, in that order.
    fn finish(&mut self) -> Vec<ResponseEvent> {
        let mut events = Vec::new();
        if let Some(name) = self.tool_name.take() {
            events.push(ResponseEvent::ToolCall {
                name,
                arguments: std::mem::take(&mut self.tool_args),
            });
        }
        if self.input_tokens.is_some() || self.output_tokens.is_some() {
            events.push(ResponseEvent::Usage {
                input_tokens: self.input_tokens.take().unwrap_or(0),
                output_tokens: self.output_tokens.take().unwrap_or(0),
            });
        }
        events
    }

    fn parse_frame(&mut self, raw: &str) -> Result<Frame, String> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| format!("invalid JSON frame: {err}"))?;
        match self.dialect {
            Dialect::OpenAi => Ok(self.openai_frame(&value)),
            Dialect::Claude => Ok(self.claude_frame(&value)),
            Dialect::Gemini => Ok(self.gemini_frame(&value)),
            Dialect::Cohere => Ok(self.cohere_frame(&value)),
            Dialect::Ollama => Ok(self.ollama_frame(&value)),
            Dialect::Cloudflare => Ok(self.cloudflare_frame(&value)),
            Dialect::Ernie => Ok(self.ernie_frame(&value)),
            Dialect::Qianwen => Ok(self.qianwen_frame(&value)),
            // Replicate never streams; bodies go through parse_single.
            Dialect::Replicate => Err("unexpected streaming frame for replicate".to_string()),
        }
    }

    fn openai_frame(&mut self, value: &Value) -> Frame {
        if let Some(event) = provider_error(value) {
            return Frame::terminal(vec![event]);
        }
        let mut events = Vec::new();
        if let Some(choices) = value["choices"].as_array() {
            for choice in choices {
                let delta = &choice["delta"];
                if let Some(text) = delta["content"].as_str() {
                    if !text.is_empty() {
                        events.push(ResponseEvent::ContentDelta(text.to_string()));
                    }
                }
                if let Some(calls) = delta["tool_calls"].as_array() {
                    for call in calls {
                        let function = &call["function"];
                        if let Some(name) = function["name"].as_str() {
                            // A new name starts a new call; flush the last one.
                            if self.tool_name.is_some() {
                                events.extend(self.flush_tool_call());
                            }
                            self.tool_name = Some(name.to_string());
                        }
                        if let Some(args) = function["arguments"].as_str() {
                            self.tool_args.push_str(args);
                        }
                    }
                }
            }
        }
        if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
            self.record_usage(usage["prompt_tokens"].as_u64(), usage["completion_tokens"].as_u64());
        }
        Frame::events(events)
    }

    fn claude_frame(&mut self, value: &Value) -> Frame {
        let mut events = Vec::new();
        match value["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &value["message"]["usage"];
                self.record_usage(usage["input_tokens"].as_u64(), None);
            }
            "content_block_start" => {
                let block = &value["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    if let Some(name) = block["name"].as_str() {
                        self.tool_name = Some(name.to_string());
                    }
                }
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(ResponseEvent::ContentDelta(text.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta["partial_json"].as_str() {
                            self.tool_args.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                events.extend(self.flush_tool_call());
            }
            "message_delta" => {
                self.record_usage(None, value["usage"]["output_tokens"].as_u64());
            }
            "message_stop" => return Frame::terminal(events),
            "error" => {
                let message = value["error"]["message"]
                    .as_str()
                    .unwrap_or("provider reported an error")
                    .to_string();
                events.push(ResponseEvent::Error {
                    kind: StreamErrorKind::Provider,
                    message,
                });
                return Frame::terminal(events);
            }
            // ping and unknown event types are ignored.
            _ => {}
        }
        Frame::events(events)
    }

    fn gemini_frame(&mut self, value: &Value) -> Frame {
        if let Some(event) = provider_error(value) {
            return Frame::terminal(vec![event]);
        }
        let mut events = Vec::new();
        let mut terminal = false;
        if let Some(candidates) = value["candidates"].as_array() {
            for candidate in candidates {
                if let Some(parts) = candidate["content"]["parts"].as_array() {
                    for part in parts {
                        if let Some(text) = part["text"].as_str() {
                            if !text.is_empty() {
                                events.push(ResponseEvent::ContentDelta(text.to_string()));
                            }
                        }
                    }
                }
                if candidate["finishReason"].as_str().is_some() {
                    terminal = true;
                }
            }
        }
        let usage = &value["usageMetadata"];
        if usage.is_object() {
            self.record_usage(
                usage["promptTokenCount"].as_u64(),
                usage["candidatesTokenCount"].as_u64(),
            );
        }
        Frame { events, terminal }
    }

    fn cohere_frame(&mut self, value: &Value) -> Frame {
        match value["event_type"].as_str().unwrap_or_default() {
            "text-generation" => {
                let mut events = Vec::new();
                if let Some(text) = value["text"].as_str() {
                    events.push(ResponseEvent::ContentDelta(text.to_string()));
                }
                Frame::events(events)
            }
            "stream-end" => {
                let billed = &value["response"]["meta"]["billed_units"];
                self.record_usage(billed["input_tokens"].as_u64(), billed["output_tokens"].as_u64());
                Frame::terminal(Vec::new())
            }
            _ => Frame::events(Vec::new()),
        }
    }

    fn ollama_frame(&mut self, value: &Value) -> Frame {
        if let Some(message) = value["error"].as_str() {
            return Frame::terminal(vec![ResponseEvent::Error {
                kind: StreamErrorKind::Provider,
                message: message.to_string(),
            }]);
        }
        let mut events = Vec::new();
        if let Some(text) = value["message"]["content"].as_str() {
            if !text.is_empty() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
        }
        if value["done"].as_bool() == Some(true) {
            self.record_usage(
                value["prompt_eval_count"].as_u64(),
                value["eval_count"].as_u64(),
            );
            return Frame::terminal(events);
        }
        Frame::events(events)
    }

    fn cloudflare_frame(&mut self, value: &Value) -> Frame {
        let mut events = Vec::new();
        if let Some(text) = value["response"].as_str() {
            if !text.is_empty() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
        }
        let usage = &value["usage"];
        if usage.is_object() {
            self.record_usage(usage["prompt_tokens"].as_u64(), usage["completion_tokens"].as_u64());
        }
        Frame::events(events)
    }

    fn ernie_frame(&mut self, value: &Value) -> Frame {
        if let Some(message) = value["error_msg"].as_str() {
            return Frame::terminal(vec![ResponseEvent::Error {
                kind: StreamErrorKind::Provider,
                message: message.to_string(),
            }]);
        }
        let mut events = Vec::new();
        if let Some(text) = value["result"].as_str() {
            if !text.is_empty() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
        }
        let usage = &value["usage"];
        if usage.is_object() {
            self.record_usage(usage["prompt_tokens"].as_u64(), usage["completion_tokens"].as_u64());
        }
        if value["is_end"].as_bool() == Some(true) {
            return Frame::terminal(events);
        }
        Frame::events(events)
    }

    fn qianwen_frame(&mut self, value: &Value) -> Frame {
        if value["code"].as_str().is_some_and(|c| !c.is_empty()) {
            let message = value["message"]
                .as_str()
                .unwrap_or("provider reported an error")
                .to_string();
            return Frame::terminal(vec![ResponseEvent::Error {
                kind: StreamErrorKind::Provider,
                message,
            }]);
        }
        let mut events = Vec::new();
        let mut terminal = false;
        if let Some(choices) = value["output"]["choices"].as_array() {
            for choice in choices {
                if let Some(text) = choice["message"]["content"].as_str() {
                    if !text.is_empty() {
                        events.push(ResponseEvent::ContentDelta(text.to_string()));
                    }
                }
                if choice["finish_reason"].as_str() == Some("stop") {
                    terminal = true;
                }
            }
        }
        let usage = &value["usage"];
        if usage.is_object() {
            self.record_usage(usage["input_tokens"].as_u64(), usage["output_tokens"].as_u64());
        }
        Frame { events, terminal }
    }

    fn flush_tool_call(&mut self) -> Option<ResponseEvent> {
        self.tool_name.take().map(|name| ResponseEvent::ToolCall {
            name,
            arguments: std::mem::take(&mut self.tool_args),
        })
    }
}

/// Detect a generic `{"error": {...}}` payload and normalize it.
fn provider_error(value: &Value) -> Option<ResponseEvent> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("provider reported an error")
        .to_string();
    Some(ResponseEvent::Error {
        kind: StreamErrorKind::Provider,
        message,
    })
}

// ---------------------------------------------------------------------------
// Single-shot bodies
// ---------------------------------------------------------------------------

/// Parse one non-streamed response body into events (without the closing
/// `Done`, which the decode loop appends).
fn parse_single(dialect: Dialect, body: &str) -> Result<Vec<ResponseEvent>, String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err("empty response body".to_string());
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|err| format!("invalid JSON response: {err}"))?;

    let mut events = Vec::new();
    match dialect {
        Dialect::OpenAi => {
            if let Some(event) = provider_error(&value) {
                return Ok(vec![event]);
            }
            let message = &value["choices"][0]["message"];
            if let Some(text) = message["content"].as_str() {
                if !text.is_empty() {
                    events.push(ResponseEvent::ContentDelta(text.to_string()));
                }
            }
            if let Some(calls) = message["tool_calls"].as_array() {
                for call in calls {
                    let function = &call["function"];
                    if let Some(name) = function["name"].as_str() {
                        events.push(ResponseEvent::ToolCall {
                            name: name.to_string(),
                            arguments: function["arguments"].as_str().unwrap_or("").to_string(),
                        });
                    }
                }
            }
            push_usage(&mut events, &value["usage"], "prompt_tokens", "completion_tokens");
        }
        Dialect::Claude => {
            if value["type"].as_str() == Some("error") {
                if let Some(event) = provider_error(&value) {
                    return Ok(vec![event]);
                }
            }
            if let Some(blocks) = value["content"].as_array() {
                for block in blocks {
                    match block["type"].as_str().unwrap_or_default() {
                        "text" => {
                            if let Some(text) = block["text"].as_str() {
                                events.push(ResponseEvent::ContentDelta(text.to_string()));
                            }
                        }
                        "tool_use" => {
                            if let Some(name) = block["name"].as_str() {
                                events.push(ResponseEvent::ToolCall {
                                    name: name.to_string(),
                                    arguments: block["input"].to_string(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }
            push_usage(&mut events, &value["usage"], "input_tokens", "output_tokens");
        }
        Dialect::Gemini => {
            if let Some(event) = provider_error(&value) {
                return Ok(vec![event]);
            }
            if let Some(parts) = value["candidates"][0]["content"]["parts"].as_array() {
                let text: String = parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect();
                if !text.is_empty() {
                    events.push(ResponseEvent::ContentDelta(text));
                }
            }
            push_usage(
                &mut events,
                &value["usageMetadata"],
                "promptTokenCount",
                "candidatesTokenCount",
            );
        }
        Dialect::Cohere => {
            if let Some(text) = value["text"].as_str() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
            push_usage(
                &mut events,
                &value["meta"]["billed_units"],
                "input_tokens",
                "output_tokens",
            );
        }
        Dialect::Ollama => {
            if let Some(message) = value["error"].as_str() {
                return Ok(vec![ResponseEvent::Error {
                    kind: StreamErrorKind::Provider,
                    message: message.to_string(),
                }]);
            }
            if let Some(text) = value["message"]["content"].as_str() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
            if value["prompt_eval_count"].is_u64() || value["eval_count"].is_u64() {
                events.push(ResponseEvent::Usage {
                    input_tokens: value["prompt_eval_count"].as_u64().unwrap_or(0),
                    output_tokens: value["eval_count"].as_u64().unwrap_or(0),
                });
            }
        }
        Dialect::Cloudflare => {
            if value["success"].as_bool() == Some(false) {
                let message = value["errors"][0]["message"]
                    .as_str()
                    .unwrap_or("provider reported an error")
                    .to_string();
                return Ok(vec![ResponseEvent::Error {
                    kind: StreamErrorKind::Provider,
                    message,
                }]);
            }
            if let Some(text) = value["result"]["response"].as_str() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
        }
        Dialect::Ernie => {
            if let Some(message) = value["error_msg"].as_str() {
                return Ok(vec![ResponseEvent::Error {
                    kind: StreamErrorKind::Provider,
                    message: message.to_string(),
                }]);
            }
            if let Some(text) = value["result"].as_str() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
            push_usage(&mut events, &value["usage"], "prompt_tokens", "completion_tokens");
        }
        Dialect::Qianwen => {
            if value["code"].as_str().is_some_and(|c| !c.is_empty()) {
                let message = value["message"]
                    .as_str()
                    .unwrap_or("provider reported an error")
                    .to_string();
                return Ok(vec![ResponseEvent::Error {
                    kind: StreamErrorKind::Provider,
                    message,
                }]);
            }
            if let Some(text) = value["output"]["choices"][0]["message"]["content"].as_str() {
                events.push(ResponseEvent::ContentDelta(text.to_string()));
            }
            push_usage(&mut events, &value["usage"], "input_tokens", "output_tokens");
        }
        Dialect::Replicate => {
            if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                let message = error.as_str().unwrap_or("provider reported an error");
                return Ok(vec![ResponseEvent::Error {
                    kind: StreamErrorKind::Provider,
                    message: message.to_string(),
                }]);
            }
            let text = match &value["output"] {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<String>(),
                _ => String::new(),
            };
            if !text.is_empty() {
                events.push(ResponseEvent::ContentDelta(text));
            }
        }
    }
    Ok(events)
}

fn push_usage(events: &mut Vec<ResponseEvent>, usage: &Value, input_key: &str, output_key: &str) {
    if usage.is_object() {
        events.push(ResponseEvent::Usage {
            input_tokens: usage[input_key].as_u64().unwrap_or(0),
            output_tokens: usage[output_key].as_u64().unwrap_or(0),
        });
    }
}
