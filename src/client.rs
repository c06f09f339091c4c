//! Client facade tying routing, compression, translation, transport, and
//! decoding into one `send` call.
//!
//! `Gateway::send` resolves the target provider and model, compresses
//! session history when the token estimate crosses the threshold, and
//! returns a [`ResponseStream`]. The stream enforces the overall exchange
//! deadline and appends the exchange to the session only after a clean
//! `Done`, so errored or cancelled turns never pollute history.

use crate::config::{GatewayConfig, ModelSpec, ProviderConfig};
use crate::decode::{decode, EventStream};
use crate::error::{ConfigError, GatewayError};
use crate::provider::describe;
use crate::session::Session;
use crate::transport::{HttpTransport, Transport};
use crate::translate::translate;
use crate::types::{ChatRequest, Message, ResponseEvent, StreamErrorKind};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Injectable environment lookup shared by credential resolution.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Single entry point for the rest of the application.
pub struct Gateway {
    config: GatewayConfig,
    env: EnvLookup,
}

impl Gateway {
    /// Build a gateway over a validated configuration, reading credentials
    /// from the process environment.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        Self::with_env(config, |key: &str| std::env::var(key).ok())
    }

    /// Build a gateway with a substitute environment lookup.
    pub fn with_env<FEnv>(config: GatewayConfig, env: FEnv) -> Result<Self, ConfigError>
    where
        FEnv: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            env: Arc::new(env),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Resolve `"provider:model"` or a bare model name against the
    /// configured providers.
    ///
    /// Bare names are searched across every provider's declared models.
    /// Closed-catalog providers reject model names absent from their
    /// `models` list before any network call; open catalogs accept any
    /// name under an explicit provider prefix.
    pub fn route(&self, model: &str) -> Result<(&ProviderConfig, ModelSpec), GatewayError> {
        if let Some((provider_id, model_name)) = model.split_once(':') {
            if let Some(provider) = self.config.provider(provider_id) {
                if let Some(spec) = provider.model(model_name) {
                    return Ok((provider, spec.clone()));
                }
                if describe(provider.kind).requires_declared_models {
                    return Err(ConfigError::Invalid(format!(
                        "model `{model_name}` is not declared under provider `{provider_id}`"
                    ))
                    .into());
                }
                return Ok((provider, ModelSpec::named(model_name)));
            }
            // Fall through: the colon may be part of the model name itself
            // (e.g. ollama tags like `llama3.2:1b`).
        }
        for provider in &self.config.providers {
            if let Some(spec) = provider.model(model) {
                return Ok((provider, spec.clone()));
            }
        }
        Err(ConfigError::Invalid(format!(
            "no configured provider serves model `{model}`; use `provider:model` or declare it"
        ))
        .into())
    }

    /// Execute one exchange.
    ///
    /// Configuration-shape failures (unknown route, missing credential,
    /// vision on a text-only model) surface as `Err` before any network
    /// I/O; everything after the request is dispatched arrives in-band on
    /// the returned stream, which always reaches a terminal event.
    pub async fn send<'s>(
        &self,
        request: &ChatRequest,
        mut session: Option<&'s mut Session>,
    ) -> Result<ResponseStream<'s>, GatewayError> {
        let (provider, model) = self.route(&request.model)?;
        let env = self.env_fn();
        let deadline = Instant::now() + Duration::from_secs(self.config.exchange_timeout_secs);

        if let Some(session) = session.as_deref_mut() {
            session.begin_exchange();
            if session.should_compress(
                &request.messages,
                self.config.compress_threshold,
                model.max_input_tokens,
            ) {
                // The sub-request shares the exchange deadline so a stalled
                // summarization backend can never hang the primary exchange.
                let outcome = match tokio::time::timeout_at(
                    deadline,
                    self.summarize(provider, &model, session),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout),
                };
                match outcome {
                    Ok(summary) => {
                        tracing::debug!(
                            provider = provider.identifier(),
                            "compressed session history"
                        );
                        session.apply_summary(&self.config.summary_prompt, &summary);
                    }
                    Err(err) => {
                        // Compression must never block the primary exchange.
                        tracing::warn!(
                            provider = provider.identifier(),
                            error = %err,
                            "history compression failed, continuing uncompressed"
                        );
                        session.mark_compression_attempted();
                    }
                }
            }
        }

        let mut outgoing = request.clone();
        if let Some(session) = session.as_deref() {
            let mut messages = session.messages().to_vec();
            messages.extend(request.messages.iter().cloned());
            outgoing.messages = messages;
        }

        let wire = translate(&outgoing, provider, &model, &env)?;
        let transport = HttpTransport::for_provider(provider, &env)?;
        let bytes = tokio::time::timeout_at(deadline, transport.execute(&wire))
            .await
            .map_err(|_| GatewayError::Timeout)??;

        let cancel = CancellationToken::new();
        let events = decode(wire.wire_format, wire.dialect, bytes, cancel.clone());
        Ok(ResponseStream {
            events: with_deadline(events, deadline),
            cancel: CancelHandle(cancel),
            session,
            user_messages: request.messages.clone(),
            assistant_text: String::new(),
            usage: None,
            saw_error: false,
        })
    }

    /// Non-streamed summarization sub-request over the session history.
    async fn summarize(
        &self,
        provider: &ProviderConfig,
        model: &ModelSpec,
        session: &Session,
    ) -> Result<String, GatewayError> {
        let sub_request = ChatRequest {
            model: model.name.clone(),
            messages: session.summarization_messages(&self.config.summarize_prompt),
            temperature: None,
            top_p: None,
            stream: false,
        };
        let env = self.env_fn();
        let wire = translate(&sub_request, provider, model, &env)?;
        let transport = HttpTransport::for_provider(provider, &env)?;
        let bytes = transport.execute(&wire).await?;

        let mut events = decode(wire.wire_format, wire.dialect, bytes, CancellationToken::new());
        let mut summary = String::new();
        while let Some(event) = events.next().await {
            match event {
                ResponseEvent::ContentDelta(text) => summary.push_str(&text),
                ResponseEvent::Error { kind, message } => {
                    return Err(match kind {
                        StreamErrorKind::Timeout => GatewayError::Timeout,
                        StreamErrorKind::Parse => GatewayError::Parse(message),
                        // In-band provider errors arrive on a 200 response.
                        _ => GatewayError::Provider {
                            status: 200,
                            message,
                        },
                    });
                }
                _ => {}
            }
        }
        if summary.trim().is_empty() {
            return Err(GatewayError::Parse(
                "summarization response carried no content".to_string(),
            ));
        }
        Ok(summary)
    }

    fn env_fn(&self) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
        let env = Arc::clone(&self.env);
        move |key: &str| env(key)
    }
}

/// Abort an in-progress stream past the exchange deadline with an in-band
/// timeout error and a forced `Done`.
fn with_deadline(events: EventStream, deadline: Instant) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut events = events;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    yield ResponseEvent::Error {
                        kind: StreamErrorKind::Timeout,
                        message: "exchange deadline elapsed".to_string(),
                    };
                    yield ResponseEvent::Done;
                    return;
                }
                event = events.next() => {
                    let Some(event) = event else { return };
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Response stream
// ---------------------------------------------------------------------------

/// Clonable handle that aborts the exchange it belongs to.
#[derive(Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    /// Abort the stream; the decoder closes with a `Cancelled` terminal.
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// Normalized event stream for one exchange.
///
/// Holds the exclusive session borrow for its whole lifetime and commits
/// the exchange to the session when (and only when) the stream closes with
/// a clean `Done`.
pub struct ResponseStream<'s> {
    events: EventStream,
    cancel: CancelHandle,
    session: Option<&'s mut Session>,
    user_messages: Vec<Message>,
    assistant_text: String,
    usage: Option<(u64, u64)>,
    saw_error: bool,
}

impl ResponseStream<'_> {
    /// Handle for caller-initiated abort; safe to clone across tasks.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn observe(&mut self, event: &ResponseEvent) {
        match event {
            ResponseEvent::ContentDelta(text) => self.assistant_text.push_str(text),
            ResponseEvent::Usage {
                input_tokens,
                output_tokens,
            } => self.usage = Some((*input_tokens, *output_tokens)),
            ResponseEvent::Error { .. } => self.saw_error = true,
            ResponseEvent::Done => {
                if !self.saw_error {
                    self.commit();
                }
            }
            ResponseEvent::ToolCall { .. } | ResponseEvent::Cancelled => {}
        }
    }

    fn commit(&mut self) {
        if let Some(session) = self.session.take() {
            session.record_exchange(
                &self.user_messages,
                Message::assistant(std::mem::take(&mut self.assistant_text)),
            );
            if let Some((input, output)) = self.usage.take() {
                session.record_usage(input, output);
            }
        }
    }
}

impl Stream for ResponseStream<'_> {
    type Item = ResponseEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.events.as_mut().poll_next(cx) {
            Poll::Ready(Some(event)) => {
                this.observe(&event);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use crate::testsupport::collect_events;
    use crate::types::Attachment;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Mock provider server: answers `bodies.len()` sequential connections,
    // each with 200 OK and the given payload, and returns the captured
    // request texts.
    async fn spawn_server(bodies: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut captured = Vec::new();
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                captured.push(read_request(&mut socket).await);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            captured
        });
        (format!("http://{addr}/v1"), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length: ").map(str::to_string))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    return text.to_string();
                }
            }
        }
    }

    fn mock_config(api_base: &str) -> GatewayConfig {
        let mut provider = ProviderConfig::new(ProviderKind::OpenAiCompatible);
        provider.name = Some("mock".into());
        provider.api_base = Some(api_base.to_string());
        provider.api_key = Some("sk-test".into());
        GatewayConfig {
            providers: vec![provider],
            ..GatewayConfig::default()
        }
    }

    fn sse_body(deltas: &[&str]) -> String {
        let mut body = String::new();
        for delta in deltas {
            body.push_str(&format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{delta}\"}}}}]}}\n\n"
            ));
        }
        body.push_str(
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":3}}\n\n",
        );
        body.push_str("data: [DONE]\n\n");
        body
    }

    // provider:model routing, bare-name fallback, and closed-catalog
    // rejection all resolve before any I/O.
    #[tokio::test]
    async fn routing_resolves_prefix_and_declared_models() {
        let mut ollama = ProviderConfig::new(ProviderKind::Ollama);
        ollama.models.push(ModelSpec::named("llama3.2:1b"));
        let mut openai = ProviderConfig::new(ProviderKind::OpenAi);
        openai.models.push(ModelSpec::named("gpt-4o"));
        let gateway = Gateway::with_env(
            GatewayConfig {
                providers: vec![ollama, openai],
                ..GatewayConfig::default()
            },
            |_: &str| None,
        )
        .unwrap();

        let (provider, spec) = gateway.route("ollama:llama3.2:1b").unwrap();
        assert_eq!(provider.kind, ProviderKind::Ollama);
        assert_eq!(spec.name, "llama3.2:1b");

        // Bare declared name resolves across providers.
        let (provider, _) = gateway.route("gpt-4o").unwrap();
        assert_eq!(provider.kind, ProviderKind::OpenAi);

        // Open catalog accepts undeclared names under an explicit prefix.
        let (_, spec) = gateway.route("openai:gpt-4o-mini").unwrap();
        assert_eq!(spec.name, "gpt-4o-mini");

        // Closed catalog rejects undeclared names up front.
        assert!(gateway.route("ollama:mistral").is_err());
        assert!(gateway.route("nowhere").is_err());
    }

    // Vision on a text-only model fails before any connection is made.
    #[tokio::test]
    async fn attachment_without_vision_fails_before_io() {
        let gateway =
            Gateway::with_env(mock_config("http://127.0.0.1:9/v1"), |_: &str| None).unwrap();
        let mut request = ChatRequest::user("mock:text-only", "what is this?");
        request.messages[0]
            .attachments
            .push(Attachment::image("image/png", b"png"));
        let err = gateway.send(&request, None).await.err().unwrap();
        assert!(matches!(err, GatewayError::UnsupportedCapability(_)), "{err}");
    }

    // Full happy path: stream deltas, then the exchange lands in the session.
    #[tokio::test]
    async fn exchange_appends_to_session_after_done() {
        let (api_base, server) = spawn_server(vec![sse_body(&["Hel", "lo"])]).await;
        let gateway = Gateway::with_env(mock_config(&api_base), |_: &str| None).unwrap();
        let mut session = Session::new();

        let request = ChatRequest::user("mock:gpt-test", "greet me");
        let stream = gateway.send(&request, Some(&mut session)).await.unwrap();
        let events = collect_events(stream).await;
        assert_eq!(events.last(), Some(&ResponseEvent::Done));

        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[0].content, "greet me");
        assert_eq!(session.messages()[1].content, "Hello");
        assert_eq!(session.usage().last_input_tokens, 9);
        assert_eq!(session.usage().last_output_tokens, 3);
        server.await.unwrap();
    }

    // A parse failure forces Error + Done and the session stays untouched.
    #[tokio::test]
    async fn errored_exchange_never_touches_session() {
        let (api_base, server) = spawn_server(vec!["data: {broken\n\n".to_string()]).await;
        let gateway = Gateway::with_env(mock_config(&api_base), |_: &str| None).unwrap();
        let mut session = Session::new();

        let request = ChatRequest::user("mock:gpt-test", "hi");
        let stream = gateway.send(&request, Some(&mut session)).await.unwrap();
        let events = collect_events(stream).await;
        assert!(matches!(
            events[0],
            ResponseEvent::Error {
                kind: StreamErrorKind::Parse,
                ..
            }
        ));
        assert_eq!(events[1], ResponseEvent::Done);
        assert!(session.messages().is_empty());
        assert_eq!(session.usage().session_total(), 0);
        server.await.unwrap();
    }

    // Crossing the threshold issues one summarization sub-request and the
    // main exchange proceeds over [summary, new_user_message].
    #[tokio::test]
    async fn compression_summarizes_history_before_exchange() {
        let summary_body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "earlier we argued about tabs"}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 20}
        })
        .to_string();
        let (api_base, server) =
            spawn_server(vec![summary_body, sse_body(&["spaces win"])]).await;

        let mut config = mock_config(&api_base);
        config.compress_threshold = 1000;
        config.summary_prompt = "Recap: ".into();
        let gateway = Gateway::with_env(config, |_: &str| None).unwrap();

        let mut session = Session::new();
        session.record_exchange(
            &[Message::user("x".repeat(5000))],
            Message::assistant("y".repeat(2000)),
        );

        let request = ChatRequest::user("mock:gpt-test", "so who wins?");
        let stream = gateway.send(&request, Some(&mut session)).await.unwrap();
        let events = collect_events(stream).await;
        assert_eq!(events.last(), Some(&ResponseEvent::Done));

        // Summary replaced prior turns; the triggering exchange followed it.
        assert_eq!(session.messages().len(), 3);
        assert_eq!(
            session.messages()[0].content,
            "Recap: earlier we argued about tabs"
        );
        assert_eq!(session.messages()[1].content, "so who wins?");
        assert_eq!(session.messages()[2].content, "spaces win");

        let captured = server.await.unwrap();
        assert_eq!(captured.len(), 2);
        // Sub-request is non-streamed and ends with the summarize instruction.
        assert!(captured[0].contains("\"stream\":false"), "{}", captured[0]);
        assert!(captured[0].contains("Summarize the discussion"), "{}", captured[0]);
        // Main request carries only the summary plus the new user message.
        assert!(captured[1].contains("Recap: earlier we argued about tabs"));
        assert!(!captured[1].contains("xxxxx"), "old history leaked");
    }

    // A failed sub-request downgrades to a warning and the exchange
    // proceeds over the uncompressed history.
    #[tokio::test]
    async fn failed_compression_does_not_block_exchange() {
        let broken_summary = "not json".to_string();
        let (api_base, server) =
            spawn_server(vec![broken_summary, sse_body(&["still here"])]).await;
        let mut config = mock_config(&api_base);
        config.compress_threshold = 1000;
        let gateway = Gateway::with_env(config, |_: &str| None).unwrap();

        let mut session = Session::new();
        session.record_exchange(
            &[Message::user("x".repeat(5000))],
            Message::assistant("ok"),
        );

        let request = ChatRequest::user("mock:gpt-test", "hello?");
        let stream = gateway.send(&request, Some(&mut session)).await.unwrap();
        let events = collect_events(stream).await;
        assert_eq!(events.last(), Some(&ResponseEvent::Done));

        // Uncompressed history plus the new exchange.
        assert_eq!(session.messages().len(), 4);
        let captured = server.await.unwrap();
        assert!(captured[1].contains("xxxxx"), "history should be uncompressed");
    }

    // A summarization backend that accepts the sub-request and then stalls
    // must not hang send(): the exchange deadline bounds the whole turn.
    #[tokio::test]
    async fn stalled_summarization_respects_exchange_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            // Accept the summarization sub-request, then never answer.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = mock_config(&format!("http://{addr}/v1"));
        config.compress_threshold = 1000;
        config.exchange_timeout_secs = 1;
        let gateway = Gateway::with_env(config, |_: &str| None).unwrap();

        let mut session = Session::new();
        session.record_exchange(
            &[Message::user("x".repeat(5000))],
            Message::assistant("ok"),
        );
        let history_before = session.messages().to_vec();

        let request = ChatRequest::user("mock:gpt-test", "hello?");
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            gateway.send(&request, Some(&mut session)),
        )
        .await
        .expect("send() must reach a terminal outcome within the deadline");
        assert!(matches!(outcome, Err(GatewayError::Timeout)));
        // History is left intact for the next turn.
        assert_eq!(session.messages(), history_before.as_slice());
    }

    // The exchange deadline aborts a stalled stream with Error(Timeout) + Done.
    #[tokio::test]
    async fn stalled_stream_times_out_in_band() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            let head = "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
            let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
            let chunk = format!("{head}{:x}\r\n{frame}\r\n", frame.len());
            socket.write_all(chunk.as_bytes()).await.unwrap();
            // Stall without closing; the client must give up on its own.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = mock_config(&format!("http://{addr}/v1"));
        config.exchange_timeout_secs = 1;
        let gateway = Gateway::with_env(config, |_: &str| None).unwrap();
        let mut session = Session::new();

        let request = ChatRequest::user("mock:gpt-test", "hi");
        let stream = gateway.send(&request, Some(&mut session)).await.unwrap();
        let events = collect_events(stream).await;
        assert_eq!(events[0], ResponseEvent::ContentDelta("partial".into()));
        assert!(matches!(
            events[1],
            ResponseEvent::Error {
                kind: StreamErrorKind::Timeout,
                ..
            }
        ));
        assert_eq!(events[2], ResponseEvent::Done);
        assert!(session.messages().is_empty());
    }

    // Caller-initiated abort closes the stream with Cancelled and never
    // commits to the session.
    #[tokio::test]
    async fn cancel_handle_aborts_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            let head = "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
            let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n\n";
            let chunk = format!("{head}{:x}\r\n{frame}\r\n", frame.len());
            socket.write_all(chunk.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let gateway =
            Gateway::with_env(mock_config(&format!("http://{addr}/v1")), |_: &str| None).unwrap();
        let mut session = Session::new();
        let request = ChatRequest::user("mock:gpt-test", "hi");
        let mut stream = gateway.send(&request, Some(&mut session)).await.unwrap();
        let handle = stream.cancel_handle();

        assert_eq!(
            stream.next().await,
            Some(ResponseEvent::ContentDelta("first".into()))
        );
        handle.cancel();
        assert_eq!(stream.next().await, Some(ResponseEvent::Cancelled));
        assert_eq!(stream.next().await, None);
        drop(stream);
        assert!(session.messages().is_empty());
    }
}
