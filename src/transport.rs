//! HTTP transport for translated wire requests.
//!
//! One [`HttpTransport`] per provider instance, so proxy and timeout
//! settings stay independent. The transport only moves bytes: it sends
//! the composed request, maps non-2xx responses into provider errors with
//! the body carried verbatim, and hands the response byte stream to the
//! decoder untouched.

use crate::config::ProviderConfig;
use crate::credentials::resolve_proxy;
use crate::error::GatewayError;
use crate::translate::WireRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

/// Raw response bytes, chunked as the network delivers them.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// Seam between request execution and the rest of the pipeline.
///
/// Tests substitute a scripted implementation so the translate/decode
/// path runs without sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one wire request and return the response byte stream.
    async fn execute(&self, request: &WireRequest) -> Result<ByteStream, GatewayError>;
}

/// Reqwest-backed transport configured from one provider instance.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client honoring the provider's proxy and connect timeout.
    pub fn for_provider<FEnv>(provider: &ProviderConfig, env: &FEnv) -> Result<Self, GatewayError>
    where
        FEnv: Fn(&str) -> Option<String>,
    {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = provider.extra.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(proxy) = resolve_proxy(provider, env) {
            builder = builder.proxy(reqwest::Proxy::all(&proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &WireRequest) -> Result<ByteStream, GatewayError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            // Body text is carried verbatim so callers see the provider's
            // own diagnostics.
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider {
                status: status.as_u16(),
                message,
            });
        }
        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(GatewayError::from)),
        ))
    }
}
