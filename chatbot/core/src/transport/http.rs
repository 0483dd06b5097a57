//! HTTP Transport
//!
//! `reqwest` client for the chat server.
//!
//! # Server API
//!
//! - `POST /chat` - general chat turn (streamed)
//! - `POST /ubti/question` - UBTI question/answer turn (streamed)
//! - `POST /ubti/result` - UBTI result (JSON)
//! - recommendation endpoints (streamed), paths from configuration
//!
//! Streaming requests ask for `text/event-stream` and no content encoding, so
//! the body can be read incrementally. Cookies are kept between requests
//! (credentials included). No read timeout is set: a hung read is ended by the
//! caller cancelling the exchange.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL};

use super::{ResponseHandle, StreamTransport};
use crate::error::{BodyError, ExchangeError};
use crate::protocol::ChatRequest;

/// Chat server client
#[derive(Clone, Debug)]
pub struct HttpTransport {
    /// Server base URL, without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for `base_url`
    ///
    /// `connect_timeout` bounds connection establishment only.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ExchangeError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| ExchangeError::Transport {
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// The server base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for an endpoint path
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn streaming_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    async fn open_stream(
        &self,
        path: &str,
        request: &ChatRequest,
    ) -> Result<ResponseHandle, ExchangeError> {
        let url = self.url(path);
        tracing::debug!(url = %url, tone = %request.tone, "Opening stream");

        let response = self
            .http_client
            .post(&url)
            .headers(Self::streaming_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport {
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BodyError::new))
            .boxed();

        Ok(ResponseHandle::new(status, body))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError> {
        let response = self
            .http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::ProtocolStatus { status, body });
        }

        response.json().await.map_err(|e| ExchangeError::Transport {
            reason: format!("invalid JSON response: {e}"),
        })
    }
}
