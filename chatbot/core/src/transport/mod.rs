//! Transport Layer
//!
//! The HTTP exchange with the chat server, behind a trait so the engine can be
//! driven by a real `reqwest` client or by an in-process script.
//!
//! # Available Transports
//!
//! - **Http**: `reqwest` client against the chat server
//! - **InProcess**: scripted responses with controllable chunk boundaries,
//!   delays and failures (tests, demos)
//!
//! A transport only opens the exchange and hands back a fetch-style
//! [`ResponseHandle`]; reading, decoding and pacing the body is the stream
//! processor's job.

mod http;
mod in_process;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{BodyError, ExchangeError};
use crate::protocol::ChatRequest;

pub use http::HttpTransport;
pub use in_process::{
    encode_record, BodySender, InProcessTransport, RecordedRequest, ScriptedResponse,
};

/// Chunked response body
pub type ByteStream = BoxStream<'static, Result<Bytes, BodyError>>;

/// Status and body of an opened streaming response
pub struct ResponseHandle {
    status: u16,
    body: ByteStream,
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl ResponseHandle {
    /// Wrap a status and body
    #[must_use]
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// A 200 response from a list of body chunks
    #[must_use]
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let parts: Vec<Result<Bytes, BodyError>> = chunks.into_iter().map(|b| Ok(b.into())).collect();
        Self::new(200, futures::stream::iter(parts).boxed())
    }

    /// HTTP status code
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Take the body stream
    #[must_use]
    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Read the whole body as (lossy) UTF-8 text
    pub async fn text(self) -> Result<String, BodyError> {
        let mut body = self.body;
        let mut bytes = Vec::new();
        while let Some(chunk) = body.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Transport trait for the chat server
///
/// Implement this to point the engine at a different server or a test double.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Transport name (for logging)
    fn name(&self) -> &str;

    /// Open a streaming exchange
    ///
    /// Resolves as soon as the response head is available; a non-2xx status is
    /// returned as a handle, not as an error, so the caller can read the body as
    /// a diagnostic.
    async fn open_stream(
        &self,
        path: &str,
        request: &ChatRequest,
    ) -> Result<ResponseHandle, ExchangeError>;

    /// Plain JSON request/response (result fetches)
    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError>;
}
