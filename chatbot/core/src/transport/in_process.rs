//! In-Process Transport
//!
//! Scripted server for tests and demos. Each call pops the next
//! [`ScriptedResponse`]; requests are recorded for later inspection.
//!
//! # Usage
//!
//! ```ignore
//! let transport = InProcessTransport::new();
//! transport.push(ScriptedResponse::ndjson(&[
//!     ProtocolEvent::MessageStart,
//!     ProtocolEvent::MessageChunk { content: "hi".into() },
//!     ProtocolEvent::MessageEnd,
//! ]));
//!
//! // Body chunks pushed by hand, after the exchange has started
//! let (sender, response) = ScriptedResponse::channel(200);
//! transport.push(response);
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ByteStream, ResponseHandle, StreamTransport};
use crate::error::{BodyError, ExchangeError};
use crate::protocol::{ChatRequest, ProtocolEvent};

/// One scripted server reply
#[derive(Debug)]
pub enum ScriptedResponse {
    /// A body made of fixed chunks
    Stream {
        /// HTTP status
        status: u16,
        /// Body chunks, or a read failure at that point
        parts: Vec<Result<Bytes, BodyError>>,
        /// Delay before each chunk
        chunk_delay: Duration,
    },
    /// A body fed through a [`BodySender`]
    Channel {
        /// HTTP status
        status: u16,
        /// Chunk receiver
        rx: mpsc::Receiver<Result<Bytes, BodyError>>,
    },
    /// A JSON reply for `post_json`
    Json(serde_json::Value),
    /// The request never reaches the server
    ConnectFailure(String),
}

impl ScriptedResponse {
    /// 200 response, one chunk per record
    #[must_use]
    pub fn ndjson(events: &[ProtocolEvent]) -> Self {
        Self::chunks(events.iter().map(encode_record))
    }

    /// 200 response from raw chunks
    #[must_use]
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self::Stream {
            status: 200,
            parts: chunks.into_iter().map(|c| Ok(c.into())).collect(),
            chunk_delay: Duration::ZERO,
        }
    }

    /// Non-2xx response with a diagnostic body
    #[must_use]
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Stream {
            status,
            parts: vec![Ok(Bytes::from(body.into()))],
            chunk_delay: Duration::ZERO,
        }
    }

    /// 200 response whose body fails after the given chunks
    #[must_use]
    pub fn failing_after<I, B>(chunks: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut parts: Vec<Result<Bytes, BodyError>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        parts.push(Err(BodyError(reason.into())));
        Self::Stream {
            status: 200,
            parts,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Body fed by hand; the body ends when the sender is dropped
    #[must_use]
    pub fn channel(status: u16) -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(64);
        (BodySender { tx }, Self::Channel { status, rx })
    }

    /// Delay every chunk of a fixed body
    #[must_use]
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        match self {
            Self::Stream { status, parts, .. } => Self::Stream {
                status,
                parts,
                chunk_delay: delay,
            },
            other => other,
        }
    }

    fn into_handle(self) -> Result<ResponseHandle, ExchangeError> {
        match self {
            Self::Stream {
                status,
                parts,
                chunk_delay,
            } => {
                let body: ByteStream = if chunk_delay.is_zero() {
                    futures::stream::iter(parts).boxed()
                } else {
                    futures::stream::iter(parts)
                        .then(move |part| async move {
                            tokio::time::sleep(chunk_delay).await;
                            part
                        })
                        .boxed()
                };
                Ok(ResponseHandle::new(status, body))
            }
            Self::Channel { status, rx } => Ok(ResponseHandle::new(status, ReceiverStream::new(rx).boxed())),
            Self::Json(value) => Ok(ResponseHandle::from_chunks([value.to_string()])),
            Self::ConnectFailure(reason) => Err(ExchangeError::Transport { reason }),
        }
    }
}

/// Serialize a record as one NDJSON line
#[must_use]
pub fn encode_record(event: &ProtocolEvent) -> Bytes {
    let mut line = serde_json::to_vec(event).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

/// Feeds a [`ScriptedResponse::channel`] body
#[derive(Clone, Debug)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes, BodyError>>,
}

impl BodySender {
    /// Send raw bytes; returns false once the reader is gone
    pub async fn send_bytes(&self, bytes: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(bytes.into())).await.is_ok()
    }

    /// Send one record as an NDJSON line
    pub async fn send_event(&self, event: &ProtocolEvent) -> bool {
        self.tx.send(Ok(encode_record(event))).await.is_ok()
    }

    /// Fail the body read
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        self.tx.send(Err(BodyError(reason.into()))).await.is_ok()
    }
}

/// A request seen by the in-process transport
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    /// Endpoint path
    pub path: String,
    /// JSON body
    pub body: serde_json::Value,
}

/// Scripted transport
#[derive(Debug, Default)]
pub struct InProcessTransport {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl InProcessTransport {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next reply
    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Replies not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    fn take(&self, path: &str, body: serde_json::Value) -> Result<ScriptedResponse, ExchangeError> {
        self.requests.lock().push(RecordedRequest {
            path: path.to_string(),
            body,
        });
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| ExchangeError::Transport {
                reason: format!("no scripted response for {path}"),
            })
    }
}

#[async_trait]
impl StreamTransport for InProcessTransport {
    fn name(&self) -> &'static str {
        "InProcess"
    }

    async fn open_stream(
        &self,
        path: &str,
        request: &ChatRequest,
    ) -> Result<ResponseHandle, ExchangeError> {
        let body = serde_json::to_value(request).map_err(|e| ExchangeError::Transport {
            reason: e.to_string(),
        })?;
        self.take(path, body)?.into_handle()
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError> {
        let handle = match self.take(path, body.clone())? {
            ScriptedResponse::Json(value) => return Ok(value),
            other => other.into_handle()?,
        };

        let status = handle.status();
        let text = handle.text().await.map_err(|e| ExchangeError::Transport {
            reason: e.to_string(),
        })?;
        if !(200..300).contains(&status) {
            return Err(ExchangeError::ProtocolStatus { status, body: text });
        }
        serde_json::from_str(&text).map_err(|e| ExchangeError::Transport {
            reason: format!("invalid JSON response: {e}"),
        })
    }
}
