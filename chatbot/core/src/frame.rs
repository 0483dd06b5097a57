//! Frame Decoder
//!
//! Turns the raw bytes of a streaming response into protocol events.
//!
//! # Frame Format
//!
//! ```text
//! {"type":"message_start"}\n
//! data: {"type":"message_chunk","content":"안"}\n
//! \n
//! {"type":"message_chunk","content":"녕"}\n
//! ```
//!
//! One JSON object per line. An SSE-style `data:` prefix is accepted, and blank
//! lines, `:` comments, other SSE fields and the `[DONE]` sentinel are skipped.
//!
//! Network reads split and merge records at arbitrary byte offsets, including
//! in the middle of a multi-byte character. The decoder keeps a byte carry
//! buffer and only decodes complete lines, so a character split across reads is
//! reassembled before it is interpreted.
//!
//! A record that fails to parse, or whose `type` is unknown, is dropped with a
//! warning; it never ends the stream.

use std::fmt;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::FrameError;
use crate::protocol::ProtocolEvent;

/// Maximum size of a single record (10 MB)
///
/// A line longer than this is discarded up to its terminating newline.
pub const MAX_RECORD_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for the decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Parse one line into an event
///
/// Returns `Ok(None)` for lines that carry no record (blank, SSE comment or
/// field, `[DONE]`).
pub fn parse_record(line: &[u8]) -> Result<Option<ProtocolEvent>, FrameError> {
    let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    let mut line = line.trim();

    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix("data:") {
        line = rest.trim();
    } else if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return Ok(None);
    }
    if line.is_empty() || line == "[DONE]" {
        return Ok(None);
    }

    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(FrameError::MissingType)?;
    if !ProtocolEvent::is_known_type(tag) {
        return Err(FrameError::UnknownType(tag.to_string()));
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| FrameError::InvalidJson(e.to_string()))
}

/// Incremental newline-delimited record decoder
///
/// Buffers incoming bytes and yields complete events.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Bytes past `read_pos` already searched for a newline
    scanned: usize,
    /// Discarding an oversized line until its newline
    skipping: bool,
    decoded: u64,
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scanned: 0,
            skipping: false,
            decoded: 0,
            dropped: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of unconsumed bytes in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Records successfully decoded so far
    #[must_use]
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Records dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next complete event in the buffer
    ///
    /// Skips over lines that fail to parse. Returns `None` once no complete
    /// line is left; the incomplete tail stays buffered for the next `push`.
    pub fn next_event(&mut self) -> Option<ProtocolEvent> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let found = pending[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(newline) = found.map(|offset| self.scanned + offset) else {
                self.scanned = pending.len();
                if pending.len() > MAX_RECORD_SIZE {
                    tracing::warn!(
                        size = pending.len(),
                        max = MAX_RECORD_SIZE,
                        "Discarding oversized record"
                    );
                    self.dropped += 1;
                    self.buffer.clear();
                    self.read_pos = 0;
                    self.scanned = 0;
                    self.skipping = true;
                }
                return None;
            };

            let line_start = self.read_pos;
            self.read_pos += newline + 1;
            self.scanned = 0;

            if self.skipping {
                self.skipping = false;
                continue;
            }

            if let Some(event) = self.accept(line_start, line_start + newline) {
                return Some(event);
            }
        }
    }

    /// Parse whatever is left after the byte source has ended
    ///
    /// The remainder gets one final parse attempt and is discarded either way.
    pub fn finish(&mut self) -> Option<ProtocolEvent> {
        let end = self.buffer.len();
        let start = self.read_pos;
        let skipping = std::mem::take(&mut self.skipping);

        let event = if start < end && !skipping {
            self.accept(start, end)
        } else {
            None
        };

        self.buffer.clear();
        self.read_pos = 0;
        self.scanned = 0;
        event
    }

    /// Decode a complete byte payload in one go
    #[must_use]
    pub fn decode_all(data: &[u8]) -> Vec<ProtocolEvent> {
        let mut decoder = Self::new();
        decoder.push(data);
        let mut events: Vec<_> = std::iter::from_fn(|| decoder.next_event()).collect();
        events.extend(decoder.finish());
        events
    }

    fn accept(&mut self, start: usize, end: usize) -> Option<ProtocolEvent> {
        match parse_record(&self.buffer[start..end]) {
            Ok(Some(event)) => {
                self.decoded += 1;
                tracing::trace!(kind = event.kind(), "Decoded record");
                Some(event)
            }
            Ok(None) => None,
            Err(e) => {
                self.dropped += 1;
                tracing::warn!(error = %e, "Dropping malformed record");
                None
            }
        }
    }
}

/// Pull-based event reader over a chunked response body
///
/// `next_event` is cancel-safe: dropping it while it awaits the body loses no
/// buffered data, so it can race a timer inside `tokio::select!`.
pub struct FrameReader<S> {
    body: S,
    decoder: FrameDecoder,
    finished: bool,
    bytes_read: u64,
}

impl<S> fmt::Debug for FrameReader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("decoder", &self.decoder)
            .field("finished", &self.finished)
            .field("bytes_read", &self.bytes_read)
            .finish_non_exhaustive()
    }
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    /// Wrap a byte stream
    pub fn new(body: S) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            finished: false,
            bytes_read: 0,
        }
    }

    /// Whether the body has ended (or failed)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Total bytes received from the body
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// The underlying decoder (for statistics)
    #[must_use]
    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    /// Next event, in arrival order
    ///
    /// Yields `Err` once if the body fails; yields `None` after the body ends
    /// and the remainder has been parsed. The reader is not restartable.
    pub async fn next_event(&mut self) -> Option<Result<ProtocolEvent, E>> {
        loop {
            if let Some(event) = self.decoder.next_event() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    self.bytes_read += bytes.len() as u64;
                    self.decoder.push(&bytes);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return self.decoder.finish().map(Ok);
                }
            }
        }
    }

    /// Turn the reader into a lazy event stream
    pub fn into_stream(self) -> impl Stream<Item = Result<ProtocolEvent, E>> {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_event().await.map(|item| (item, reader))
        })
    }
}
