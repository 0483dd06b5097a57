//! Stream Processor
//!
//! Drives one streaming exchange end-to-end:
//!
//! ```text
//!  response body ──► FrameReader ──► ProtocolEvent
//!                                      │
//!               message_chunk ─────────┼──► accumulated text
//!                                      │        │
//!                                      ▼        ▼
//!                              StreamingThrottle (paced text,
//!                                      │          ordered markers)
//!                                      ▼
//!                               StreamConsumer::on_chunk
//!                               StreamConsumer::on_question (question_content)
//! ```
//!
//! Reading and pacing share one task: a biased `tokio::select!` races the
//! cancellation token, the next throttle release and the next network record.
//! Network bursts are queued in the throttle while earlier slices are still
//! waiting for their tick, and cards arriving mid-answer can be delivered
//! without waiting for the text.
//!
//! The processor is at-most-once: it never retries. A failure is reported once
//! through [`StreamConsumer::on_error`] and returned as `Err`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::frame::{FrameDecoder, FrameReader};
use crate::protocol::{ProtocolEvent, StreamChunk};
use crate::throttle::{StreamingThrottle, ThrottleConfig};
use crate::transport::ResponseHandle;

// ============================================================================
// Consumer
// ============================================================================

/// Receives the output of one exchange
///
/// Callbacks run on the processor's task, in delivery order. After a
/// cancellation no callback fires at all.
pub trait StreamConsumer {
    /// A paced text slice or a structured event
    fn on_chunk(&mut self, chunk: StreamChunk);

    /// The text of a `question_content` record, delivered alongside `on_chunk`
    fn on_question(&mut self, _question: &str) {}

    /// The exchange failed; called at most once
    fn on_error(&mut self, _error: &ExchangeError) {}
}

// ============================================================================
// Exchange
// ============================================================================

/// Exchange identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(pub Uuid);

impl ExchangeId {
    /// Generate a new unique exchange ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus {
    /// Still streaming
    InProgress,
    /// Body ended and every queued chunk was delivered
    Completed,
    /// Ended by an error
    Failed,
    /// Ended by the cancellation handle
    Cancelled,
}

impl ExchangeStatus {
    /// Whether the exchange has ended
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One request/response cycle
///
/// Owned by whoever opened it and consumed by [`StreamProcessor::process`];
/// a new exchange is needed to stream again.
#[derive(Debug)]
pub struct StreamingExchange {
    id: ExchangeId,
    status: ExchangeStatus,
    text: String,
    cancel: CancellationToken,
    started_at: Instant,
}

impl Default for StreamingExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingExchange {
    /// Start a new exchange with its own cancellation token
    #[must_use]
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    /// Start a new exchange honoring an external cancellation token
    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            id: ExchangeId::new(),
            status: ExchangeStatus::InProgress,
            text: String::new(),
            cancel,
            started_at: Instant::now(),
        }
    }

    /// Exchange ID
    #[must_use]
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ExchangeStatus {
        self.status
    }

    /// Answer text accumulated so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Handle that cancels this exchange from anywhere
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the exchange
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the exchange was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close an exchange that was cancelled before any response arrived
    #[must_use]
    pub fn into_cancelled(mut self) -> ExchangeOutcome {
        self.cancel.cancel();
        self.finish(ExchangeStatus::Cancelled, ExchangeStats::default())
    }

    fn finish(&mut self, status: ExchangeStatus, stats: ExchangeStats) -> ExchangeOutcome {
        self.status = status;
        ExchangeOutcome {
            id: self.id,
            status,
            text: std::mem::take(&mut self.text),
            stats: ExchangeStats {
                elapsed: self.started_at.elapsed(),
                ..stats
            },
        }
    }
}

/// Counters for one exchange
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Body bytes received
    pub bytes_read: u64,
    /// Records decoded
    pub records_decoded: u64,
    /// Malformed or unknown records dropped
    pub records_dropped: u64,
    /// Text slices delivered
    pub text_slices: usize,
    /// Text characters delivered
    pub chars_released: usize,
    /// Queued text characters dropped by cancellation or failure
    pub chars_discarded: usize,
    /// Structured events delivered
    pub events_released: usize,
    /// Wall time of the exchange
    pub elapsed: Duration,
}

/// Result of a finished exchange
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeOutcome {
    /// Exchange ID
    pub id: ExchangeId,
    /// `Completed` or `Cancelled`
    pub status: ExchangeStatus,
    /// Full answer text (for a cancelled exchange, what had arrived)
    pub text: String,
    /// Counters
    pub stats: ExchangeStats,
}

// ============================================================================
// Processor
// ============================================================================

/// Streams one response through decoder and throttle into a consumer
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamProcessor {
    config: ThrottleConfig,
}

impl StreamProcessor {
    /// Create a processor with resolved pacing
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self { config }
    }

    /// Pacing in effect
    #[must_use]
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Run the exchange to completion, failure or cancellation
    ///
    /// A non-2xx status fails the exchange before any record is read, with the
    /// body text as diagnostic. A body read failure fails it with the text
    /// accumulated so far preserved in the error.
    pub async fn process<C>(
        &self,
        mut exchange: StreamingExchange,
        response: ResponseHandle,
        consumer: &mut C,
    ) -> Result<ExchangeOutcome, ExchangeError>
    where
        C: StreamConsumer + ?Sized,
    {
        let exchange_id = exchange.id();
        tracing::debug!(
            exchange_id = %exchange_id,
            status = response.status(),
            chars_per_tick = self.config.chars_per_tick,
            tick_interval_ms = self.config.tick_interval_ms,
            "Processing stream"
        );

        if exchange.is_cancelled() {
            return Ok(exchange.finish(ExchangeStatus::Cancelled, ExchangeStats::default()));
        }

        if !response.is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
            tracing::error!(exchange_id = %exchange_id, status, body = %body, "Stream request rejected");
            let error = ExchangeError::ProtocolStatus { status, body };
            exchange.finish(ExchangeStatus::Failed, ExchangeStats::default());
            consumer.on_error(&error);
            return Err(error);
        }

        let cancel = exchange.cancel_handle();
        let mut throttle = StreamingThrottle::new(self.config, cancel.clone());
        let mut reader = FrameReader::new(response.into_body());
        let mut stats = ExchangeStats::default();

        loop {
            if reader.is_finished() && !throttle.has_pending() {
                break;
            }

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    throttle.discard();
                    let stats = collect_stats(stats, reader.bytes_read(), reader.decoder(), &throttle);
                    tracing::info!(
                        exchange_id = %exchange_id,
                        chars_discarded = stats.chars_discarded,
                        "Exchange cancelled"
                    );
                    return Ok(exchange.finish(ExchangeStatus::Cancelled, stats));
                }

                release = throttle.next_release(), if throttle.has_pending() => {
                    if let Some(chunk) = release {
                        deliver(consumer, &cancel, chunk, &mut stats);
                    }
                }

                item = reader.next_event(), if !reader.is_finished() => {
                    match item {
                        Some(Ok(ProtocolEvent::MessageChunk { content })) => {
                            exchange.text.push_str(&content);
                            throttle.push_text(&content);
                        }
                        Some(Ok(event)) => {
                            tracing::debug!(exchange_id = %exchange_id, kind = event.kind(), "Structured event");
                            if let Some(chunk) = throttle.push_event(event) {
                                deliver(consumer, &cancel, chunk, &mut stats);
                            }
                        }
                        Some(Err(e)) => {
                            throttle.discard();
                            let stats = collect_stats(stats, reader.bytes_read(), reader.decoder(), &throttle);
                            let outcome = exchange.finish(ExchangeStatus::Failed, stats);
                            tracing::error!(
                                exchange_id = %exchange_id,
                                error = %e,
                                partial_chars = outcome.text.chars().count(),
                                "Stream interrupted"
                            );
                            let error = ExchangeError::MidStreamRead {
                                reason: e.to_string(),
                                partial_text: outcome.text,
                            };
                            if !cancel.is_cancelled() {
                                consumer.on_error(&error);
                            }
                            return Err(error);
                        }
                        None => {}
                    }
                }
            }
        }

        let stats = collect_stats(stats, reader.bytes_read(), reader.decoder(), &throttle);
        let outcome = exchange.finish(ExchangeStatus::Completed, stats);
        tracing::info!(
            exchange_id = %exchange_id,
            chars = outcome.stats.chars_released,
            records = outcome.stats.records_decoded,
            dropped = outcome.stats.records_dropped,
            elapsed_ms = outcome.stats.elapsed.as_millis() as u64,
            "Exchange completed"
        );
        Ok(outcome)
    }
}

fn deliver<C>(consumer: &mut C, cancel: &CancellationToken, chunk: StreamChunk, stats: &mut ExchangeStats)
where
    C: StreamConsumer + ?Sized,
{
    if cancel.is_cancelled() {
        return;
    }
    match &chunk {
        StreamChunk::Text(_) => {}
        StreamChunk::Event(ProtocolEvent::QuestionContent { question, .. }) => {
            stats.events_released += 1;
            consumer.on_question(question);
        }
        StreamChunk::Event(_) => stats.events_released += 1,
    }
    consumer.on_chunk(chunk);
}

fn collect_stats(
    stats: ExchangeStats,
    bytes_read: u64,
    decoder: &FrameDecoder,
    throttle: &StreamingThrottle,
) -> ExchangeStats {
    let released = throttle.stats();
    ExchangeStats {
        bytes_read,
        records_decoded: decoder.decoded(),
        records_dropped: decoder.dropped(),
        text_slices: released.slices_out,
        chars_released: released.chars_out,
        chars_discarded: released.chars_discarded,
        ..stats
    }
}
