//! Streaming Throttle
//!
//! Re-emits answer text at a human-readable cadence no matter how fast bytes
//! arrive. Text is cut into slices of at most `chars_per_tick` characters and
//! consecutive slices are released at least `tick_interval_ms` apart.
//!
//! # Ordering
//!
//! ```text
//!   push_text("abcd")  ──► [ "ab" | "cd" ]  ──tick──► "ab" ──tick──► "cd"
//!   push_event(card)   ──► released at once (flush_on_structured_event)
//!                      └─► or queued behind the text (reading order)
//!   push_event(end)    ──► always queued behind the text it closes
//! ```
//!
//! The throttle does no work of its own: the caller awaits
//! [`StreamingThrottle::next_release`] on its own task, so pacing is a timer
//! suspension point rather than a separate thread. One exchange drives one
//! throttle; instances are never shared.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ProtocolEvent, StreamChunk};

// ============================================================================
// Configuration
// ============================================================================

/// Pacing parameters of one exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum characters per released slice (at least 1)
    pub chars_per_tick: usize,
    /// Minimum time between two text releases
    pub tick_interval_ms: u64,
    /// Release cards ahead of queued text (`true`) or behind it (`false`)
    pub flush_on_structured_event: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottlePreset::Chat.default_config()
    }
}

impl ThrottleConfig {
    /// Create a config; `chars_per_tick` is raised to 1 if zero
    #[must_use]
    pub fn new(chars_per_tick: usize, tick_interval_ms: u64) -> Self {
        Self {
            chars_per_tick: chars_per_tick.max(1),
            tick_interval_ms,
            flush_on_structured_event: true,
        }
    }

    /// Set structured event ordering
    #[must_use]
    pub fn with_flush_on_structured_event(mut self, flush: bool) -> Self {
        self.flush_on_structured_event = flush;
        self
    }

    /// No pacing at all (every delta is one slice, no delay)
    #[must_use]
    pub fn unthrottled() -> Self {
        Self::new(usize::MAX, 0)
    }

    /// Tick interval as a `Duration`
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Named pacing presets, one per exchange kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlePreset {
    /// General chat answers
    Chat,
    /// UBTI interview turns (slower, question-by-question)
    Ubti,
    /// Likes / usage based recommendations
    Recommendation,
}

impl ThrottlePreset {
    /// Preset name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Ubti => "ubti",
            Self::Recommendation => "recommendation",
        }
    }

    /// Built-in pacing of this preset
    #[must_use]
    pub fn default_config(self) -> ThrottleConfig {
        match self {
            Self::Chat => ThrottleConfig::new(2, 30),
            Self::Ubti => ThrottleConfig::new(1, 50),
            Self::Recommendation => ThrottleConfig::new(4, 20),
        }
    }
}

/// The preset table, resolved when an exchange starts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlePresets {
    /// Pacing for general chat
    pub chat: ThrottleConfig,
    /// Pacing for UBTI turns
    pub ubti: ThrottleConfig,
    /// Pacing for recommendation turns
    pub recommendation: ThrottleConfig,
}

impl Default for ThrottlePresets {
    fn default() -> Self {
        Self {
            chat: ThrottlePreset::Chat.default_config(),
            ubti: ThrottlePreset::Ubti.default_config(),
            recommendation: ThrottlePreset::Recommendation.default_config(),
        }
    }
}

impl ThrottlePresets {
    /// Pacing for a preset
    #[must_use]
    pub fn resolve(&self, preset: ThrottlePreset) -> ThrottleConfig {
        match preset {
            ThrottlePreset::Chat => self.chat,
            ThrottlePreset::Ubti => self.ubti,
            ThrottlePreset::Recommendation => self.recommendation,
        }
    }

    /// Mutable access to one preset (used while loading configuration)
    pub fn get_mut(&mut self, preset: ThrottlePreset) -> &mut ThrottleConfig {
        match preset {
            ThrottlePreset::Chat => &mut self.chat,
            ThrottlePreset::Ubti => &mut self.ubti,
            ThrottlePreset::Recommendation => &mut self.recommendation,
        }
    }
}

// ============================================================================
// Throttle
// ============================================================================

#[derive(Debug)]
enum Pending {
    /// A text slice, paced
    Text(String),
    /// An event released in order, without delay
    Event(ProtocolEvent),
}

/// Release counters of one throttle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    /// Characters accepted through `push_text`
    pub chars_in: usize,
    /// Characters released to the consumer
    pub chars_out: usize,
    /// Text slices released
    pub slices_out: usize,
    /// Characters discarded by cancellation
    pub chars_discarded: usize,
}

/// Paces text slices for one exchange
#[derive(Debug)]
pub struct StreamingThrottle {
    config: ThrottleConfig,
    queue: VecDeque<Pending>,
    last_text_release: Option<Instant>,
    cancel: CancellationToken,
    stats: ThrottleStats,
}

impl StreamingThrottle {
    /// Create a throttle bound to an exchange's cancellation token
    #[must_use]
    pub fn new(config: ThrottleConfig, cancel: CancellationToken) -> Self {
        Self {
            config: ThrottleConfig {
                chars_per_tick: config.chars_per_tick.max(1),
                ..config
            },
            queue: VecDeque::new(),
            last_text_release: None,
            cancel,
            stats: ThrottleStats::default(),
        }
    }

    /// The pacing in effect
    #[must_use]
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Release counters
    #[must_use]
    pub fn stats(&self) -> ThrottleStats {
        self.stats
    }

    /// Whether anything is waiting to be released
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Characters queued but not yet released
    #[must_use]
    pub fn pending_chars(&self) -> usize {
        self.queue
            .iter()
            .map(|p| match p {
                Pending::Text(text) => text.chars().count(),
                Pending::Event(_) => 0,
            })
            .sum()
    }

    /// Queue answer text, cut into slices of at most `chars_per_tick` characters
    ///
    /// A trailing slice that is still short is topped up first.
    pub fn push_text(&mut self, text: &str) {
        if self.cancel.is_cancelled() || text.is_empty() {
            return;
        }
        let limit = self.config.chars_per_tick;
        let mut chars = text.chars().peekable();
        self.stats.chars_in += text.chars().count();

        if let Some(Pending::Text(tail)) = self.queue.back_mut() {
            let mut room = limit.saturating_sub(tail.chars().count());
            while room > 0 {
                let Some(c) = chars.next() else { break };
                tail.push(c);
                room -= 1;
            }
        }

        while chars.peek().is_some() {
            let slice: String = chars.by_ref().take(limit).collect();
            self.queue.push_back(Pending::Text(slice));
        }
    }

    /// Offer a non-text event
    ///
    /// Returns the chunk if it must be delivered right now; otherwise it is
    /// queued and will come out of [`next_release`](Self::next_release).
    pub fn push_event(&mut self, event: ProtocolEvent) -> Option<StreamChunk> {
        if self.cancel.is_cancelled() {
            return None;
        }
        if let Some(content) = event.as_text_delta() {
            self.push_text(content);
            return None;
        }
        if self.queue.is_empty() || (event.is_structured() && self.config.flush_on_structured_event)
        {
            return Some(StreamChunk::Event(event));
        }
        self.queue.push_back(Pending::Event(event));
        None
    }

    /// When the next text slice may be released (`None` = immediately)
    #[must_use]
    pub fn next_text_deadline(&self) -> Option<Instant> {
        self.last_text_release
            .map(|last| last + self.config.tick_interval())
            .filter(|deadline| *deadline > Instant::now())
    }

    /// Wait for and release the next queued chunk
    ///
    /// Returns `None` when the queue is empty or the exchange was cancelled; a
    /// cancellation discards everything still queued. Cancel-safe: nothing is
    /// dequeued until the pacing delay has elapsed.
    pub async fn next_release(&mut self) -> Option<StreamChunk> {
        if self.cancel.is_cancelled() {
            self.discard();
            return None;
        }

        if matches!(self.queue.front()?, Pending::Text(_)) {
            if let Some(deadline) = self.next_text_deadline() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        self.discard();
                        return None;
                    }
                    () = sleep_until(deadline) => {}
                }
            }
        }

        match self.queue.pop_front()? {
            Pending::Text(text) => {
                self.last_text_release = Some(Instant::now());
                self.stats.chars_out += text.chars().count();
                self.stats.slices_out += 1;
                Some(StreamChunk::Text(text))
            }
            Pending::Event(event) => Some(StreamChunk::Event(event)),
        }
    }

    /// Drop everything queued; returns the number of text characters dropped
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending_chars();
        self.queue.clear();
        self.stats.chars_discarded += dropped;
        if dropped > 0 {
            tracing::debug!(chars = dropped, "Discarded queued text");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(s: &str) -> StreamChunk {
        StreamChunk::Text(s.to_string())
    }

    async fn drain(throttle: &mut StreamingThrottle) -> Vec<(StreamChunk, Instant)> {
        let mut out = Vec::new();
        while let Some(chunk) = throttle.next_release().await {
            out.push((chunk, Instant::now()));
        }
        out
    }

    #[test]
    fn test_preset_defaults() {
        assert_eq!(ThrottlePreset::Ubti.default_config(), ThrottleConfig::new(1, 50));
        let presets = ThrottlePresets::default();
        assert_eq!(presets.resolve(ThrottlePreset::Chat), ThrottleConfig::new(2, 30));
        assert!(presets.resolve(ThrottlePreset::Recommendation).flush_on_structured_event);
        assert_eq!(ThrottleConfig::new(0, 10).chars_per_tick, 1);
    }

    #[test]
    fn test_text_is_sliced_by_characters() {
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(2, 10), CancellationToken::new());
        throttle.push_text("안녕하세요");
        assert_eq!(throttle.pending_chars(), 5);
        assert_eq!(throttle.queue.len(), 3);

        // Short tail slice "요" is topped up before new slices are cut
        throttle.push_text("!!");
        assert_eq!(throttle.queue.len(), 4);
        assert_eq!(throttle.pending_chars(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_releases_are_spaced_by_tick_interval() {
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(1, 50), CancellationToken::new());
        throttle.push_text("안");
        throttle.push_text("녕");

        let released = drain(&mut throttle).await;
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].0, text("안"));
        assert_eq!(released[1].0, text("녕"));
        assert!(released[1].1 - released[0].1 >= Duration::from_millis(50));

        let stats = throttle.stats();
        assert_eq!(stats.chars_in, 2);
        assert_eq!(stats.chars_out, 2);
        assert_eq!(stats.slices_out, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_release_is_immediate() {
        let start = Instant::now();
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(3, 100), CancellationToken::new());
        throttle.push_text("abc");
        assert_eq!(throttle.next_release().await, Some(text("abc")));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_event_preempts_queued_text() {
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(1, 50), CancellationToken::new());
        throttle.push_text("abc");
        let card = ProtocolEvent::PlanRecommendations { plans: Vec::new() };

        assert_eq!(throttle.push_event(card.clone()), Some(StreamChunk::Event(card)));
        assert_eq!(throttle.pending_chars(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_event_waits_for_text_without_flush() {
        let config = ThrottleConfig::new(1, 50).with_flush_on_structured_event(false);
        let mut throttle = StreamingThrottle::new(config, CancellationToken::new());
        throttle.push_text("ab");
        let card = ProtocolEvent::QuestionsComplete;
        assert_eq!(throttle.push_event(card.clone()), None);

        let order: Vec<_> = drain(&mut throttle).await.into_iter().map(|(c, _)| c).collect();
        assert_eq!(order, vec![text("a"), text("b"), StreamChunk::Event(card)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_end_stays_behind_its_text() {
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(1, 50), CancellationToken::new());
        assert_eq!(
            throttle.push_event(ProtocolEvent::MessageStart),
            Some(StreamChunk::Event(ProtocolEvent::MessageStart))
        );
        throttle.push_text("hi");
        assert_eq!(throttle.push_event(ProtocolEvent::MessageEnd), None);

        let order: Vec<_> = drain(&mut throttle).await.into_iter().map(|(c, _)| c).collect();
        assert_eq!(
            order,
            vec![text("h"), text("i"), StreamChunk::Event(ProtocolEvent::MessageEnd)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_queued_text() {
        let cancel = CancellationToken::new();
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(1, 50), cancel.clone());
        throttle.push_text("abcd");
        assert_eq!(throttle.next_release().await, Some(text("a")));

        cancel.cancel();
        assert_eq!(throttle.next_release().await, None);
        assert!(!throttle.has_pending());
        assert_eq!(throttle.stats().chars_discarded, 3);

        throttle.push_text("more");
        assert_eq!(throttle.push_event(ProtocolEvent::MessageEnd), None);
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pacing_delay() {
        let cancel = CancellationToken::new();
        let mut throttle = StreamingThrottle::new(ThrottleConfig::new(1, 10_000), cancel.clone());
        throttle.push_text("ab");
        assert_eq!(throttle.next_release().await, Some(text("a")));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert_eq!(throttle.next_release().await, None);
        assert!(Instant::now() - start < Duration::from_millis(10_000));
    }
}
