//! Chat Orchestration
//!
//! Drives user turns against the chat server and keeps the per-session
//! streaming state the UI renders from.
//!
//! # Design Philosophy
//!
//! The client is UI-agnostic. A surface passes an explicit [`SessionId`] and a
//! [`StreamConsumer`] of its own to every turn; the client fans each delivered
//! chunk out to that consumer and to the session's [`TurnHandlers`], which
//! update the session log, the card slots and the UBTI flow.
//!
//! ```text
//!  ChatClient::send_message(session, text)
//!      │  route: UBTI answer or general chat
//!      ▼
//!  StreamingChat::begin_turn ──► TurnHandlers (one per turn)
//!      │                               ▲
//!      ▼                               │ on_chunk / on_question / on_error
//!  StreamTransport::open_stream ──► StreamProcessor::process
//!                                      │
//!                                      └──► caller's StreamConsumer
//! ```
//!
//! At most one exchange streams per session; a second turn is rejected with
//! [`ChatError::TurnInProgress`] until the first one ends or is cancelled.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ChatError, ExchangeError};
use crate::processor::{
    ExchangeOutcome, ExchangeStatus, StreamConsumer, StreamProcessor, StreamingExchange,
};
use crate::protocol::{
    ChatRequest, Plan, ProtocolEvent, StreamChunk, SubscriptionCards, Tone, UsageSnapshot,
};
use crate::session::{MessageRole, SessionId, SessionLog, SessionStore};
use crate::throttle::{ThrottlePreset, ThrottlePresets};
use crate::transport::StreamTransport;
use crate::ubti::{UbtiFlow, UbtiPhase};

// ============================================================================
// Fixed messages
// ============================================================================

/// Message that opens a UBTI interview
pub const UBTI_KICKOFF_MESSAGE: &str = "UBTI 분석을 시작해주세요";

/// User message logged for a likes-based recommendation
pub const LIKES_RECOMMENDATION_MESSAGE: &str = "좋아요한 서비스 기반으로 추천해 주세요";

/// User message logged for a usage-based recommendation
pub const USAGE_RECOMMENDATION_MESSAGE: &str = "내 사용량 기반으로 요금제 추천해 주세요";

/// Bot greeting for a new conversation
pub const GREETING: &str =
    "안녕하세요! 😊 저는 LG유플러스의 AI 어시스턴트예요. 궁금한 점이 있으시면 언제든지 물어보세요!";

/// Bot greeting after the conversation is reset
pub const RESET_GREETING: &str = "새로운 대화를 시작합니다! 😊 무엇을 도와드릴까요?";

// ============================================================================
// Exchange kinds
// ============================================================================

/// The kinds of streamed turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// General chat
    Chat,
    /// UBTI question/answer
    Ubti,
    /// Recommendation from liked services
    LikesRecommendation,
    /// Plan recommendation from usage
    UsageRecommendation,
}

impl ExchangeKind {
    /// Kind name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Ubti => "ubti",
            Self::LikesRecommendation => "likes_recommendation",
            Self::UsageRecommendation => "usage_recommendation",
        }
    }

    /// Throttle preset for this kind
    #[must_use]
    pub fn preset(self) -> ThrottlePreset {
        match self {
            Self::Chat => ThrottlePreset::Chat,
            Self::Ubti => ThrottlePreset::Ubti,
            Self::LikesRecommendation | Self::UsageRecommendation => ThrottlePreset::Recommendation,
        }
    }

    /// Whether the reply is expected to carry cards
    #[must_use]
    pub fn expects_cards(self) -> bool {
        matches!(self, Self::LikesRecommendation | Self::UsageRecommendation)
    }

    /// Whether the request body carries the session id
    #[must_use]
    pub fn carries_session(self) -> bool {
        !matches!(self, Self::UsageRecommendation)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server endpoint paths
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// General chat (streamed)
    pub chat: String,
    /// UBTI question/answer (streamed)
    pub ubti_question: String,
    /// UBTI result (JSON)
    pub ubti_result: String,
    /// Likes-based recommendation (streamed)
    pub likes_recommendation: String,
    /// Usage-based recommendation (streamed)
    pub usage_recommendation: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            chat: "/chat".to_string(),
            ubti_question: "/ubti/question".to_string(),
            ubti_result: "/ubti/result".to_string(),
            likes_recommendation: "/chat/likes".to_string(),
            usage_recommendation: "/chat/usage".to_string(),
        }
    }
}

impl Endpoints {
    /// Streaming path for a turn kind
    #[must_use]
    pub fn path(&self, kind: ExchangeKind) -> &str {
        match kind {
            ExchangeKind::Chat => &self.chat,
            ExchangeKind::Ubti => &self.ubti_question,
            ExchangeKind::LikesRecommendation => &self.likes_recommendation,
            ExchangeKind::UsageRecommendation => &self.usage_recommendation,
        }
    }
}

/// JSON payload of a UBTI result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UbtiResult(pub serde_json::Value);

impl UbtiResult {
    /// A top-level string field of the result
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(serde_json::Value::as_str)
    }
}

// ============================================================================
// Per-session streaming state
// ============================================================================

/// Where the current turn is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    /// No turn yet, or reset
    #[default]
    Idle,
    /// Request sent, nothing delivered yet
    Waiting,
    /// Chunks are being delivered
    Streaming,
    /// The last turn completed
    Done,
    /// The last turn failed
    Failed,
}

/// What the UI renders for one session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatView {
    /// Turn progress
    pub streaming_state: StreamingState,
    /// A recommendation turn is waiting for its cards
    pub expecting_cards: bool,
    /// Bot text delivered for the current message so far
    pub streaming_text: String,
    /// Latest plan cards
    pub plan_cards: Vec<Plan>,
    /// Latest subscription cards
    pub subscription_cards: SubscriptionCards,
    /// Latest usage card
    pub usage: Option<UsageSnapshot>,
    /// Failure of the last turn
    pub last_error: Option<ExchangeError>,
}

#[derive(Debug)]
struct ActiveTurn {
    turn: u64,
    kind: ExchangeKind,
    cancel: CancellationToken,
}

/// Streaming state of one chat session
pub struct StreamingChat {
    session_id: SessionId,
    log: Arc<dyn SessionLog>,
    view: Mutex<ChatView>,
    ubti: UbtiFlow,
    active: Mutex<Option<ActiveTurn>>,
    turns: AtomicU64,
    /// Bumped whenever the UBTI flow is started or reset
    ubti_epoch: AtomicU64,
}

impl fmt::Debug for StreamingChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingChat")
            .field("session_id", &self.session_id)
            .field("view", &*self.view.lock())
            .field("ubti", &self.ubti)
            .finish_non_exhaustive()
    }
}

impl StreamingChat {
    /// Create idle state for a session
    #[must_use]
    pub fn new(session_id: SessionId, log: Arc<dyn SessionLog>) -> Self {
        Self {
            session_id,
            log,
            view: Mutex::new(ChatView::default()),
            ubti: UbtiFlow::new(),
            active: Mutex::new(None),
            turns: AtomicU64::new(0),
            ubti_epoch: AtomicU64::new(0),
        }
    }

    /// Session this state belongs to
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Snapshot of the rendered state
    #[must_use]
    pub fn view(&self) -> ChatView {
        self.view.lock().clone()
    }

    /// Turn progress
    #[must_use]
    pub fn streaming_state(&self) -> StreamingState {
        self.view.lock().streaming_state
    }

    /// The UBTI flow of this session
    #[must_use]
    pub fn ubti(&self) -> &UbtiFlow {
        &self.ubti
    }

    /// Whether an exchange is streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Cancellation handle of the exchange in flight
    #[must_use]
    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.active.lock().as_ref().map(|a| a.cancel.clone())
    }

    /// Handlers for a general chat or UBTI turn
    pub fn create_streaming_handlers(
        self: &Arc<Self>,
        user_message: &str,
        is_ubti: bool,
    ) -> Result<TurnHandlers, ChatError> {
        let kind = if is_ubti {
            ExchangeKind::Ubti
        } else {
            ExchangeKind::Chat
        };
        self.begin_turn(kind, user_message)
    }

    /// Claim the session for a new turn and log the user message
    pub fn begin_turn(
        self: &Arc<Self>,
        kind: ExchangeKind,
        user_message: &str,
    ) -> Result<TurnHandlers, ChatError> {
        let cancel = CancellationToken::new();
        let turn = {
            let mut active = self.active.lock();
            if active.is_some() {
                tracing::warn!(session_id = %self.session_id, kind = %kind, "Turn rejected, reply still streaming");
                return Err(ChatError::TurnInProgress);
            }
            let turn = self.turns.fetch_add(1, Ordering::SeqCst);
            *active = Some(ActiveTurn {
                turn,
                kind,
                cancel: cancel.clone(),
            });
            turn
        };

        {
            let mut view = self.view.lock();
            view.streaming_state = StreamingState::Waiting;
            view.expecting_cards = kind.expects_cards();
            view.streaming_text.clear();
            view.last_error = None;
        }

        if !user_message.is_empty() {
            self.log.append(&self.session_id, user_message, MessageRole::User);
        }

        Ok(TurnHandlers {
            chat: Arc::clone(self),
            kind,
            turn,
            ubti_epoch: self.ubti_epoch.load(Ordering::SeqCst),
            cancel,
            text: String::new(),
            logged_len: 0,
        })
    }

    /// Begin a fresh UBTI interview
    pub fn start_ubti(&self) {
        self.ubti_epoch.fetch_add(1, Ordering::SeqCst);
        self.ubti.start();
    }

    /// Return the UBTI flow to idle
    ///
    /// A UBTI exchange still in flight is cancelled. Turns that began before
    /// the reset no longer touch the flow.
    pub fn reset_ubti(&self) {
        self.ubti_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = self.active.lock().as_ref() {
            if active.kind == ExchangeKind::Ubti {
                tracing::info!(session_id = %self.session_id, "Cancelling UBTI exchange on reset");
                active.cancel.cancel();
            }
        }
        self.ubti.reset();
    }

    /// Clear all card slots
    pub fn reset_cards(&self) {
        let mut view = self.view.lock();
        view.plan_cards.clear();
        view.subscription_cards = SubscriptionCards::default();
        view.usage = None;
        view.expecting_cards = false;
    }

    /// Cancel the exchange in flight and return to idle
    pub fn reset_streaming_state(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel.cancel();
        }
        let mut view = self.view.lock();
        view.streaming_state = StreamingState::Idle;
        view.expecting_cards = false;
        view.streaming_text.clear();
        view.last_error = None;
    }

    fn release(&self, turn: u64) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| a.turn == turn) {
            *active = None;
        }
    }
}

// ============================================================================
// Turn handlers
// ============================================================================

/// Consumer that applies one turn's output to its session
///
/// Releases the session for the next turn when dropped.
#[derive(Debug)]
pub struct TurnHandlers {
    chat: Arc<StreamingChat>,
    kind: ExchangeKind,
    turn: u64,
    ubti_epoch: u64,
    cancel: CancellationToken,
    /// Released bot text not yet written to the log
    text: String,
    /// Bytes of this exchange's answer already written to the log
    logged_len: usize,
}

impl TurnHandlers {
    /// Turn kind
    #[must_use]
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Cancellation handle for this turn's exchange
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply the end of a successful or cancelled exchange
    pub fn finish(&mut self, outcome: &ExchangeOutcome) {
        let mut view = self.chat.view.lock();
        view.expecting_cards = false;
        match outcome.status {
            ExchangeStatus::Cancelled => {
                self.text.clear();
                view.streaming_state = StreamingState::Idle;
            }
            _ => {
                drop(view);
                self.flush_bot_message();
                self.chat.view.lock().streaming_state = StreamingState::Done;
            }
        }
    }

    fn flush_bot_message(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        self.logged_len += text.len();
        self.chat
            .log
            .append(&self.chat.session_id, &text, MessageRole::Bot);
    }

    /// Take back answer text the throttle had queued but not yet released
    fn recover_unreleased(&mut self, partial_text: &str) {
        let released = self.logged_len + self.text.len();
        let Some(rest) = partial_text.get(released..).filter(|rest| !rest.is_empty()) else {
            return;
        };
        self.text.push_str(rest);
        self.chat.view.lock().streaming_text.push_str(rest);
    }
}

impl StreamConsumer for TurnHandlers {
    fn on_chunk(&mut self, chunk: StreamChunk) {
        {
            let mut view = self.chat.view.lock();
            if view.streaming_state == StreamingState::Waiting {
                view.streaming_state = StreamingState::Streaming;
            }
        }

        let event = match chunk {
            StreamChunk::Text(text) => {
                self.text.push_str(&text);
                self.chat.view.lock().streaming_text.push_str(&text);
                return;
            }
            StreamChunk::Event(event) => event,
        };

        match &event {
            ProtocolEvent::MessageStart => self.chat.view.lock().streaming_text.clear(),
            ProtocolEvent::MessageEnd => self.flush_bot_message(),
            ProtocolEvent::PlanRecommendations { plans } => {
                let mut view = self.chat.view.lock();
                view.plan_cards = plans.clone();
                view.expecting_cards = false;
            }
            ProtocolEvent::SubscriptionRecommendations { items } => {
                let mut view = self.chat.view.lock();
                view.subscription_cards = SubscriptionCards::from_items(items);
                view.expecting_cards = false;
            }
            ProtocolEvent::UsageAnalysis { data } => {
                let mut view = self.chat.view.lock();
                view.usage = Some(data.clone());
                view.expecting_cards = false;
            }
            _ => {}
        }

        if event.is_ubti() {
            if self.chat.ubti_epoch.load(Ordering::SeqCst) == self.ubti_epoch {
                self.chat.ubti.apply(&event);
            } else {
                tracing::debug!(
                    session_id = %self.chat.session_id,
                    kind = event.kind(),
                    "Ignoring UBTI event from before the last reset"
                );
            }
        }
    }

    fn on_question(&mut self, question: &str) {
        tracing::debug!(session_id = %self.chat.session_id, chars = question.chars().count(), "Question extracted");
    }

    fn on_error(&mut self, error: &ExchangeError) {
        // Partial text stays in the log next to the failure
        if let Some(partial_text) = error.partial_text() {
            self.recover_unreleased(partial_text);
        }
        self.flush_bot_message();
        let mut view = self.chat.view.lock();
        view.streaming_state = StreamingState::Failed;
        view.expecting_cards = false;
        view.last_error = Some(error.clone());
    }
}

impl Drop for TurnHandlers {
    fn drop(&mut self) {
        self.chat.release(self.turn);
    }
}

/// Delivers every chunk to the session handlers and to the caller
struct Fanout<'a> {
    handlers: &'a mut TurnHandlers,
    observer: &'a mut (dyn StreamConsumer + Send),
}

impl StreamConsumer for Fanout<'_> {
    fn on_chunk(&mut self, chunk: StreamChunk) {
        self.handlers.on_chunk(chunk.clone());
        self.observer.on_chunk(chunk);
    }

    fn on_question(&mut self, question: &str) {
        self.handlers.on_question(question);
        self.observer.on_question(question);
    }

    fn on_error(&mut self, error: &ExchangeError) {
        self.handlers.on_error(error);
        self.observer.on_error(error);
    }
}

/// Consumer that ignores everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopConsumer;

impl StreamConsumer for NoopConsumer {
    fn on_chunk(&mut self, _chunk: StreamChunk) {}
}

// ============================================================================
// Client
// ============================================================================

/// Drives chat turns for any number of sessions
pub struct ChatClient<T: StreamTransport> {
    transport: Arc<T>,
    endpoints: Endpoints,
    presets: ThrottlePresets,
    store: Arc<Mutex<SessionStore>>,
    chats: Mutex<HashMap<SessionId, Arc<StreamingChat>>>,
}

impl<T: StreamTransport> fmt::Debug for ChatClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("transport", &self.transport.name())
            .field("endpoints", &self.endpoints)
            .field("presets", &self.presets)
            .finish_non_exhaustive()
    }
}

impl<T: StreamTransport> ChatClient<T> {
    /// Create a client with its own session store
    pub fn new(transport: T, endpoints: Endpoints, presets: ThrottlePresets) -> Self {
        Self::with_store(
            Arc::new(transport),
            endpoints,
            presets,
            Arc::new(Mutex::new(SessionStore::new())),
        )
    }

    /// Create a client over a shared transport and session store
    pub fn with_store(
        transport: Arc<T>,
        endpoints: Endpoints,
        presets: ThrottlePresets,
        store: Arc<Mutex<SessionStore>>,
    ) -> Self {
        Self {
            transport,
            endpoints,
            presets,
            store,
            chats: Mutex::new(HashMap::new()),
        }
    }

    /// The transport
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The session store
    #[must_use]
    pub fn store(&self) -> &Arc<Mutex<SessionStore>> {
        &self.store
    }

    /// Create a session, optionally opened by a bot greeting
    pub fn create_session(&self, greeting: Option<&str>) -> SessionId {
        let mut store = self.store.lock();
        let id = store.create_session();
        if let Some(greeting) = greeting {
            store.add_message(&id, greeting, MessageRole::Bot);
        }
        id
    }

    /// Streaming state of an open session
    ///
    /// Fails for ended sessions and drops whatever state was kept for them.
    pub fn chat(&self, session_id: &SessionId) -> Result<Arc<StreamingChat>, ChatError> {
        let ended = self.store.lock().get(session_id).map(|s| s.is_completed);
        match ended {
            None => return Err(ChatError::UnknownSession),
            Some(true) => {
                self.chats.lock().remove(session_id);
                return Err(ChatError::SessionEnded);
            }
            Some(false) => {}
        }
        let mut chats = self.chats.lock();
        let chat = chats.entry(session_id.clone()).or_insert_with(|| {
            let log: Arc<dyn SessionLog> = self.store.clone();
            Arc::new(StreamingChat::new(session_id.clone(), log))
        });
        Ok(Arc::clone(chat))
    }

    /// Send a user message, as a UBTI answer while an interview is running
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        message: &str,
        tone: Tone,
        observer: &mut (dyn StreamConsumer + Send),
    ) -> Result<ExchangeOutcome, ChatError> {
        let kind = if self.chat(session_id)?.ubti().accepts_answers() {
            ExchangeKind::Ubti
        } else {
            ExchangeKind::Chat
        };
        self.run_turn(session_id, kind, message, tone, observer).await
    }

    /// Send an answer to the current UBTI question
    pub async fn send_ubti_answer(
        &self,
        session_id: &SessionId,
        message: &str,
        tone: Tone,
        observer: &mut (dyn StreamConsumer + Send),
    ) -> Result<ExchangeOutcome, ChatError> {
        self.run_turn(session_id, ExchangeKind::Ubti, message, tone, observer)
            .await
    }

    /// Start a UBTI interview, creating a session if none is given
    pub async fn start_ubti(
        &self,
        session_id: Option<&SessionId>,
        tone: Tone,
        observer: &mut (dyn StreamConsumer + Send),
    ) -> Result<(SessionId, ExchangeOutcome), ChatError> {
        let session_id = match session_id {
            Some(id) => id.clone(),
            None => self.create_session(None),
        };
        let chat = self.chat(&session_id)?;
        if chat.is_streaming() {
            return Err(ChatError::TurnInProgress);
        }
        chat.start_ubti();
        tracing::info!(session_id = %session_id, "Starting UBTI interview");

        let outcome = self
            .run_turn(&session_id, ExchangeKind::Ubti, UBTI_KICKOFF_MESSAGE, tone, observer)
            .await?;
        Ok((session_id, outcome))
    }

    /// Ask for recommendations based on liked services
    pub async fn likes_recommendation(
        &self,
        session_id: &SessionId,
        tone: Tone,
        observer: &mut (dyn StreamConsumer + Send),
    ) -> Result<ExchangeOutcome, ChatError> {
        self.run_turn(
            session_id,
            ExchangeKind::LikesRecommendation,
            LIKES_RECOMMENDATION_MESSAGE,
            tone,
            observer,
        )
        .await
    }

    /// Ask for a plan recommendation based on usage
    pub async fn usage_recommendation(
        &self,
        session_id: &SessionId,
        tone: Tone,
        observer: &mut (dyn StreamConsumer + Send),
    ) -> Result<ExchangeOutcome, ChatError> {
        self.run_turn(
            session_id,
            ExchangeKind::UsageRecommendation,
            USAGE_RECOMMENDATION_MESSAGE,
            tone,
            observer,
        )
        .await
    }

    /// Fetch the UBTI result once the interview is ready for submission
    pub async fn fetch_ubti_result(
        &self,
        session_id: &SessionId,
        tone: Tone,
    ) -> Result<UbtiResult, ChatError> {
        let chat = self.chat(session_id)?;
        if chat.ubti().phase() != UbtiPhase::ReadyToSubmit {
            return Err(ChatError::UbtiNotReady);
        }

        let body = serde_json::json!({
            "session_id": session_id.as_str(),
            "tone": tone,
            "message": "",
        });
        let value = self
            .transport
            .post_json(&self.endpoints.ubti_result, &body)
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, error = %e, "UBTI result fetch failed");
                e
            })?;

        if let Err(violation) = chat.ubti().mark_result_fetched() {
            tracing::warn!(session_id = %session_id, violation = %violation, "UBTI flow changed during result fetch");
        }
        tracing::info!(session_id = %session_id, "UBTI result fetched");
        Ok(UbtiResult(value))
    }

    /// Cancel the exchange in flight; returns false if nothing was streaming
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let Some(chat) = self.chats.lock().get(session_id).cloned() else {
            return false;
        };
        match chat.cancel_handle() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Reset the UBTI flow of a session
    pub fn reset_ubti(&self, session_id: &SessionId) -> Result<(), ChatError> {
        self.chat(session_id)?.reset_ubti();
        Ok(())
    }

    /// Clear the card slots of a session
    pub fn reset_cards(&self, session_id: &SessionId) -> Result<(), ChatError> {
        self.chat(session_id)?.reset_cards();
        Ok(())
    }

    /// Cancel the exchange in flight and return the session to idle
    pub fn reset_streaming_state(&self, session_id: &SessionId) -> Result<(), ChatError> {
        self.chat(session_id)?.reset_streaming_state();
        Ok(())
    }

    /// Number of sessions with streaming state held by this client
    #[must_use]
    pub fn chat_count(&self) -> usize {
        self.chats.lock().len()
    }

    /// End a conversation, cancelling its exchange and dropping its state
    ///
    /// Returns false if the session is unknown.
    pub fn end_session(&self, session_id: &SessionId) -> bool {
        let chat = self.chats.lock().remove(session_id);
        if let Some(chat) = chat {
            chat.reset_ubti();
            chat.reset_cards();
            chat.reset_streaming_state();
        }
        self.store.lock().end_session(session_id)
    }

    /// End a conversation and open a new one with the reset greeting
    pub fn reset_chat(&self, session_id: &SessionId) -> SessionId {
        self.end_session(session_id);
        self.create_session(Some(RESET_GREETING))
    }

    async fn run_turn(
        &self,
        session_id: &SessionId,
        kind: ExchangeKind,
        message: &str,
        tone: Tone,
        observer: &mut (dyn StreamConsumer + Send),
    ) -> Result<ExchangeOutcome, ChatError> {
        match self.store.lock().get(session_id) {
            None => return Err(ChatError::UnknownSession),
            Some(session) if session.is_completed => return Err(ChatError::SessionEnded),
            Some(_) => {}
        }

        let chat = self.chat(session_id)?;
        let mut handlers = chat.begin_turn(kind, message)?;
        let cancel = handlers.cancel_handle();
        let exchange = StreamingExchange::with_cancel(cancel.clone());
        let request = if kind.carries_session() {
            ChatRequest::new(session_id.as_str(), message, tone)
        } else {
            ChatRequest::sessionless(message, tone)
        };
        let path = self.endpoints.path(kind);

        tracing::info!(
            session_id = %session_id,
            exchange_id = %exchange.id(),
            kind = %kind,
            transport = self.transport.name(),
            path = %path,
            "Starting exchange"
        );

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            opened = self.transport.open_stream(path, &request) => Some(opened),
        };

        let mut fanout = Fanout {
            handlers: &mut handlers,
            observer,
        };
        let response = match opened {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                tracing::error!(session_id = %session_id, kind = %kind, error = %e, "Exchange could not be opened");
                fanout.on_error(&e);
                return Err(e.into());
            }
            None => {
                let outcome = exchange.into_cancelled();
                handlers.finish(&outcome);
                return Ok(outcome);
            }
        };

        let processor = StreamProcessor::new(self.presets.resolve(kind.preset()));
        let outcome = processor.process(exchange, response, &mut fanout).await?;
        handlers.finish(&outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessTransport, ScriptedResponse};
    use pretty_assertions::assert_eq;

    fn client() -> ChatClient<InProcessTransport> {
        ChatClient::new(
            InProcessTransport::new(),
            Endpoints::default(),
            ThrottlePresets::default(),
        )
    }

    fn answer(text: &str) -> Vec<ProtocolEvent> {
        vec![
            ProtocolEvent::MessageStart,
            ProtocolEvent::MessageChunk {
                content: text.to_string(),
            },
            ProtocolEvent::MessageEnd,
        ]
    }

    fn messages(client: &ChatClient<InProcessTransport>, id: &SessionId) -> Vec<(MessageRole, String)> {
        client
            .store()
            .lock()
            .get(id)
            .unwrap()
            .messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    #[test]
    fn test_exchange_kind_routing() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.path(ExchangeKind::Chat), "/chat");
        assert_eq!(endpoints.path(ExchangeKind::Ubti), "/ubti/question");
        assert_eq!(ExchangeKind::Ubti.preset(), ThrottlePreset::Ubti);
        assert_eq!(
            ExchangeKind::UsageRecommendation.preset(),
            ThrottlePreset::Recommendation
        );
        assert!(ExchangeKind::LikesRecommendation.expects_cards());
        assert!(!ExchangeKind::UsageRecommendation.carries_session());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_turn_logs_both_sides() {
        let client = client();
        let id = client.create_session(Some(GREETING));
        client.transport().push(ScriptedResponse::ndjson(&answer("반가워요")));

        let outcome = client
            .send_message(&id, "안녕", Tone::General, &mut NoopConsumer)
            .await
            .unwrap();

        assert_eq!(outcome.text, "반가워요");
        assert_eq!(
            messages(&client, &id),
            vec![
                (MessageRole::Bot, GREETING.to_string()),
                (MessageRole::User, "안녕".to_string()),
                (MessageRole::Bot, "반가워요".to_string()),
            ]
        );
        let chat = client.chat(&id).unwrap();
        assert_eq!(chat.streaming_state(), StreamingState::Done);
        assert!(!chat.is_streaming());

        let request = &client.transport().requests()[0];
        assert_eq!(request.path, "/chat");
        assert_eq!(request.body["session_id"], id.as_str());
        assert_eq!(request.body["tone"], "general");
    }

    #[tokio::test]
    async fn test_second_turn_rejected_while_streaming() {
        let client = client();
        let id = client.create_session(None);
        let chat = client.chat(&id).unwrap();

        let _first = chat.create_streaming_handlers("one", false).unwrap();
        let second = chat.create_streaming_handlers("two", false);
        assert_eq!(second.unwrap_err(), ChatError::TurnInProgress);
    }

    #[tokio::test]
    async fn test_handlers_release_session_on_drop() {
        let client = client();
        let id = client.create_session(None);
        let chat = client.chat(&id).unwrap();

        drop(chat.create_streaming_handlers("one", false).unwrap());
        assert!(!chat.is_streaming());
        assert!(chat.create_streaming_handlers("two", false).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_and_ended_sessions() {
        let client = client();
        let missing = SessionId::from("missing");
        let err = client
            .send_message(&missing, "hi", Tone::General, &mut NoopConsumer)
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::UnknownSession);

        let id = client.create_session(None);
        let next = client.reset_chat(&id);
        let err = client
            .send_message(&id, "hi", Tone::General, &mut NoopConsumer)
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::SessionEnded);
        assert_eq!(
            messages(&client, &next),
            vec![(MessageRole::Bot, RESET_GREETING.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommendation_cards_fill_slots() {
        let client = client();
        let id = client.create_session(None);
        let plan: Plan = serde_json::from_value(serde_json::json!({
            "id": 1, "name": "5G 프리미어", "price": 85000, "data": "무제한", "voice": "무제한"
        }))
        .unwrap();
        client.transport().push(ScriptedResponse::ndjson(&[
            ProtocolEvent::MessageStart,
            ProtocolEvent::MessageChunk {
                content: "추천드려요".to_string(),
            },
            ProtocolEvent::PlanRecommendations {
                plans: vec![plan.clone()],
            },
            ProtocolEvent::MessageEnd,
        ]));

        client
            .likes_recommendation(&id, Tone::Muneoz, &mut NoopConsumer)
            .await
            .unwrap();

        let view = client.chat(&id).unwrap().view();
        assert_eq!(view.plan_cards, vec![plan]);
        assert!(!view.expecting_cards);

        client.reset_cards(&id).unwrap();
        assert!(client.chat(&id).unwrap().view().plan_cards.is_empty());
    }

    #[tokio::test]
    async fn test_usage_recommendation_is_sessionless() {
        let client = client();
        let id = client.create_session(None);
        client.transport().push(ScriptedResponse::ndjson(&answer("ok")));

        client
            .usage_recommendation(&id, Tone::General, &mut NoopConsumer)
            .await
            .unwrap();

        let request = &client.transport().requests()[0];
        assert_eq!(request.path, "/chat/usage");
        assert!(request.body.get("session_id").is_none());
    }

    #[tokio::test]
    async fn test_failed_open_reports_error() {
        let client = client();
        let id = client.create_session(None);
        client
            .transport()
            .push(ScriptedResponse::ConnectFailure("refused".to_string()));

        let err = client
            .send_message(&id, "hi", Tone::General, &mut NoopConsumer)
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Exchange(ExchangeError::Transport { .. })));
        let view = client.chat(&id).unwrap().view();
        assert_eq!(view.streaming_state, StreamingState::Failed);
        assert!(view.last_error.is_some());
        assert!(!client.chat(&id).unwrap().is_streaming());
    }

    #[tokio::test]
    async fn test_result_fetch_before_ready_is_rejected() {
        let client = client();
        let id = client.create_session(None);
        let err = client.fetch_ubti_result(&id, Tone::General).await.unwrap_err();
        assert_eq!(err, ChatError::UbtiNotReady);
        assert!(client.transport().requests().is_empty());
    }

    #[test]
    fn test_cancel_without_exchange() {
        let client = client();
        let id = client.create_session(None);
        assert!(!client.cancel(&id));
    }

    #[test]
    fn test_failure_logs_text_still_queued_for_pacing() {
        let client = client();
        let id = client.create_session(None);
        let chat = client.chat(&id).unwrap();
        let mut handlers = chat.create_streaming_handlers("질문", false).unwrap();

        handlers.on_chunk(StreamChunk::Event(ProtocolEvent::MessageStart));
        handlers.on_chunk(StreamChunk::Text("첫 답".to_string()));
        handlers.on_chunk(StreamChunk::Event(ProtocolEvent::MessageEnd));
        handlers.on_chunk(StreamChunk::Event(ProtocolEvent::MessageStart));
        handlers.on_chunk(StreamChunk::Text("반쯤".to_string()));
        handlers.on_error(&ExchangeError::MidStreamRead {
            reason: "connection reset".to_string(),
            partial_text: "첫 답반쯤 왔어요".to_string(),
        });

        assert_eq!(
            messages(&client, &id),
            vec![
                (MessageRole::User, "질문".to_string()),
                (MessageRole::Bot, "첫 답".to_string()),
                (MessageRole::Bot, "반쯤 왔어요".to_string()),
            ]
        );
        let view = chat.view();
        assert_eq!(view.streaming_text, "반쯤 왔어요");
        assert_eq!(view.streaming_state, StreamingState::Failed);
    }

    #[test]
    fn test_reset_ubti_detaches_turns_started_before() {
        let client = client();
        let id = client.create_session(None);
        let chat = client.chat(&id).unwrap();

        let mut handlers = chat.create_streaming_handlers("hi", false).unwrap();
        handlers.on_chunk(StreamChunk::Event(ProtocolEvent::QuestionStart));
        assert_eq!(chat.ubti().phase(), UbtiPhase::Active);

        chat.reset_ubti();
        // Chat turns keep streaming, only their UBTI events stop counting
        assert!(!handlers.cancel_handle().is_cancelled());
        handlers.on_chunk(StreamChunk::Event(ProtocolEvent::QuestionContent {
            question: "Q2".to_string(),
            step: 1,
            total_steps: 4,
        }));

        let snapshot = chat.ubti().snapshot();
        assert_eq!(snapshot.phase, UbtiPhase::Idle);
        assert_eq!(snapshot.current_step, -1);
    }

    #[test]
    fn test_reset_ubti_cancels_ubti_turn() {
        let client = client();
        let id = client.create_session(None);
        let chat = client.chat(&id).unwrap();

        let handlers = chat.create_streaming_handlers("A", true).unwrap();
        chat.reset_ubti();
        assert!(handlers.cancel_handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_start_ubti_on_ended_session_keeps_flow() {
        let client = client();
        let id = client.create_session(None);
        let chat = client.chat(&id).unwrap();
        chat.start_ubti();
        chat.ubti().apply(&ProtocolEvent::QuestionContent {
            question: "Q3".to_string(),
            step: 2,
            total_steps: 4,
        });
        client.store().lock().end_session(&id);

        let err = client
            .start_ubti(Some(&id), Tone::General, &mut NoopConsumer)
            .await
            .unwrap_err();

        assert_eq!(err, ChatError::SessionEnded);
        assert_eq!(chat.ubti().snapshot().current_step, 2);
        assert!(client.transport().requests().is_empty());
    }

    #[test]
    fn test_ended_sessions_are_pruned() {
        let client = client();
        let first = client.create_session(None);
        let second = client.create_session(None);
        client.chat(&first).unwrap();
        client.chat(&second).unwrap();
        assert_eq!(client.chat_count(), 2);

        assert!(client.end_session(&first));
        assert_eq!(client.chat_count(), 1);

        // Ended through the shared store, pruned on the next lookup
        client.store().lock().end_session(&second);
        assert_eq!(client.chat(&second).unwrap_err(), ChatError::SessionEnded);
        assert_eq!(client.chat_count(), 0);
        assert!(!client.end_session(&SessionId::from("missing")));
    }
}
