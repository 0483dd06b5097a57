//! Chatbot Core - Headless Streaming Chat and UBTI Interview Engine
//!
//! This crate turns the chat server's streamed replies into paced, typed
//! output for any UI surface, and keeps the per-session state of a multi-step
//! UBTI interview. It has no terminal or UI dependencies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     UI Surface (CLI, tests)                      │
//! │            StreamConsumer ▲           │ send_message / start_ubti │
//! └───────────────────────────┼───────────┼───────────────────────────┘
//!                             │           ▼
//! ┌───────────────────────────┼──────────────────────────────────────┐
//! │                      CHATBOT CORE                                │
//! │  ┌────────────────────────┴───────────────────────────────────┐  │
//! │  │ ChatClient ── StreamingChat (cards, state) ── UbtiFlow     │  │
//! │  │      │              ▲ TurnHandlers                         │  │
//! │  │      ▼              │                                      │  │
//! │  │ StreamTransport ─► StreamProcessor                         │  │
//! │  │   (reqwest)          ├─ FrameReader / FrameDecoder (NDJSON) │  │
//! │  │                      └─ StreamingThrottle (pacing)          │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │  SessionStore (message log)          ChatbotConfig (TOML + env)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatClient`]: Drives turns for explicit sessions against a transport
//! - [`StreamProcessor`]: Runs one exchange through decoder and throttle
//! - [`FrameDecoder`]: Carry buffer turning raw bytes into [`ProtocolEvent`]s
//! - [`StreamingThrottle`]: Paces text, releases cards immediately
//! - [`UbtiFlow`]: UBTI interview state machine with a watch feed
//!
//! # Quick Start
//!
//! ```ignore
//! use chatbot_core::{load_config, ChatClient, HttpTransport, NoopConsumer};
//!
//! let config = load_config()?;
//! let transport = HttpTransport::new(&config.base_url, config.connect_timeout)?;
//! let client = ChatClient::new(transport, config.endpoints.clone(), config.throttle);
//!
//! let session = client.create_session(None);
//! let outcome = client
//!     .send_message(&session, "요금제 추천해줘", config.tone, &mut NoopConsumer)
//!     .await?;
//! println!("{}", outcome.text);
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: Wire records, cards and the request body
//! - [`frame`]: Newline-delimited record framing over a byte stream
//! - [`throttle`]: Pacing configuration, presets and the throttle
//! - [`processor`]: One exchange end-to-end
//! - [`ubti`]: UBTI interview state
//! - [`session`]: Sessions and the message log
//! - [`chat`]: Turn orchestration and per-session streaming state
//! - [`transport`]: HTTP and in-process transports
//! - [`config`]: TOML and environment configuration
//! - [`error`]: Error types

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod chat;
pub mod config;
pub mod error;
pub mod frame;
pub mod processor;
pub mod protocol;
pub mod session;
pub mod throttle;
pub mod transport;
pub mod ubti;

pub use chat::{
    ChatClient, ChatView, Endpoints, ExchangeKind, NoopConsumer, StreamingChat, StreamingState,
    TurnHandlers, UbtiResult,
};
pub use config::{load_config, load_config_from_path, ChatbotConfig, ConfigError, ConfigOverrides};
pub use error::{BodyError, ChatError, ExchangeError, FrameError, StateViolation};
pub use frame::{FrameDecoder, FrameReader};
pub use processor::{
    ExchangeId, ExchangeOutcome, ExchangeStats, ExchangeStatus, StreamConsumer, StreamProcessor,
    StreamingExchange,
};
pub use protocol::{
    ChatRequest, LifeBrand, MainSubscription, Plan, ProtocolEvent, StreamChunk, SubscriptionCards,
    SubscriptionItem, Tone, UsageSnapshot,
};
pub use session::{ChatMessage, ChatSession, MessageRole, SessionId, SessionLog, SessionStore};
pub use throttle::{StreamingThrottle, ThrottleConfig, ThrottlePreset, ThrottlePresets};
pub use transport::{HttpTransport, InProcessTransport, ResponseHandle, ScriptedResponse, StreamTransport};
pub use ubti::{UbtiFlow, UbtiPhase, UbtiSnapshot};
