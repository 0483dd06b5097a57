//! Error Types
//!
//! Exchange-level failures are surfaced exactly once to the caller. Frame-level
//! failures are absorbed by the decoder (logged and skipped), and UBTI state
//! violations are reported but never roll state back.

use std::fmt;

use thiserror::Error;

use crate::ubti::UbtiPhase;

/// Terminal failure of one streaming exchange
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// The request could not be sent or no response arrived
    #[error("request failed: {reason}")]
    Transport {
        /// Underlying transport failure
        reason: String,
    },

    /// The server answered with a non-2xx status
    #[error("server returned {status}: {body}")]
    ProtocolStatus {
        /// HTTP status code
        status: u16,
        /// Raw response body, kept as diagnostic text
        body: String,
    },

    /// The connection dropped after part of the answer arrived
    #[error("stream interrupted: {reason}")]
    MidStreamRead {
        /// Underlying read failure
        reason: String,
        /// Answer text accumulated before the failure
        partial_text: String,
    },
}

impl ExchangeError {
    /// Text accumulated before the failure, if any was preserved
    #[must_use]
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Self::MidStreamRead { partial_text, .. } if !partial_text.is_empty() => {
                Some(partial_text)
            }
            _ => None,
        }
    }

    /// HTTP status, for status failures
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ProtocolStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure while reading a response body
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BodyError(pub String);

impl BodyError {
    /// Wrap any displayable failure
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// A single record that could not be turned into a protocol event
///
/// Never fails an exchange.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The record is not valid JSON or does not match its declared shape
    #[error("invalid JSON record: {0}")]
    InvalidJson(String),

    /// The record has no string `type` field
    #[error("record has no type tag")]
    MissingType,

    /// The `type` tag is not one this client understands
    #[error("unknown record type '{0}'")]
    UnknownType(String),

    /// The record bytes are not valid UTF-8
    #[error("record is not valid UTF-8")]
    InvalidUtf8,
}

/// A UBTI event inconsistent with the recorded interview state
///
/// Reported and logged; the event is still applied as received.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StateViolation {
    /// A question arrived with a lower step than the last one recorded
    #[error("question step regressed from {previous} to {received}")]
    StepRegressed {
        /// Last recorded step
        previous: i32,
        /// Step carried by the event
        received: i32,
    },

    /// A question step outside `0..total_steps`
    #[error("question step {step} outside 0..{total_steps}")]
    StepOutOfRange {
        /// Step carried by the event
        step: i32,
        /// Total carried by the event
        total_steps: u32,
    },

    /// An event that makes no sense in the current phase
    #[error("unexpected '{event}' while {phase}")]
    UnexpectedEvent {
        /// Phase at the time of the event
        phase: UbtiPhase,
        /// Event kind
        event: &'static str,
    },
}

/// Failure of a chat orchestration call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    /// The session already has an exchange streaming
    #[error("a reply is still streaming for this session")]
    TurnInProgress,

    /// The session was ended and accepts no more turns
    #[error("session has ended")]
    SessionEnded,

    /// No session with that ID
    #[error("unknown session")]
    UnknownSession,

    /// The UBTI result was requested before all questions were answered
    #[error("UBTI interview is not ready for submission")]
    UbtiNotReady,

    /// The exchange itself failed
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
