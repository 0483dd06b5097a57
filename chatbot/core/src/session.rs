//! Session Management
//!
//! Chat sessions and their message log.
//!
//! # Design Philosophy
//!
//! A session is one conversation with the bot. Sessions are addressed by an
//! explicit [`SessionId`] handle passed into every streaming entry point;
//! there is no ambient "current session". The streaming engine writes to the
//! log only through the [`SessionLog`] trait, so any store can sit behind it.
//!
//! An ended session keeps its history but accepts no new turns.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("session_{}", Uuid::new_v4().simple()))
    }

    /// The ID as sent on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Who wrote a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The person chatting
    User,
    /// The assistant
    Bot,
}

/// A message in the conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was created (Unix timestamp ms)
    pub timestamp: u64,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }
}

/// A conversation session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSession {
    /// Unique session ID
    pub id: SessionId,
    /// Conversation history
    pub messages: Vec<ChatMessage>,
    /// Whether the session has ended
    pub is_completed: bool,
    /// When the session was created (Unix timestamp ms)
    pub created_at: u64,
    /// When the session was last written (Unix timestamp ms)
    pub last_active_at: u64,
}

impl ChatSession {
    /// Create an empty session
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        let now = now_ms();
        Self {
            id,
            messages: Vec::new(),
            is_completed: false,
            created_at: now,
            last_active_at: now,
        }
    }

    /// Append a message
    pub fn push(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
        self.last_active_at = now_ms();
    }

    /// The most recent message
    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// Writer for the session message log
pub trait SessionLog: Send + Sync {
    /// Append a message to a session; unknown or ended sessions are ignored
    fn append(&self, session_id: &SessionId, text: &str, role: MessageRole);
}

/// In-memory session store
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<SessionId, ChatSession>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its ID
    pub fn create_session(&mut self) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(id.clone(), ChatSession::new(id.clone()));
        tracing::debug!(session_id = %id, "Session created");
        id
    }

    /// Append a message; returns false if the session is unknown or ended
    pub fn add_message(&mut self, session_id: &SessionId, content: impl Into<String>, role: MessageRole) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) if !session.is_completed => {
                session.push(role, content);
                true
            }
            Some(_) => {
                tracing::warn!(session_id = %session_id, "Message for ended session dropped");
                false
            }
            None => {
                tracing::warn!(session_id = %session_id, "Message for unknown session dropped");
                false
            }
        }
    }

    /// Mark a session as ended; returns false if it is unknown
    pub fn end_session(&mut self, session_id: &SessionId) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.is_completed = true;
                tracing::debug!(session_id = %session_id, messages = session.messages.len(), "Session ended");
                true
            }
            None => false,
        }
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<&ChatSession> {
        self.sessions.get(session_id)
    }

    /// Whether a session exists and accepts turns
    #[must_use]
    pub fn is_open(&self, session_id: &SessionId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| !s.is_completed)
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionLog for Mutex<SessionStore> {
    fn append(&self, session_id: &SessionId, text: &str, role: MessageRole) {
        self.lock().add_message(session_id, text, role);
    }
}

/// Get current time in milliseconds
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
