//! Wire Protocol
//!
//! Records streamed by the chat server, one JSON object per frame. Every record
//! carries a `type` tag that selects its shape:
//!
//! ```text
//! { "type": "message_start" }
//! { "type": "message_chunk", "content": "<text>" }
//! { "type": "message_end" }
//! { "type": "plan_recommendations", "plans": [ ... ] }
//! { "type": "subscription_recommendations", "subscriptions": [ ... ] }
//! { "type": "usage_analysis", "data": { ... } }
//! { "type": "question_start" }
//! { "type": "question_content", "question": "<text>", "step": 0, "total_steps": 4 }
//! { "type": "question_end" }
//! { "type": "questions_complete" }
//! { "type": "ubti_complete" }
//! ```
//!
//! Also holds the request body sent to open a streaming exchange.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Protocol Events
// ============================================================================

/// A single decoded protocol record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Beginning of a natural-language answer
    MessageStart,

    /// Text delta appended to the answer
    MessageChunk {
        /// The delta text
        content: String,
    },

    /// The natural-language answer is complete
    MessageEnd,

    /// Plan recommendation cards
    PlanRecommendations {
        /// Plans in display order
        plans: Vec<Plan>,
    },

    /// Subscription recommendation cards
    SubscriptionRecommendations {
        /// Recommended items in display order
        #[serde(rename = "subscriptions")]
        items: Vec<SubscriptionItem>,
    },

    /// Usage analysis card
    UsageAnalysis {
        /// Current usage of the user's plan
        data: UsageSnapshot,
    },

    /// A UBTI question is about to be streamed
    QuestionStart,

    /// The text of the current UBTI question
    QuestionContent {
        /// Question text
        question: String,
        /// Zero-based index of this question
        step: i32,
        /// Number of questions in the interview
        total_steps: u32,
    },

    /// The current UBTI question is finished
    QuestionEnd,

    /// Every UBTI question has been answered
    QuestionsComplete,

    /// The UBTI session is finished server-side
    UbtiComplete,
}

impl ProtocolEvent {
    /// Every `type` tag this protocol understands
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "message_start",
        "message_chunk",
        "message_end",
        "plan_recommendations",
        "subscription_recommendations",
        "usage_analysis",
        "question_start",
        "question_content",
        "question_end",
        "questions_complete",
        "ubti_complete",
    ];

    /// Wire tag of this event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::MessageChunk { .. } => "message_chunk",
            Self::MessageEnd => "message_end",
            Self::PlanRecommendations { .. } => "plan_recommendations",
            Self::SubscriptionRecommendations { .. } => "subscription_recommendations",
            Self::UsageAnalysis { .. } => "usage_analysis",
            Self::QuestionStart => "question_start",
            Self::QuestionContent { .. } => "question_content",
            Self::QuestionEnd => "question_end",
            Self::QuestionsComplete => "questions_complete",
            Self::UbtiComplete => "ubti_complete",
        }
    }

    /// Whether `tag` names a known record type
    #[must_use]
    pub fn is_known_type(tag: &str) -> bool {
        Self::KNOWN_TYPES.contains(&tag)
    }

    /// Text delta content, if this is a chunk
    #[must_use]
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::MessageChunk { content } => Some(content),
            _ => None,
        }
    }

    /// Start/end markers of the answer text
    ///
    /// These travel in order with text slices so that a consumer never sees the
    /// end marker before the text it closes.
    #[must_use]
    pub fn is_message_marker(&self) -> bool {
        matches!(self, Self::MessageStart | Self::MessageEnd)
    }

    /// Card payloads (plans, subscriptions, usage)
    #[must_use]
    pub fn is_card(&self) -> bool {
        matches!(
            self,
            Self::PlanRecommendations { .. }
                | Self::SubscriptionRecommendations { .. }
                | Self::UsageAnalysis { .. }
        )
    }

    /// UBTI question framing and completion events
    #[must_use]
    pub fn is_ubti(&self) -> bool {
        matches!(
            self,
            Self::QuestionStart
                | Self::QuestionContent { .. }
                | Self::QuestionEnd
                | Self::QuestionsComplete
                | Self::UbtiComplete
        )
    }

    /// Everything that is neither answer text nor an answer marker
    #[must_use]
    pub fn is_structured(&self) -> bool {
        !matches!(self, Self::MessageChunk { .. }) && !self.is_message_marker()
    }
}

/// What a consumer receives: a paced text slice or any other event
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    /// Slice of answer text, released by the throttle
    Text(String),
    /// Any event other than a text delta
    Event(ProtocolEvent),
}

impl StreamChunk {
    /// Wire tag of the underlying event (`message_chunk` for text)
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "message_chunk",
            Self::Event(event) => event.kind(),
        }
    }

    /// The text slice, if this is text
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Event(_) => None,
        }
    }
}

// ============================================================================
// Card Payloads
// ============================================================================

/// A recommended mobile plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier
    pub id: i64,
    /// Display name
    pub name: String,
    /// Monthly price
    pub price: i64,
    /// Data allowance, as displayed
    pub data: String,
    /// Voice allowance, as displayed
    pub voice: String,
    /// Throttled speed after the allowance is spent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    /// Tethering / sharing allowance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_data: Option<String>,
    /// SMS allowance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<String>,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// A main (OTT / media) subscription
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainSubscription {
    /// Subscription identifier
    pub id: i64,
    /// Display title
    pub title: String,
    /// Monthly price
    pub price: i64,
    /// Category label
    pub category: String,
    /// Logo / artwork
    pub image_url: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// A lifestyle brand partnership
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeBrand {
    /// Brand identifier
    pub id: i64,
    /// Display name
    pub name: String,
    /// Logo / artwork
    pub image_url: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Category label
    #[serde(default)]
    pub category: String,
}

/// One entry of a subscription recommendation, discriminated by its `type` tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionItem {
    /// `"type": "main_subscription"`
    MainSubscription(MainSubscription),
    /// `"type": "life_brand"`
    LifeBrand(LifeBrand),
}

/// Subscription cards as a UI shows them: at most one of each kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCards {
    /// First main subscription in the recommendation
    pub main_subscription: Option<MainSubscription>,
    /// First life brand in the recommendation
    pub life_brand: Option<LifeBrand>,
}

impl SubscriptionCards {
    /// Group a recommendation into cards, keeping the first item of each kind
    #[must_use]
    pub fn from_items(items: &[SubscriptionItem]) -> Self {
        let mut cards = Self::default();
        for item in items {
            match item {
                SubscriptionItem::MainSubscription(main) if cards.main_subscription.is_none() => {
                    cards.main_subscription = Some(main.clone());
                }
                SubscriptionItem::LifeBrand(brand) if cards.life_brand.is_none() => {
                    cards.life_brand = Some(brand.clone());
                }
                _ => {}
            }
        }
        cards
    }

    /// Whether neither card is present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.main_subscription.is_none() && self.life_brand.is_none()
    }
}

/// Remaining allowances of the user's current plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// User identifier
    pub user_id: i64,
    /// Current plan name
    pub current_plan: String,
    /// Current plan price
    pub current_price: i64,
    /// Remaining data
    pub remaining_data: f64,
    /// Remaining voice minutes
    pub remaining_voice: f64,
    /// Remaining SMS count
    pub remaining_sms: f64,
    /// Share of the allowance already used (0-100)
    pub usage_percentage: f64,
}

// ============================================================================
// Requests
// ============================================================================

/// Response style requested from the server
///
/// Forwarded verbatim; the engine never interprets it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    /// Neutral style
    #[default]
    General,
    /// Casual "muneoz" persona
    Muneoz,
}

impl Tone {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Muneoz => "muneoz",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(Self::General),
            "muneoz" => Ok(Self::Muneoz),
            other => Err(format!("unknown tone '{other}' (expected general or muneoz)")),
        }
    }
}

/// Body of a streaming request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Server-side session, absent for session-less turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The user's message (empty for result fetches)
    pub message: String,
    /// Response style
    pub tone: Tone,
}

impl ChatRequest {
    /// Request bound to a session
    pub fn new(session_id: impl Into<String>, message: impl Into<String>, tone: Tone) -> Self {
        Self {
            session_id: Some(session_id.into()),
            message: message.into(),
            tone,
        }
    }

    /// Request without a session
    pub fn sessionless(message: impl Into<String>, tone: Tone) -> Self {
        Self {
            session_id: None,
            message: message.into(),
            tone,
        }
    }
}
