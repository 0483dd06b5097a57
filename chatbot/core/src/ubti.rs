//! UBTI Flow State Machine
//!
//! Tracks one guided-question interview across the sequence of turns that
//! make it up.
//!
//! ```text
//!          start / question_start
//!   Idle ─────────────────────────► Active(step, total, question)
//!    ▲                                 │ question_content (step = n)
//!    │ reset                           │ questions_complete
//!    │                                 ▼
//!    ├──────────────────────────── ReadyToSubmit
//!    │                                 │ result fetched / ubti_complete
//!    │                                 ▼
//!    └──────────────────────────── Completed
//! ```
//!
//! The flow outlives any single exchange and is fed only from the processor's
//! delivery callbacks. Events that contradict the recorded state are reported
//! as [`StateViolation`]s and applied as received; nothing is rolled back.
//!
//! Watchers subscribe to a `tokio::sync::watch` feed of [`UbtiSnapshot`]s.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::StateViolation;
use crate::protocol::ProtocolEvent;

/// Interview phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UbtiPhase {
    /// No interview running
    #[default]
    Idle,
    /// Questions are being asked
    Active,
    /// Enough answers gathered; result not requested yet
    ReadyToSubmit,
    /// Result delivered
    Completed,
}

impl UbtiPhase {
    /// Phase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::ReadyToSubmit => "ready_to_submit",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for UbtiPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable UBTI state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UbtiSnapshot {
    /// Current question step (-1 = not started)
    pub current_step: i32,
    /// Number of questions in the interview (0 until known)
    pub total_steps: u32,
    /// Question being asked
    pub current_question_text: Option<String>,
    /// Answers gathered, result may be requested
    pub ready_to_submit: bool,
    /// An interview is running
    pub in_progress: bool,
    /// Phase
    pub phase: UbtiPhase,
}

impl Default for UbtiSnapshot {
    fn default() -> Self {
        Self {
            current_step: -1,
            total_steps: 0,
            current_question_text: None,
            ready_to_submit: false,
            in_progress: false,
            phase: UbtiPhase::Idle,
        }
    }
}

impl UbtiSnapshot {
    /// `"{step}/{total}"` (1-based) while questions are being asked
    #[must_use]
    pub fn progress_label(&self) -> Option<String> {
        (self.phase == UbtiPhase::Active && self.current_step >= 0 && self.total_steps > 0)
            .then(|| format!("{}/{}", self.current_step + 1, self.total_steps))
    }
}

/// The UBTI interview state of one chat session
#[derive(Debug)]
pub struct UbtiFlow {
    state: watch::Sender<UbtiSnapshot>,
}

impl Default for UbtiFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl UbtiFlow {
    /// Create an idle flow
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(UbtiSnapshot::default());
        Self { state }
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> UbtiSnapshot {
        self.state.borrow().clone()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> UbtiPhase {
        self.state.borrow().phase
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UbtiSnapshot> {
        self.state.subscribe()
    }

    /// Whether a plain user message should be treated as an interview answer
    #[must_use]
    pub fn accepts_answers(&self) -> bool {
        let state = self.state.borrow();
        state.in_progress && state.current_step >= 0
    }

    /// Begin a fresh interview at step 0, discarding any previous one
    pub fn start(&self) {
        self.state.send_replace(Self::started());
        tracing::debug!("UBTI flow started");
    }

    /// Return to idle unconditionally
    pub fn reset(&self) {
        self.state.send_replace(UbtiSnapshot::default());
        tracing::debug!("UBTI flow reset");
    }

    /// Record that the result was fetched (`ReadyToSubmit -> Completed`)
    pub fn mark_result_fetched(&self) -> Result<(), StateViolation> {
        let phase = self.phase();
        if phase != UbtiPhase::ReadyToSubmit {
            return Err(StateViolation::UnexpectedEvent {
                phase,
                event: "result_fetched",
            });
        }
        self.state.send_modify(Self::complete);
        Ok(())
    }

    /// Feed one delivered event
    ///
    /// Non-UBTI events are ignored. A returned violation has been logged and
    /// the event applied regardless, except in phases where it has no meaning.
    pub fn apply(&self, event: &ProtocolEvent) -> Option<StateViolation> {
        let mut violation = None;

        self.state.send_if_modified(|state| match event {
            ProtocolEvent::QuestionStart => match state.phase {
                UbtiPhase::Idle => {
                    *state = Self::started();
                    true
                }
                UbtiPhase::Active => false,
                phase => {
                    violation = Some(StateViolation::UnexpectedEvent {
                        phase,
                        event: event.kind(),
                    });
                    false
                }
            },

            ProtocolEvent::QuestionContent {
                question,
                step,
                total_steps,
            } => {
                match state.phase {
                    UbtiPhase::Idle => *state = Self::started(),
                    UbtiPhase::Active => {}
                    phase => {
                        violation = Some(StateViolation::UnexpectedEvent {
                            phase,
                            event: event.kind(),
                        });
                        return false;
                    }
                }

                if *step < state.current_step {
                    violation = Some(StateViolation::StepRegressed {
                        previous: state.current_step,
                        received: *step,
                    });
                } else if *step < 0 || (*total_steps > 0 && *step as u32 >= *total_steps) {
                    violation = Some(StateViolation::StepOutOfRange {
                        step: *step,
                        total_steps: *total_steps,
                    });
                }

                state.current_step = *step;
                state.total_steps = *total_steps;
                state.current_question_text = Some(question.clone());
                true
            }

            ProtocolEvent::QuestionsComplete => match state.phase {
                UbtiPhase::Idle | UbtiPhase::Active => {
                    if state.phase == UbtiPhase::Idle {
                        violation = Some(StateViolation::UnexpectedEvent {
                            phase: state.phase,
                            event: event.kind(),
                        });
                    }
                    state.phase = UbtiPhase::ReadyToSubmit;
                    state.ready_to_submit = true;
                    state.in_progress = true;
                    state.current_question_text = None;
                    true
                }
                UbtiPhase::ReadyToSubmit | UbtiPhase::Completed => false,
            },

            ProtocolEvent::UbtiComplete => match state.phase {
                UbtiPhase::Completed => false,
                UbtiPhase::ReadyToSubmit => {
                    Self::complete(state);
                    true
                }
                phase @ (UbtiPhase::Idle | UbtiPhase::Active) => {
                    violation = Some(StateViolation::UnexpectedEvent {
                        phase,
                        event: event.kind(),
                    });
                    Self::complete(state);
                    true
                }
            },

            _ => false,
        });

        if let Some(v) = &violation {
            let state = self.state.borrow();
            tracing::warn!(
                kind = event.kind(),
                step = state.current_step,
                phase = %state.phase,
                violation = %v,
                "UBTI state violation"
            );
        } else if event.is_ubti() {
            let state = self.state.borrow();
            tracing::debug!(
                kind = event.kind(),
                step = state.current_step,
                total_steps = state.total_steps,
                phase = %state.phase,
                "UBTI state updated"
            );
        }

        violation
    }

    fn started() -> UbtiSnapshot {
        UbtiSnapshot {
            current_step: 0,
            in_progress: true,
            phase: UbtiPhase::Active,
            ..UbtiSnapshot::default()
        }
    }

    fn complete(state: &mut UbtiSnapshot) {
        state.phase = UbtiPhase::Completed;
        state.ready_to_submit = true;
        state.in_progress = false;
        state.current_question_text = None;
    }
}
