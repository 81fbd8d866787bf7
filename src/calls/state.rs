//! Call phase state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a call left the non-idle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local hang-up.
    UserEnded,
    /// The other side hung up (observed via the call record).
    RemoteEnded,
    /// Local decline of an incoming call.
    Declined,
    /// The other side declined our call.
    RemoteDeclined,
    /// Local capture failed, call auto-declined.
    MediaDenied,
    /// The call record was already resolved when we tried to act on it.
    Unavailable,
    /// The caller withdrew the ring before we answered.
    Withdrawn,
    /// The incoming-call prompt expired without action.
    TimedOut,
}

/// Current phase of the per-chat call session.
///
/// `Ended` is transient: cleanup always follows and resets the phase to
/// `Idle`.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Caller: offer published, waiting for the callee's answer.
    Calling { offer_sent_at: DateTime<Utc> },
    /// Callee: incoming call surfaced, waiting for local accept/decline.
    Receiving { received_at: DateTime<Utc> },
    /// Both descriptions exchanged, media flowing.
    Connected { connected_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
    },
}

impl CallPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// In a call or negotiating one.
    pub fn in_call(&self) -> bool {
        matches!(
            self,
            Self::Calling { .. } | Self::Receiving { .. } | Self::Connected { .. }
        )
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Receiving { .. })
    }

    /// Apply a transition. Returns an error if the transition is not legal
    /// from the current phase.
    pub fn apply_transition(&self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        let next = match (self, transition) {
            (CallPhase::Idle, CallTransition::OutgoingStarted) => CallPhase::Calling {
                offer_sent_at: Utc::now(),
            },
            (CallPhase::Idle, CallTransition::IncomingObserved) => CallPhase::Receiving {
                received_at: Utc::now(),
            },
            (CallPhase::Calling { .. }, CallTransition::RemoteAnswered) => CallPhase::Connected {
                connected_at: Utc::now(),
            },
            (CallPhase::Receiving { .. }, CallTransition::LocalAccepted) => CallPhase::Connected {
                connected_at: Utc::now(),
            },
            (CallPhase::Receiving { .. }, CallTransition::LocalDeclined { reason }) => {
                CallPhase::Ended {
                    reason,
                    ended_at: Utc::now(),
                }
            }
            (
                CallPhase::Calling { .. } | CallPhase::Receiving { .. } | CallPhase::Connected { .. },
                CallTransition::RemoteEnded { reason },
            ) => CallPhase::Ended {
                reason,
                ended_at: Utc::now(),
            },
            (
                CallPhase::Calling { .. } | CallPhase::Receiving { .. } | CallPhase::Connected { .. },
                CallTransition::HungUp,
            ) => CallPhase::Ended {
                reason: EndReason::UserEnded,
                ended_at: Utc::now(),
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

/// State transitions driven by user actions and channel observations.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Offer written, ring started (caller side).
    OutgoingStarted,
    /// The notifier surfaced an incoming call while idle (callee side).
    IncomingObserved,
    /// The subscribed call record carries a non-empty answer.
    RemoteAnswered,
    /// Local accept completed (answer written).
    LocalAccepted,
    LocalDeclined { reason: EndReason },
    /// Terminal status observed on the call record.
    RemoteEnded { reason: EndReason },
    HungUp,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}
