//! Document types exchanged over the signaling channel.
//!
//! Field names serialize in camelCase to match the documents the web client
//! reads and writes.

use crate::types::id::{CallId, NotificationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a call record.
///
/// Monotonic: `Pending -> Active -> Ended`, or `Pending -> Declined`. There
/// is no transition out of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Active,
    Ended,
    Declined,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Declined => "declined",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Opaque descriptor of a media session's parameters. Passed through to the
/// underlying negotiation transport unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// The signaling channel's representation of one call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    /// Set exactly once, at creation, by the caller.
    pub offer: SessionDescription,
    /// Set exactly once, by the callee, only while `status` is pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    pub status: CallStatus,
    /// Back-reference to the associated notification record, for cleanup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notif_id: Option<NotificationId>,
}

impl CallRecord {
    pub fn new(
        id: CallId,
        caller_id: UserId,
        callee_id: UserId,
        offer: SessionDescription,
        notif_id: Option<NotificationId>,
    ) -> Self {
        Self {
            id,
            caller_id,
            callee_id,
            offer,
            answer: None,
            status: CallStatus::Pending,
            notif_id,
        }
    }
}

/// One side's candidate sequence within a call.
///
/// The caller appends to the offer sequence, the callee to the answer
/// sequence; each side consumes the other's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSide {
    Offer,
    Answer,
}

impl fmt::Display for CandidateSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// Opaque connectivity descriptor, exchanged incrementally. Order within a
/// sequence carries no meaning beyond arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub payload: String,
}

impl CandidateRecord {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Answered,
}

/// Ephemeral record that rings the callee: associates a target user with a
/// pending call id. Deleted when the call is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNotification {
    pub id: NotificationId,
    /// Target user.
    pub user_id: UserId,
    pub call_id: CallId,
    pub caller_id: UserId,
    pub caller_name: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl CallNotification {
    pub fn ring(
        id: NotificationId,
        user_id: UserId,
        call_id: CallId,
        caller_id: UserId,
        caller_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            call_id,
            caller_id,
            caller_name: caller_name.into(),
            status: NotificationStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_record_serializes_like_the_web_documents() {
        let record = CallRecord::new(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            UserId::new("alice"),
            UserId::new("bob"),
            SessionDescription::offer("v=0"),
            Some(NotificationId::new("n1")),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["callerId"], "alice");
        assert_eq!(json["calleeId"], "bob");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["notifId"], "n1");
        assert!(json.get("answer").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Pending.is_terminal());
        assert!(!CallStatus::Active.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
    }
}
