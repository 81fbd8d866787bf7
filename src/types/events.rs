//! Events surfaced by the call controller to the presentation layer.

use super::id::{CallId, NotificationId, UserId};
use crate::calls::state::CallPhase;
use crate::media::MediaStreamHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// An actionable incoming-call prompt, bound to one call attempt.
///
/// Carries everything the UI needs to render accept/decline and everything
/// the controller needs to resolve the call afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCallPrompt {
    pub call_id: CallId,
    pub notif_id: NotificationId,
    pub caller_id: UserId,
    pub caller_name: String,
    pub received_at: DateTime<Utc>,
}

/// Transient, toast-style notices. Failures never propagate past the
/// controller; the UI only ever observes the phase plus these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallNotice {
    /// Camera/microphone permission denied or device unavailable.
    MediaAccessDenied,
    /// The call was resolved or removed before we could act on it.
    CallUnavailable,
    /// A signaling write failed; local call state was not advanced past it.
    SignalingFailed(String),
}

/// Events delivered to the UI alongside the phase watch channel.
#[derive(Debug, Clone, Serialize)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    IncomingCall(IncomingCallPrompt),
    /// The pending prompt's notification disappeared (e.g. the caller hung
    /// up before being answered). The prompt must be dismissed unactioned.
    PromptWithdrawn { notif_id: NotificationId },
    /// The remote party's media stream became available.
    RemoteMedia(MediaStreamHandle),
    Notice(CallNotice),
}
