//! Incoming-call prompt lifecycle.

use super::session::SessionInput;
use crate::store::CallNotification;
use crate::types::events::IncomingCallPrompt;
use crate::types::id::NotificationId;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Holds at most one live incoming-call prompt and its ring timer.
///
/// The timer fires back into the session's input queue, so a timeout is
/// handled in line with every other event rather than racing them.
pub(super) struct IncomingCallNotifier {
    ring_timeout: Duration,
    prompt: Option<IncomingCallPrompt>,
    timer: Option<JoinHandle<()>>,
}

impl IncomingCallNotifier {
    pub(super) fn new(ring_timeout: Duration) -> Self {
        Self {
            ring_timeout,
            prompt: None,
            timer: None,
        }
    }

    /// Turn a pending notification into a live prompt and start its ring
    /// timer. Replaces any previous prompt.
    pub(super) fn surface(
        &mut self,
        notif: &CallNotification,
        input_tx: mpsc::UnboundedSender<SessionInput>,
    ) -> IncomingCallPrompt {
        self.clear();
        let prompt = IncomingCallPrompt {
            call_id: notif.call_id.clone(),
            notif_id: notif.id.clone(),
            caller_id: notif.caller_id.clone(),
            caller_name: notif.caller_name.clone(),
            received_at: Utc::now(),
        };
        let notif_id = prompt.notif_id.clone();
        let ring_timeout = self.ring_timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            let _ = input_tx.send(SessionInput::PromptTimeout { notif_id });
        }));
        self.prompt = Some(prompt.clone());
        prompt
    }

    /// Remove the prompt if it is bound to `notif_id`, stopping its timer.
    pub(super) fn withdraw_if(&mut self, notif_id: &NotificationId) -> Option<IncomingCallPrompt> {
        if self
            .prompt
            .as_ref()
            .is_some_and(|p| &p.notif_id == notif_id)
        {
            self.clear()
        } else {
            None
        }
    }

    pub(super) fn has_prompt(&self) -> bool {
        self.prompt.is_some()
    }

    /// Drop the prompt and abort the ring timer. Idempotent.
    pub(super) fn clear(&mut self) -> Option<IncomingCallPrompt> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.prompt.take()
    }
}
