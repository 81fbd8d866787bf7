//! Public handle to a per-chat call session.

use super::error::CallError;
use super::session::{CallSession, SessionCommand, SessionInput};
use super::state::CallPhase;
use crate::config::CallConfig;
use crate::media::MediaEngine;
use crate::store::SignalingStore;
use crate::types::events::CallEvent;
use crate::types::user::{PeerInfo, SessionContext};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Controls calling within one two-person chat.
///
/// Cheap to keep around while the chat is open: the session task it fronts
/// idles on its input queue between calls. All methods are safe to call in
/// any phase; out-of-place requests fail with a [`CallError`] instead of
/// disturbing the session.
pub struct CallController {
    input_tx: mpsc::UnboundedSender<SessionInput>,
    phase_rx: watch::Receiver<CallPhase>,
    peer: PeerInfo,
    task: Option<JoinHandle<()>>,
}

impl CallController {
    /// Start a session for the chat with `peer`. The returned receiver
    /// carries [`CallEvent`]s for the presentation layer; dropping it only
    /// discards events, never stalls the session.
    pub fn new(
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaEngine>,
        ctx: SessionContext,
        peer: PeerInfo,
        config: CallConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (input_tx, phase_rx, events_rx, task) =
            CallSession::spawn(store, media, ctx, peer.clone(), config);
        (
            Self {
                input_tx,
                phase_rx,
                peer,
                task: Some(task),
            },
            events_rx,
        )
    }

    /// Start an outgoing call to the peer.
    pub async fn initiate(&self) -> Result<(), CallError> {
        self.request(|respond| SessionCommand::Initiate { respond })
            .await
    }

    /// Accept the currently ringing incoming call.
    pub async fn answer(&self) -> Result<(), CallError> {
        self.request(|respond| SessionCommand::Answer { respond })
            .await
    }

    /// Decline the currently ringing incoming call.
    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|respond| SessionCommand::Decline { respond })
            .await
    }

    /// Leave the current call (or withdraw an unanswered outgoing one).
    /// A no-op when no call is in progress.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|respond| SessionCommand::HangUp { respond })
            .await
    }

    pub fn phase(&self) -> CallPhase {
        self.phase_rx.borrow().clone()
    }

    /// A watch on the call phase, for `wait_for`-style observation.
    pub fn phase_watch(&self) -> watch::Receiver<CallPhase> {
        self.phase_rx.clone()
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Shut the session down, hanging up first if a call is in progress,
    /// and wait for it to finish.
    pub async fn dispose(mut self) {
        let _ = self
            .input_tx
            .send(SessionInput::Command(SessionCommand::Dispose));
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), CallError>>) -> SessionCommand,
    ) -> Result<(), CallError> {
        let (respond, response) = oneshot::channel();
        self.input_tx
            .send(SessionInput::Command(make(respond)))
            .map_err(|_| CallError::Disposed)?;
        response.await.map_err(|_| CallError::Disposed)?
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        // Covers handles dropped without an explicit dispose.
        if self.task.is_some() {
            let _ = self
                .input_tx
                .send(SessionInput::Command(SessionCommand::Dispose));
        }
    }
}
