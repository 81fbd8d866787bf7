//! The per-chat call session actor.
//!
//! All call state lives in one task. Commands from the controller handle and
//! events forwarded from store subscriptions, media sessions, and the ring
//! timer arrive over a single queue and are consumed one at a time, so no
//! handler ever observes another handler half-done.
//!
//! Events from a previous call attempt are fenced by an epoch counter:
//! cleanup bumps the epoch, and forwarded events tagged with an older epoch
//! are dropped on receipt.

use super::error::CallError;
use super::notifier::IncomingCallNotifier;
use super::state::{CallPhase, CallTransition, EndReason};
use crate::config::CallConfig;
use crate::media::{LocalMedia, MediaEngine, MediaSession, MediaSessionEvents, MediaStreamHandle};
use crate::store::{
    CallNotification, CallRecord, CallStatus, CandidateRecord, CandidateSide, NotificationEvent,
    SignalingStore, StoreError, SubscriptionGuard,
};
use crate::types::events::{CallEvent, CallNotice};
use crate::types::id::{CallId, NotificationId};
use crate::types::user::{PeerInfo, SessionContext};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(super) enum SessionCommand {
    Initiate {
        respond: oneshot::Sender<Result<(), CallError>>,
    },
    Answer {
        respond: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        respond: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        respond: oneshot::Sender<Result<(), CallError>>,
    },
    Dispose,
}

/// Everything that can reach the session task.
#[derive(Debug)]
pub(super) enum SessionInput {
    Command(SessionCommand),
    CallUpdated { epoch: u64, record: CallRecord },
    CandidateAdded { epoch: u64, candidate: CandidateRecord },
    RemoteMedia { epoch: u64, handle: MediaStreamHandle },
    Notification(NotificationEvent),
    PromptTimeout { notif_id: NotificationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

/// Resources held while a call attempt is live. Torn down as a unit.
struct ActiveCall {
    call_id: CallId,
    /// The ring notification, if it may still exist on the channel.
    notif_id: Option<NotificationId>,
    role: Role,
    media: Box<dyn MediaSession>,
    local: Box<dyn LocalMedia>,
    /// Remote candidates may only be applied once this is true; earlier
    /// arrivals wait in `pending_candidates`.
    remote_description_set: bool,
    pending_candidates: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
    guards: Vec<SubscriptionGuard>,
}

pub(super) struct CallSession {
    store: Arc<dyn SignalingStore>,
    media: Arc<dyn MediaEngine>,
    ctx: SessionContext,
    peer: PeerInfo,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    input_rx: mpsc::UnboundedReceiver<SessionInput>,
    phase: CallPhase,
    phase_tx: watch::Sender<CallPhase>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    notifier: IncomingCallNotifier,
    active: Option<ActiveCall>,
    epoch: u64,
}

impl CallSession {
    pub(super) fn spawn(
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaEngine>,
        ctx: SessionContext,
        peer: PeerInfo,
        config: CallConfig,
    ) -> (
        mpsc::UnboundedSender<SessionInput>,
        watch::Receiver<CallPhase>,
        mpsc::UnboundedReceiver<CallEvent>,
        JoinHandle<()>,
    ) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(CallPhase::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = CallSession {
            notifier: IncomingCallNotifier::new(config.ring_timeout),
            store,
            media,
            ctx,
            peer,
            input_tx: input_tx.clone(),
            input_rx,
            phase: CallPhase::Idle,
            phase_tx,
            events_tx,
            active: None,
            epoch: 0,
        };
        let task = tokio::spawn(session.run());
        (input_tx, phase_rx, events_rx, task)
    }

    async fn run(mut self) {
        let incoming = self.store.subscribe_incoming(&self.ctx.user_id).await;
        let (incoming_rx, _incoming_guard) = incoming.into_parts();
        let incoming_task = self.spawn_forwarder(incoming_rx, SessionInput::Notification);

        while let Some(input) = self.input_rx.recv().await {
            match input {
                SessionInput::Command(SessionCommand::Dispose) => break,
                SessionInput::Command(SessionCommand::Initiate { respond }) => {
                    let result = self.handle_initiate().await;
                    let _ = respond.send(result);
                }
                SessionInput::Command(SessionCommand::Answer { respond }) => {
                    let result = self.handle_answer().await;
                    let _ = respond.send(result);
                }
                SessionInput::Command(SessionCommand::Decline { respond }) => {
                    let result = self.handle_decline().await;
                    let _ = respond.send(result);
                }
                SessionInput::Command(SessionCommand::HangUp { respond }) => {
                    let result = self.handle_hang_up().await;
                    let _ = respond.send(result);
                }
                SessionInput::CallUpdated { epoch, record } => {
                    self.on_call_updated(epoch, record).await;
                }
                SessionInput::CandidateAdded { epoch, candidate } => {
                    self.on_candidate(epoch, candidate).await;
                }
                SessionInput::RemoteMedia { epoch, handle } => {
                    if epoch == self.epoch {
                        self.emit(CallEvent::RemoteMedia(handle));
                    }
                }
                SessionInput::Notification(event) => {
                    self.on_notification(event).await;
                }
                SessionInput::PromptTimeout { notif_id } => {
                    self.on_prompt_timeout(notif_id).await;
                }
            }
        }

        // Disposed mid-call: leave the call on the channel too, best-effort.
        if self.phase.in_call() {
            if let Err(err) = self.handle_hang_up().await {
                debug!("hang-up on dispose failed: {err}");
            }
        }
        self.cleanup().await;
        incoming_task.abort();
    }

    async fn handle_initiate(&mut self) -> Result<(), CallError> {
        if !self.phase.is_idle() || self.active.is_some() || self.notifier.has_prompt() {
            return Err(CallError::CallInProgress);
        }

        let local = match self.media.capture_local().await {
            Ok(local) => local,
            Err(err) => {
                self.emit(CallEvent::Notice(CallNotice::MediaAccessDenied));
                return Err(err.into());
            }
        };
        // Release the capture devices unless the whole setup sequence lands.
        let local = scopeguard::guard(local, |mut local| local.stop());

        let (mut media, events) = self.media.create_session(local.as_ref()).await?;

        let offer = match media.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                media.close().await;
                return Err(err.into());
            }
        };

        let call_id = CallId::generate();
        let notif_id = NotificationId::generate();
        let record = CallRecord::new(
            call_id.clone(),
            self.ctx.user_id.clone(),
            self.peer.user_id.clone(),
            offer,
            Some(notif_id.clone()),
        );
        let notification = CallNotification::ring(
            notif_id.clone(),
            self.peer.user_id.clone(),
            call_id.clone(),
            self.ctx.user_id.clone(),
            self.ctx.display_name.clone(),
        );

        // One batch: the callee never sees a ring without its call record.
        if let Err(err) = self.store.create_call(record, notification).await {
            media.close().await;
            self.emit(CallEvent::Notice(CallNotice::SignalingFailed(
                err.to_string(),
            )));
            return Err(err.into());
        }

        info!(
            "outgoing call {call_id} from {} to {}",
            self.ctx.user_id, self.peer.user_id
        );

        let (tasks, guards) = self
            .open_call_subscriptions(&call_id, CandidateSide::Answer, CandidateSide::Offer, events)
            .await;

        self.active = Some(ActiveCall {
            call_id,
            notif_id: Some(notif_id),
            role: Role::Caller,
            media,
            local: scopeguard::ScopeGuard::into_inner(local),
            remote_description_set: false,
            pending_candidates: Vec::new(),
            tasks,
            guards,
        });
        self.transition(CallTransition::OutgoingStarted)
    }

    async fn handle_answer(&mut self) -> Result<(), CallError> {
        if !self.phase.can_accept() {
            return Err(CallError::NoLongerAvailable);
        }
        let Some(prompt) = self.notifier.clear() else {
            return Err(CallError::NoLongerAvailable);
        };
        let call_id = prompt.call_id;
        let notif_id = prompt.notif_id;

        // Capture first: a denied permission prompt declines the call.
        let local = match self.media.capture_local().await {
            Ok(local) => local,
            Err(err) => {
                self.write_decline(&call_id, Some(notif_id)).await;
                self.emit(CallEvent::Notice(CallNotice::MediaAccessDenied));
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::MediaDenied,
                })
                .await;
                return Err(err.into());
            }
        };
        let local = scopeguard::guard(local, |mut local| local.stop());

        // The record may have been resolved while the prompt was ringing
        // (caller hung up, another device answered).
        let record = match self.store.get_call(&call_id).await {
            Ok(Some(record)) if record.status == CallStatus::Pending => record,
            Ok(_) => {
                self.emit(CallEvent::Notice(CallNotice::CallUnavailable));
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::Unavailable,
                })
                .await;
                return Err(CallError::NoLongerAvailable);
            }
            Err(err) => {
                self.emit(CallEvent::Notice(CallNotice::SignalingFailed(
                    err.to_string(),
                )));
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::Unavailable,
                })
                .await;
                return Err(err.into());
            }
        };

        let (mut media, events) = match self.media.create_session(local.as_ref()).await {
            Ok(pair) => pair,
            Err(err) => {
                self.write_decline(&call_id, Some(notif_id)).await;
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::MediaDenied,
                })
                .await;
                return Err(err.into());
            }
        };

        let answer = match async {
            media.set_remote_description(&record.offer).await?;
            media.create_answer().await
        }
        .await
        {
            Ok(answer) => answer,
            Err(err) => {
                media.close().await;
                self.write_decline(&call_id, Some(notif_id)).await;
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::MediaDenied,
                })
                .await;
                return Err(err.into());
            }
        };

        // Answer and notification removal land atomically, guarded against
        // a record that stopped being pending since the get above.
        match self
            .store
            .set_answer(&call_id, answer, Some(notif_id.clone()))
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotPending) => {
                media.close().await;
                self.emit(CallEvent::Notice(CallNotice::CallUnavailable));
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::Unavailable,
                })
                .await;
                return Err(CallError::NoLongerAvailable);
            }
            Err(err) => {
                media.close().await;
                self.write_decline(&call_id, Some(notif_id)).await;
                self.emit(CallEvent::Notice(CallNotice::SignalingFailed(
                    err.to_string(),
                )));
                self.finish(CallTransition::LocalDeclined {
                    reason: EndReason::Unavailable,
                })
                .await;
                return Err(err.into());
            }
        }

        info!("answered call {call_id} from {}", record.caller_id);

        // The remote description is already applied, so offer-side
        // candidates can flow straight into the media session. Entries
        // published before this point are replayed by the subscription.
        let (tasks, guards) = self
            .open_call_subscriptions(&call_id, CandidateSide::Offer, CandidateSide::Answer, events)
            .await;

        self.active = Some(ActiveCall {
            call_id,
            notif_id: None,
            role: Role::Callee,
            media,
            local: scopeguard::ScopeGuard::into_inner(local),
            remote_description_set: true,
            pending_candidates: Vec::new(),
            tasks,
            guards,
        });
        self.transition(CallTransition::LocalAccepted)
    }

    async fn handle_decline(&mut self) -> Result<(), CallError> {
        let Some(prompt) = self.notifier.clear() else {
            return Err(CallError::NoLongerAvailable);
        };
        info!("declined call {} from {}", prompt.call_id, prompt.caller_id);
        self.write_decline(&prompt.call_id, Some(prompt.notif_id)).await;
        self.finish(CallTransition::LocalDeclined {
            reason: EndReason::Declined,
        })
        .await;
        Ok(())
    }

    async fn handle_hang_up(&mut self) -> Result<(), CallError> {
        if self.phase.is_idle() {
            return Ok(());
        }
        if self.phase.can_accept() {
            // Ringing but unanswered: same as a decline.
            return self.handle_decline().await;
        }
        let (call_id, notif_id) = match self.active.as_mut() {
            Some(active) => (active.call_id.clone(), active.notif_id.take()),
            None => return Ok(()),
        };
        // Deleting the ring notification in the same batch withdraws an
        // unanswered call; if it was already removed the delete is a no-op.
        if let Err(err) = self
            .store
            .set_status(&call_id, CallStatus::Ended, notif_id)
            .await
        {
            warn!("failed to write hang-up for call {call_id}: {err}");
            self.emit(CallEvent::Notice(CallNotice::SignalingFailed(
                err.to_string(),
            )));
        }
        self.finish(CallTransition::HungUp).await;
        Ok(())
    }

    async fn on_call_updated(&mut self, epoch: u64, record: CallRecord) {
        if epoch != self.epoch {
            return;
        }
        if record.status.is_terminal() {
            let reason = if record.status == CallStatus::Declined {
                EndReason::RemoteDeclined
            } else {
                EndReason::RemoteEnded
            };
            info!("call {} resolved remotely: {}", record.id, record.status);
            self.finish(CallTransition::RemoteEnded { reason }).await;
            return;
        }

        let mut answered = false;
        let mut failed = false;
        if let (Some(active), Some(answer)) = (self.active.as_mut(), record.answer.as_ref()) {
            if active.role == Role::Caller && !active.remote_description_set {
                match active.media.set_remote_description(answer).await {
                    Ok(()) => {
                        active.remote_description_set = true;
                        for payload in std::mem::take(&mut active.pending_candidates) {
                            if let Err(err) = active.media.add_remote_candidate(&payload).await {
                                warn!("failed to apply buffered candidate: {err}");
                            }
                        }
                        answered = true;
                    }
                    Err(err) => {
                        warn!("failed to apply answer for call {}: {err}", active.call_id);
                        failed = true;
                    }
                }
            }
        }

        if failed {
            if let Some(call_id) = self.active.as_ref().map(|a| a.call_id.clone()) {
                if let Err(err) = self.store.set_status(&call_id, CallStatus::Ended, None).await {
                    warn!("failed to end unanswerable call {call_id}: {err}");
                }
            }
            self.finish(CallTransition::RemoteEnded {
                reason: EndReason::Unavailable,
            })
            .await;
        } else if answered {
            if let Err(err) = self.transition(CallTransition::RemoteAnswered) {
                warn!("answer observed in unexpected phase: {err}");
            }
        }
    }

    async fn on_candidate(&mut self, epoch: u64, candidate: CandidateRecord) {
        if epoch != self.epoch {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.remote_description_set {
            if let Err(err) = active.media.add_remote_candidate(&candidate.payload).await {
                warn!(
                    "failed to apply remote candidate for call {}: {err}",
                    active.call_id
                );
            }
        } else {
            active.pending_candidates.push(candidate.payload);
        }
    }

    async fn on_notification(&mut self, event: NotificationEvent) {
        match event {
            NotificationEvent::Added(notif) => {
                if !self.phase.is_idle() {
                    // Busy: the ring is never surfaced. The caller keeps
                    // ringing until their own timeout or hang-up.
                    debug!(
                        "suppressing incoming call {} while in phase {:?}",
                        notif.call_id, self.phase
                    );
                    return;
                }
                info!("incoming call {} from {}", notif.call_id, notif.caller_id);
                let prompt = self.notifier.surface(&notif, self.input_tx.clone());
                if let Err(err) = self.transition(CallTransition::IncomingObserved) {
                    warn!("could not surface incoming call: {err}");
                    self.notifier.clear();
                    return;
                }
                self.emit(CallEvent::IncomingCall(prompt));
            }
            NotificationEvent::Removed(notif_id) => {
                if let Some(prompt) = self.notifier.withdraw_if(&notif_id) {
                    info!("incoming call {} withdrawn by caller", prompt.call_id);
                    self.emit(CallEvent::PromptWithdrawn {
                        notif_id: prompt.notif_id,
                    });
                    self.finish(CallTransition::RemoteEnded {
                        reason: EndReason::Withdrawn,
                    })
                    .await;
                }
            }
        }
    }

    async fn on_prompt_timeout(&mut self, notif_id: NotificationId) {
        let Some(prompt) = self.notifier.withdraw_if(&notif_id) else {
            return;
        };
        info!("incoming call {} rang out unanswered", prompt.call_id);
        self.write_decline(&prompt.call_id, Some(prompt.notif_id.clone()))
            .await;
        self.emit(CallEvent::PromptWithdrawn {
            notif_id: prompt.notif_id,
        });
        self.finish(CallTransition::LocalDeclined {
            reason: EndReason::TimedOut,
        })
        .await;
    }

    /// Subscriptions and pumps for one call attempt: record updates, the
    /// peer's candidate sequence, our candidate publisher, and the remote
    /// media stream. All tagged with the current epoch.
    async fn open_call_subscriptions(
        &self,
        call_id: &CallId,
        consume_side: CandidateSide,
        publish_side: CandidateSide,
        events: MediaSessionEvents,
    ) -> (Vec<JoinHandle<()>>, Vec<SubscriptionGuard>) {
        let epoch = self.epoch;
        let mut tasks = Vec::new();
        let mut guards = Vec::new();

        let (rx, guard) = self.store.subscribe_call(call_id).await.into_parts();
        tasks.push(self.spawn_forwarder(rx, move |record| SessionInput::CallUpdated {
            epoch,
            record,
        }));
        guards.push(guard);

        let (rx, guard) = self
            .store
            .subscribe_candidates(call_id, consume_side)
            .await
            .into_parts();
        tasks.push(
            self.spawn_forwarder(rx, move |candidate| SessionInput::CandidateAdded {
                epoch,
                candidate,
            }),
        );
        guards.push(guard);

        tasks.push(self.spawn_candidate_pump(call_id.clone(), publish_side, events.local_candidates));
        tasks.push(
            self.spawn_forwarder(events.remote_media, move |handle| SessionInput::RemoteMedia {
                epoch,
                handle,
            }),
        );

        (tasks, guards)
    }

    fn spawn_forwarder<T, F>(&self, mut rx: mpsc::UnboundedReceiver<T>, map: F) -> JoinHandle<()>
    where
        T: Send + 'static,
        F: Fn(T) -> SessionInput + Send + 'static,
    {
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if input_tx.send(map(item)).is_err() {
                    break;
                }
            }
        })
    }

    /// Publishes locally discovered candidates to our side's sequence.
    fn spawn_candidate_pump(
        &self,
        call_id: CallId,
        side: CandidateSide,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(err) = store
                    .append_candidate(&call_id, side, CandidateRecord::new(payload))
                    .await
                {
                    warn!("failed to publish candidate for call {call_id}: {err}");
                    let _ = events_tx.send(CallEvent::Notice(CallNotice::SignalingFailed(
                        err.to_string(),
                    )));
                }
            }
        })
    }

    async fn write_decline(&self, call_id: &CallId, notif_id: Option<NotificationId>) {
        if let Err(err) = self
            .store
            .set_status(call_id, CallStatus::Declined, notif_id)
            .await
        {
            warn!("failed to write decline for call {call_id}: {err}");
            self.emit(CallEvent::Notice(CallNotice::SignalingFailed(
                err.to_string(),
            )));
        }
    }

    /// Apply a terminal transition, then tear the call down. The `Ended`
    /// phase is published before cleanup resets to `Idle`.
    async fn finish(&mut self, transition: CallTransition) {
        if let Err(err) = self.transition(transition) {
            debug!("terminal transition on inactive session: {err}");
        }
        self.cleanup().await;
    }

    /// Release everything held for the current attempt. Idempotent; always
    /// lands on `Idle`. The epoch bump fences out events still in flight
    /// from the attempt being torn down.
    async fn cleanup(&mut self) {
        self.epoch += 1;
        self.notifier.clear();
        if let Some(mut active) = self.active.take() {
            for task in active.tasks.drain(..) {
                task.abort();
            }
            active.guards.clear();
            active.media.close().await;
            active.local.stop();
        }
        if !self.phase.is_idle() {
            self.set_phase(CallPhase::Idle);
        }
    }

    fn transition(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let next = self.phase.apply_transition(transition)?;
        self.set_phase(next);
        Ok(())
    }

    fn set_phase(&mut self, phase: CallPhase) {
        debug!(
            "{}: call phase {:?} -> {:?}",
            self.ctx.user_id, self.phase, phase
        );
        self.phase = phase.clone();
        let _ = self.phase_tx.send(phase.clone());
        self.emit(CallEvent::PhaseChanged(phase));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events_tx.send(event);
    }
}
