//! The signaling channel abstraction over the external document store.
//!
//! The backing store is expected to offer document CRUD with atomic batches
//! (multiple writes across collections succeed or fail together) and
//! snapshot subscriptions. The trait below is domain-shaped: every
//! multi-collection operation here maps to one such batch.

use super::error::Result;
use super::records::{
    CallNotification, CallRecord, CallStatus, CandidateRecord, CandidateSide, SessionDescription,
};
use crate::types::id::{CallId, NotificationId, UserId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Runs the backend-specific unsubscribe when dropped.
pub struct SubscriptionGuard(Option<Box<dyn FnOnce() + Send + Sync>>);

impl SubscriptionGuard {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(unsubscribe)))
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

/// A live query subscription: the current result set is delivered first,
/// then incremental changes, until the subscription is dropped.
///
/// Dropping the subscription (or the receiver half after `into_parts`) is
/// the unsubscribe.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    guard: SubscriptionGuard,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, guard: SubscriptionGuard) -> Self {
        Self { rx, guard }
    }

    /// Receive the next item. `None` means the backend closed the stream.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Split into the receiver and the unsubscribe guard, so the receiver
    /// can be moved into a forwarding task while the guard's owner controls
    /// the subscription lifetime.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<T>, SubscriptionGuard) {
        (self.rx, self.guard)
    }
}

/// Change events for the incoming-call notification query.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    /// A notification is in (or entered) the pending result set.
    Added(CallNotification),
    /// A notification left the result set (deleted or resolved).
    Removed(NotificationId),
}

/// The persistent, queryable store both peers share to exchange session
/// descriptions and connectivity candidates.
///
/// Writes are asynchronous and non-blocking; callers react to completion
/// via the returned future, never by polling. Subscription streams are
/// independent of each other: no cross-stream ordering is guaranteed.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Create the call record and the callee's incoming-call notification
    /// in one atomic batch.
    async fn create_call(&self, call: CallRecord, notification: CallNotification) -> Result<()>;

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>>;

    /// Write `{answer, status: active}` and delete the notification in one
    /// atomic batch. Fails with [`StoreError::NotPending`] unless the
    /// record's current status is `pending` — the guard against answering a
    /// call that was already resolved.
    ///
    /// [`StoreError::NotPending`]: super::error::StoreError::NotPending
    async fn set_answer(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
        delete_notification: Option<NotificationId>,
    ) -> Result<()>;

    /// Write a terminal status, optionally deleting the associated
    /// notification in the same batch. Writing a terminal status over an
    /// existing terminal status is a no-op (first writer wins).
    async fn set_status(
        &self,
        call_id: &CallId,
        status: CallStatus,
        delete_notification: Option<NotificationId>,
    ) -> Result<()>;

    /// Append one entry to a call's offer- or answer-candidate sequence.
    async fn append_candidate(
        &self,
        call_id: &CallId,
        side: CandidateSide,
        candidate: CandidateRecord,
    ) -> Result<()>;

    /// Delete a notification record. Deleting an absent record is not an
    /// error.
    async fn delete_notification(&self, notif_id: &NotificationId) -> Result<()>;

    /// Subscribe to updates of one call record. The current record (if any)
    /// is delivered first, then every subsequent update.
    async fn subscribe_call(&self, call_id: &CallId) -> Subscription<CallRecord>;

    /// Subscribe to one candidate sequence. Existing entries are delivered
    /// first, then each append; every entry is delivered exactly once per
    /// subscription.
    async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        side: CandidateSide,
    ) -> Subscription<CandidateRecord>;

    /// Subscribe to pending incoming-call notifications addressed to a
    /// user. Existing pending notifications arrive as `Added`, followed by
    /// incremental `Added`/`Removed` events.
    async fn subscribe_incoming(&self, user_id: &UserId) -> Subscription<NotificationEvent>;
}
