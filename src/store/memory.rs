//! In-memory signaling store, used by tests and the demo binary.
//!
//! Mutations are applied before listeners are notified, so no subscriber
//! ever observes a partially applied batch. Observers of *different*
//! collections may see the two halves of a batch in either order; the batch
//! guarantee is that the writes fail or succeed together.

use super::error::{Result, StoreError};
use super::records::{
    CallNotification, CallRecord, CallStatus, CandidateRecord, CandidateSide, NotificationStatus,
    SessionDescription,
};
use super::traits::{NotificationEvent, SignalingStore, Subscription, SubscriptionGuard};
use crate::types::id::{CallId, NotificationId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

struct Watcher<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

/// Send to every live watcher, pruning the ones whose receiver is gone.
fn dispatch<T: Clone>(watchers: &mut Vec<Watcher<T>>, item: &T) {
    watchers.retain(|w| w.tx.send(item.clone()).is_ok());
}

#[derive(Default)]
struct CallSlot {
    record: Option<CallRecord>,
    watchers: Vec<Watcher<CallRecord>>,
}

#[derive(Default)]
struct CandidateSeq {
    entries: Vec<CandidateRecord>,
    watchers: Vec<Watcher<CandidateRecord>>,
}

#[derive(Default)]
struct Inbox {
    items: Vec<CallNotification>,
    watchers: Vec<Watcher<NotificationEvent>>,
}

#[derive(Default)]
struct StoreInner {
    calls: DashMap<CallId, CallSlot>,
    candidates: DashMap<(CallId, CandidateSide), CandidateSeq>,
    inboxes: DashMap<UserId, Inbox>,
    notif_index: DashMap<NotificationId, UserId>,
    next_watcher: AtomicU64,
    fail_next_write: AtomicBool,
    fail_next_read: AtomicBool,
}

/// Reference [`SignalingStore`] backend over shared in-process maps.
///
/// Cloning is cheap; clones share the same collections, so one instance can
/// serve both peers of a call in tests.
#[derive(Clone, Default)]
pub struct MemorySignalingStore {
    inner: Arc<StoreInner>,
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write operation fail with a backend error. The write
    /// is rejected before any mutation, matching the all-or-nothing batch
    /// contract.
    pub fn fail_next_write(&self) {
        self.inner.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Make the next read operation fail with a backend error.
    pub fn fail_next_read(&self) {
        self.inner.fail_next_read.store(true, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.inner
            .calls
            .iter()
            .filter(|slot| slot.record.is_some())
            .count()
    }

    pub fn notification_count(&self) -> usize {
        self.inner.notif_index.len()
    }

    pub fn candidate_count(&self, call_id: &CallId, side: CandidateSide) -> usize {
        self.inner
            .candidates
            .get(&(call_id.clone(), side))
            .map(|seq| seq.entries.len())
            .unwrap_or(0)
    }

    fn check_write(&self) -> Result<()> {
        if self.inner.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.inner.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected read failure".into()));
        }
        Ok(())
    }

    fn next_watcher_id(&self) -> u64 {
        self.inner.next_watcher.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_notification(&self, notif_id: &NotificationId) {
        if let Some((_, user_id)) = self.inner.notif_index.remove(notif_id) {
            if let Some(mut inbox) = self.inner.inboxes.get_mut(&user_id) {
                inbox.items.retain(|n| n.id != *notif_id);
                dispatch(
                    &mut inbox.watchers,
                    &NotificationEvent::Removed(notif_id.clone()),
                );
            }
        }
    }

    #[cfg(test)]
    fn candidate_watcher_count(&self, call_id: &CallId, side: CandidateSide) -> usize {
        self.inner
            .candidates
            .get(&(call_id.clone(), side))
            .map(|seq| seq.watchers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn create_call(&self, call: CallRecord, notification: CallNotification) -> Result<()> {
        self.check_write()?;

        let mut slot = self.inner.calls.entry(call.id.clone()).or_default();
        if slot.record.is_some() {
            return Err(StoreError::AlreadyExists(call.id.to_string()));
        }
        trace!("create call {} ({} -> {})", call.id, call.caller_id, call.callee_id);
        slot.record = Some(call.clone());
        dispatch(&mut slot.watchers, &call);
        drop(slot);

        self.inner
            .notif_index
            .insert(notification.id.clone(), notification.user_id.clone());
        let mut inbox = self
            .inner
            .inboxes
            .entry(notification.user_id.clone())
            .or_default();
        inbox.items.push(notification.clone());
        dispatch(&mut inbox.watchers, &NotificationEvent::Added(notification));
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        self.check_read()?;
        Ok(self
            .inner
            .calls
            .get(call_id)
            .and_then(|slot| slot.record.clone()))
    }

    async fn set_answer(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
        delete_notification: Option<NotificationId>,
    ) -> Result<()> {
        self.check_write()?;

        let mut slot = self
            .inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        let record = slot
            .record
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        if record.status != CallStatus::Pending {
            return Err(StoreError::NotPending);
        }
        record.answer = Some(answer);
        record.status = CallStatus::Active;
        let updated = record.clone();
        dispatch(&mut slot.watchers, &updated);
        drop(slot);

        if let Some(notif_id) = delete_notification {
            self.remove_notification(&notif_id);
        }
        Ok(())
    }

    async fn set_status(
        &self,
        call_id: &CallId,
        status: CallStatus,
        delete_notification: Option<NotificationId>,
    ) -> Result<()> {
        self.check_write()?;

        let mut slot = self
            .inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        let record = slot
            .record
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(call_id.to_string()))?;
        // Terminal statuses are final: a concurrent second terminal write
        // keeps the first one.
        if !record.status.is_terminal() {
            record.status = status;
            let updated = record.clone();
            dispatch(&mut slot.watchers, &updated);
        }
        drop(slot);

        if let Some(notif_id) = delete_notification {
            self.remove_notification(&notif_id);
        }
        Ok(())
    }

    async fn append_candidate(
        &self,
        call_id: &CallId,
        side: CandidateSide,
        candidate: CandidateRecord,
    ) -> Result<()> {
        self.check_write()?;

        let mut seq = self
            .inner
            .candidates
            .entry((call_id.clone(), side))
            .or_default();
        seq.entries.push(candidate.clone());
        dispatch(&mut seq.watchers, &candidate);
        Ok(())
    }

    async fn delete_notification(&self, notif_id: &NotificationId) -> Result<()> {
        self.check_write()?;
        self.remove_notification(notif_id);
        Ok(())
    }

    async fn subscribe_call(&self, call_id: &CallId) -> Subscription<CallRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher_id();

        let mut slot = self.inner.calls.entry(call_id.clone()).or_default();
        if let Some(record) = &slot.record {
            let _ = tx.send(record.clone());
        }
        slot.watchers.push(Watcher { id, tx });
        drop(slot);

        let inner = Arc::clone(&self.inner);
        let key = call_id.clone();
        let guard = SubscriptionGuard::new(move || {
            if let Some(mut slot) = inner.calls.get_mut(&key) {
                slot.watchers.retain(|w| w.id != id);
            }
        });
        Subscription::new(rx, guard)
    }

    async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        side: CandidateSide,
    ) -> Subscription<CandidateRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher_id();

        let mut seq = self
            .inner
            .candidates
            .entry((call_id.clone(), side))
            .or_default();
        for entry in &seq.entries {
            let _ = tx.send(entry.clone());
        }
        seq.watchers.push(Watcher { id, tx });
        drop(seq);

        let inner = Arc::clone(&self.inner);
        let key = (call_id.clone(), side);
        let guard = SubscriptionGuard::new(move || {
            if let Some(mut seq) = inner.candidates.get_mut(&key) {
                seq.watchers.retain(|w| w.id != id);
            }
        });
        Subscription::new(rx, guard)
    }

    async fn subscribe_incoming(&self, user_id: &UserId) -> Subscription<NotificationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher_id();

        let mut inbox = self.inner.inboxes.entry(user_id.clone()).or_default();
        for item in &inbox.items {
            if item.status == NotificationStatus::Pending {
                let _ = tx.send(NotificationEvent::Added(item.clone()));
            }
        }
        inbox.watchers.push(Watcher { id, tx });
        drop(inbox);

        let inner = Arc::clone(&self.inner);
        let key = user_id.clone();
        let guard = SubscriptionGuard::new(move || {
            if let Some(mut inbox) = inner.inboxes.get_mut(&key) {
                inbox.watchers.retain(|w| w.id != id);
            }
        });
        Subscription::new(rx, guard)
    }
}
