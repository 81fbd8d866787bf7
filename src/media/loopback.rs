//! In-process fake media engine for tests and the demo binary.

use super::{
    LocalMedia, MediaEngine, MediaError, MediaSession, MediaSessionEvents, MediaStreamHandle,
};
use crate::store::{DescriptionKind, SessionDescription};
use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Fake media engine: fabricated session descriptions, a configurable
/// number of connectivity candidates per side, and counters that let tests
/// assert on resource release and candidate application.
pub struct LoopbackMediaEngine {
    deny_capture: AtomicBool,
    candidate_count: usize,
    live_captures: Arc<AtomicUsize>,
    candidates_applied: Arc<AtomicUsize>,
    next_capture: AtomicUsize,
}

impl Default for LoopbackMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMediaEngine {
    pub fn new() -> Self {
        Self::with_candidates(3)
    }

    pub fn with_candidates(candidate_count: usize) -> Self {
        Self {
            deny_capture: AtomicBool::new(false),
            candidate_count,
            live_captures: Arc::new(AtomicUsize::new(0)),
            candidates_applied: Arc::new(AtomicUsize::new(0)),
            next_capture: AtomicUsize::new(0),
        }
    }

    /// Make subsequent `capture_local` calls fail as if the user denied
    /// the permission prompt.
    pub fn deny_capture(&self, deny: bool) {
        self.deny_capture.store(deny, Ordering::SeqCst);
    }

    /// Number of captures currently held (not yet stopped).
    pub fn live_captures(&self) -> usize {
        self.live_captures.load(Ordering::SeqCst)
    }

    /// Total remote candidates applied across all sessions.
    pub fn candidates_applied(&self) -> usize {
        self.candidates_applied.load(Ordering::SeqCst)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidate_count
    }
}

struct LoopbackTracks {
    handle: MediaStreamHandle,
    stopped: bool,
    live: Arc<AtomicUsize>,
}

impl LocalMedia for LoopbackTracks {
    fn handle(&self) -> MediaStreamHandle {
        self.handle.clone()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for LoopbackTracks {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopbackSession {
    id: String,
    candidate_count: usize,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    remote_announced: bool,
    closed: bool,
    candidates_tx: Option<mpsc::UnboundedSender<String>>,
    remote_tx: Option<mpsc::UnboundedSender<MediaStreamHandle>>,
    applied: Arc<AtomicUsize>,
}

impl LoopbackSession {
    fn emit_local_candidates(&mut self) {
        if let Some(tx) = &self.candidates_tx {
            for i in 0..self.candidate_count {
                let _ = tx.send(format!("candidate:{}:{}", self.id, i));
            }
        }
    }

    fn maybe_announce_remote(&mut self) {
        if self.remote_announced || self.local_desc.is_none() || self.remote_desc.is_none() {
            return;
        }
        self.remote_announced = true;
        if let Some(tx) = self.remote_tx.take() {
            let _ = tx.send(MediaStreamHandle::new(format!("loopback-remote-{}", self.id)));
        }
    }

    fn fail_if_closed(&self) -> Result<(), MediaError> {
        if self.closed {
            return Err(MediaError::Session("session closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for LoopbackSession {
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        self.fail_if_closed()?;
        let desc = SessionDescription::offer(format!("v=0 loopback session {}", self.id));
        self.local_desc = Some(desc.clone());
        self.emit_local_candidates();
        self.maybe_announce_remote();
        Ok(desc)
    }

    async fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.fail_if_closed()?;
        if self.remote_desc.is_some() {
            return Err(MediaError::Session("remote description already set".into()));
        }
        self.remote_desc = Some(desc.clone());
        self.maybe_announce_remote();
        Ok(())
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        self.fail_if_closed()?;
        let remote = self
            .remote_desc
            .as_ref()
            .ok_or_else(|| MediaError::Session("no remote description".into()))?;
        if remote.kind != DescriptionKind::Offer {
            return Err(MediaError::Session("remote description is not an offer".into()));
        }
        let desc = SessionDescription::answer(format!("v=0 loopback session {}", self.id));
        self.local_desc = Some(desc.clone());
        self.emit_local_candidates();
        self.maybe_announce_remote();
        Ok(desc)
    }

    async fn add_remote_candidate(&mut self, _payload: &str) -> Result<(), MediaError> {
        self.fail_if_closed()?;
        if self.remote_desc.is_none() {
            return Err(MediaError::Session(
                "candidate added before remote description".into(),
            ));
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.candidates_tx = None;
        self.remote_tx = None;
    }
}

#[async_trait]
impl MediaEngine for LoopbackMediaEngine {
    async fn capture_local(&self) -> Result<Box<dyn LocalMedia>, MediaError> {
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(MediaError::AccessDenied);
        }
        let n = self.next_capture.fetch_add(1, Ordering::SeqCst);
        self.live_captures.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackTracks {
            handle: MediaStreamHandle::new(format!("loopback-local-{n}")),
            stopped: false,
            live: Arc::clone(&self.live_captures),
        }))
    }

    async fn create_session(
        &self,
        _local: &dyn LocalMedia,
    ) -> Result<(Box<dyn MediaSession>, MediaSessionEvents), MediaError> {
        let mut id_bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut id_bytes);
        let (candidates_tx, local_candidates) = mpsc::unbounded_channel();
        let (remote_tx, remote_media) = mpsc::unbounded_channel();
        let session = LoopbackSession {
            id: hex::encode(id_bytes),
            candidate_count: self.candidate_count,
            local_desc: None,
            remote_desc: None,
            remote_announced: false,
            closed: false,
            candidates_tx: Some(candidates_tx),
            remote_tx: Some(remote_tx),
            applied: Arc::clone(&self.candidates_applied),
        };
        Ok((
            Box::new(session),
            MediaSessionEvents {
                local_candidates,
                remote_media,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_denial() {
        let engine = LoopbackMediaEngine::new();
        engine.deny_capture(true);
        assert!(matches!(
            engine.capture_local().await,
            Err(MediaError::AccessDenied)
        ));
        assert_eq!(engine.live_captures(), 0);
    }

    #[tokio::test]
    async fn test_capture_release_accounting() {
        let engine = LoopbackMediaEngine::new();
        let mut tracks = engine.capture_local().await.unwrap();
        assert_eq!(engine.live_captures(), 1);
        tracks.stop();
        tracks.stop();
        assert_eq!(engine.live_captures(), 0);
    }

    #[tokio::test]
    async fn test_offer_answer_produces_candidates_and_remote_stream() {
        let engine = LoopbackMediaEngine::with_candidates(2);
        let local = engine.capture_local().await.unwrap();
        let (mut session, mut events) = engine.create_session(local.as_ref()).await.unwrap();

        let offer = session.create_offer().await.unwrap();
        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert!(events.local_candidates.recv().await.is_some());
        assert!(events.local_candidates.recv().await.is_some());

        session
            .set_remote_description(&SessionDescription::answer("v=0 peer"))
            .await
            .unwrap();
        assert!(events.remote_media.recv().await.is_some());

        session.add_remote_candidate("candidate:peer:0").await.unwrap();
        assert_eq!(engine.candidates_applied(), 1);
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let engine = LoopbackMediaEngine::new();
        let local = engine.capture_local().await.unwrap();
        let (mut session, _events) = engine.create_session(local.as_ref()).await.unwrap();
        assert!(session.create_answer().await.is_err());
    }
}
