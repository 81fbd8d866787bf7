//! The media-negotiation seam.
//!
//! Session descriptions and connectivity candidates are opaque blobs to the
//! calling core; the traits below are the only contact surface with the
//! actual negotiation transport (WebRTC in the browser client). External
//! media implementations plug in here.

mod loopback;

pub use loopback::LoopbackMediaEngine;

use crate::store::SessionDescription;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The user denied camera/microphone access.
    #[error("media access denied")]
    AccessDenied,

    #[error("media unavailable: {0}")]
    Unavailable(String),

    #[error("media session error: {0}")]
    Session(String),
}

/// Opaque handle to a media stream, surfaced to the presentation layer for
/// rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaStreamHandle {
    pub id: String,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Locally captured tracks. `stop` releases the capture devices and is
/// idempotent; implementations also release on drop.
pub trait LocalMedia: Send + Sync {
    fn handle(&self) -> MediaStreamHandle;
    fn stop(&mut self);
}

/// Out-of-band outputs of a media session.
pub struct MediaSessionEvents {
    /// Locally discovered connectivity candidates. They start flowing once
    /// a local description exists and must each be published to the
    /// signaling channel.
    pub local_candidates: mpsc::UnboundedReceiver<String>,
    /// Delivered when the remote party's stream becomes available.
    pub remote_media: mpsc::UnboundedReceiver<MediaStreamHandle>,
}

/// One peer connection's negotiation surface.
///
/// `create_answer` requires the remote description to be applied first;
/// candidates may only be added after a remote description is set (the
/// session state machine buffers early arrivals).
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&mut self, desc: &SessionDescription)
    -> Result<(), MediaError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn add_remote_candidate(&mut self, payload: &str) -> Result<(), MediaError>;

    /// Tear the session down. Idempotent.
    async fn close(&mut self);
}

/// Factory for local capture and peer sessions.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire local audio/video capture. May wait indefinitely on a user
    /// permission grant; fails with [`MediaError::AccessDenied`] on refusal.
    async fn capture_local(&self) -> Result<Box<dyn LocalMedia>, MediaError>;

    /// Create a peer session fed by the given local tracks.
    async fn create_session(
        &self,
        local: &dyn LocalMedia,
    ) -> Result<(Box<dyn MediaSession>, MediaSessionEvents), MediaError>;
}
