//! Peer-to-peer call signaling for two-person study chats.
//!
//! The crate is organized around three seams:
//!
//! - [`store`]: the signaling channel both peers share, expressed as the
//!   [`store::SignalingStore`] trait with an in-memory implementation for
//!   tests and demos.
//! - [`media`]: the opaque media-negotiation surface ([`media::MediaEngine`]
//!   and friends) that a real transport plugs into.
//! - [`calls`]: the per-chat [`calls::CallController`] that orchestrates the
//!   call lifecycle across the two.

pub mod calls;
pub mod config;
pub mod media;
pub mod store;
pub mod types;

pub use calls::{CallController, CallError, CallPhase, EndReason};
pub use config::CallConfig;
pub use media::{LoopbackMediaEngine, MediaEngine, MediaStreamHandle};
pub use store::{MemorySignalingStore, SignalingStore};
pub use types::events::{CallEvent, CallNotice, IncomingCallPrompt};
pub use types::user::{PeerInfo, SessionContext};
