//! Peer-to-peer call orchestration for a two-person chat.
//!
//! One [`CallController`] per open chat owns a background session task that
//! drives the whole call lifecycle: publishing offers and answers over the
//! signaling store, relaying connectivity candidates into the media session,
//! surfacing incoming-call prompts, and tearing everything down when either
//! side leaves.

mod controller;
mod error;
mod notifier;
mod session;
pub mod state;

pub use controller::CallController;
pub use error::CallError;
pub use state::{CallPhase, CallTransition, EndReason};
