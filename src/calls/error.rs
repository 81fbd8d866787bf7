//! Call-related error types.

use crate::media::MediaError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("another call is already in progress")]
    CallInProgress,

    #[error("call is no longer available")]
    NoLongerAvailable,

    #[error("invalid call phase transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("signaling error: {0}")]
    Store(#[from] StoreError),

    #[error("controller disposed")]
    Disposed,
}
