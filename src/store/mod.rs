//! Signaling channel: the shared document store both peers use to exchange
//! session descriptions and connectivity candidates before a direct peer
//! link exists.

mod error;
mod memory;
mod records;
mod traits;

pub use error::{Result, StoreError};
pub use memory::MemorySignalingStore;
pub use records::{
    CallNotification, CallRecord, CallStatus, CandidateRecord, CandidateSide, DescriptionKind,
    NotificationStatus, SessionDescription,
};
pub use traits::{NotificationEvent, SignalingStore, Subscription, SubscriptionGuard};
