//! Session and peer identity passed explicitly into the call controller.

use super::id::UserId;
use serde::Serialize;

/// The locally signed-in user, as the controller needs to see it.
///
/// The original application read this from ambient auth state; here it is an
/// explicit value handed to the controller at construction.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl SessionContext {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// The other party of the two-person chat a controller is bound to.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub display_name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}
