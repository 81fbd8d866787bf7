//! Tunables for the calling subsystem.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an incoming-call prompt rings before it is treated as an
    /// implicit decline.
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
        }
    }
}
