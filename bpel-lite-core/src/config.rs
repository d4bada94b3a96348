use serde::{Deserialize, Serialize};

/// Tunables for the routing engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a queued message may wait for a route before the expiry
    /// sweep fails it. Messages that never find a match would otherwise
    /// accumulate forever.
    pub queued_message_ttl_ms: i64,
    /// Delay before re-attempting delivery against a disabled process.
    pub retry_interval_ms: i64,
    /// Give up redelivery after this many attempts.
    pub max_delivery_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queued_message_ttl_ms: 30 * 24 * 3600 * 1000,
            retry_interval_ms: 60_000,
            max_delivery_attempts: 10,
        }
    }
}
