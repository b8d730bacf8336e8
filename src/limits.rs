//! Tunable capacities and timeouts (`SPEC_FULL.md` §1), standing in for
//! the original's hard-coded `#define`s. Mirrors the shape of the
//! teacher's `ServerConfig`/`ForwarderConfig` (`forwarder/src/config.rs`)
//! minus the TOML file loader — no file I/O is in scope here, only an
//! overridable `Default`.

use std::time::Duration;

/// Process-wide knobs for the session store, event fabric, and scheduler.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Default hop count for a fresh broadcast (`spec.md` §4.3).
    pub broadcast_hop_default: u8,
    /// Capacity of the broadcast-dedup UUID ring (`spec.md` §4.3).
    pub broadcast_dedup_ring: usize,
    /// Maximum live sessions held by a `SessionStore`.
    pub session_capacity: usize,
    /// Session idle timeout before it becomes eligible for LRU eviction.
    pub session_timeout: Duration,
    /// Default timeout for `calls_call_sync` (`spec.md` §4.5).
    pub sync_call_timeout: Duration,
    /// Maximum outstanding outgoing RPC call IDs (`spec.md` §4.7.4).
    pub max_outstanding_calls: u16,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            broadcast_hop_default: 10,
            broadcast_dedup_ring: 8,
            session_capacity: 4096,
            session_timeout: Duration::from_secs(3600),
            sync_call_timeout: Duration::from_secs(30),
            max_outstanding_calls: 4095,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_constants() {
        let limits = Limits::default();
        assert_eq!(limits.broadcast_hop_default, 10);
        assert_eq!(limits.broadcast_dedup_ring, 8);
        assert_eq!(limits.max_outstanding_calls, 4095);
    }
}
