//! Replay prevention
//!
//! The gateway keeps one process-wide cache of recently seen record IVs.
//! Decryption is refused for an IV that was admitted within the TTL; a
//! background sweeper removes expired entries once a minute so the map stays
//! bounded by TTL × arrival rate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::crypto::NONCE_SIZE;

/// Default replay window
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Sweep interval for the background cleaner
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tracks recently seen IVs to prevent replay.
pub struct ReplayCache {
    ttl: Duration,
    entries: DashMap<[u8; NONCE_SIZE], Instant>,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Returns true if the IV was already admitted within the TTL; otherwise
    /// records it and returns false. An entry found past its expiry is
    /// treated as absent and refreshed. Detection does not refresh expiry.
    pub fn seen_or_add(&self, iv: &[u8], now: Instant) -> bool {
        let key: [u8; NONCE_SIZE] = match iv.try_into() {
            Ok(key) => key,
            // wrong-sized IV never decrypts anyway; refuse admission
            Err(_) => return true,
        };

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    true
                } else {
                    occupied.insert(now + self.ttl);
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + self.ttl);
                false
            }
        }
    }

    /// Drop entries whose expiry has passed.
    pub fn sweep(&self, now: Instant) {
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the minute sweeper. Abort the handle on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep(Instant::now());
            }
        })
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_admits() {
        let cache = ReplayCache::default();
        let now = Instant::now();
        assert!(!cache.seen_or_add(&[1u8; 12], now));
        assert!(cache.seen_or_add(&[1u8; 12], now));
        assert!(cache.seen_or_add(&[1u8; 12], now));
        assert!(!cache.seen_or_add(&[2u8; 12], now));
    }

    #[test]
    fn test_expired_entry_readmits() {
        let cache = ReplayCache::new(Duration::from_secs(30));
        let now = Instant::now();
        assert!(!cache.seen_or_add(&[1u8; 12], now));
        // within the window: still a replay
        assert!(cache.seen_or_add(&[1u8; 12], now + Duration::from_secs(10)));
        // past the window: logically absent again
        assert!(!cache.seen_or_add(&[1u8; 12], now + Duration::from_secs(31)));
    }

    #[test]
    fn test_detection_does_not_refresh_expiry() {
        let cache = ReplayCache::new(Duration::from_secs(30));
        let now = Instant::now();
        assert!(!cache.seen_or_add(&[1u8; 12], now));
        assert!(cache.seen_or_add(&[1u8; 12], now + Duration::from_secs(29)));
        // if detection refreshed the expiry this would still be a replay
        assert!(!cache.seen_or_add(&[1u8; 12], now + Duration::from_secs(31)));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let cache = ReplayCache::new(Duration::from_secs(30));
        let now = Instant::now();
        cache.seen_or_add(&[1u8; 12], now);
        cache.seen_or_add(&[2u8; 12], now + Duration::from_secs(20));
        assert_eq!(cache.len(), 2);

        cache.sweep(now + Duration::from_secs(31));
        assert_eq!(cache.len(), 1);

        cache.sweep(now + Duration::from_secs(51));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_wrong_size_iv_refused() {
        let cache = ReplayCache::default();
        assert!(cache.seen_or_add(&[1u8; 8], Instant::now()));
        assert!(cache.is_empty());
    }
}
