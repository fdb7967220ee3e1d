//! Delivery-id replay suppression.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// In-memory TTL set over `(provider, delivery_id)`.
///
/// Providers redeliver webhooks on timeouts and manual replays; within
/// the window the duplicate is acknowledged without creating new rows.
/// Expired entries are swept lazily on insert.
pub struct DeliveryDedup {
    ttl: Duration,
    seen: Mutex<HashMap<(String, String), Instant>>,
}

impl DeliveryDedup {
    /// Dedup window of `ttl`; zero disables suppression entirely.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `(provider, delivery_id)`; returns `true` when it was
    /// already seen inside the window.
    #[must_use]
    pub fn check_and_insert(&self, provider: &str, delivery_id: &str) -> bool {
        if self.ttl.is_zero() || delivery_id.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);

        let key = (provider.to_string(), delivery_id.to_string());
        match seen.get(&key) {
            Some(_) => true,
            None => {
                seen.insert(key, now);
                false
            }
        }
    }
}
