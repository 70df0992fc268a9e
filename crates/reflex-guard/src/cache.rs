//! Response cache shared by concurrently running pipelines
//!
//! Lookup-then-evict and seed-then-store happen under the map's write lock,
//! so two pipelines racing on one key never observe a half-written entry.
//!
//! The ttl a caller probes with only decides hit or miss for that caller.
//! Entries are evicted once they outlive the cache-wide retention window, so
//! a caller with a short ttl never drops an answer others may still replay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response: Value,
    pub stored_at: DateTime<Utc>,
}

/// Result of a cache probe
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CachedResponse),
    Miss,
    /// Entry is older than the caller's ttl; it stays while within retention
    Expired,
    /// Entry was stamped after `now`; it has been evicted
    Inconsistent { stored_at: DateTime<Utc> },
}

/// Default retention window: one hour
pub const DEFAULT_RETENTION_MS: i64 = 3_600_000;

#[derive(Debug)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CachedResponse>>,
    retention_ms: i64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_retention_ms(DEFAULT_RETENTION_MS)
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_ms(retention_ms: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention_ms: retention_ms.max(0),
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// Probe `key` at `now` with a ttl in milliseconds
    pub fn lookup(&self, key: &str, now: DateTime<Utc>, ttl_ms: i64) -> CacheLookup {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get(key) else {
            return CacheLookup::Miss;
        };

        let elapsed = (now - entry.stored_at).num_milliseconds();
        if elapsed < 0 {
            let stored_at = entry.stored_at;
            entries.remove(key);
            return CacheLookup::Inconsistent { stored_at };
        }
        if elapsed < ttl_ms.min(self.retention_ms) {
            return CacheLookup::Hit(entry.clone());
        }
        if elapsed >= self.retention_ms {
            entries.remove(key);
        }
        CacheLookup::Expired
    }

    /// Store `response`, dropping entries past retention on the way
    pub fn store(&self, key: impl Into<String>, response: Value, now: DateTime<Utc>) {
        let mut entries = self.entries.write();
        let retention_ms = self.retention_ms;
        entries.retain(|_, entry| {
            let elapsed = (now - entry.stored_at).num_milliseconds();
            (0..retention_ms).contains(&elapsed)
        });
        entries.insert(
            key.into(),
            CachedResponse {
                response,
                stored_at: now,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<CachedResponse> {
        self.entries.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_hit_then_expired() {
        let cache = ResponseCache::new();
        let t0 = Utc::now();
        cache.store("k", json!("42"), t0);

        assert!(matches!(cache.lookup("k", t0 + Duration::seconds(59), 60_000), CacheLookup::Hit(_)));
        assert_eq!(cache.lookup("k", t0 + Duration::seconds(60), 60_000), CacheLookup::Expired);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_short_ttl_does_not_evict_for_others() {
        let cache = ResponseCache::new();
        let t0 = Utc::now();
        cache.store("k", json!("42"), t0);

        let later = t0 + Duration::seconds(10);
        assert_eq!(cache.lookup("k", later, 0), CacheLookup::Expired);
        assert!(matches!(cache.lookup("k", later, 60_000), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_retention_bounds_entries() {
        let cache = ResponseCache::with_retention_ms(1_000);
        let t0 = Utc::now();
        cache.store("old", json!(1), t0);

        // a long ttl never outlives retention
        assert_eq!(cache.lookup("old", t0 + Duration::seconds(2), 60_000), CacheLookup::Expired);
        assert!(cache.is_empty());

        cache.store("a", json!(1), t0);
        cache.store("b", json!(2), t0 + Duration::seconds(5));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("a", t0 + Duration::seconds(5), 60_000), CacheLookup::Miss);
    }

    #[test]
    fn test_future_entry_is_inconsistent() {
        let cache = ResponseCache::new();
        let t0 = Utc::now();
        cache.store("k", json!("x"), t0 + Duration::seconds(5));

        assert!(matches!(cache.lookup("k", t0, 60_000), CacheLookup::Inconsistent { .. }));
        assert_eq!(cache.lookup("k", t0, 60_000), CacheLookup::Miss);
    }
}
