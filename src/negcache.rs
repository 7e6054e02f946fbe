//! Negative cache (Component B): a short-TTL record of "known absent" keys.
//!
//! Uses a DashMap + `Instant`-based TTL idiom, trimmed to the simpler
//! per-kind key used here (no domain-trie suffix matching is needed for
//! exact-key negative lookups).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Keyed by `(domain, ...)` throughout, even for `Sid` where the SID
/// itself already encodes a domain: a bare-SID key would let one domain's
/// negative entry shadow a same-SID lookup scoped to another, so every
/// variant carries the domain name the lookup was made against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NegKey {
    UserName(String, String),
    GroupName(String, String),
    Uid(String, u32),
    Gid(String, u32),
    Sid(String, String),
}

struct NegEntry {
    inserted_at: Instant,
    permanent: bool,
}

#[derive(Default)]
pub struct NegCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
}

pub struct NegCache {
    ttl: Duration,
    entries: DashMap<NegKey, NegEntry>,
    pub stats: NegCacheStats,
}

impl NegCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            stats: NegCacheStats::default(),
        }
    }

    /// Returns `true` if `key` is a hit (definitely absent for now). A
    /// stale (expired, non-permanent) entry counts as a miss.
    pub fn check(&self, key: &NegKey) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.permanent || entry.inserted_at.elapsed() < self.ttl => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn set(&self, key: NegKey, permanent: bool) {
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            NegEntry {
                inserted_at: Instant::now(),
                permanent,
            },
        );
    }

    /// Sweeps entries past their TTL; bounds memory for a long-running process.
    pub fn cleanup_expired(&self) {
        self.entries
            .retain(|_, v| v.permanent || v.inserted_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_check_hits_within_ttl() {
        let cache = NegCache::new(Duration::from_secs(30));
        let key = NegKey::UserName("dom".into(), "alice".into());
        cache.set(key.clone(), false);
        assert!(cache.check(&key));
    }

    #[test]
    fn unset_key_is_a_miss() {
        let cache = NegCache::new(Duration::from_secs(30));
        assert!(!cache.check(&NegKey::Uid("dom".into(), 1000)));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = NegCache::new(Duration::from_millis(1));
        let key = NegKey::Gid("dom".into(), 42);
        cache.set(key.clone(), false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.check(&key));
    }

    #[test]
    fn permanent_entry_never_expires() {
        let cache = NegCache::new(Duration::from_millis(1));
        let key = NegKey::Sid("dom".into(), "S-1-5-21-1-2-3-500".into());
        cache.set(key.clone(), true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.check(&key));
    }

    #[test]
    fn cleanup_expired_removes_stale_entries() {
        let cache = NegCache::new(Duration::from_millis(1));
        cache.set(NegKey::Uid("dom".into(), 1), false);
        std::thread::sleep(Duration::from_millis(20));
        cache.cleanup_expired();
        assert!(cache.is_empty());
    }
}
