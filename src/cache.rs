//! Fingerprint -> last-good-response map with LRU+TTL eviction, the
//! read-through fallback used when the bus transaction for a read fails.
//!
//! Writes are never stored here and never invalidate anything: they are
//! commanded through, or they fail honestly.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Identity of a read request: `(function_code, start_register,
/// register_count)`. Writes are never fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint {
    pub function_code: u8,
    pub start_register: u16,
    pub register_count: u16,
}

struct CacheEntry {
    encoded_tcp_response: Vec<u8>,
    created_at: Instant,
    last_accessed_at: Instant,
    hit_count: u64,
}

/// A diagnostics-friendly view of one cache entry, relative to the moment
/// [`FallbackCache::snapshot`] was called.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySnapshot {
    pub function_code: u8,
    pub start_register: u16,
    pub register_count: u16,
    pub age_ms: u128,
    pub hit_count: u64,
}

pub struct FallbackCache {
    entries: BTreeMap<Fingerprint, CacheEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl FallbackCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self { entries: BTreeMap::new(), max_entries, ttl }
    }

    /// Inserts or replaces the cached response for `fingerprint`, then runs
    /// maintenance: a TTL sweep, followed by an LRU-by-`created_at` eviction
    /// if the table is still at or over capacity.
    pub fn put(&mut self, fingerprint: Fingerprint, encoded_tcp_response: Vec<u8>) {
        let now = Instant::now();
        self.entries.remove(&fingerprint);
        self.entries.insert(
            fingerprint,
            CacheEntry { encoded_tcp_response, created_at: now, last_accessed_at: now, hit_count: 0 },
        );
        self.run_maintenance(now);
    }

    fn run_maintenance(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now.saturating_duration_since(entry.created_at) <= ttl);

        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(fp, _)| *fp);
            match oldest {
                Some(fp) => {
                    self.entries.remove(&fp);
                }
                None => break,
            }
        }
    }

    /// Looks up `fingerprint`; on hit, bumps `hit_count` and
    /// `last_accessed_at` and returns the stored bytes.
    pub fn get(&mut self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entry = self.entries.get_mut(fingerprint)?;
        entry.hit_count += 1;
        entry.last_accessed_at = now;
        Some(entry.encoded_tcp_response.clone())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CacheEntrySnapshot> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|(fp, entry)| CacheEntrySnapshot {
                function_code: fp.function_code,
                start_register: fp.start_register,
                register_count: fp.register_count,
                age_ms: now.saturating_duration_since(entry.created_at).as_millis(),
                hit_count: entry.hit_count,
            })
            .collect()
    }
}
