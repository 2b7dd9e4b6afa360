//! In-memory TTL cache for competitor bands, keyed by (property, date).
//!
//! Negative lookups (upstream had no data) are cached too, so a missing
//! pair does not hammer the upstream on every quote.

use super::CompetitorBand;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type Key = (String, NaiveDate);

struct CacheEntry {
    band: Option<CompetitorBand>,
    fetched_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CachedBand {
    pub band: Option<CompetitorBand>,
    pub is_fresh: bool,
}

pub struct BandCache {
    entries: Mutex<HashMap<Key, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl BandCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Returns the cached band (fresh or stale) if present. Stale
    /// entries stay resident until evicted so the gateway can serve
    /// them while a revalidation is failing.
    pub fn get(&self, key: &Key) -> Option<CachedBand> {
        let entries = self.entries.lock();
        entries.get(key).map(|entry| CachedBand {
            band: entry.band.clone(),
            is_fresh: entry.fetched_at.elapsed() < self.ttl,
        })
    }

    pub fn insert(&self, key: Key, band: Option<CompetitorBand>) {
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            // Evict the entry that has been resident the longest.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                band,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
