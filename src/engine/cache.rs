use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

// ── Availability Cache ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub page_id: Ulid,
    pub date: NaiveDate,
}

impl CacheKey {
    pub fn new(page_id: Ulid, date: NaiveDate) -> Self {
        Self { page_id, date }
    }
}

/// A computed slot list for one (page, date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub page_id: Ulid,
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
    pub cached_at: Ms,
    /// Key generation observed before the slots were computed.
    pub generation: u64,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.page_id, self.date)
    }

    pub fn is_fresh(&self, now: Ms, ttl_ms: Ms) -> bool {
        now - self.cached_at < ttl_ms
    }
}

/// Storage for computed slot lists.
///
/// Every key carries a generation that moves forward on each invalidation.
/// A computation reads the generation first and hands it back to `put`; the
/// entry is only installed if no invalidation happened in between, so a
/// reader racing a reservation can never resurrect a stale list.
pub trait AvailabilityCache: Send + Sync {
    /// Stored entry, fresh or not. Freshness is the caller's decision.
    fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    fn generation(&self, key: &CacheKey) -> u64;

    /// Install `entry` if its generation is still current. Returns whether it was stored.
    fn put(&self, entry: CacheEntry) -> bool;

    fn invalidate(&self, key: &CacheKey);

    /// Drop every date of a page (config change).
    fn invalidate_page(&self, page_id: Ulid);

    /// Remove entries older than `ttl_ms`. Returns how many were removed.
    fn evict_stale(&self, now: Ms, ttl_ms: Ms) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct CacheCell {
    generation: u64,
    entry: Option<CacheEntry>,
}

/// Process-local cache. Keys without a cell report the floor generation,
/// which is raised whenever cells are dropped so that removed keys never
/// go backwards.
pub struct InMemoryCache {
    cells: DashMap<CacheKey, CacheCell>,
    counter: AtomicU64,
    floor: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
            counter: AtomicU64::new(0),
            floor: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.cells.get(key).and_then(|cell| cell.entry.clone())
    }

    fn generation(&self, key: &CacheKey) -> u64 {
        match self.cells.get(key) {
            Some(cell) => cell.generation,
            None => self.floor.load(Ordering::SeqCst),
        }
    }

    fn put(&self, entry: CacheEntry) -> bool {
        let floor = self.floor.load(Ordering::SeqCst);
        let mut cell = self.cells.entry(entry.key()).or_insert_with(|| CacheCell {
            generation: floor,
            entry: None,
        });
        if cell.generation != entry.generation {
            return false;
        }
        cell.entry = Some(entry);
        true
    }

    fn invalidate(&self, key: &CacheKey) {
        let generation = self.next_generation();
        let mut cell = self.cells.entry(*key).or_insert_with(|| CacheCell {
            generation,
            entry: None,
        });
        cell.generation = generation;
        cell.entry = None;
        metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL).increment(1);
    }

    fn invalidate_page(&self, page_id: Ulid) {
        let generation = self.next_generation();
        // Dates of this page with no cell yet fall back to the floor.
        self.floor.fetch_max(generation, Ordering::SeqCst);
        for mut cell in self.cells.iter_mut() {
            if cell.key().page_id == page_id {
                cell.generation = generation;
                cell.entry = None;
            }
        }
        metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL).increment(1);
    }

    fn evict_stale(&self, now: Ms, ttl_ms: Ms) -> usize {
        let mut removed = 0;
        let mut highest = 0;
        self.cells.retain(|_, cell| {
            let keep = cell.entry.as_ref().is_some_and(|e| e.is_fresh(now, ttl_ms));
            if !keep {
                removed += 1;
                highest = highest.max(cell.generation);
            }
            keep
        });
        if removed > 0 {
            self.floor.fetch_max(highest, Ordering::SeqCst);
        }
        removed
    }

    fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.entry.is_some()).count()
    }
}
