//! Probabilistic lock-free resubmit cache.
//!
//! A fixed array of atomic cells stamps the last `(round, payload)` seen per
//! `(submitter, service, target team, round bucket, payload bucket)` tuple.
//! A repeated stamp means the flag was definitely seen; a changed stamp means
//! "plausibly unseen" and the flag goes on to persistence, whose uniqueness
//! constraint stays the source of truth. Collisions are allowed by design and
//! cost exactly one database round-trip.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::info;

/// At most ~20 flags are valid at a given point in time per
/// (service, team, payload), so 26 round buckets keep at most one live flag
/// per cell. Collisions are acceptable, but expensive.
pub const ROUND_BUCKETS: u32 = 26;

/// Flags distinguishable per round. Collisions here are acceptable too.
pub const PAYLOAD_BUCKETS: u32 = 5;

struct Cells {
    teams: u32,
    services: u32,
    slots: Box<[AtomicU32]>,
}

pub struct FlagCache {
    cells: RwLock<Cells>,
    hits: AtomicI64,
    misses: AtomicI64,
    fails: AtomicI64,
}

impl FlagCache {
    /// An empty cache; call [`FlagCache::resize`] before use.
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(Cells {
                teams: 0,
                services: 0,
                slots: Vec::new().into_boxed_slice(),
            }),
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
            fails: AtomicI64::new(0),
        }
    }

    /// Replace the cell array with a fresh zeroed one sized for the given
    /// team and service counts. Previous content is discarded; the hit/miss
    /// counters survive.
    pub fn resize(&self, teams: u32, services: u32) {
        let count = teams as usize
            * teams as usize
            * services as usize
            * ROUND_BUCKETS as usize
            * PAYLOAD_BUCKETS as usize;
        info!(
            "Cache memory: {} MB",
            (count * std::mem::size_of::<AtomicU32>()) >> 20
        );
        let slots: Box<[AtomicU32]> = (0..count).map(|_| AtomicU32::new(0)).collect();
        *self.cells.write() = Cells {
            teams,
            services,
            slots,
        };
    }

    /// Stamp the flag's cell. Returns `true` when the flag is possibly new,
    /// `false` when it was definitely seen in the current bucket window.
    pub fn check(
        &self,
        submitter: u16,
        team_id: u16,
        service_id: u16,
        round: u16,
        payload: u16,
    ) -> bool {
        let cells = self.cells.read();

        // ids are [1..count]; shift to [0..count), out-of-range ids (and the
        // wrapped 0) fall through to persistence
        let submitter = submitter.wrapping_sub(1) as u32;
        let team = team_id.wrapping_sub(1) as u32;
        let service = service_id.wrapping_sub(1) as u32;
        if submitter >= cells.teams || team >= cells.teams || service >= cells.services {
            return true;
        }

        let mut index = submitter as usize;
        index = index * cells.services as usize + service as usize;
        index = index * cells.teams as usize + team as usize;
        index = index * ROUND_BUCKETS as usize + (round as u32 % ROUND_BUCKETS) as usize;
        index = index * PAYLOAD_BUCKETS as usize + (payload as u32 % PAYLOAD_BUCKETS) as usize;

        // No collision in the stamp within a bucket window: that would need
        // two identical (round, payload) pairs, which is one and the same flag.
        let key = round as u32 | (payload as u32) << 16;

        let is_new = cells.slots[index].swap(key, Ordering::Relaxed) != key;
        if is_new {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    /// Record that persistence reported a duplicate the cache did not catch.
    pub fn record_failed(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    /// Flags answered from the cache (definite resubmits).
    pub fn hits(&self) -> i64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Flags the cache passed through to persistence.
    pub fn misses(&self) -> i64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Passed-through flags that persistence rejected as duplicates.
    pub fn fails(&self) -> i64 {
        self.fails.load(Ordering::Relaxed)
    }
}

impl Default for FlagCache {
    fn default() -> Self {
        Self::new()
    }
}
