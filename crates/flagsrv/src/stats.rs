//! Per-team submission counters and connection accounting.
//!
//! Counters are plain atomics; reports zero them by atomic exchange so each
//! readout covers the interval since the previous one.

use std::fs;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::cache::FlagCache;

/// Counter capacity. Submitting teams beyond this are not counted.
pub const MAX_TEAMS: usize = 2048;

/// Outcome category of one production flag submission. Every production flag
/// lands in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagCategory {
    New = 0,
    Old = 1,
    Expired = 2,
    Invalid = 3,
    Nop = 4,
    Own = 5,
}

struct TeamLine {
    counters: [AtomicI64; 6],
}

impl TeamLine {
    fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }
}

pub struct Statistics {
    connections_total: AtomicI64,
    open_connections: AtomicI64,
    teams: Vec<TeamLine>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicI64::new(0),
            open_connections: AtomicI64::new(0),
            teams: (0..MAX_TEAMS).map(|_| TeamLine::new()).collect(),
        }
    }

    pub fn count_flag(&self, submitter: u16, category: FlagCategory) {
        if let Some(line) = self.teams.get(submitter as usize) {
            line.counters[category as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the number of clients connected after this one.
    pub fn connection_opened(&self) -> i64 {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the number of clients still connected.
    pub fn connection_closed(&self) -> i64 {
        self.open_connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// `current,delta,fd_open,fd_limit` - the delta resets on readout.
    pub fn connection_report(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.open_connections.load(Ordering::Relaxed),
            self.connections_total.swap(0, Ordering::Relaxed),
            open_fd_count(),
            fd_limit()
        )
    }

    /// One `teamN,new,old,expired,invalid,nop,own` line per team with any
    /// non-zero counter. Counters reset on readout.
    pub fn flag_report(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (team_id, line) in self.teams.iter().enumerate() {
            let mut counts = [0i64; 6];
            let mut any = false;
            for (slot, counter) in counts.iter_mut().zip(line.counters.iter()) {
                *slot = counter.swap(0, Ordering::Relaxed);
                any |= *slot != 0;
            }
            if any {
                out.push(format!(
                    "team{},{},{},{},{},{},{}\n",
                    team_id, counts[0], counts[1], counts[2], counts[3], counts[4], counts[5]
                ));
            }
        }
        out
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// `hits,misses,fails` of the resubmit cache.
pub fn cache_report(cache: &FlagCache) -> String {
    format!("{},{},{}\n", cache.hits(), cache.misses(), cache.fails())
}

/// Number of open descriptors, read from `/proc/self/fd`. -1 when unreadable.
pub fn open_fd_count() -> i64 {
    match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries.count() as i64,
        Err(_) => -1,
    }
}

/// Effective `RLIMIT_NOFILE`. Prefers the hard limit when the soft limit is
/// unset or above it.
pub fn fd_limit() -> i64 {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) } != 0 {
        return -1;
    }
    let picked = if limits.rlim_max > 0 && (limits.rlim_max < limits.rlim_cur || limits.rlim_cur == 0)
    {
        limits.rlim_max
    } else {
        limits.rlim_cur
    };
    picked as i64
}
