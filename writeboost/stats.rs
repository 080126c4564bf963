// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Opaque statistics counters.
//!
//! The I/O paths bucket each request by direction, whether the key
//! was found in the index, whether the hit was on the active RAM
//! buffer, and whether the request covered a whole block. The core
//! never reads these counters back; they exist for operators.

use std::sync::atomic::{AtomicU64, Ordering};

const NR_IO_BUCKETS: usize = 16;

/// Counters maintained by the cache core.
///
pub struct Stats {
    io: [AtomicU64; NR_IO_BUCKETS],
    barriers: AtomicU64,
    flushes: AtomicU64,
    read_cache_reserved: AtomicU64,
    read_cache_cancelled: AtomicU64,
    read_cache_promoted: AtomicU64,
    writebacks: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub io: [u64; NR_IO_BUCKETS],
    pub barriers: u64,
    pub flushes: u64,
    pub read_cache_reserved: u64,
    pub read_cache_cancelled: u64,
    pub read_cache_promoted: u64,
    pub writebacks: u64,
}

impl Stats {
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Stats {
            io: [ZERO; NR_IO_BUCKETS],
            barriers: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            read_cache_reserved: AtomicU64::new(0),
            read_cache_cancelled: AtomicU64::new(0),
            read_cache_promoted: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        }
    }

    /// Counts one request in its (direction, found, on-buffer,
    /// full-block) bucket.
    ///
    pub fn record_io(&self, write: bool, found: bool, on_buffer: bool, full: bool) {
        let bucket = (write as usize) << 3
            | (found as usize) << 2
            | (on_buffer as usize) << 1
            | (full as usize);
        self.io[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Reads one (direction, found, on-buffer, full-block) bucket.
    ///
    pub fn io_bucket(&self, write: bool, found: bool, on_buffer: bool, full: bool) -> u64 {
        let bucket = (write as usize) << 3
            | (found as usize) << 2
            | (on_buffer as usize) << 1
            | (full as usize);
        self.io[bucket].load(Ordering::Relaxed)
    }

    pub fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_cache_reserved(&self) {
        self.read_cache_reserved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_cache_cancelled(&self) {
        self.read_cache_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_cache_promoted(&self) {
        self.read_cache_promoted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writeback(&self) {
        self.writebacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Zeroes every counter.
    ///
    pub fn clear(&self) {
        for bucket in self.io.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
        self.barriers.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
        self.read_cache_reserved.store(0, Ordering::Relaxed);
        self.read_cache_cancelled.store(0, Ordering::Relaxed);
        self.read_cache_promoted.store(0, Ordering::Relaxed);
        self.writebacks.store(0, Ordering::Relaxed);
    }

    /// Returns a copy of every counter.
    ///
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut io = [0u64; NR_IO_BUCKETS];
        for (i, bucket) in self.io.iter().enumerate() {
            io[i] = bucket.load(Ordering::Relaxed);
        }

        StatsSnapshot {
            io,
            barriers: self.barriers.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            read_cache_reserved: self.read_cache_reserved.load(Ordering::Relaxed),
            read_cache_cancelled: self.read_cache_cancelled.load(Ordering::Relaxed),
            read_cache_promoted: self.read_cache_promoted.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets() {
        let stats = Stats::new();
        stats.record_io(true, false, false, true);
        stats.record_io(true, false, false, true);
        stats.record_io(false, true, true, false);

        assert_eq!(stats.io_bucket(true, false, false, true), 2);
        assert_eq!(stats.io_bucket(false, true, true, false), 1);
        assert_eq!(stats.io_bucket(false, false, false, false), 0);

        let snap = stats.snapshot();
        assert_eq!(snap.io.iter().sum::<u64>(), 3);

        stats.clear();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
