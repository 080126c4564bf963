// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The metablock and segment model.
//!
//! Metablocks and segments live in stable arrays for the device's
//! lifetime and are named by dense indices; a metablock's segment
//! follows from index arithmetic rather than a reference. This module
//! also holds the synchronisation primitives tied to segment
//! lifecycle: per-segment inflight counters and the monotonic
//! identifier gates daemons communicate through.

use crate::config::ConfigError;
use align::{FULL_MASK, SECTORS_PER_BLOCK};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// The sentinel naming no metablock.
///
pub const MB_NONE: u32 = u32::MAX;

/// The fixed geometry of a cache device.
///
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    segment_size_order: u8,
    nr_segments: u64,
    caches_per_seg: usize,
}

impl Geometry {
    /// Derives the geometry from the segment size order and the
    /// cache device capacity.
    ///
    /// The first segment-sized region holds the superblock; the
    /// device must have room for at least one segment after it.
    ///
    pub fn new(segment_size_order: u8, cache_sectors: u64) -> Result<Self, ConfigError> {
        let segment_size = 1u64 << segment_size_order;
        let regions = cache_sectors / segment_size;
        if regions < 2 {
            return Err(ConfigError::CacheTooSmall);
        }

        Ok(Geometry {
            segment_size_order,
            nr_segments: regions - 1,
            caches_per_seg: (segment_size / SECTORS_PER_BLOCK) as usize - 1,
        })
    }

    /// The segment size in sectors.
    ///
    pub fn segment_size_sectors(&self) -> u64 {
        1u64 << self.segment_size_order
    }

    /// The number of segments on the device.
    ///
    pub fn nr_segments(&self) -> u64 {
        self.nr_segments
    }

    /// The number of cache blocks per segment.
    ///
    pub fn caches_per_seg(&self) -> usize {
        self.caches_per_seg
    }

    /// The total number of cache blocks on the device.
    ///
    pub fn nr_caches(&self) -> u32 {
        self.nr_segments as u32 * self.caches_per_seg as u32
    }

    /// The position in the cyclic segment array owning metablock
    /// `mb`.
    ///
    pub fn seg_pos_of_mb(&self, mb: u32) -> usize {
        mb as usize / self.caches_per_seg
    }

    /// The slot of metablock `mb` within its segment.
    ///
    pub fn slot_of_mb(&self, mb: u32) -> usize {
        mb as usize % self.caches_per_seg
    }

    /// The position in the cyclic segment array a segment identity
    /// maps to. Identities are 1-based; 0 is invalid.
    ///
    pub fn seg_pos_of_id(&self, id: u64) -> usize {
        ((id - 1) % self.nr_segments) as usize
    }

    /// The ring lap a segment identity belongs to, starting at 1.
    ///
    pub fn lap_of_id(&self, id: u64) -> u32 {
        ((id - 1) / self.nr_segments + 1) as u32
    }

    /// The first metablock of the segment at `pos`.
    ///
    pub fn first_mb_of_pos(&self, pos: usize) -> u32 {
        (pos * self.caches_per_seg) as u32
    }

    /// The first sector of the segment at `pos` on the cache
    /// device, past the superblock region.
    ///
    pub fn seg_start_sector(&self, pos: usize) -> u64 {
        (pos as u64 + 1) * self.segment_size_sectors()
    }

    /// The first sector of metablock `mb`'s data block on the
    /// cache device.
    ///
    pub fn mb_data_sector(&self, mb: u32) -> u64 {
        let seg_start = self.seg_start_sector(self.seg_pos_of_mb(mb));
        seg_start + SECTORS_PER_BLOCK * (self.slot_of_mb(mb) as u64 + 1)
    }
}

/// One metablock's dirtiness.
///
/// `data_bits` names the sectors of the block whose cached bytes are
/// valid; `dirty` is set when any of them are newer than the backing
/// device and therefore await writeback. A clean read promotion has
/// all bits valid and `dirty` unset.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dirtiness {
    pub dirty: bool,
    pub data_bits: u8,
}

struct DirtyInner {
    bits: Vec<Dirtiness>,
    nr_dirty: usize,
}

/// The dirtiness table for every metablock, guarded by the one
/// spinlock that is never held across I/O.
///
pub struct DirtyTable {
    inner: spin::Mutex<DirtyInner>,
}

impl DirtyTable {
    pub fn new(nr_caches: u32) -> Self {
        DirtyTable {
            inner: spin::Mutex::new(DirtyInner {
                bits: vec![Dirtiness::default(); nr_caches as usize],
                nr_dirty: 0,
            }),
        }
    }

    /// Reads one metablock's dirtiness.
    ///
    pub fn get(&self, mb: u32) -> Dirtiness {
        self.inner.lock().bits[mb as usize]
    }

    /// Adds `mask` to a metablock's dirty sectors, returning
    /// whether the metablock just became dirty.
    ///
    pub fn taint(&self, mb: u32, mask: u8) -> bool {
        let mut inner = self.inner.lock();
        let was_dirty = inner.bits[mb as usize].dirty;
        inner.bits[mb as usize].dirty = true;
        inner.bits[mb as usize].data_bits |= mask;

        if !was_dirty {
            inner.nr_dirty += 1;
        }

        !was_dirty
    }

    /// Marks a freshly promoted metablock fully valid but clean.
    ///
    pub fn promote_valid(&self, mb: u32) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.bits[mb as usize];
        debug_assert!(!entry.dirty);
        entry.data_bits = FULL_MASK;
    }

    /// Clears a metablock's dirtiness, returning whether it was
    /// dirty.
    ///
    pub fn clean(&self, mb: u32) -> bool {
        let mut inner = self.inner.lock();
        let was_dirty = inner.bits[mb as usize].dirty;
        inner.bits[mb as usize].dirty = false;
        inner.bits[mb as usize].data_bits = 0;

        if was_dirty {
            inner.nr_dirty -= 1;
        }

        was_dirty
    }

    /// The number of dirty metablocks.
    ///
    pub fn nr_dirty(&self) -> usize {
        self.inner.lock().nr_dirty
    }
}

/// Per-segment counters of ongoing metablock references, with a
/// shared rendezvous for zero-waits.
///
pub struct Inflight {
    counters: Vec<AtomicUsize>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Inflight {
    pub fn new(nr_segments: usize) -> Self {
        let mut counters = Vec::with_capacity(nr_segments);
        for _ in 0..nr_segments {
            counters.push(AtomicUsize::new(0));
        }

        Inflight {
            counters,
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn inc(&self, pos: usize) {
        self.counters[pos].fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference, waking zero-waiters when the counter
    /// reaches zero.
    ///
    pub fn dec(&self, pos: usize) {
        let prior = self.counters[pos].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior > 0);
        if prior == 1 {
            let _guard = crate::lock(&self.lock);
            self.cond.notify_all();
        }
    }

    pub fn count(&self, pos: usize) -> usize {
        self.counters[pos].load(Ordering::Acquire)
    }

    /// Blocks until the segment at `pos` has no ongoing
    /// references.
    ///
    pub fn wait_zero(&self, pos: usize) {
        if self.count(pos) == 0 {
            return;
        }

        let mut guard = crate::lock(&self.lock);
        while self.count(pos) != 0 {
            guard = self.cond.wait(guard).expect("poisoned lock");
        }
    }
}

/// A monotonically increasing identifier daemons wait on, such as
/// `last_flushed_id` and `last_writeback_id`.
///
pub struct IdGate {
    id: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl IdGate {
    pub fn new(initial: u64) -> Self {
        IdGate {
            id: AtomicU64::new(initial),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Advances the identifier. Identifiers never move backwards.
    ///
    pub fn advance_to(&self, id: u64) {
        let _guard = crate::lock(&self.lock);
        let current = self.id.load(Ordering::Acquire);
        if id > current {
            self.id.store(id, Ordering::Release);
            self.cond.notify_all();
        }
    }

    /// Blocks until the identifier reaches `id`.
    ///
    pub fn wait_for(&self, id: u64) {
        if self.get() >= id {
            return;
        }

        let mut guard = crate::lock(&self.lock);
        while self.get() < id {
            guard = self.cond.wait(guard).expect("poisoned lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn geometry() {
        // 128-sector segments on a 640-sector device: one
        // superblock region plus four segments of 15 cache blocks.
        let geom = Geometry::new(7, 640).unwrap();
        assert_eq!(geom.segment_size_sectors(), 128);
        assert_eq!(geom.nr_segments(), 4);
        assert_eq!(geom.caches_per_seg(), 15);
        assert_eq!(geom.nr_caches(), 60);

        assert_eq!(geom.seg_pos_of_mb(0), 0);
        assert_eq!(geom.seg_pos_of_mb(14), 0);
        assert_eq!(geom.seg_pos_of_mb(15), 1);
        assert_eq!(geom.slot_of_mb(14), 14);
        assert_eq!(geom.slot_of_mb(16), 1);

        // Identities are 1-based and wrap around the ring.
        assert_eq!(geom.seg_pos_of_id(1), 0);
        assert_eq!(geom.seg_pos_of_id(4), 3);
        assert_eq!(geom.seg_pos_of_id(5), 0);
        assert_eq!(geom.lap_of_id(1), 1);
        assert_eq!(geom.lap_of_id(4), 1);
        assert_eq!(geom.lap_of_id(5), 2);
        assert_eq!(geom.lap_of_id(9), 3);

        // Region 0 is the superblock.
        assert_eq!(geom.seg_start_sector(0), 128);
        assert_eq!(geom.seg_start_sector(3), 512);

        // The first block of each segment is its header.
        assert_eq!(geom.mb_data_sector(0), 136);
        assert_eq!(geom.mb_data_sector(1), 144);
        assert_eq!(geom.mb_data_sector(15), 264);

        assert_eq!(geom.first_mb_of_pos(2), 30);

        // Too small for a superblock and a segment.
        assert!(Geometry::new(7, 128).is_err());
    }

    #[test]
    fn dirtiness() {
        let table = DirtyTable::new(4);
        assert_eq!(table.nr_dirty(), 0);
        assert_eq!(table.get(0), Dirtiness::default());

        // The first taint is a transition, later ones are not.
        assert!(table.taint(0, 0x0f));
        assert!(!table.taint(0, 0xf0));
        assert_eq!(
            table.get(0),
            Dirtiness {
                dirty: true,
                data_bits: 0xff
            }
        );
        assert_eq!(table.nr_dirty(), 1);

        assert!(table.taint(2, 0x01));
        assert_eq!(table.nr_dirty(), 2);

        assert!(table.clean(0));
        assert!(!table.clean(0));
        assert_eq!(table.get(0), Dirtiness::default());
        assert_eq!(table.nr_dirty(), 1);

        // A clean promotion is fully valid but not dirty.
        table.promote_valid(1);
        assert_eq!(
            table.get(1),
            Dirtiness {
                dirty: false,
                data_bits: 0xff
            }
        );
        assert_eq!(table.nr_dirty(), 1);
    }

    #[test]
    fn inflight() {
        let inflight = Arc::new(Inflight::new(2));
        inflight.inc(0);
        inflight.inc(0);
        assert_eq!(inflight.count(0), 2);

        // wait_zero returns immediately for an idle segment.
        inflight.wait_zero(1);

        let clone = inflight.clone();
        let waiter = thread::spawn(move || clone.wait_zero(0));
        inflight.dec(0);
        inflight.dec(0);
        waiter.join().unwrap();
        assert_eq!(inflight.count(0), 0);
    }

    #[test]
    fn id_gate() {
        let gate = Arc::new(IdGate::new(0));
        gate.wait_for(0);

        let clone = gate.clone();
        let waiter = thread::spawn(move || clone.wait_for(3));
        gate.advance_to(1);
        gate.advance_to(3);
        waiter.join().unwrap();

        // The gate never moves backwards.
        gate.advance_to(2);
        assert_eq!(gate.get(), 3);
    }
}
