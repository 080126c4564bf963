// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The RAM-buffer pool staging unflushed segments.
//!
//! The pool is a fixed ring: the buffer for segment `id` lives in
//! slot `(id - 1) mod N`. A buffer leaves the pool when its segment
//! becomes current and returns when the segment's flush completes,
//! so acquiring the buffer for segment `id` waits until segment
//! `id - N` has finished flushing. This is the backpressure on the
//! write path.

use align::BLOCK_SIZE;
use std::sync::{Condvar, Mutex};

/// A staging buffer for one segment: a header block followed by one
/// block per metablock slot.
///
pub struct RamBuf {
    data: Vec<u8>,
}

impl RamBuf {
    pub fn new(caches_per_seg: usize) -> Self {
        RamBuf {
            data: vec![0u8; (caches_per_seg + 1) * BLOCK_SIZE],
        }
    }

    /// The whole buffer, header block first.
    ///
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// The 4 KiB header block.
    ///
    pub fn header_block_mut(&mut self) -> &mut [u8] {
        &mut self.data[..BLOCK_SIZE]
    }

    /// The staging block for metablock slot `slot`.
    ///
    pub fn slot(&self, slot: usize) -> &[u8] {
        let at = (slot + 1) * BLOCK_SIZE;
        &self.data[at..at + BLOCK_SIZE]
    }

    /// Mutable access to the staging block for slot `slot`.
    ///
    pub fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let at = (slot + 1) * BLOCK_SIZE;
        &mut self.data[at..at + BLOCK_SIZE]
    }

    fn zero(&mut self) {
        for byte in self.data.iter_mut() {
            *byte = 0;
        }
    }
}

/// The fixed ring of RAM buffers.
///
pub struct RamBufPool {
    slots: Mutex<Vec<Option<Box<RamBuf>>>>,
    cond: Condvar,
}

impl RamBufPool {
    /// Returns a pool of `nr_rambuf` buffers sized for
    /// `caches_per_seg` cache blocks each.
    ///
    pub fn new(nr_rambuf: usize, caches_per_seg: usize) -> Self {
        let mut slots = Vec::with_capacity(nr_rambuf);
        for _ in 0..nr_rambuf {
            slots.push(Some(Box::new(RamBuf::new(caches_per_seg))));
        }

        RamBufPool {
            slots: Mutex::new(slots),
            cond: Condvar::new(),
        }
    }

    fn slot_of_id(&self, slots: &[Option<Box<RamBuf>>], id: u64) -> usize {
        ((id - 1) % slots.len() as u64) as usize
    }

    /// Takes the buffer for segment `id`, blocking until the
    /// previous user of the slot has returned it. The buffer is
    /// zeroed before it is handed out.
    ///
    pub fn acquire(&self, id: u64) -> Box<RamBuf> {
        let mut slots = crate::lock(&self.slots);
        let slot = self.slot_of_id(&slots, id);
        loop {
            if let Some(mut buf) = slots[slot].take() {
                drop(slots);
                buf.zero();
                return buf;
            }
            slots = self.cond.wait(slots).expect("poisoned lock");
        }
    }

    /// Returns the buffer for segment `id` after its flush has
    /// completed.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied, which indicates a
    /// double release.
    ///
    pub fn release(&self, id: u64, buf: Box<RamBuf>) {
        let mut slots = crate::lock(&self.slots);
        let slot = self.slot_of_id(&slots, id);
        assert!(slots[slot].is_none());
        slots[slot] = Some(buf);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn slots() {
        let mut buf = RamBuf::new(3);
        assert_eq!(buf.bytes().len(), 4 * BLOCK_SIZE);

        buf.header_block_mut()[0] = 1;
        buf.slot_mut(0)[0] = 2;
        buf.slot_mut(2)[BLOCK_SIZE - 1] = 3;

        assert_eq!(buf.bytes()[0], 1);
        assert_eq!(buf.slot(0)[0], 2);
        assert_eq!(buf.slot(2)[BLOCK_SIZE - 1], 3);

        buf.zero();
        assert!(buf.bytes().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn ring_reuse() {
        let pool = RamBufPool::new(2, 3);

        // Segments 1 and 2 take the two slots.
        let buf1 = pool.acquire(1);
        let buf2 = pool.acquire(2);

        // Segment 3 reuses slot 0, so it waits for segment 1.
        let pool = Arc::new(pool);
        let clone = pool.clone();
        let waiter = thread::spawn(move || clone.acquire(3));

        pool.release(1, buf1);
        let buf3 = waiter.join().unwrap();
        assert!(buf3.bytes().iter().all(|&byte| byte == 0));

        pool.release(2, buf2);
        pool.release(3, buf3);
    }
}
