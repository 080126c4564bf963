// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Bounded pools of fixed-size scratch buffers.
//!
//! The I/O paths draw 512 B and 4 KiB scratch areas from these pools.
//! An exhausted pool fails the allocation instead of blocking, so a
//! request under memory pressure is failed with out-of-memory rather
//! than stalling the cache.

use spin::Mutex;

/// A bounded pool of equally-sized byte buffers.
///
pub struct BufPool {
    buf_size: usize,
    bufs: Mutex<Vec<Box<[u8]>>>,
}

impl BufPool {
    /// Returns a pool holding `count` zeroed buffers of `buf_size`
    /// bytes each.
    ///
    pub fn new(buf_size: usize, count: usize) -> Self {
        let mut bufs = Vec::with_capacity(count);
        for _ in 0..count {
            bufs.push(vec![0u8; buf_size].into_boxed_slice());
        }

        BufPool {
            buf_size,
            bufs: Mutex::new(bufs),
        }
    }

    /// Takes a buffer from the pool, or returns `None` if the pool
    /// is exhausted.
    ///
    /// The buffer's previous contents are unspecified; callers
    /// overwrite the region they use.
    ///
    pub fn alloc(&self) -> Option<Box<[u8]>> {
        self.bufs.lock().pop()
    }

    /// Returns a buffer to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the buffer's size does not match the pool's,
    /// which indicates a buffer returned to the wrong pool.
    ///
    pub fn free(&self, buf: Box<[u8]>) {
        assert_eq!(buf.len(), self.buf_size);
        self.bufs.lock().push(buf);
    }
}
