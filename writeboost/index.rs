// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The hash index mapping backing-device keys to metablocks.
//!
//! Metablocks are named by dense indices into stable arrays, so the
//! index stores chains as arrays of links rather than pointers. A
//! metablock is either linked into exactly one bucket chain or
//! detached; detachment is a first-class state, and a detached
//! metablock keeps its last key so the flush path can still record
//! it.

use crate::segment::MB_NONE;

/// Computes the bucket for a key.
///
/// Keys are 4 KiB-aligned sectors, so the low three bits carry no
/// information; the block number is spread with a Fibonacci
/// multiplier before masking.
///
fn spread(key: u64) -> u64 {
    (key >> 3).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// A chained hash index over metablocks.
///
pub struct HashIndex {
    buckets: Vec<u32>,
    next: Vec<u32>,
    keys: Vec<u64>,
    linked: Vec<bool>,
    mask: u64,
}

impl HashIndex {
    /// Returns an index sized for `nr_caches` metablocks, all
    /// detached.
    ///
    pub fn new(nr_caches: u32) -> Self {
        let htsize = (nr_caches as usize).next_power_of_two();
        Self::with_htsize(nr_caches, htsize)
    }

    fn with_htsize(nr_caches: u32, htsize: usize) -> Self {
        HashIndex {
            buckets: vec![MB_NONE; htsize],
            next: vec![MB_NONE; nr_caches as usize],
            keys: vec![0; nr_caches as usize],
            linked: vec![false; nr_caches as usize],
            mask: htsize as u64 - 1,
        }
    }

    fn bucket_of(&self, key: u64) -> usize {
        (spread(key) & self.mask) as usize
    }

    /// Unlinks `mb` from its bucket chain, if it is on one.
    ///
    fn unlink(&mut self, mb: u32) {
        if !self.linked[mb as usize] {
            return;
        }

        let bucket = self.bucket_of(self.keys[mb as usize]);
        let mut link = self.buckets[bucket];
        if link == mb {
            self.buckets[bucket] = self.next[mb as usize];
        } else {
            while link != MB_NONE {
                let after = self.next[link as usize];
                if after == mb {
                    self.next[link as usize] = self.next[mb as usize];
                    break;
                }
                link = after;
            }
        }

        self.next[mb as usize] = MB_NONE;
        self.linked[mb as usize] = false;
    }

    /// Looks a key up, returning the metablock caching it.
    ///
    pub fn lookup(&self, key: u64) -> Option<u32> {
        let mut link = self.buckets[self.bucket_of(key)];
        while link != MB_NONE {
            if self.keys[link as usize] == key {
                return Some(link);
            }
            link = self.next[link as usize];
        }

        None
    }

    /// Registers `mb` under `key`, detaching it from any prior
    /// bucket first.
    ///
    /// Callers must have invalidated any previous occupant of
    /// `key`; registering over a live occupant would shadow it.
    ///
    pub fn register(&mut self, mb: u32, key: u64) {
        self.unlink(mb);
        debug_assert!(self.lookup(key).is_none());

        let bucket = self.bucket_of(key);
        self.keys[mb as usize] = key;
        self.next[mb as usize] = self.buckets[bucket];
        self.buckets[bucket] = mb;
        self.linked[mb as usize] = true;
    }

    /// Detaches `mb` from the index. The metablock keeps its key
    /// for the flush path, but no lookup will return it.
    ///
    pub fn delete(&mut self, mb: u32) {
        self.unlink(mb);
    }

    /// Returns `mb`'s key if it is currently registered.
    ///
    pub fn registered_key(&self, mb: u32) -> Option<u64> {
        if self.linked[mb as usize] {
            Some(self.keys[mb as usize])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_delete() {
        let mut index = HashIndex::new(8);
        assert_eq!(index.lookup(0), None);

        index.register(3, 0);
        index.register(4, 8);
        assert_eq!(index.lookup(0), Some(3));
        assert_eq!(index.lookup(8), Some(4));
        assert_eq!(index.lookup(16), None);
        assert_eq!(index.registered_key(3), Some(0));

        index.delete(3);
        assert_eq!(index.lookup(0), None);
        assert_eq!(index.registered_key(3), None);
        assert_eq!(index.lookup(8), Some(4));

        // Deleting a detached metablock is a no-op.
        index.delete(3);
        assert_eq!(index.lookup(8), Some(4));
    }

    #[test]
    fn rekey() {
        let mut index = HashIndex::new(8);

        // Re-registering moves the metablock to the new key.
        index.register(1, 0);
        index.register(1, 64);
        assert_eq!(index.lookup(0), None);
        assert_eq!(index.lookup(64), Some(1));

        // Registering a fresh metablock after deleting the old
        // occupant takes over the key.
        index.delete(1);
        index.register(2, 64);
        assert_eq!(index.lookup(64), Some(2));
    }

    #[test]
    fn chains() {
        // One bucket: every key collides, exercising the chain
        // walk in lookup and unlink.
        let mut index = HashIndex::with_htsize(3, 1);
        index.register(0, 0);
        index.register(1, 8);
        index.register(2, 16);
        assert_eq!(index.lookup(0), Some(0));
        assert_eq!(index.lookup(8), Some(1));
        assert_eq!(index.lookup(16), Some(2));

        // Unlink from the middle of the chain.
        index.delete(1);
        assert_eq!(index.lookup(0), Some(0));
        assert_eq!(index.lookup(8), None);
        assert_eq!(index.lookup(16), Some(2));

        // Unlink from the head.
        index.delete(2);
        assert_eq!(index.lookup(0), Some(0));
        assert_eq!(index.lookup(16), None);
    }
}
