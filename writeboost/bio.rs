// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The request model consumed by [`map`](crate::Writeboost::map).
//!
//! A bio addresses at most one 4 KiB block of the virtual device, in
//! 512 B sectors. The core either completes a bio inline, defers its
//! acknowledgement to the flush pipeline (barriers and FUA writes), or
//! remaps it to one of the two real devices. Remapped bios carry a
//! [`Tag`] that the caller must hand back through
//! [`end_io`](crate::Writeboost::end_io) once the I/O has finished.

use crate::Error;
use align::{sector_in_block, SECTOR_SIZE, SECTORS_PER_BLOCK};
use bitflags::bitflags;
use std::sync::{Arc, Condvar, Mutex};

bitflags! {
    /// Request flags carried by a bio.
    ///
    pub struct ReqFlags: u8 {
        /// All writes acknowledged before this bio must be durable
        /// before it starts.
        const PREFLUSH = 1 << 0;

        /// This bio's payload must be durable before it is
        /// acknowledged.
        const FUA = 1 << 1;
    }
}

/// The payload of a bio.
///
pub enum BioKind<'buf> {
    /// Read into the buffer.
    Read(&'buf mut [u8]),

    /// Write the buffer's contents.
    Write(&'buf [u8]),

    /// A pure flush, with no payload.
    Flush,
}

/// A single I/O request against the virtual device.
///
pub struct Bio<'buf> {
    /// The first 512 B sector this bio addresses.
    pub sector: u64,

    /// Request flags.
    pub flags: ReqFlags,

    /// The payload.
    pub kind: BioKind<'buf>,
}

impl<'buf> Bio<'buf> {
    /// Returns a read bio with no flags.
    ///
    pub fn read(sector: u64, buf: &'buf mut [u8]) -> Self {
        Bio {
            sector,
            flags: ReqFlags::empty(),
            kind: BioKind::Read(buf),
        }
    }

    /// Returns a write bio with no flags.
    ///
    pub fn write(sector: u64, buf: &'buf [u8]) -> Self {
        Bio {
            sector,
            flags: ReqFlags::empty(),
            kind: BioKind::Write(buf),
        }
    }

    /// Returns a pure-flush bio.
    ///
    pub fn flush() -> Self {
        Bio {
            sector: 0,
            flags: ReqFlags::PREFLUSH,
            kind: BioKind::Flush,
        }
    }

    /// Returns the bio's length in sectors.
    ///
    pub fn nr_sectors(&self) -> u64 {
        let bytes = match &self.kind {
            BioKind::Read(buf) => buf.len(),
            BioKind::Write(buf) => buf.len(),
            BioKind::Flush => 0,
        };

        (bytes / SECTOR_SIZE) as u64
    }

    /// Checks that the bio addresses a whole number of sectors
    /// within a single 4 KiB block.
    ///
    pub fn validate(&self) -> Result<(), Error> {
        let bytes = match &self.kind {
            BioKind::Read(buf) => buf.len(),
            BioKind::Write(buf) => buf.len(),
            BioKind::Flush => return Ok(()),
        };

        if bytes == 0 || bytes % SECTOR_SIZE != 0 {
            return Err(Error::InvalidRequest);
        }

        let nr_sectors = (bytes / SECTOR_SIZE) as u64;
        if sector_in_block(self.sector) + nr_sectors > SECTORS_PER_BLOCK {
            return Err(Error::InvalidRequest);
        }

        Ok(())
    }
}

/// Names one of the two real devices behind the cache.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetDev {
    /// The slow backing device.
    Backing,

    /// The fast cache device.
    Cache,
}

/// The per-request state the core records on a remapped bio.
///
/// The caller passes the tag back through
/// [`end_io`](crate::Writeboost::end_io) unchanged.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// Nothing to do at completion.
    None,

    /// A read miss that reserved a read-cache cell; the payload
    /// is captured at completion.
    WillCache {
        /// The reserved cell's index.
        cell: usize,
    },

    /// A read served from a flushed segment; the segment's
    /// inflight counter is decremented at completion.
    ReadSeg {
        /// The segment's position in the cyclic segment array.
        seg: usize,
    },
}

/// Where a remapped bio must be sent.
///
#[derive(Clone, Copy, Debug)]
pub struct Remap {
    /// The device the bio now targets.
    pub target: TargetDev,

    /// The rewritten start sector.
    pub sector: u64,

    /// Completion state for [`end_io`](crate::Writeboost::end_io).
    pub tag: Tag,
}

/// The inline outcome of a submitted bio.
///
pub enum SubmitResult {
    /// The bio completed inline.
    Done(Result<(), Error>),

    /// Acknowledgement is deferred until the bio's segment is
    /// durable; wait on the completion.
    Deferred(Completion),
}

/// The result of mapping a bio.
///
pub enum Disposition {
    /// The core consumed the bio.
    Submitted(SubmitResult),

    /// The caller must perform the bio against the named device
    /// and then call [`end_io`](crate::Writeboost::end_io).
    Remapped(Remap),
}

/// A waitable acknowledgement for a deferred bio.
///
/// Completions are released by the flush pipeline once the segment
/// the bio was staged into is durable on the cache device.
///
#[derive(Clone)]
pub struct Completion {
    state: Arc<CompletionState>,
}

struct CompletionState {
    result: Mutex<Option<Result<(), Error>>>,
    cond: Condvar,
}

impl Completion {
    /// Returns a new, unreleased completion.
    ///
    pub fn new() -> Self {
        Completion {
            state: Arc::new(CompletionState {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Releases the completion with the given result, waking
    /// all waiters.
    ///
    pub fn complete(&self, result: Result<(), Error>) {
        let mut slot = crate::lock(&self.state.result);
        if slot.is_none() {
            *slot = Some(result);
            self.state.cond.notify_all();
        }
    }

    /// Returns whether the completion has been released.
    ///
    pub fn is_complete(&self) -> bool {
        crate::lock(&self.state.result).is_some()
    }

    /// Blocks until the completion is released and returns its
    /// result.
    ///
    pub fn wait(&self) -> Result<(), Error> {
        let mut slot = crate::lock(&self.state.result);
        loop {
            match *slot {
                Some(result) => return result,
                None => slot = self.state.cond.wait(slot).expect("poisoned lock"),
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bio_validation() {
        let mut buf = [0u8; 4096];

        // A whole block at offset 0.
        assert_eq!(Bio::read(0, &mut buf).validate(), Ok(()));
        assert_eq!(Bio::read(8, &mut buf).validate(), Ok(()));

        // One sector at the last offset of a block.
        assert_eq!(Bio::read(7, &mut buf[..512]).validate(), Ok(()));
        assert_eq!(Bio::read(15, &mut buf[..512]).validate(), Ok(()));

        // Straddles a block boundary.
        assert_eq!(
            Bio::read(7, &mut buf[..1024]).validate(),
            Err(Error::InvalidRequest)
        );
        assert_eq!(
            Bio::read(4, &mut buf).validate(),
            Err(Error::InvalidRequest)
        );

        // Not a whole number of sectors.
        assert_eq!(
            Bio::read(0, &mut buf[..100]).validate(),
            Err(Error::InvalidRequest)
        );

        // Flush bios carry no payload.
        assert_eq!(Bio::flush().validate(), Ok(()));
        assert_eq!(Bio::flush().nr_sectors(), 0);
    }

    #[test]
    fn completion() {
        let completion = Completion::new();
        assert!(!completion.is_complete());

        let clone = completion.clone();
        let waiter = thread::spawn(move || clone.wait());

        completion.complete(Ok(()));
        assert!(completion.is_complete());
        assert_eq!(waiter.join().unwrap(), Ok(()));

        // A second release does not overwrite the first.
        completion.complete(Err(Error::Io));
        assert_eq!(completion.wait(), Ok(()));
    }
}
