// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The flush pipeline.
//!
//! Segment hand-off packages the active RAM buffer, its segment
//! identity, and any pending barriers into a flush job. A single
//! flusher thread drains the job queue in order, writes each segment
//! to the cache device in one synchronous write, advances
//! `last_flushed_id`, recycles the RAM buffer, and releases the
//! job's barriers. Segment `i` therefore always becomes durable
//! before segment `i + 1`.

use crate::bio::Completion;
use crate::dev::Core;
use crate::rambuf::RamBuf;
use crate::Error;
use align::BLOCK_SIZE;
use crossbeam_queue::ArrayQueue;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// One segment's worth of staged bytes on its way to the cache
/// device.
///
pub struct FlushJob {
    /// The segment's identity.
    pub id: u64,

    /// The segment's first sector on the cache device.
    pub start_sector: u64,

    /// The number of blocks to write: the header plus one block
    /// per committed metablock.
    pub nr_blocks: usize,

    /// The staged bytes, header block first.
    pub buf: Box<RamBuf>,

    /// Barriers released once this segment is durable.
    pub barriers: Vec<Completion>,
}

/// The bounded, single-consumer queue of flush jobs.
///
/// The queue's depth equals the RAM buffer count, so a push can
/// only fail if a buffer was handed off twice.
///
pub struct FlushQueue {
    jobs: ArrayQueue<FlushJob>,
    lock: Mutex<()>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl FlushQueue {
    pub fn new(depth: usize) -> Self {
        FlushQueue {
            jobs: ArrayQueue::new(depth),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Enqueues a job and wakes the flusher.
    ///
    /// # Panics
    ///
    /// Panics if the queue is full; the RAM buffer pool bounds the
    /// number of outstanding jobs, so overflow is a bug.
    ///
    pub fn push(&self, job: FlushJob) {
        if self.jobs.push(job).is_err() {
            panic!("flush queue overflow");
        }

        let _guard = crate::lock(&self.lock);
        self.cond.notify_all();
    }

    /// Takes the next job, blocking until one arrives. Returns
    /// `None` once the queue has been stopped and drained.
    ///
    pub fn pop_wait(&self) -> Option<FlushJob> {
        let mut guard = crate::lock(&self.lock);
        loop {
            if let Ok(job) = self.jobs.pop() {
                return Some(job);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            guard = self.cond.wait(guard).expect("poisoned lock");
        }
    }

    /// Stops the queue; the flusher exits after draining the
    /// remaining jobs.
    ///
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = crate::lock(&self.lock);
        self.cond.notify_all();
    }
}

/// The flusher worker's body.
///
pub fn run(core: &Core) {
    while let Some(job) = core.flush_q.pop_wait() {
        flush_one(core, job);
    }
}

/// Writes one segment durably and releases its waiters.
///
fn flush_one(core: &Core, job: FlushJob) {
    let FlushJob {
        id,
        start_sector,
        nr_blocks,
        buf,
        barriers,
    } = job;

    let bytes = &buf.bytes()[..nr_blocks * BLOCK_SIZE];
    let mut result = core
        .cache
        .write_at(start_sector, bytes)
        .map_err(|_| Error::Io);

    // Barriers demand durability, not just completion.
    if result.is_ok() && !barriers.is_empty() {
        result = core.cache.sync().map_err(|_| Error::Io);
    }

    if result.is_err() {
        // The pipeline still advances past a failed segment write;
        // the error surfaces through the job's barriers.
        error!("writing segment {} to the cache device failed", id);
    } else {
        debug!("segment {} flushed ({} blocks)", id, nr_blocks);
    }

    core.stats.record_flush();
    core.flushed.advance_to(id);
    core.rambufs.release(id, buf);

    for barrier in barriers {
        barrier.complete(result);
    }
}
