// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The cache device core: the write path, the read path, segment
//! hand-off, and the control surface.
//!
//! All index-visible state lives under one mutex (`io_lock` in the
//! state struct below); dirtiness transitions take a spinlock that
//! is never held across I/O. Synchronous device reads for partial
//! merges happen outside the mutex with a per-segment inflight
//! reference held, and the result is revalidated against the index
//! before it is committed.

mod facade;

pub use facade::CacheDev;

use crate::bio::{Bio, BioKind, Completion, Disposition, Remap, ReqFlags, SubmitResult, Tag, TargetDev};
use crate::config::{ConfigError, Options, Tunables};
use crate::flush::{FlushJob, FlushQueue};
use crate::index::HashIndex;
use crate::layout::{MbRecord, SegmentHeader, SuperblockHeader, SuperblockRecord, INVALID_KEY};
use crate::mempool::BufPool;
use crate::rambuf::{RamBuf, RamBufPool};
use crate::readcache::{BatchSignal, ReadCacheState};
use crate::segment::{DirtyTable, Geometry, IdGate, Inflight};
use crate::stats::{Stats, StatsSnapshot};
use crate::Error;
use align::{
    align_down_to_block, sector_in_block, sector_mask, FULL_MASK, BLOCK_SIZE, SECTOR_SIZE,
    SECTORS_PER_BLOCK,
};
use log::{info, warn};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use storage::block::{Device, DeviceRef};

/// The number of 512 B scratch buffers in the bounded pool.
///
const NR_BUF_1: usize = 16;

/// The number of 4 KiB scratch buffers in the bounded pool.
///
const NR_BUF_8: usize = 16;

/// The durable state recovered from the cache device, from which
/// the core resumes. The current segment identity follows as
/// `last_flushed_id + 1`.
///
#[derive(Clone, Debug)]
pub struct ResumeState {
    pub last_flushed_id: u64,
    pub last_writeback_id: u64,

    /// The cache blocks the recovery subsystem found resident in
    /// the flushed segments, oldest segment first. The constructor
    /// rebuilds the index and the dirtiness table from them.
    pub resident: Vec<ResumeRecord>,
}

impl ResumeState {
    /// The state of a freshly formatted cache device.
    ///
    pub fn fresh() -> Self {
        ResumeState {
            last_flushed_id: 0,
            last_writeback_id: 0,
            resident: Vec::new(),
        }
    }
}

/// One recovered cache block: metablock `mb` caches `key_sector`,
/// with `dirty_bits` still awaiting writeback.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeRecord {
    pub mb: u32,
    pub key_sector: u64,
    pub dirty_bits: u8,
}

/// A point-in-time view of the device, for operators.
///
#[derive(Clone, Debug)]
pub struct Status {
    pub current_id: u64,
    pub last_flushed_id: u64,
    pub last_writeback_id: u64,
    pub nr_dirty_caches: usize,
    pub barriers_pending: usize,
    pub stats: StatsSnapshot,
}

/// One dirty cache block the writeback daemon must copy to the
/// backing device.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WritebackRecord {
    /// The metablock's dense index.
    pub mb: u32,

    /// The backing sector the block belongs to.
    pub key_sector: u64,

    /// The sectors awaiting writeback.
    pub data_bits: u8,
}

/// The state guarded by the write-path mutex.
///
struct Inner {
    index: HashIndex,
    cursor: u32,
    current_id: u64,
    seg_ids: Vec<u64>,
    seg_len: Vec<usize>,
    rambuf: Option<Box<RamBuf>>,
    barriers: Vec<Completion>,
    rc: ReadCacheState,
}

/// The cache core shared between the foreground paths and the
/// worker threads.
///
pub(crate) struct Core {
    pub(crate) backing: DeviceRef,
    pub(crate) cache: DeviceRef,
    pub(crate) geom: Geometry,
    opts: Options,
    tunables: Tunables,

    io_lock: Mutex<Inner>,
    dirty: DirtyTable,
    drop_lock: Mutex<()>,
    drop_cond: Condvar,

    inflight: Inflight,
    pub(crate) flushed: IdGate,
    written_back: IdGate,

    pub(crate) rambufs: RamBufPool,
    pub(crate) flush_q: FlushQueue,

    cell_data: Vec<spin::Mutex<Box<[u8]>>>,
    ack_count: AtomicUsize,
    batch: BatchSignal,

    buf_1: BufPool,
    buf_8: BufPool,

    pub(crate) stats: Stats,
    force_drop: AtomicBool,
}

/// The log-structured cache device.
///
/// Owns the flusher and read-cache worker threads; dropping the
/// device hands off any staged data, drains the flush queue, and
/// joins the workers.
///
pub struct Writeboost {
    core: Arc<Core>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Formats a cache device: writes the superblock header and a
/// zeroed superblock record.
///
pub fn format_cache_device(cache: &dyn Device, segment_size_order: u8) -> Result<(), Error> {
    let segment_size = 1u64 << segment_size_order;

    let mut sector = vec![0u8; SECTOR_SIZE];
    SuperblockHeader::encode(&mut sector);
    cache.write_at(0, &sector).map_err(|_| Error::Io)?;

    let mut sector = vec![0u8; SECTOR_SIZE];
    SuperblockRecord {
        last_writeback_id: 0,
    }
    .encode(&mut sector);
    cache
        .write_at(segment_size - 1, &sector)
        .map_err(|_| Error::Io)?;

    cache.sync().map_err(|_| Error::Io)
}

impl Writeboost {
    /// Builds the core over a backing and a cache device and
    /// starts its worker threads.
    ///
    pub fn new(
        backing: DeviceRef,
        cache: DeviceRef,
        options: Options,
        resume: ResumeState,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let geom = Geometry::new(options.segment_size_order, cache.nr_sectors())?;

        let nr_segments = geom.nr_segments() as usize;
        let current_id = resume.last_flushed_id + 1;

        // Rebuild the segment identity table for the identities
        // still on the ring.
        let mut seg_ids = vec![0u64; nr_segments];
        let oldest = if current_id > geom.nr_segments() {
            current_id - geom.nr_segments() + 1
        } else {
            1
        };
        for id in oldest..=current_id {
            seg_ids[geom.seg_pos_of_id(id)] = id;
        }

        let rambufs = RamBufPool::new(options.nr_rambuf, geom.caches_per_seg());
        let rambuf = rambufs.acquire(current_id);

        // Replay the recovered cache lines, oldest first, so a
        // newer copy of a key supersedes an older one.
        let mut index = HashIndex::new(geom.nr_caches());
        let dirty = DirtyTable::new(geom.nr_caches());
        for record in resume.resident.iter() {
            if record.mb >= geom.nr_caches() {
                warn!("resume record for metablock {} is out of range", record.mb);
                continue;
            }

            let seg_id = seg_ids[geom.seg_pos_of_mb(record.mb)];
            if seg_id == 0 || seg_id == current_id {
                warn!(
                    "resume record for metablock {} does not name a flushed segment",
                    record.mb
                );
                continue;
            }

            if let Some(prior) = index.lookup(record.key_sector) {
                dirty.clean(prior);
                index.delete(prior);
            }
            index.register(record.mb, record.key_sector);

            // Segments behind the writeback frontier carry no dirt.
            if record.dirty_bits != 0 && seg_id > resume.last_writeback_id {
                dirty.taint(record.mb, record.dirty_bits);
            }
        }

        let nr_cells = options.nr_read_cache_cells;
        let mut cell_data = Vec::with_capacity(nr_cells);
        for _ in 0..nr_cells {
            cell_data.push(spin::Mutex::new(vec![0u8; BLOCK_SIZE].into_boxed_slice()));
        }

        info!(
            "resuming: {} segments of {} sectors, current segment {}, {} resident blocks",
            nr_segments,
            geom.segment_size_sectors(),
            current_id,
            resume.resident.len()
        );

        let core = Arc::new(Core {
            backing,
            cache,
            geom,
            opts: options,
            tunables: Tunables::new(),
            io_lock: Mutex::new(Inner {
                index,
                cursor: geom.first_mb_of_pos(geom.seg_pos_of_id(current_id)),
                current_id,
                seg_ids,
                seg_len: vec![0usize; nr_segments],
                rambuf: Some(rambuf),
                barriers: Vec::new(),
                rc: ReadCacheState::new(nr_cells),
            }),
            dirty,
            drop_lock: Mutex::new(()),
            drop_cond: Condvar::new(),
            inflight: Inflight::new(nr_segments),
            flushed: IdGate::new(resume.last_flushed_id),
            written_back: IdGate::new(resume.last_writeback_id),
            rambufs,
            flush_q: FlushQueue::new(options.nr_rambuf),
            cell_data,
            ack_count: AtomicUsize::new(nr_cells),
            batch: BatchSignal::new(),
            buf_1: BufPool::new(SECTOR_SIZE, NR_BUF_1),
            buf_8: BufPool::new(BLOCK_SIZE, NR_BUF_8),
            stats: Stats::new(),
            force_drop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(2);

        let flusher = core.clone();
        workers.push(
            thread::Builder::new()
                .name("wb-flusher".into())
                .spawn(move || crate::flush::run(&flusher))
                .expect("failed to spawn the flusher"),
        );

        let promoter = core.clone();
        workers.push(
            thread::Builder::new()
                .name("wb-readcache".into())
                .spawn(move || {
                    while promoter.batch.wait() {
                        promoter.run_batch();
                    }
                })
                .expect("failed to spawn the read-cache worker"),
        );

        Ok(Writeboost { core, workers })
    }

    /// Maps one bio, per the host block-device contract: the bio
    /// either completes inline (possibly deferred to the flush
    /// pipeline) or comes back remapped to one of the two real
    /// devices, in which case the caller performs the I/O and then
    /// calls [`end_io`](Writeboost::end_io) with the returned tag.
    ///
    pub fn map(&self, bio: Bio<'_>) -> Disposition {
        self.core.map(bio)
    }

    /// Completes a remapped bio. `data` is the bio's payload, used
    /// by read-cache captures; pass the read buffer for reads and
    /// an empty slice otherwise.
    ///
    pub fn end_io(&self, tag: Tag, data: &[u8], result: Result<(), Error>) {
        self.core.end_io(tag, data, result)
    }

    /// Forces a segment hand-off if barrier bios are pending.
    /// External deadline timers call this to bound barrier latency.
    ///
    pub fn flush_barriers(&self) {
        self.core.flush_barriers()
    }

    /// Hands off the staged segment, waits for its durability, and
    /// syncs the cache device.
    ///
    pub fn sync_all(&self) -> Result<(), Error> {
        self.core.sync_all()
    }

    /// Blocks until every dirty cache block has been written back.
    /// Requires a running writeback daemon to drain the dirt.
    ///
    pub fn drop_caches(&self) {
        self.core.drop_caches()
    }

    /// Zeroes the statistics counters.
    ///
    pub fn clear_stat(&self) {
        self.core.stats.clear()
    }

    /// Sets a runtime tunable.
    ///
    pub fn reconfigure(&self, key: &str, value: u64) -> Result<(), ConfigError> {
        self.core.tunables.set(key, value)
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn geometry(&self) -> Geometry {
        self.core.geom
    }

    /// Blocks until segment `id` is durable on the cache device.
    ///
    pub fn wait_for_flush(&self, id: u64) {
        self.core.flushed.wait_for(id)
    }

    /// The newest durably flushed segment identity. Daemons poll
    /// this without taking any lock.
    ///
    pub fn last_flushed_id(&self) -> u64 {
        self.core.flushed.get()
    }

    /// The newest written-back segment identity.
    ///
    pub fn last_writeback_id(&self) -> u64 {
        self.core.written_back.get()
    }

    /// The number of dirty cache blocks.
    ///
    pub fn nr_dirty_caches(&self) -> usize {
        self.core.dirty.nr_dirty()
    }

    /// Whether [`drop_caches`](Writeboost::drop_caches) is waiting;
    /// the writeback daemon should drain regardless of thresholds.
    ///
    pub fn force_drop_requested(&self) -> bool {
        self.core.force_drop.load(Ordering::Acquire)
    }

    /// The dirty blocks of flushed segment `id`, decoded from its
    /// on-disk header, for the writeback daemon.
    ///
    pub fn writeback_records(&self, id: u64) -> Result<Vec<WritebackRecord>, Error> {
        self.core.writeback_records(id)
    }

    /// Marks segment `id` written back: its blocks become clean
    /// and `last_writeback_id` advances, releasing segment-reuse
    /// waiters.
    ///
    pub fn complete_writeback(&self, id: u64) {
        self.core.complete_writeback(id)
    }

    /// Writes the superblock record for the current
    /// `last_writeback_id` to the cache device.
    ///
    pub fn record_superblock(&self) -> Result<(), Error> {
        self.core.record_superblock()
    }
}

impl Drop for Writeboost {
    fn drop(&mut self) {
        self.core.drain_for_shutdown();
        self.core.flush_q.stop();
        self.core.batch.stop();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Copies the sectors named by `data_bits` from `scratch` into a
/// staging block.
///
fn stage_block(slot: &mut [u8], scratch: &[u8], data_bits: u8) {
    if data_bits == FULL_MASK {
        slot.copy_from_slice(&scratch[..BLOCK_SIZE]);
        return;
    }

    for i in 0..SECTORS_PER_BLOCK as usize {
        if data_bits & (1 << i) != 0 {
            let at = i * SECTOR_SIZE;
            slot[at..at + SECTOR_SIZE].copy_from_slice(&scratch[at..at + SECTOR_SIZE]);
        }
    }
}

impl Core {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        crate::lock(&self.io_lock)
    }

    pub(crate) fn map(&self, bio: Bio<'_>) -> Disposition {
        if let Err(error) = bio.validate() {
            return Disposition::Submitted(SubmitResult::Done(Err(error)));
        }

        let sector = bio.sector;
        let flags = bio.flags;
        match bio.kind {
            BioKind::Write(data) => self.write_bio(sector, data, flags),
            BioKind::Read(buf) => self.read_bio(sector, buf),
            BioKind::Flush => self.flush_bio(),
        }
    }

    pub(crate) fn end_io(&self, tag: Tag, data: &[u8], result: Result<(), Error>) {
        match tag {
            Tag::None => {}
            Tag::ReadSeg { seg } => self.inflight.dec(seg),
            Tag::WillCache { cell } => {
                match result {
                    Ok(()) => {
                        let mut slot = self.cell_data[cell].lock();
                        slot.copy_from_slice(&data[..BLOCK_SIZE]);
                    }
                    Err(_) => {
                        let mut inner = self.lock_inner();
                        inner.rc.mark_cancelled(cell);
                    }
                }

                if self.ack_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.batch.raise();
                }
            }
        }
    }

    // The write path.

    fn write_bio(&self, sector: u64, data: &[u8], flags: ReqFlags) -> Disposition {
        let full = data.len() == BLOCK_SIZE;
        if self.opts.write_around_mode {
            return self.write_around(sector, full);
        }

        let nr_sectors = (data.len() / SECTOR_SIZE) as u64;
        let offset = sector_in_block(sector);
        let data_bits = sector_mask(offset, nr_sectors);
        let key = align_down_to_block(sector);

        let mut scratch = match self.buf_8.alloc() {
            Some(buf) => buf,
            None => return Disposition::Submitted(SubmitResult::Done(Err(Error::OutOfMemory))),
        };
        let at = offset as usize * SECTOR_SIZE;
        scratch[at..at + data.len()].copy_from_slice(data);

        let outcome = self.write_cached(key, data_bits, &mut scratch, flags, full);
        self.buf_8.free(scratch);

        Disposition::Submitted(match outcome {
            Ok(submit) => submit,
            Err(error) => SubmitResult::Done(Err(error)),
        })
    }

    /// Stages one write into the log.
    ///
    /// `scratch` holds the payload at its in-block offset and is
    /// extended in place when older dirty sectors are merged
    /// forward.
    ///
    fn write_cached(
        &self,
        key: u64,
        orig_bits: u8,
        scratch: &mut [u8],
        flags: ReqFlags,
        full: bool,
    ) -> Result<SubmitResult, Error> {
        let mut attempt = 0u32;
        loop {
            let mut data_bits = orig_bits;
            let mut inner = self.lock_inner();
            let found = inner.index.lookup(key);
            let mut reuse_slot = None;

            if let Some(mb) = found {
                let pos = self.geom.seg_pos_of_mb(mb);
                let on_buffer = inner.seg_ids[pos] == inner.current_id;
                if attempt == 0 {
                    self.stats.record_io(true, true, on_buffer, full);
                }

                if on_buffer {
                    reuse_slot = Some(mb);
                } else {
                    // prepare_overwrite: the occupant lives on a
                    // flushed segment. Merge its dirty sectors
                    // forward if the new write leaves any exposed,
                    // then invalidate it.
                    let seg_id = inner.seg_ids[pos];
                    let old = self.dirty.get(mb);
                    let merge =
                        orig_bits != FULL_MASK && old.dirty && old.data_bits & !orig_bits != 0;
                    if merge {
                        self.inflight.inc(pos);
                        drop(inner);

                        let merged =
                            self.merge_forward(mb, seg_id, orig_bits, old.data_bits, scratch);

                        // Drop the reference before re-locking: a
                        // hand-off recycling this position waits for
                        // it to reach zero while holding the mutex.
                        self.inflight.dec(pos);
                        merged?;

                        inner = self.lock_inner();
                        if inner.index.lookup(key) != Some(mb) || inner.seg_ids[pos] != seg_id {
                            // The occupant moved while the merge
                            // read was in flight; start over.
                            drop(inner);
                            attempt += 1;
                            continue;
                        }
                        data_bits |= old.data_bits;
                    }

                    self.clean_mb(mb);
                    inner.index.delete(mb);
                }
            } else if attempt == 0 {
                self.stats.record_io(true, false, false, full);
            }

            let mb = match reuse_slot {
                Some(mb) => {
                    self.inflight.inc(self.geom.seg_pos_of_mb(mb));
                    mb
                }
                None => {
                    inner.rc.cancel_sector(key);
                    if self.needs_new_segment(&inner) {
                        self.rotate_segment(&mut inner);
                    }
                    self.advance_cursor(&mut inner)
                }
            };

            let slot = self.geom.slot_of_mb(mb);
            stage_block(
                inner
                    .rambuf
                    .as_mut()
                    .expect("no active RAM buffer")
                    .slot_mut(slot),
                scratch,
                data_bits,
            );
            self.dirty.taint(mb, data_bits);
            inner.index.register(mb, key);

            let cur_pos = self.geom.seg_pos_of_id(inner.current_id);
            let deferred = if flags.intersects(ReqFlags::FUA | ReqFlags::PREFLUSH) {
                let completion = Completion::new();
                inner.barriers.push(completion.clone());
                self.stats.record_barrier();
                Some(completion)
            } else {
                None
            };
            drop(inner);
            self.inflight.dec(cur_pos);

            return Ok(match deferred {
                Some(completion) => SubmitResult::Deferred(completion),
                None => SubmitResult::Done(Ok(())),
            });
        }
    }

    /// Reads the old occupant's dirty sectors from the cache
    /// device and copies the ones the incoming write leaves
    /// uncovered into `scratch`.
    ///
    /// Runs without the write-path mutex; the caller holds an
    /// inflight reference on the occupant's segment.
    ///
    fn merge_forward(
        &self,
        mb: u32,
        seg_id: u64,
        incoming: u8,
        old_bits: u8,
        scratch: &mut [u8],
    ) -> Result<(), Error> {
        self.flushed.wait_for(seg_id);

        let mut sector_buf = self.buf_1.alloc().ok_or(Error::OutOfMemory)?;
        let base = self.geom.mb_data_sector(mb);
        let mut result = Ok(());

        for i in 0..SECTORS_PER_BLOCK as usize {
            let bit = 1u8 << i;
            if old_bits & bit == 0 || incoming & bit != 0 {
                continue;
            }

            if self.cache.read_at(base + i as u64, &mut sector_buf).is_err() {
                result = Err(Error::Io);
                break;
            }

            let at = i * SECTOR_SIZE;
            scratch[at..at + SECTOR_SIZE].copy_from_slice(&sector_buf);
        }

        self.buf_1.free(sector_buf);
        result
    }

    fn write_around(&self, sector: u64, full: bool) -> Disposition {
        let key = align_down_to_block(sector);
        let mut inner = self.lock_inner();

        let found = inner.index.lookup(key);
        self.stats.record_io(true, found.is_some(), false, full);
        if let Some(mb) = found {
            self.clean_mb(mb);
            inner.index.delete(mb);
        }
        inner.rc.cancel_sector(key);
        drop(inner);

        Disposition::Remapped(Remap {
            target: TargetDev::Backing,
            sector,
            tag: Tag::None,
        })
    }

    // The read path.

    fn read_bio(&self, sector: u64, buf: &mut [u8]) -> Disposition {
        let key = align_down_to_block(sector);
        let offset = sector_in_block(sector) as usize;
        let full = buf.len() == BLOCK_SIZE;

        let mut inner = self.lock_inner();
        let found = inner.index.lookup(key);

        let mb = match found {
            None => {
                self.stats.record_io(false, false, false, full);

                let mut tag = Tag::None;
                if full {
                    let threshold = self.tunables.read_cache_threshold();
                    if let Some(cell) = inner.rc.reserve(key, threshold) {
                        self.stats.record_read_cache_reserved();
                        tag = Tag::WillCache { cell };
                    }
                }
                drop(inner);

                return Disposition::Remapped(Remap {
                    target: TargetDev::Backing,
                    sector,
                    tag,
                });
            }
            Some(mb) => mb,
        };

        let pos = self.geom.seg_pos_of_mb(mb);
        let seg_id = inner.seg_ids[pos];
        let dirt = self.dirty.get(mb);

        if seg_id == inner.current_id {
            self.stats.record_io(false, true, true, full);
            let slot = self.geom.slot_of_mb(mb);

            if dirt.data_bits == FULL_MASK {
                // Fully valid on the staging buffer; serve the
                // requested range straight from RAM.
                let block = inner.rambuf.as_ref().expect("no active RAM buffer").slot(slot);
                let at = offset * SECTOR_SIZE;
                buf.copy_from_slice(&block[at..at + buf.len()]);
                return Disposition::Submitted(SubmitResult::Done(Ok(())));
            }

            // Partial: snapshot the staged block, then overlay it
            // on the backing block outside the mutex.
            let mut staged = match self.buf_8.alloc() {
                Some(buf) => buf,
                None => {
                    return Disposition::Submitted(SubmitResult::Done(Err(Error::OutOfMemory)))
                }
            };
            staged.copy_from_slice(inner.rambuf.as_ref().expect("no active RAM buffer").slot(slot));
            self.inflight.inc(pos);
            drop(inner);

            let result = self.read_with_backing(key, dirt.data_bits, &staged, offset, buf);
            self.inflight.dec(pos);
            self.buf_8.free(staged);
            return Disposition::Submitted(SubmitResult::Done(result));
        }

        // A hit on a flushed segment: reads may not race ahead of
        // their own segment's flush.
        self.stats.record_io(false, true, false, full);
        self.inflight.inc(pos);
        drop(inner);
        self.flushed.wait_for(seg_id);

        if dirt.data_bits == FULL_MASK {
            return Disposition::Remapped(Remap {
                target: TargetDev::Cache,
                sector: self.geom.mb_data_sector(mb) + offset as u64,
                tag: Tag::ReadSeg { seg: pos },
            });
        }

        let result = self.read_with_cache_overlay(key, mb, dirt.data_bits, offset, buf);
        self.inflight.dec(pos);
        Disposition::Submitted(SubmitResult::Done(result))
    }

    /// Synthesises a block from the backing device and the staged
    /// sectors named by `data_bits`, then copies the requested
    /// range into `out`.
    ///
    fn read_with_backing(
        &self,
        key: u64,
        data_bits: u8,
        staged: &[u8],
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        let mut block = self.buf_8.alloc().ok_or(Error::OutOfMemory)?;

        let result = self
            .backing
            .read_at(key, &mut block[..BLOCK_SIZE])
            .map_err(|_| Error::Io);

        if result.is_ok() {
            for i in 0..SECTORS_PER_BLOCK as usize {
                if data_bits & (1 << i) != 0 {
                    let at = i * SECTOR_SIZE;
                    block[at..at + SECTOR_SIZE].copy_from_slice(&staged[at..at + SECTOR_SIZE]);
                }
            }

            let at = offset * SECTOR_SIZE;
            out.copy_from_slice(&block[at..at + out.len()]);
        }

        self.buf_8.free(block);
        result
    }

    /// Synthesises a block from the backing device and the dirty
    /// sectors read from the cache device, then copies the
    /// requested range into `out`.
    ///
    fn read_with_cache_overlay(
        &self,
        key: u64,
        mb: u32,
        data_bits: u8,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        let mut block = self.buf_8.alloc().ok_or(Error::OutOfMemory)?;
        let mut sector_buf = match self.buf_1.alloc() {
            Some(buf) => buf,
            None => {
                self.buf_8.free(block);
                return Err(Error::OutOfMemory);
            }
        };

        let mut result = self
            .backing
            .read_at(key, &mut block[..BLOCK_SIZE])
            .map_err(|_| Error::Io);

        if result.is_ok() {
            let base = self.geom.mb_data_sector(mb);
            for i in 0..SECTORS_PER_BLOCK as usize {
                if data_bits & (1 << i) == 0 {
                    continue;
                }

                if self.cache.read_at(base + i as u64, &mut sector_buf).is_err() {
                    result = Err(Error::Io);
                    break;
                }

                let at = i * SECTOR_SIZE;
                block[at..at + SECTOR_SIZE].copy_from_slice(&sector_buf);
            }
        }

        if result.is_ok() {
            let at = offset * SECTOR_SIZE;
            out.copy_from_slice(&block[at..at + out.len()]);
        }

        self.buf_1.free(sector_buf);
        self.buf_8.free(block);
        result
    }

    fn flush_bio(&self) -> Disposition {
        if self.opts.write_around_mode {
            // Nothing is staged; the flush belongs to the backing
            // device.
            return Disposition::Remapped(Remap {
                target: TargetDev::Backing,
                sector: 0,
                tag: Tag::None,
            });
        }

        let completion = Completion::new();
        let mut inner = self.lock_inner();
        inner.barriers.push(completion.clone());
        self.stats.record_barrier();
        drop(inner);

        Disposition::Submitted(SubmitResult::Deferred(completion))
    }

    // The cursor and segment hand-off.

    fn needs_new_segment(&self, inner: &Inner) -> bool {
        let pos = self.geom.seg_pos_of_id(inner.current_id);
        inner.seg_len[pos] == self.geom.caches_per_seg()
    }

    /// Hands out the next metablock slot of the current segment.
    ///
    fn advance_cursor(&self, inner: &mut Inner) -> u32 {
        let pos = self.geom.seg_pos_of_id(inner.current_id);
        debug_assert!(inner.seg_len[pos] < self.geom.caches_per_seg());

        let mb = inner.cursor;
        inner.cursor += 1;
        inner.seg_len[pos] += 1;
        self.inflight.inc(pos);

        mb
    }

    fn rotate_segment(&self, inner: &mut Inner) {
        self.queue_flush_job(inner);
        self.acquire_new_segment(inner, inner.current_id + 1);
    }

    /// Packages the current segment and its barriers into a flush
    /// job.
    ///
    fn queue_flush_job(&self, inner: &mut Inner) {
        let id = inner.current_id;
        let pos = self.geom.seg_pos_of_id(id);

        self.inflight.wait_zero(pos);

        let length = inner.seg_len[pos];
        let mut buf = inner.rambuf.take().expect("no active RAM buffer");
        let lap = self.geom.lap_of_id(id);

        {
            let header = buf.header_block_mut();
            SegmentHeader {
                id,
                length: length as u8,
                lap,
            }
            .encode(header);

            let first = self.geom.first_mb_of_pos(pos);
            for slot in 0..self.geom.caches_per_seg() {
                let mb = first + slot as u32;
                let key = inner.index.registered_key(mb).unwrap_or(INVALID_KEY);
                let dirt = self.dirty.get(mb);
                MbRecord {
                    key_sector: key,
                    dirty_bits: if dirt.dirty { dirt.data_bits } else { 0 },
                    lap,
                }
                .encode(header, slot);
            }
        }

        let barriers = mem::replace(&mut inner.barriers, Vec::new());
        self.flush_q.push(FlushJob {
            id,
            start_sector: self.geom.seg_start_sector(pos),
            nr_blocks: length + 1,
            buf,
            barriers,
        });
    }

    /// Establishes segment `id` as current.
    ///
    /// Waits for the RAM buffer of segment `id - N_RAMBUF` and for
    /// the writeback of segment `id - nr_segments`, then detaches
    /// every metablock of the recycled position.
    ///
    fn acquire_new_segment(&self, inner: &mut Inner, id: u64) {
        let buf = self.rambufs.acquire(id);

        let pos = self.geom.seg_pos_of_id(id);
        self.inflight.wait_zero(pos);
        if id > self.geom.nr_segments() {
            self.written_back.wait_for(id - self.geom.nr_segments());
        }

        let first = self.geom.first_mb_of_pos(pos);
        for slot in 0..self.geom.caches_per_seg() {
            let mb = first + slot as u32;
            assert!(
                !self.dirty.get(mb).dirty,
                "dirty metablock in recycled segment {}",
                id
            );
            // Clean promotions lose their valid bits with the
            // recycle.
            self.dirty.clean(mb);
            inner.index.delete(mb);
        }

        inner.seg_ids[pos] = id;
        inner.seg_len[pos] = 0;
        inner.cursor = first;
        inner.current_id = id;
        inner.rambuf = Some(buf);
    }

    // The read-cache batch worker.

    /// Stages every surviving cell of a completed batch into the
    /// log, then reopens the cell array.
    ///
    pub(crate) fn run_batch(&self) {
        {
            let threshold = self.tunables.read_cache_threshold();
            let mut inner = self.lock_inner();
            inner.rc.cancel_sequential_runs(threshold);
        }

        let nr_cells = self.opts.nr_read_cache_cells;
        for cell in 0..nr_cells {
            let mut inner = self.lock_inner();
            let meta = inner.rc.cell(cell);
            if meta.cancelled {
                self.stats.record_read_cache_cancelled();
                continue;
            }
            if inner.index.lookup(meta.sector).is_some() {
                // Promoted by an earlier cell or cached by a
                // racing write since the capture.
                continue;
            }

            if self.needs_new_segment(&inner) {
                self.rotate_segment(&mut inner);
            }
            let mb = self.advance_cursor(&mut inner);
            let slot = self.geom.slot_of_mb(mb);
            {
                let data = self.cell_data[cell].lock();
                inner
                    .rambuf
                    .as_mut()
                    .expect("no active RAM buffer")
                    .slot_mut(slot)
                    .copy_from_slice(&data);
            }
            self.dirty.promote_valid(mb);
            inner.index.register(mb, meta.sector);

            let cur_pos = self.geom.seg_pos_of_id(inner.current_id);
            drop(inner);
            self.inflight.dec(cur_pos);
            self.stats.record_read_cache_promoted();
        }

        // Every cell of the finished batch has been acknowledged,
        // so nothing can decrement the counter until reinit makes
        // the cells reservable again.
        let mut inner = self.lock_inner();
        self.ack_count.store(nr_cells, Ordering::Release);
        inner.rc.reinit();
    }

    // The control surface.

    pub(crate) fn flush_barriers(&self) {
        let mut inner = self.lock_inner();
        if !inner.barriers.is_empty() {
            self.rotate_segment(&mut inner);
        }
    }

    pub(crate) fn sync_all(&self) -> Result<(), Error> {
        let target;
        {
            let mut inner = self.lock_inner();
            let pos = self.geom.seg_pos_of_id(inner.current_id);
            if inner.seg_len[pos] > 0 || !inner.barriers.is_empty() {
                target = inner.current_id;
                self.rotate_segment(&mut inner);
            } else {
                target = inner.current_id - 1;
            }
        }

        self.flushed.wait_for(target);
        self.cache.sync().map_err(|_| Error::Io)
    }

    pub(crate) fn drop_caches(&self) {
        self.force_drop.store(true, Ordering::Release);

        {
            let mut inner = self.lock_inner();
            let pos = self.geom.seg_pos_of_id(inner.current_id);
            if inner.seg_len[pos] > 0 {
                self.rotate_segment(&mut inner);
            }
        }

        let mut guard = crate::lock(&self.drop_lock);
        while self.dirty.nr_dirty() != 0 {
            guard = self.drop_cond.wait(guard).expect("poisoned lock");
        }
        drop(guard);

        self.force_drop.store(false, Ordering::Release);
    }

    /// Clears a metablock's dirtiness and wakes
    /// [`drop_caches`](Writeboost::drop_caches) waiters when the
    /// last dirty block goes.
    ///
    fn clean_mb(&self, mb: u32) {
        if self.dirty.clean(mb) && self.dirty.nr_dirty() == 0 {
            let _guard = crate::lock(&self.drop_lock);
            self.drop_cond.notify_all();
        }
    }

    pub(crate) fn status(&self) -> Status {
        let inner = self.lock_inner();
        Status {
            current_id: inner.current_id,
            last_flushed_id: self.flushed.get(),
            last_writeback_id: self.written_back.get(),
            nr_dirty_caches: self.dirty.nr_dirty(),
            barriers_pending: inner.barriers.len(),
            stats: self.stats.snapshot(),
        }
    }

    pub(crate) fn writeback_records(&self, id: u64) -> Result<Vec<WritebackRecord>, Error> {
        if id == 0 || id > self.flushed.get() {
            return Err(Error::InvalidRequest);
        }

        let pos = self.geom.seg_pos_of_id(id);
        let mut header = vec![0u8; BLOCK_SIZE];
        self.cache
            .read_at(self.geom.seg_start_sector(pos), &mut header)
            .map_err(|_| Error::Io)?;

        let decoded = SegmentHeader::decode(&header);
        if decoded.id != id {
            warn!(
                "segment {} expected at position {}, found {}",
                id, pos, decoded.id
            );
            return Err(Error::Io);
        }

        let first = self.geom.first_mb_of_pos(pos);
        let mut records = Vec::new();
        for slot in 0..decoded.length as usize {
            let record = MbRecord::decode(&header, slot);
            if record.key_sector == INVALID_KEY || record.dirty_bits == 0 {
                continue;
            }

            records.push(WritebackRecord {
                mb: first + slot as u32,
                key_sector: record.key_sector,
                data_bits: record.dirty_bits,
            });
        }

        Ok(records)
    }

    pub(crate) fn complete_writeback(&self, id: u64) {
        debug_assert!(id <= self.flushed.get());

        let first = self.geom.first_mb_of_pos(self.geom.seg_pos_of_id(id));
        for slot in 0..self.geom.caches_per_seg() {
            self.clean_mb(first + slot as u32);
        }

        self.written_back.advance_to(id);
        self.stats.record_writeback();
    }

    pub(crate) fn record_superblock(&self) -> Result<(), Error> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        SuperblockRecord {
            last_writeback_id: self.written_back.get(),
        }
        .encode(&mut sector);

        self.cache
            .write_at(self.geom.segment_size_sectors() - 1, &sector)
            .map_err(|_| Error::Io)?;
        self.cache.sync().map_err(|_| Error::Io)
    }

    /// Hands off any staged data on shutdown without starting a
    /// new segment; the flusher drains the queue before exiting.
    ///
    fn drain_for_shutdown(&self) {
        let mut inner = self.lock_inner();
        if inner.rambuf.is_none() {
            return;
        }

        let pos = self.geom.seg_pos_of_id(inner.current_id);
        if inner.seg_len[pos] > 0 || !inner.barriers.is_empty() {
            self.queue_flush_job(&mut inner);
        }
    }
}
