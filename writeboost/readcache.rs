// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The read-cache staging engine.
//!
//! Hot read misses are captured in a fixed array of cells and later
//! promoted into the log in one batch. Sequential scans are detected
//! by watching for runs of consecutive block reads and are not
//! promoted; a run discovered mid-stream is cancelled retroactively.
//!
//! The reservation state lives under the device's `io_lock`; the
//! cell payloads are filled in by read completions outside it. A
//! batch is dispatched when every cell's read has completed, and the
//! batch worker owns the cells until it reinitialises them, so at
//! most one batch is ever outstanding.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

/// One promotion opportunity.
///
#[derive(Clone, Copy, Debug)]
pub struct CellMeta {
    /// The 4 KiB-aligned backing sector the cell captures.
    pub sector: u64,

    /// Set when the cell must not be promoted: its read failed,
    /// its sector was overwritten, or it belongs to a sequential
    /// run.
    pub cancelled: bool,
}

/// The reservation state of the read-cache cells.
///
pub struct ReadCacheState {
    cells: Vec<CellMeta>,
    tree: BTreeMap<u64, usize>,
    cursor: usize,
    last_sector: u64,
    seqcount: u32,
    over_threshold: bool,
}

impl ReadCacheState {
    pub fn new(nr_cells: usize) -> Self {
        ReadCacheState {
            cells: vec![
                CellMeta {
                    sector: 0,
                    cancelled: false
                };
                nr_cells
            ],
            tree: BTreeMap::new(),
            cursor: nr_cells,
            last_sector: u64::MAX,
            seqcount: 0,
            over_threshold: false,
        }
    }

    /// Reserves a cell for a full-block read miss at `sector`.
    ///
    /// Returns `None` when promotion is disabled, the cells are
    /// exhausted, or the sector already holds a cell. A reserved
    /// cell may still come back cancelled if the miss turns out to
    /// belong to a sequential run.
    ///
    pub fn reserve(&mut self, sector: u64, threshold: u8) -> Option<usize> {
        if threshold == 0 || self.cursor == 0 || self.tree.contains_key(&sector) {
            return None;
        }

        self.cursor -= 1;
        let cell = self.cursor;
        self.cells[cell] = CellMeta {
            sector,
            cancelled: false,
        };
        self.tree.insert(sector, cell);

        // Sequentiality detection. A run is only discovered once
        // it exceeds the threshold, so the cells it has already
        // claimed are cancelled retroactively.
        if sector == self.last_sector.wrapping_add(8) {
            self.seqcount += 1;
        } else {
            self.seqcount = 1;
            self.over_threshold = false;
        }
        self.last_sector = sector;

        if self.over_threshold {
            self.cells[cell].cancelled = true;
        } else if self.seqcount as u64 > threshold as u64 {
            self.over_threshold = true;
            let end = (cell + self.seqcount as usize).min(self.cells.len());
            for run in cell..end {
                self.cells[run].cancelled = true;
            }
        }

        Some(cell)
    }

    /// Cancels any cell holding `sector`; the data it would
    /// promote is now stale.
    ///
    pub fn cancel_sector(&mut self, sector: u64) {
        if let Some(&cell) = self.tree.get(&sector) {
            self.cells[cell].cancelled = true;
        }
    }

    /// Cancels one cell, for a failed read.
    ///
    pub fn mark_cancelled(&mut self, cell: usize) {
        self.cells[cell].cancelled = true;
    }

    /// Walks the cells in sector order and cancels every run of
    /// consecutive blocks longer than `threshold`. With promotion
    /// disabled, every cell is cancelled.
    ///
    pub fn cancel_sequential_runs(&mut self, threshold: u8) {
        if threshold == 0 {
            for cell in self.cells.iter_mut() {
                cell.cancelled = true;
            }
            return;
        }

        let ordered: Vec<(u64, usize)> = self.tree.iter().map(|(&s, &c)| (s, c)).collect();
        let mut run: Vec<usize> = Vec::new();
        let mut prev = u64::MAX;
        for &(sector, cell) in ordered.iter() {
            if sector != prev.wrapping_add(8) {
                if run.len() > threshold as usize {
                    for &member in run.iter() {
                        self.cells[member].cancelled = true;
                    }
                }
                run.clear();
            }
            run.push(cell);
            prev = sector;
        }

        if run.len() > threshold as usize {
            for &member in run.iter() {
                self.cells[member].cancelled = true;
            }
        }
    }

    /// Reinitialises every cell after a batch, making the whole
    /// array available again.
    ///
    pub fn reinit(&mut self) {
        for cell in self.cells.iter_mut() {
            *cell = CellMeta {
                sector: 0,
                cancelled: false,
            };
        }
        self.tree.clear();
        self.cursor = self.cells.len();
    }

    pub fn cell(&self, cell: usize) -> CellMeta {
        self.cells[cell]
    }

    #[cfg(test)]
    fn nr_reserved(&self) -> usize {
        self.cells.len() - self.cursor
    }
}

/// The dispatch rendezvous between read completions and the batch
/// worker.
///
pub struct BatchSignal {
    pending: Mutex<BatchFlags>,
    cond: Condvar,
}

#[derive(Clone, Copy, Default)]
struct BatchFlags {
    raised: bool,
    stopped: bool,
}

impl BatchSignal {
    pub fn new() -> Self {
        BatchSignal {
            pending: Mutex::new(BatchFlags::default()),
            cond: Condvar::new(),
        }
    }

    /// Wakes the batch worker.
    ///
    pub fn raise(&self) {
        let mut flags = crate::lock(&self.pending);
        flags.raised = true;
        self.cond.notify_all();
    }

    /// Tells the batch worker to exit.
    ///
    pub fn stop(&self) {
        let mut flags = crate::lock(&self.pending);
        flags.stopped = true;
        self.cond.notify_all();
    }

    /// Blocks until the signal is raised, returning `false` when
    /// the worker should exit instead.
    ///
    pub fn wait(&self) -> bool {
        let mut flags = crate::lock(&self.pending);
        loop {
            if flags.raised {
                flags.raised = false;
                return true;
            }
            if flags.stopped {
                return false;
            }
            flags = self.cond.wait(flags).expect("poisoned lock");
        }
    }
}

impl Default for BatchSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_exhaust() {
        let mut state = ReadCacheState::new(2);

        // Promotion disabled.
        assert_eq!(state.reserve(0, 0), None);

        let first = state.reserve(0, 127).unwrap();
        assert_eq!(state.cell(first).sector, 0);
        assert!(!state.cell(first).cancelled);

        // The same sector holds at most one cell.
        assert_eq!(state.reserve(0, 127), None);

        let second = state.reserve(64, 127).unwrap();
        assert_ne!(first, second);

        // Exhausted.
        assert_eq!(state.reserve(128, 127), None);

        state.reinit();
        assert_eq!(state.nr_reserved(), 0);
        assert!(state.reserve(128, 127).is_some());
    }

    #[test]
    fn sequential_run_detected_late() {
        let mut state = ReadCacheState::new(8);

        // Reads at sectors 0, 8, .. 40 with a threshold of 4: the
        // run is noticed on the fifth read, which retroactively
        // cancels the first four, and the sixth is cancelled on
        // arrival.
        let mut cells = Vec::new();
        for block in 0..6u64 {
            cells.push(state.reserve(block * 8, 4).unwrap());
        }

        for &cell in cells.iter() {
            assert!(state.cell(cell).cancelled);
        }

        // A non-sequential read resets the detector.
        let fresh = state.reserve(1000, 4).unwrap();
        assert!(!state.cell(fresh).cancelled);
    }

    #[test]
    fn short_runs_survive() {
        let mut state = ReadCacheState::new(8);

        // Four consecutive blocks at threshold 4 stay promotable.
        for block in 0..4u64 {
            let cell = state.reserve(block * 8, 4).unwrap();
            assert!(!state.cell(cell).cancelled);
        }

        // A distant read keeps its cell too.
        let cell = state.reserve(800, 4).unwrap();
        assert!(!state.cell(cell).cancelled);
    }

    #[test]
    fn write_cancels() {
        let mut state = ReadCacheState::new(4);
        let cell = state.reserve(16, 127).unwrap();

        state.cancel_sector(16);
        assert!(state.cell(cell).cancelled);

        // Cancelling an unreserved sector is a no-op.
        state.cancel_sector(24);
    }

    #[test]
    fn rescan_cancels_runs() {
        let mut state = ReadCacheState::new(8);

        // Reservations arrive out of order: 16, 0, 8, 32. Sorted
        // by sector they contain the run 0..24, which exceeds a
        // threshold of 2; 32 is separate.
        let a = state.reserve(16, 127).unwrap();
        let b = state.reserve(0, 127).unwrap();
        let c = state.reserve(8, 127).unwrap();
        let d = state.reserve(32, 127).unwrap();

        state.cancel_sequential_runs(2);
        assert!(state.cell(a).cancelled);
        assert!(state.cell(b).cancelled);
        assert!(state.cell(c).cancelled);
        assert!(!state.cell(d).cancelled);

        // With promotion disabled every cell is cancelled.
        state.reinit();
        let cell = state.reserve(100, 127).unwrap();
        state.cancel_sequential_runs(0);
        assert!(state.cell(cell).cancelled);
    }

    #[test]
    fn batch_signal() {
        let signal = BatchSignal::new();
        signal.raise();
        assert!(signal.wait());

        signal.raise();
        signal.stop();
        // A raised batch is drained before the stop is honoured.
        assert!(signal.wait());
        assert!(!signal.wait());
    }
}
