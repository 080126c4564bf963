// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Configurable options and runtime tunables.
//!
//! Options are fixed at construction time and validated up front.
//! Tunables can be changed at runtime through
//! [`reconfigure`](crate::Writeboost::reconfigure); an invalid value
//! is rejected at admission and leaves the existing state untouched.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// The smallest supported segment size: 2^7 sectors (64 KiB).
///
pub const MIN_SEGMENT_SIZE_ORDER: u8 = 7;

/// The largest supported segment size: 2^11 sectors (1 MiB).
///
/// The limit keeps the on-disk segment header (one metablock record
/// per cache block) within its single 4 KiB header block.
///
pub const MAX_SEGMENT_SIZE_ORDER: u8 = 11;

/// Describes a rejected configuration.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The key does not name an option.
    UnknownKey,

    /// The named option cannot be changed at runtime.
    StaticOption,

    /// The value falls outside the option's accepted range.
    OutOfRange,

    /// The cache device is too small for even one segment.
    CacheTooSmall,
}

/// Options fixed at construction time.
///
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// log2 of the segment size in sectors.
    pub segment_size_order: u8,

    /// The number of RAM buffers staging unflushed segments.
    pub nr_rambuf: usize,

    /// Bypass write caching entirely.
    pub write_around_mode: bool,

    /// The number of read-cache cells.
    pub nr_read_cache_cells: usize,
}

impl Options {
    /// Checks every option against its accepted range.
    ///
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size_order < MIN_SEGMENT_SIZE_ORDER
            || self.segment_size_order > MAX_SEGMENT_SIZE_ORDER
        {
            return Err(ConfigError::OutOfRange);
        }

        if self.nr_rambuf < 1 || self.nr_rambuf > 64 {
            return Err(ConfigError::OutOfRange);
        }

        if self.nr_read_cache_cells < 1 || self.nr_read_cache_cells > 2048 {
            return Err(ConfigError::OutOfRange);
        }

        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            segment_size_order: MAX_SEGMENT_SIZE_ORDER,
            nr_rambuf: 8,
            write_around_mode: false,
            nr_read_cache_cells: 128,
        }
    }
}

/// Runtime-adjustable tunables.
///
/// Each tunable is an atomic so that daemons and the I/O paths can
/// read it without locking.
///
pub struct Tunables {
    writeback_threshold: AtomicU8,
    nr_max_batched_writeback: AtomicU32,
    update_sb_record_interval: AtomicU32,
    sync_data_interval: AtomicU32,
    read_cache_threshold: AtomicU8,
}

impl Tunables {
    pub fn new() -> Self {
        Tunables {
            writeback_threshold: AtomicU8::new(0),
            nr_max_batched_writeback: AtomicU32::new(8),
            update_sb_record_interval: AtomicU32::new(0),
            sync_data_interval: AtomicU32::new(0),
            read_cache_threshold: AtomicU8::new(0),
        }
    }

    /// The dirtiness percentage above which the writeback daemon
    /// should start draining. 0 disables threshold-driven writeback.
    ///
    pub fn writeback_threshold(&self) -> u8 {
        self.writeback_threshold.load(Ordering::Relaxed)
    }

    /// The largest number of segments the writeback daemon drains
    /// in one batch.
    ///
    pub fn nr_max_batched_writeback(&self) -> u32 {
        self.nr_max_batched_writeback.load(Ordering::Relaxed)
    }

    /// Seconds between superblock record updates. 0 disables them.
    ///
    pub fn update_sb_record_interval(&self) -> u32 {
        self.update_sb_record_interval.load(Ordering::Relaxed)
    }

    /// Seconds between forced syncs. 0 disables them.
    ///
    pub fn sync_data_interval(&self) -> u32 {
        self.sync_data_interval.load(Ordering::Relaxed)
    }

    /// The sequentiality limit above which read misses are not
    /// promoted into the cache. 0 disables read promotion.
    ///
    pub fn read_cache_threshold(&self) -> u8 {
        self.read_cache_threshold.load(Ordering::Relaxed)
    }

    /// Sets the tunable named by `key` to `value`.
    ///
    /// Static options are rejected with
    /// [`ConfigError::StaticOption`]; out-of-range values with
    /// [`ConfigError::OutOfRange`]. Rejection leaves every tunable
    /// unchanged.
    ///
    pub fn set(&self, key: &str, value: u64) -> Result<(), ConfigError> {
        match key {
            "writeback_threshold" => {
                if value > 100 {
                    return Err(ConfigError::OutOfRange);
                }
                self.writeback_threshold
                    .store(value as u8, Ordering::Relaxed);
            }
            "nr_max_batched_writeback" => {
                if value < 1 || value > 32 {
                    return Err(ConfigError::OutOfRange);
                }
                self.nr_max_batched_writeback
                    .store(value as u32, Ordering::Relaxed);
            }
            "update_sb_record_interval" => {
                if value > 3600 {
                    return Err(ConfigError::OutOfRange);
                }
                self.update_sb_record_interval
                    .store(value as u32, Ordering::Relaxed);
            }
            "sync_data_interval" => {
                if value > 3600 {
                    return Err(ConfigError::OutOfRange);
                }
                self.sync_data_interval
                    .store(value as u32, Ordering::Relaxed);
            }
            "read_cache_threshold" => {
                if value > 127 {
                    return Err(ConfigError::OutOfRange);
                }
                self.read_cache_threshold
                    .store(value as u8, Ordering::Relaxed);
            }
            "write_around_mode" | "nr_read_cache_cells" => {
                return Err(ConfigError::StaticOption);
            }
            _ => return Err(ConfigError::UnknownKey),
        }

        Ok(())
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_ranges() {
        assert_eq!(Options::default().validate(), Ok(()));

        let mut opts = Options::default();
        opts.segment_size_order = 6;
        assert_eq!(opts.validate(), Err(ConfigError::OutOfRange));
        opts.segment_size_order = 12;
        assert_eq!(opts.validate(), Err(ConfigError::OutOfRange));

        opts = Options::default();
        opts.nr_rambuf = 0;
        assert_eq!(opts.validate(), Err(ConfigError::OutOfRange));
        opts.nr_rambuf = 65;
        assert_eq!(opts.validate(), Err(ConfigError::OutOfRange));

        opts = Options::default();
        opts.nr_read_cache_cells = 0;
        assert_eq!(opts.validate(), Err(ConfigError::OutOfRange));
        opts.nr_read_cache_cells = 2049;
        assert_eq!(opts.validate(), Err(ConfigError::OutOfRange));
    }

    #[test]
    fn tunables() {
        let tunables = Tunables::new();
        assert_eq!(tunables.read_cache_threshold(), 0);

        tunables.set("read_cache_threshold", 4).unwrap();
        assert_eq!(tunables.read_cache_threshold(), 4);
        assert_eq!(
            tunables.set("read_cache_threshold", 128),
            Err(ConfigError::OutOfRange)
        );
        assert_eq!(tunables.read_cache_threshold(), 4);

        tunables.set("writeback_threshold", 100).unwrap();
        assert_eq!(tunables.writeback_threshold(), 100);
        assert_eq!(
            tunables.set("writeback_threshold", 101),
            Err(ConfigError::OutOfRange)
        );

        assert_eq!(
            tunables.set("nr_max_batched_writeback", 0),
            Err(ConfigError::OutOfRange)
        );
        tunables.set("nr_max_batched_writeback", 32).unwrap();
        assert_eq!(tunables.nr_max_batched_writeback(), 32);

        assert_eq!(
            tunables.set("write_around_mode", 1),
            Err(ConfigError::StaticOption)
        );
        assert_eq!(
            tunables.set("nr_read_cache_cells", 16),
            Err(ConfigError::StaticOption)
        );
        assert_eq!(tunables.set("bogus", 1), Err(ConfigError::UnknownKey));
    }
}
