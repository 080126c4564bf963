// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A synchronous front-end over the cache core.
//!
//! The core speaks the host block-device contract: bios go in
//! through `map` and remapped bios must be performed by the caller
//! and finished with `end_io`. `CacheDev` drives that contract
//! against the two real devices, giving embedders and tests a plain
//! read/write/flush surface.

use crate::bio::{Bio, Disposition, ReqFlags, SubmitResult, TargetDev};
use crate::config::{ConfigError, Options};
use crate::dev::{ResumeState, Writeboost};
use crate::Error;
use storage::block::{Device, DeviceRef};

/// The virtual block device: a backing device accelerated by a
/// cache device.
///
pub struct CacheDev {
    wb: Writeboost,
    backing: DeviceRef,
    cache: DeviceRef,
}

impl CacheDev {
    /// Builds the device over a freshly formatted cache.
    ///
    pub fn new(
        backing: DeviceRef,
        cache: DeviceRef,
        options: Options,
    ) -> Result<Self, ConfigError> {
        Self::resume(backing, cache, options, ResumeState::fresh())
    }

    /// Builds the device from recovered durable state.
    ///
    pub fn resume(
        backing: DeviceRef,
        cache: DeviceRef,
        options: Options,
        state: ResumeState,
    ) -> Result<Self, ConfigError> {
        let wb = Writeboost::new(backing.clone(), cache.clone(), options, state)?;
        Ok(CacheDev { wb, backing, cache })
    }

    /// The cache core, for control operations and daemons.
    ///
    pub fn core(&self) -> &Writeboost {
        &self.wb
    }

    fn target(&self, target: TargetDev) -> &dyn Device {
        match target {
            TargetDev::Backing => &*self.backing,
            TargetDev::Cache => &*self.cache,
        }
    }

    /// Reads into `buf`, which must cover a whole number of
    /// sectors within one 4 KiB block.
    ///
    pub fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), Error> {
        match self.wb.map(Bio::read(sector, &mut *buf)) {
            Disposition::Submitted(SubmitResult::Done(result)) => result,
            Disposition::Submitted(SubmitResult::Deferred(completion)) => completion.wait(),
            Disposition::Remapped(remap) => {
                let result = self
                    .target(remap.target)
                    .read_at(remap.sector, buf)
                    .map_err(|_| Error::Io);
                self.wb.end_io(remap.tag, buf, result);
                result
            }
        }
    }

    /// Writes `data`, which must cover a whole number of sectors
    /// within one 4 KiB block.
    ///
    pub fn write(&self, sector: u64, data: &[u8]) -> Result<(), Error> {
        self.write_with_flags(sector, data, ReqFlags::empty())
    }

    /// Writes `data` with the given request flags. FUA writes are
    /// acknowledged only once durable; this front-end forces the
    /// hand-off rather than waiting for a deadline timer.
    ///
    pub fn write_with_flags(
        &self,
        sector: u64,
        data: &[u8],
        flags: ReqFlags,
    ) -> Result<(), Error> {
        let bio = Bio {
            sector,
            flags,
            kind: crate::bio::BioKind::Write(data),
        };

        match self.wb.map(bio) {
            Disposition::Submitted(SubmitResult::Done(result)) => result,
            Disposition::Submitted(SubmitResult::Deferred(completion)) => {
                self.wb.flush_barriers();
                completion.wait()
            }
            Disposition::Remapped(remap) => {
                let device = self.target(remap.target);
                let mut result = device.write_at(remap.sector, data).map_err(|_| Error::Io);
                if result.is_ok() && flags.intersects(ReqFlags::FUA | ReqFlags::PREFLUSH) {
                    result = device.sync().map_err(|_| Error::Io);
                }
                self.wb.end_io(remap.tag, &[], result);
                result
            }
        }
    }

    /// Issues a flush: acknowledged once every previously
    /// acknowledged write staged into the log is durable on the
    /// cache device.
    ///
    pub fn flush(&self) -> Result<(), Error> {
        match self.wb.map(Bio::flush()) {
            Disposition::Submitted(SubmitResult::Done(result)) => result,
            Disposition::Submitted(SubmitResult::Deferred(completion)) => {
                self.wb.flush_barriers();
                completion.wait()
            }
            Disposition::Remapped(remap) => {
                self.target(remap.target).sync().map_err(|_| Error::Io)
            }
        }
    }
}
