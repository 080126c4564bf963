// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements sector-addressed block storage devices.
//!
//! Devices are addressed in 512 B sectors and perform positional I/O
//! through a shared reference, so that foreground requests and
//! background flushing can issue I/O to the same device concurrently.
//! Implementations provide their own interior synchronisation.

use align::SECTOR_SIZE;
use bitflags::bitflags;
use spin::Mutex;
use std::sync::Arc;

bitflags! {
    /// The list of operations that can be supported by
    /// a device.
    ///
    pub struct Operations: usize {
        /// Read data from a device.
        const READ = 1 << 0;

        /// Write data to a device.
        const WRITE = 1 << 1;

        /// Flush cached writes to a device.
        const SYNC = 1 << 2;
    }
}

/// Describes an error encountered while operating
/// on the device.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The buffer passed to the driver was not a whole
    /// number of sectors.
    InvalidBuffer,

    /// The request falls outside the device.
    OutOfRange,

    /// The device encountered an error while performing
    /// the requested operation.
    DeviceError,

    /// The requested operation is not supported.
    NotSupported,
}

/// Represents a sector-addressed block storage device.
///
pub trait Device: Send + Sync {
    /// Returns the device capacity as a number of
    /// sectors.
    ///
    fn nr_sectors(&self) -> u64;

    /// Returns the set of operations supported by the
    /// device.
    ///
    /// If an unsupported operation is attempted, it
    /// will return [`Error::NotSupported`].
    ///
    fn operations(&self) -> Operations;

    /// Populates a byte slice with data from the device,
    /// starting at the given sector.
    ///
    /// Note that `buf` must have a length that is an exact
    /// multiple of the sector size.
    ///
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes a byte slice to the device, starting at the
    /// given sector.
    ///
    /// Note that `buf` must have a length that is an exact
    /// multiple of the sector size.
    ///
    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<(), Error>;

    /// Makes all completed writes durable.
    ///
    fn sync(&self) -> Result<(), Error>;
}

/// A reference-counted handle to a device.
///
pub type DeviceRef = Arc<dyn Device>;

/// Checks a positional request against the device geometry.
///
fn check_request(dev: &dyn Device, sector: u64, len: usize) -> Result<(), Error> {
    if len % SECTOR_SIZE != 0 {
        return Err(Error::InvalidBuffer);
    }

    let sectors = (len / SECTOR_SIZE) as u64;
    if sector + sectors > dev.nr_sectors() {
        return Err(Error::OutOfRange);
    }

    Ok(())
}

/// A block device backed by a memory buffer.
///
/// `MemDevice` is used by tests and by callers that want a
/// RAM-backed disk. Writes are durable as soon as they complete,
/// so [`sync`](Device::sync) is a no-op.
///
pub struct MemDevice {
    nr_sectors: u64,
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    /// Returns a zero-filled device with the given number
    /// of sectors.
    ///
    pub fn new(nr_sectors: u64) -> Self {
        MemDevice {
            nr_sectors,
            data: Mutex::new(vec![0u8; nr_sectors as usize * SECTOR_SIZE]),
        }
    }

    /// Returns a copy of the device contents at the given
    /// sector range, for inspection.
    ///
    pub fn snapshot(&self, sector: u64, sectors: u64) -> Vec<u8> {
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        let end = start + sectors as usize * SECTOR_SIZE;
        data[start..end].to_vec()
    }
}

impl Device for MemDevice {
    fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    fn operations(&self) -> Operations {
        Operations::READ | Operations::WRITE | Operations::SYNC
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<(), Error> {
        check_request(self, sector, buf.len())?;

        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);

        Ok(())
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<(), Error> {
        check_request(self, sector, buf.len())?;

        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + buf.len()].copy_from_slice(buf);

        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device() {
        let dev = MemDevice::new(16);
        assert_eq!(dev.nr_sectors(), 16);
        assert_eq!(
            dev.operations(),
            Operations::READ | Operations::WRITE | Operations::SYNC
        );

        // Round-trip one sector.
        let payload = [0xabu8; SECTOR_SIZE];
        dev.write_at(3, &payload).unwrap();
        let mut got = [0u8; SECTOR_SIZE];
        dev.read_at(3, &mut got).unwrap();
        assert_eq!(got[..], payload[..]);

        // Neighbouring sectors are untouched.
        dev.read_at(2, &mut got).unwrap();
        assert_eq!(got, [0u8; SECTOR_SIZE]);
        dev.read_at(4, &mut got).unwrap();
        assert_eq!(got, [0u8; SECTOR_SIZE]);

        assert_eq!(dev.sync(), Ok(()));
    }

    #[test]
    fn bad_requests() {
        let dev = MemDevice::new(8);

        let mut short = [0u8; 100];
        assert_eq!(dev.read_at(0, &mut short), Err(Error::InvalidBuffer));

        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(dev.read_at(8, &mut buf), Err(Error::OutOfRange));
        assert_eq!(dev.write_at(7, &[0u8; 2 * SECTOR_SIZE]), Err(Error::OutOfRange));
    }
}
