// Copyright 2024 The Writeboost Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The on-disk layout of the cache device.
//!
//! The device starts with one segment-sized superblock region,
//! followed by the cyclic segment regions. Every segment begins with
//! a 4 KiB header block followed by its 4 KiB cache blocks.
//!
//! All multi-byte fields are little-endian. The `(id, length, lap)`
//! sub-record of a segment header sits entirely inside the header's
//! first 512 B sector so recovery can discover the log head and tail
//! with single-sector reads.

use align::{BLOCK_SIZE, SECTOR_SIZE};

/// The superblock magic, stored in the first bytes of the device.
///
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"WBst";

/// The key stored in the record of a cache block that holds no
/// committed data (or whose metablock has been detached).
///
pub const INVALID_KEY: u64 = u64::MAX;

/// The byte offset of the first metablock record within a segment
/// header block.
///
pub const MB_RECORDS_OFFSET: usize = SECTOR_SIZE;

/// The packed size of one metablock record.
///
pub const MB_RECORD_SIZE: usize = 13;

/// The first sector of the superblock region.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperblockHeader;

impl SuperblockHeader {
    /// Writes the header into a 512 B sector buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than one sector.
    ///
    pub fn encode(buf: &mut [u8]) {
        assert!(buf.len() >= SECTOR_SIZE);
        buf[..4].copy_from_slice(&SUPERBLOCK_MAGIC);
    }

    /// Checks a sector buffer for the superblock magic.
    ///
    pub fn decode(buf: &[u8]) -> Option<SuperblockHeader> {
        if buf.len() >= SECTOR_SIZE && buf[..4] == SUPERBLOCK_MAGIC {
            Some(SuperblockHeader)
        } else {
            None
        }
    }
}

/// The last sector of the superblock region, recorded periodically
/// so recovery can skip segments that are already written back.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperblockRecord {
    pub last_writeback_id: u64,
}

impl SuperblockRecord {
    /// Writes the record into a 512 B sector buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than one sector.
    ///
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SECTOR_SIZE);
        buf[..8].copy_from_slice(&self.last_writeback_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> SuperblockRecord {
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[..8]);
        SuperblockRecord {
            last_writeback_id: u64::from_le_bytes(id),
        }
    }
}

/// The `(id, length, lap)` sub-record at the start of a segment
/// header block.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    /// The segment's monotonic identity; 0 denotes an unwritten
    /// segment.
    pub id: u64,

    /// The number of cache blocks holding committed data.
    pub length: u8,

    /// The ring lap counter at the time of the flush.
    pub lap: u32,
}

impl SegmentHeader {
    /// Writes the sub-record into the start of a header block.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than one sector.
    ///
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SECTOR_SIZE);
        buf[..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8] = self.length;
        buf[9..12].copy_from_slice(&[0u8; 3]);
        buf[12..16].copy_from_slice(&self.lap.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> SegmentHeader {
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[..8]);
        let mut lap = [0u8; 4];
        lap.copy_from_slice(&buf[12..16]);
        SegmentHeader {
            id: u64::from_le_bytes(id),
            length: buf[8],
            lap: u32::from_le_bytes(lap),
        }
    }
}

/// One cache block's record within a segment header block.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbRecord {
    /// The backing-device sector the block caches, or
    /// [`INVALID_KEY`].
    pub key_sector: u64,

    /// The sectors of the block carrying newer-than-backing data.
    pub dirty_bits: u8,

    /// The ring lap counter at the time of the flush.
    pub lap: u32,
}

impl MbRecord {
    /// The byte offset of record `idx` within a header block.
    ///
    pub fn offset(idx: usize) -> usize {
        MB_RECORDS_OFFSET + idx * MB_RECORD_SIZE
    }

    /// Writes record `idx` into a header block.
    ///
    /// # Panics
    ///
    /// Panics if the record does not fit inside the header block.
    ///
    pub fn encode(&self, block: &mut [u8], idx: usize) {
        let at = Self::offset(idx);
        assert!(at + MB_RECORD_SIZE <= BLOCK_SIZE && block.len() >= at + MB_RECORD_SIZE);
        block[at..at + 8].copy_from_slice(&self.key_sector.to_le_bytes());
        block[at + 8] = self.dirty_bits;
        block[at + 9..at + 13].copy_from_slice(&self.lap.to_le_bytes());
    }

    /// Reads record `idx` from a header block.
    ///
    /// # Panics
    ///
    /// Panics if the record does not fit inside the header block.
    ///
    pub fn decode(block: &[u8], idx: usize) -> MbRecord {
        let at = Self::offset(idx);
        assert!(block.len() >= at + MB_RECORD_SIZE);
        let mut key = [0u8; 8];
        key.copy_from_slice(&block[at..at + 8]);
        let mut lap = [0u8; 4];
        lap.copy_from_slice(&block[at + 9..at + 13]);
        MbRecord {
            key_sector: u64::from_le_bytes(key),
            dirty_bits: block[at + 8],
            lap: u32::from_le_bytes(lap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock() {
        let mut sector = [0u8; SECTOR_SIZE];
        SuperblockHeader::encode(&mut sector);
        assert!(SuperblockHeader::decode(&sector).is_some());
        assert_eq!(&sector[..4], b"WBst");

        sector[0] = b'X';
        assert!(SuperblockHeader::decode(&sector).is_none());

        let record = SuperblockRecord {
            last_writeback_id: 0x1122_3344_5566_7788,
        };
        let mut sector = [0u8; SECTOR_SIZE];
        record.encode(&mut sector);
        assert_eq!(SuperblockRecord::decode(&sector), record);
        // Little-endian on disk.
        assert_eq!(sector[0], 0x88);
        assert_eq!(sector[7], 0x11);
    }

    #[test]
    fn segment_header() {
        let header = SegmentHeader {
            id: 42,
            length: 17,
            lap: 3,
        };

        let mut block = vec![0u8; BLOCK_SIZE];
        header.encode(&mut block);
        assert_eq!(SegmentHeader::decode(&block), header);

        // The sub-record fits in the first sector for atomic
        // discovery.
        assert_eq!(SegmentHeader::decode(&block[..SECTOR_SIZE]), header);
    }

    #[test]
    fn mb_records() {
        let mut block = vec![0u8; BLOCK_SIZE];

        // The largest supported segment holds 255 cache blocks,
        // whose records must all fit behind the first sector.
        let most = 255;
        assert!(MbRecord::offset(most - 1) + MB_RECORD_SIZE <= BLOCK_SIZE);

        for idx in 0..most {
            let record = MbRecord {
                key_sector: idx as u64 * 8,
                dirty_bits: (idx % 256) as u8,
                lap: 7,
            };
            record.encode(&mut block, idx);
        }

        for idx in 0..most {
            let record = MbRecord::decode(&block, idx);
            assert_eq!(record.key_sector, idx as u64 * 8);
            assert_eq!(record.dirty_bits, (idx % 256) as u8);
            assert_eq!(record.lap, 7);
        }

        let detached = MbRecord {
            key_sector: INVALID_KEY,
            dirty_bits: 0,
            lap: 1,
        };
        detached.encode(&mut block, 0);
        assert_eq!(MbRecord::decode(&block, 0), detached);
    }
}
