//! On-disk layout
//!
//! ```text
//! | segment 0 | segment 1 | ... | segment N-1 | superblock | checkpoint 0 | checkpoint 1 |
//! ```
//!
//! Every segment is `blocks_per_segment` blocks long. The leading data
//! slots hold inode and data blocks; the trailing reserved blocks hold the
//! inode map, the segment summary and a small metadata record. All integers
//! are little-endian.

use alloc::{vec, vec::Vec};

use serde::{Deserialize, Serialize};

use crate::{
    common::{LfsError, LfsResult},
    le_i32, le_i64, put_le,
};

pub type BlockAddr = u32;

pub const ROOT_INO: u32 = 1;
/// Encoded "absent" block or next-inode pointer.
pub const NO_ADDR: i32 = -1;
/// Names are stored NUL-terminated in a 60 byte field.
pub const MAX_FILENAME_LEN: usize = 60;
pub const DIR_ENTRY_SIZE: usize = MAX_FILENAME_LEN + 4;
pub const MAP_ENTRY_SIZE: usize = 8;
pub const SEGMENT_META_SIZE: usize = 256;
/// Bytes of an inode block that are not direct pointers.
pub const INODE_FIXED_SIZE: usize = 96;
pub const SUPERBLOCK_SIZE: usize = 20;
pub const MAX_FILE_SIZE: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_per_segment: u32,
    pub segment_count: u32,
    pub max_inodes: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_per_segment: 1024,
            segment_count: 100,
            max_inodes: 100_000,
        }
    }
}

impl Geometry {
    pub fn validate(&self) -> LfsResult<()> {
        let bs = self.block_size as usize;
        if bs < 256 || bs % DIR_ENTRY_SIZE != 0 {
            return Err(LfsError::InvalidArgument);
        }
        if self.blocks_per_segment < 4 || self.data_blocks() < 2 {
            return Err(LfsError::InvalidArgument);
        }
        if self.segment_count < 2 || self.max_inodes < 2 {
            return Err(LfsError::InvalidArgument);
        }
        // Addresses, counts and inode numbers are stored as i32.
        let limit = i32::MAX as u64;
        let total_blocks = self.blocks_per_segment as u64 * self.segment_count as u64;
        if total_blocks > limit || self.segment_size() as u64 > limit || self.max_inodes as u64 > limit {
            return Err(LfsError::InvalidArgument);
        }
        Ok(())
    }

    pub fn segment_size(&self) -> usize {
        self.block_size as usize * self.blocks_per_segment as usize
    }

    /// Smallest number of trailing blocks that fits the inode map, the
    /// summary and the metadata record for the remaining data slots.
    pub fn reserved_blocks(&self) -> u32 {
        let per_slot = 2 * MAP_ENTRY_SIZE as u64;
        let need = per_slot * self.blocks_per_segment as u64 + SEGMENT_META_SIZE as u64;
        let unit = self.block_size as u64 + per_slot;
        ((need + unit - 1) / unit) as u32
    }

    pub fn data_blocks(&self) -> u32 {
        self.blocks_per_segment.saturating_sub(self.reserved_blocks())
    }

    pub fn imap_offset(&self) -> usize {
        self.data_blocks() as usize * self.block_size as usize
    }

    pub fn summary_offset(&self) -> usize {
        self.imap_offset() + self.data_blocks() as usize * MAP_ENTRY_SIZE
    }

    pub fn meta_offset(&self) -> usize {
        self.summary_offset() + self.data_blocks() as usize * MAP_ENTRY_SIZE
    }

    pub fn direct_per_inode(&self) -> usize {
        (self.block_size as usize - INODE_FIXED_SIZE) / 4
    }

    pub fn dir_entries_per_block(&self) -> usize {
        self.block_size as usize / DIR_ENTRY_SIZE
    }

    pub fn segment_offset(&self, segment: u32) -> u64 {
        segment as u64 * self.segment_size() as u64
    }

    pub fn superblock_offset(&self) -> u64 {
        self.segment_offset(self.segment_count)
    }

    pub fn checkpoint_size(&self) -> usize {
        align4(self.segment_count as usize) + 32
    }

    pub fn checkpoint_offset(&self, slot: usize) -> u64 {
        self.superblock_offset() + self.block_size as u64 + (slot * self.checkpoint_size()) as u64
    }

    pub fn image_size(&self) -> u64 {
        let bs = self.block_size as u64;
        let ckpt = 2 * self.checkpoint_size() as u64;
        self.superblock_offset() + bs + (ckpt + bs - 1) / bs * bs
    }

    pub fn addr(&self, segment: u32, slot: u32) -> BlockAddr {
        segment * self.blocks_per_segment + slot
    }

    pub fn segment_of(&self, addr: BlockAddr) -> u32 {
        addr / self.blocks_per_segment
    }

    pub fn slot_of(&self, addr: BlockAddr) -> u32 {
        addr % self.blocks_per_segment
    }

    pub fn block_offset(&self, addr: BlockAddr) -> u64 {
        addr as u64 * self.block_size as u64
    }

    /// Whether `addr` names a data slot of some segment.
    pub fn is_data_addr(&self, addr: BlockAddr) -> bool {
        self.segment_of(addr) < self.segment_count && self.slot_of(addr) < self.data_blocks()
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

pub(crate) fn encode_addr(addr: Option<BlockAddr>) -> i32 {
    addr.map_or(NO_ADDR, |a| a as i32)
}

pub(crate) fn decode_addr(raw: i32) -> Option<BlockAddr> {
    u32::try_from(raw).ok()
}

/// Convert a stored signed field that must not be negative.
pub(crate) fn non_negative(raw: i32, what: &str) -> LfsResult<u32> {
    u32::try_from(raw).map_err(|_| LfsError::corrupt(alloc::format!("negative {}", what)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub total_inodes: u32,
    pub total_blocks: u32,
    pub total_segments: u32,
    pub block_size: u32,
    pub segment_size: u32,
}

impl Superblock {
    pub fn from_geometry(geo: &Geometry) -> Self {
        Self {
            total_inodes: geo.max_inodes,
            total_blocks: geo.blocks_per_segment * geo.segment_count,
            total_segments: geo.segment_count,
            block_size: geo.block_size,
            segment_size: geo.segment_size() as u32,
        }
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        put_le!(buf, 0, self.total_inodes as i32);
        put_le!(buf, 4, self.total_blocks as i32);
        put_le!(buf, 8, self.total_segments as i32);
        put_le!(buf, 12, self.block_size as i32);
        put_le!(buf, 16, self.segment_size as i32);
        buf
    }

    pub fn decode(buf: &[u8]) -> LfsResult<Self> {
        Ok(Self {
            total_inodes: non_negative(le_i32!(buf, 0), "inode count")?,
            total_blocks: non_negative(le_i32!(buf, 4), "block count")?,
            total_segments: non_negative(le_i32!(buf, 8), "segment count")?,
            block_size: non_negative(le_i32!(buf, 12), "block size")?,
            segment_size: non_negative(le_i32!(buf, 16), "segment size")?,
        })
    }

    /// An image that was never formatted has an all-zero superblock.
    pub fn is_blank(&self) -> bool {
        self.block_size == 0 && self.segment_size == 0
    }

    pub fn geometry(&self) -> LfsResult<Geometry> {
        if self.block_size == 0 || self.segment_size % self.block_size != 0 {
            return Err(LfsError::corrupt("superblock geometry"));
        }
        let geo = Geometry {
            block_size: self.block_size,
            blocks_per_segment: self.segment_size / self.block_size,
            segment_count: self.total_segments,
            max_inodes: self.total_inodes,
        };
        geo.validate()
            .map_err(|_| LfsError::corrupt("superblock geometry"))?;
        Ok(geo)
    }
}

/// Write position inside the open segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub segment: u32,
    pub block: u32,
    pub imap: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub bitmap: Vec<bool>,
    pub count_inode: u32,
    pub cursor: Cursor,
    pub root_ino: u32,
    pub is_full: bool,
    pub timestamp: u64,
}

impl Checkpoint {
    pub fn encode(&self, geo: &Geometry) -> Vec<u8> {
        let mut buf = vec![0u8; geo.checkpoint_size()];
        for (seg, used) in self.bitmap.iter().enumerate() {
            buf[seg] = *used as u8;
        }
        let at = align4(geo.segment_count as usize);
        put_le!(buf, at, self.count_inode as i32);
        put_le!(buf, at + 4, self.cursor.segment as i32);
        put_le!(buf, at + 8, self.cursor.block as i32);
        put_le!(buf, at + 12, self.root_ino as i32);
        put_le!(buf, at + 16, self.cursor.imap as i32);
        put_le!(buf, at + 20, self.is_full as i32);
        put_le!(buf, at + 24, self.timestamp as i64);
        buf
    }

    /// Timestamp of an encoded slot, readable before the slot is trusted.
    pub fn timestamp_of(geo: &Geometry, buf: &[u8]) -> i64 {
        le_i64!(buf, align4(geo.segment_count as usize) + 24)
    }

    /// Decode and range-check a slot.
    pub fn decode(geo: &Geometry, buf: &[u8]) -> LfsResult<Self> {
        let at = align4(geo.segment_count as usize);
        let count_inode = le_i32!(buf, at);
        let segment = le_i32!(buf, at + 4);
        let block = le_i32!(buf, at + 8);
        let root_ino = le_i32!(buf, at + 12);
        let imap = le_i32!(buf, at + 16);
        let timestamp = le_i64!(buf, at + 24);

        let data = geo.data_blocks() as i32;
        if count_inode <= 0 || count_inode as u32 >= geo.max_inodes {
            return Err(LfsError::corrupt("checkpoint inode counter"));
        }
        if segment < 0 || segment as u32 >= geo.segment_count {
            return Err(LfsError::corrupt("checkpoint segment cursor"));
        }
        if block < 0 || block > data || imap < 0 || imap > data {
            return Err(LfsError::corrupt("checkpoint block cursor"));
        }
        if root_ino <= 0 || root_ino > count_inode || timestamp <= 0 {
            return Err(LfsError::corrupt("checkpoint root inode"));
        }
        let bitmap = buf[..geo.segment_count as usize]
            .iter()
            .map(|b| *b != 0)
            .collect();
        Ok(Self {
            bitmap,
            count_inode: count_inode as u32,
            cursor: Cursor {
                segment: segment as u32,
                block: block as u32,
                imap: imap as u32,
            },
            root_ino: root_ino as u32,
            is_full: le_i32!(buf, at + 20) != 0,
            timestamp: timestamp as u64,
        })
    }
}

/// Trailing record of every segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Position of the segment in log order
    pub sequence: u64,
    pub used_blocks: u32,
    pub imap_entries: u32,
}

impl SegmentMeta {
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_le!(buf, 0, self.sequence as i64);
        put_le!(buf, 8, self.used_blocks as i32);
        put_le!(buf, 12, self.imap_entries as i32);
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            sequence: u64::try_from(le_i64!(buf, 0)).unwrap_or(0),
            used_blocks: u32::try_from(le_i32!(buf, 8)).unwrap_or(0),
            imap_entries: u32::try_from(le_i32!(buf, 12)).unwrap_or(0),
        }
    }
}

/// One inode-map entry. `addr == None` is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub ino: u32,
    pub addr: Option<BlockAddr>,
}

impl MapEntry {
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_le!(buf, 0, self.ino as i32);
        put_le!(buf, 4, encode_addr(self.addr));
    }

    /// `None` for an unused slot.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let ino = le_i32!(buf, 0);
        if ino <= 0 {
            return None;
        }
        Some(Self {
            ino: ino as u32,
            addr: decode_addr(le_i32!(buf, 4)),
        })
    }
}

/// What occupies a block slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOwner {
    Inode,
    Direct(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryEntry {
    pub ino: u32,
    pub owner: BlockOwner,
}

impl SummaryEntry {
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_le!(buf, 0, self.ino as i32);
        let index = match self.owner {
            BlockOwner::Inode => -1,
            BlockOwner::Direct(i) => i as i32,
        };
        put_le!(buf, 4, index);
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let ino = le_i32!(buf, 0);
        if ino <= 0 {
            return None;
        }
        let owner = match u32::try_from(le_i32!(buf, 4)) {
            Ok(i) => BlockOwner::Direct(i),
            Err(_) => BlockOwner::Inode,
        };
        Some(Self {
            ino: ino as u32,
            owner,
        })
    }
}
