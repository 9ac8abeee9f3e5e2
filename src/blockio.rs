//! Positioned block and segment I/O against the disk image.

use alloc::{format, sync::Arc, vec, vec::Vec};

use log::trace;

use crate::{
    common::{LfsError, LfsResult},
    device::BlockDevice,
    layout::{
        BlockAddr, Geometry, MapEntry, SegmentMeta, SummaryEntry, MAP_ENTRY_SIZE,
        SEGMENT_META_SIZE, SUPERBLOCK_SIZE,
    },
};

/// Destination of whole-segment writes: the image itself, or the
/// write-back cache during garbage collection.
pub trait SegmentSink {
    fn store_segment(&self, segment: u32, buf: &[u8]) -> LfsResult<()>;
}

#[derive(Clone)]
pub struct DiskIo {
    dev: Arc<dyn BlockDevice>,
    geo: Geometry,
}

impl DiskIo {
    pub fn new(dev: Arc<dyn BlockDevice>, geo: Geometry) -> Self {
        Self { dev, geo }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    pub fn read_exact(&self, pos: u64, buf: &mut [u8]) -> LfsResult<()> {
        let n = self.dev.read_at(pos, buf)?;
        if n != buf.len() {
            return Err(LfsError::Io(format!("short read at {}", pos)));
        }
        Ok(())
    }

    pub fn write_all(&self, pos: u64, buf: &[u8]) -> LfsResult<()> {
        let n = self.dev.write_at(pos, buf)?;
        if n != buf.len() {
            return Err(LfsError::Io(format!("short write at {}", pos)));
        }
        Ok(())
    }

    pub fn read_block(&self, addr: BlockAddr) -> LfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.geo.block_size as usize];
        self.read_exact(self.geo.block_offset(addr), &mut buf)?;
        Ok(buf)
    }

    pub fn read_segment(&self, segment: u32) -> LfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.geo.segment_size()];
        self.read_exact(self.geo.segment_offset(segment), &mut buf)?;
        Ok(buf)
    }

    pub fn write_segment(&self, segment: u32, buf: &[u8]) -> LfsResult<()> {
        trace!("write segment {}", segment);
        self.write_all(self.geo.segment_offset(segment), buf)
    }

    /// The reserved tail of a segment: imap, summary and metadata.
    fn read_tail(&self, segment: u32) -> LfsResult<Vec<u8>> {
        let start = self.geo.imap_offset();
        let mut buf = vec![0u8; self.geo.segment_size() - start];
        self.read_exact(self.geo.segment_offset(segment) + start as u64, &mut buf)?;
        Ok(buf)
    }

    pub fn read_imap(&self, segment: u32) -> LfsResult<Vec<MapEntry>> {
        let tail = self.read_tail(segment)?;
        let meta = self.meta_in_tail(&tail);
        Ok(decode_imap(&self.geo, &tail, meta.imap_entries))
    }

    pub fn read_summary(&self, segment: u32) -> LfsResult<Vec<Option<SummaryEntry>>> {
        let tail = self.read_tail(segment)?;
        Ok(decode_summary(&self.geo, &tail[self.summary_rel()..]))
    }

    pub fn read_meta(&self, segment: u32) -> LfsResult<SegmentMeta> {
        let tail = self.read_tail(segment)?;
        Ok(self.meta_in_tail(&tail))
    }

    fn summary_rel(&self) -> usize {
        self.geo.summary_offset() - self.geo.imap_offset()
    }

    fn meta_in_tail(&self, tail: &[u8]) -> SegmentMeta {
        let at = self.geo.meta_offset() - self.geo.imap_offset();
        SegmentMeta::decode(&tail[at..at + SEGMENT_META_SIZE])
    }

    pub fn read_superblock(&self) -> LfsResult<[u8; SUPERBLOCK_SIZE]> {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        self.read_exact(self.geo.superblock_offset(), &mut buf)?;
        Ok(buf)
    }

    pub fn write_superblock(&self, buf: &[u8]) -> LfsResult<()> {
        self.write_all(self.geo.superblock_offset(), buf)
    }

    pub fn read_checkpoint(&self, slot: usize) -> LfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.geo.checkpoint_size()];
        self.read_exact(self.geo.checkpoint_offset(slot), &mut buf)?;
        Ok(buf)
    }

    pub fn write_checkpoint(&self, slot: usize, buf: &[u8]) -> LfsResult<()> {
        trace!("write checkpoint slot {}", slot);
        self.write_all(self.geo.checkpoint_offset(slot), buf)
    }

    pub fn flush(&self) -> LfsResult<()> {
        self.dev.flush()
    }
}

impl SegmentSink for DiskIo {
    fn store_segment(&self, segment: u32, buf: &[u8]) -> LfsResult<()> {
        self.write_segment(segment, buf)
    }
}

/// Decode the first `count` imap entries of a region starting at the imap.
pub(crate) fn decode_imap(geo: &Geometry, region: &[u8], count: u32) -> Vec<MapEntry> {
    let count = count.min(geo.data_blocks()) as usize;
    region[..count * MAP_ENTRY_SIZE]
        .chunks_exact(MAP_ENTRY_SIZE)
        .map_while(MapEntry::decode)
        .collect()
}

/// Decode one summary entry per data slot from a region starting at the summary.
pub(crate) fn decode_summary(geo: &Geometry, region: &[u8]) -> Vec<Option<SummaryEntry>> {
    let slots = geo.data_blocks() as usize;
    region[..slots * MAP_ENTRY_SIZE]
        .chunks_exact(MAP_ENTRY_SIZE)
        .map(SummaryEntry::decode)
        .collect()
}
