//! The open segment and the allocator that appends inode and data blocks
//! to the log.

use alloc::{collections::BTreeMap, vec, vec::Vec};

use log::{debug, trace};

use crate::{
    blockio::{decode_summary, DiskIo, SegmentSink},
    common::{LfsError, LfsResult},
    inode::Inode,
    layout::{
        BlockAddr, BlockOwner, Cursor, Geometry, MapEntry, SegmentMeta, SummaryEntry,
        MAP_ENTRY_SIZE, SEGMENT_META_SIZE,
    },
};

const INODE_CACHE_LIMIT: usize = 1024;

/// In-memory image of the segment currently being filled.
#[derive(Clone)]
pub struct SegmentBuffer {
    pub segment: u32,
    pub next_block: u32,
    pub next_imap: u32,
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl SegmentBuffer {
    pub fn empty(geo: &Geometry, segment: u32, sequence: u64) -> Self {
        Self {
            segment,
            next_block: 0,
            next_imap: 0,
            sequence,
            data: vec![0; geo.segment_size()],
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            segment: self.segment,
            block: self.next_block,
            imap: self.next_imap,
        }
    }

    fn seal(&mut self, geo: &Geometry) {
        let at = geo.meta_offset();
        SegmentMeta {
            sequence: self.sequence,
            used_blocks: self.next_block,
            imap_entries: self.next_imap,
        }
        .encode_into(&mut self.data[at..at + SEGMENT_META_SIZE]);
    }
}

/// Allocator state: the inode table, segment usage and the open segment.
///
/// The live file system owns one of these. The garbage collector builds a
/// scratch copy and swaps it in when a collection completes.
#[derive(Clone)]
pub struct SegmentLog {
    pub geo: Geometry,
    pub buffer: SegmentBuffer,
    /// inode number -> address of its current inode block
    pub table: BTreeMap<u32, BlockAddr>,
    /// segments holding log data, the open one included
    pub bitmap: Vec<bool>,
    pub summaries: Vec<Vec<Option<SummaryEntry>>>,
    pub sequences: Vec<u64>,
    pub next_sequence: u64,
    /// Cursor of a freshly opened segment that still needs a checkpoint.
    pub pending_checkpoint: Option<Cursor>,
    pub rotated_since_gc: bool,
    /// Decoded copies of recently appended inodes, keyed by inode number.
    inodes: BTreeMap<u32, (BlockAddr, Inode)>,
}

impl SegmentLog {
    /// An empty log writing into `segment`.
    pub fn fresh(geo: Geometry, segment: u32, sequence: u64) -> Self {
        let n = geo.segment_count as usize;
        let mut bitmap = vec![false; n];
        bitmap[segment as usize] = true;
        let mut sequences = vec![0; n];
        sequences[segment as usize] = sequence;
        Self {
            buffer: SegmentBuffer::empty(&geo, segment, sequence),
            table: BTreeMap::new(),
            bitmap,
            summaries: vec![vec![None; geo.data_blocks() as usize]; n],
            sequences,
            next_sequence: sequence + 1,
            pending_checkpoint: None,
            rotated_since_gc: false,
            inodes: BTreeMap::new(),
            geo,
        }
    }

    /// A copy sharing this log's table and usage but writing into the
    /// free `segment`.
    pub fn fork_into(&self, segment: u32) -> Self {
        let mut fork = Self {
            geo: self.geo,
            buffer: SegmentBuffer::empty(&self.geo, segment, self.next_sequence),
            table: self.table.clone(),
            bitmap: self.bitmap.clone(),
            summaries: self.summaries.clone(),
            sequences: self.sequences.clone(),
            next_sequence: self.next_sequence + 1,
            pending_checkpoint: None,
            rotated_since_gc: false,
            inodes: self.inodes.clone(),
        };
        fork.claim(segment, self.next_sequence);
        fork
    }

    fn claim(&mut self, segment: u32, sequence: u64) {
        let s = segment as usize;
        self.bitmap[s] = true;
        self.sequences[s] = sequence;
        self.summaries[s] = vec![None; self.geo.data_blocks() as usize];
    }

    pub fn segments_in_use(&self) -> usize {
        self.bitmap.iter().filter(|used| **used).count()
    }

    pub fn free_segments(&self) -> usize {
        self.bitmap.len() - self.segments_in_use()
    }

    pub fn first_free_segment(&self) -> Option<u32> {
        self.bitmap.iter().position(|used| !*used).map(|s| s as u32)
    }

    /// Appends that still fit in the open segment.
    pub fn remaining_in_segment(&self) -> usize {
        let d = self.geo.data_blocks();
        (d - self.buffer.next_block).min(d - self.buffer.next_imap) as usize
    }

    /// Appends that fit without collecting garbage.
    pub fn capacity(&self) -> usize {
        self.remaining_in_segment() + self.free_segments() * self.geo.data_blocks() as usize
    }

    /// Read a block, preferring the unflushed copy in the open segment.
    pub fn read_block(&self, io: &DiskIo, addr: BlockAddr) -> LfsResult<Vec<u8>> {
        if self.geo.segment_of(addr) == self.buffer.segment {
            let bs = self.geo.block_size as usize;
            let at = self.geo.slot_of(addr) as usize * bs;
            return Ok(self.buffer.data[at..at + bs].to_vec());
        }
        io.read_block(addr)
    }

    pub fn append_inode(&mut self, sink: &dyn SegmentSink, inode: &Inode) -> LfsResult<BlockAddr> {
        let entry = SummaryEntry {
            ino: inode.ino,
            owner: BlockOwner::Inode,
        };
        let addr = self.append(sink, entry, &inode.encode(&self.geo))?;
        self.put_imap(MapEntry {
            ino: inode.ino,
            addr: Some(addr),
        });
        self.table.insert(inode.ino, addr);
        if !self.inodes.contains_key(&inode.ino) && self.inodes.len() >= INODE_CACHE_LIMIT {
            self.inodes.pop_first();
        }
        self.inodes.insert(inode.ino, (addr, inode.clone()));
        Ok(addr)
    }

    /// The cached copy of `ino`, if it is the one stored at `addr`.
    pub fn cached_inode(&self, ino: u32, addr: BlockAddr) -> Option<&Inode> {
        self.inodes
            .get(&ino)
            .filter(|(at, _)| *at == addr)
            .map(|(_, inode)| inode)
    }

    pub fn append_data(
        &mut self,
        sink: &dyn SegmentSink,
        ino: u32,
        index: u32,
        data: &[u8],
    ) -> LfsResult<BlockAddr> {
        let entry = SummaryEntry {
            ino,
            owner: BlockOwner::Direct(index),
        };
        self.append(sink, entry, data)
    }

    /// Record that `ino` no longer exists.
    pub fn append_tombstone(&mut self, sink: &dyn SegmentSink, ino: u32) -> LfsResult<()> {
        self.ensure_room(sink)?;
        self.put_imap(MapEntry { ino, addr: None });
        self.table.remove(&ino);
        self.inodes.remove(&ino);
        Ok(())
    }

    fn append(&mut self, sink: &dyn SegmentSink, entry: SummaryEntry, bytes: &[u8]) -> LfsResult<BlockAddr> {
        self.ensure_room(sink)?;
        let bs = self.geo.block_size as usize;
        let slot = self.buffer.next_block;
        let at = slot as usize * bs;
        let n = bytes.len().min(bs);
        self.buffer.data[at..at + n].copy_from_slice(&bytes[..n]);
        self.buffer.data[at + n..at + bs].fill(0);

        let sum_at = self.geo.summary_offset() + slot as usize * MAP_ENTRY_SIZE;
        entry.encode_into(&mut self.buffer.data[sum_at..sum_at + MAP_ENTRY_SIZE]);
        self.summaries[self.buffer.segment as usize][slot as usize] = Some(entry);
        self.buffer.next_block += 1;
        Ok(self.geo.addr(self.buffer.segment, slot))
    }

    fn put_imap(&mut self, entry: MapEntry) {
        let at = self.geo.imap_offset() + self.buffer.next_imap as usize * MAP_ENTRY_SIZE;
        entry.encode_into(&mut self.buffer.data[at..at + MAP_ENTRY_SIZE]);
        self.buffer.next_imap += 1;
    }

    fn ensure_room(&mut self, sink: &dyn SegmentSink) -> LfsResult<()> {
        if self.remaining_in_segment() == 0 {
            self.rotate(sink)?;
        }
        Ok(())
    }

    /// Write out the open segment as it stands.
    pub fn flush_current(&mut self, sink: &dyn SegmentSink) -> LfsResult<()> {
        self.buffer.seal(&self.geo);
        sink.store_segment(self.buffer.segment, &self.buffer.data)
    }

    /// Flush the full open segment and continue in the next free one.
    fn rotate(&mut self, sink: &dyn SegmentSink) -> LfsResult<()> {
        let n = self.geo.segment_count;
        let cur = self.buffer.segment;
        let next = (1..n)
            .map(|step| (cur + step) % n)
            .find(|s| !self.bitmap[*s as usize])
            .ok_or(LfsError::NoSpace)?;
        self.flush_current(sink)?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.claim(next, sequence);
        self.buffer = SegmentBuffer::empty(&self.geo, next, sequence);
        self.pending_checkpoint = Some(self.buffer.cursor());
        self.rotated_since_gc = true;
        trace!("log rotated from segment {} to {}", cur, next);
        Ok(())
    }

    /// Re-read every in-use segment summary from the image; free segments
    /// have none.
    pub fn reload_summaries(&mut self, io: &DiskIo) -> LfsResult<()> {
        for seg in 0..self.geo.segment_count {
            let s = seg as usize;
            self.summaries[s] = if seg == self.buffer.segment {
                decode_summary(&self.geo, &self.buffer.data[self.geo.summary_offset()..])
            } else if self.bitmap[s] {
                io.read_summary(seg)?
            } else {
                vec![None; self.geo.data_blocks() as usize]
            };
        }
        debug!("reloaded summaries for {} segments", self.segments_in_use());
        Ok(())
    }
}
