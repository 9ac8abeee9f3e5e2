//! Write-back cache of fixed runs of blocks ("cachelines").
//!
//! Every slot carries a logical stamp that is bumped on each access. Single
//! slot victims come from a min-heap of `(stamp, slot)` pairs with lazy
//! deletion: a popped pair whose stamp no longer matches the slot is stale
//! and dropped. Whole segments are inserted into the contiguous window of
//! slots with the smallest summed stamps. Dirty slots are written back to
//! the image before they are reused.

use alloc::{
    collections::{BTreeMap, BinaryHeap},
    vec,
    vec::Vec,
};
use core::cmp::Reverse;

use log::{debug, trace};
use spin::Mutex;

use crate::{
    blockio::{DiskIo, SegmentSink},
    common::{LfsError, LfsResult},
    layout::BlockAddr,
};

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    line: Option<u64>,
    stamp: u64,
    dirty: bool,
}

impl SlotMeta {
    const EMPTY: SlotMeta = SlotMeta {
        line: None,
        stamp: 0,
        dirty: false,
    };
}

struct CacheInner {
    data: Vec<u8>,
    slots: Vec<SlotMeta>,
    /// cacheline index -> slot
    map: BTreeMap<u64, usize>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    clock: u64,
}

pub struct WriteBackCache {
    io: DiskIo,
    line_blocks: usize,
    line_bytes: usize,
    lines: usize,
    inner: Mutex<CacheInner>,
}

impl WriteBackCache {
    /// A cache of `cache_bytes` split into lines of `line_blocks` blocks.
    /// It must be able to hold at least one whole segment.
    pub fn new(io: DiskIo, cache_bytes: usize, line_blocks: usize) -> LfsResult<Self> {
        let geo = *io.geometry();
        if line_blocks == 0 || geo.blocks_per_segment as usize % line_blocks != 0 {
            return Err(LfsError::InvalidArgument);
        }
        let line_bytes = line_blocks * geo.block_size as usize;
        let lines = cache_bytes / line_bytes;
        if lines < geo.blocks_per_segment as usize / line_blocks {
            return Err(LfsError::InvalidArgument);
        }
        debug!("write-back cache: {} lines of {} bytes", lines, line_bytes);
        let cache = Self {
            io,
            line_blocks,
            line_bytes,
            lines,
            inner: Mutex::new(CacheInner {
                data: vec![0; lines * line_bytes],
                slots: vec![SlotMeta::EMPTY; lines],
                map: BTreeMap::new(),
                heap: BinaryHeap::new(),
                clock: 0,
            }),
        };
        cache.init_cache();
        Ok(cache)
    }

    pub fn line_count(&self) -> usize {
        self.lines
    }

    /// Drop every cached line without writing anything back.
    pub fn init_cache(&self) {
        let mut inner = self.inner.lock();
        let CacheInner {
            slots,
            map,
            heap,
            clock,
            ..
        } = &mut *inner;
        map.clear();
        heap.clear();
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = SlotMeta::EMPTY;
            heap.push(Reverse((0, i)));
        }
        *clock = 0;
    }

    /// Write every dirty line back to the image.
    pub fn flush_cache(&self) -> LfsResult<()> {
        let mut inner = self.inner.lock();
        for slot in 0..self.lines {
            self.write_back(&mut inner, slot)?;
        }
        Ok(())
    }

    pub fn read_block_cached(&self, addr: BlockAddr) -> LfsResult<Vec<u8>> {
        let bs = self.io.geometry().block_size as usize;
        let line = addr as u64 / self.line_blocks as u64;
        let within = (addr as usize % self.line_blocks) * bs;

        let mut inner = self.inner.lock();
        let slot = match inner.map.get(&line) {
            Some(slot) => *slot,
            None => {
                let slot = self.evict_one(&mut inner)?;
                let start = slot * self.line_bytes;
                self.io.read_exact(
                    line * self.line_bytes as u64,
                    &mut inner.data[start..start + self.line_bytes],
                )?;
                inner.slots[slot] = SlotMeta {
                    line: Some(line),
                    stamp: 0,
                    dirty: false,
                };
                inner.map.insert(line, slot);
                slot
            }
        };
        self.touch(&mut inner, slot);
        let start = slot * self.line_bytes + within;
        Ok(inner.data[start..start + bs].to_vec())
    }

    /// Place a whole segment in the cache as dirty lines.
    pub fn write_segment_cached(&self, segment: u32, buf: &[u8]) -> LfsResult<()> {
        let geo = *self.io.geometry();
        let span = geo.blocks_per_segment as usize / self.line_blocks;
        let first = segment as u64 * span as u64;
        if buf.len() != span * self.line_bytes {
            return Err(LfsError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        // Older copies of these lines are superseded by `buf`.
        for line in first..first + span as u64 {
            if let Some(slot) = inner.map.remove(&line) {
                inner.slots[slot] = SlotMeta::EMPTY;
                inner.heap.push(Reverse((0, slot)));
            }
        }
        let start = self.evict_span(&mut inner, span)?;
        for i in 0..span {
            let slot = start + i;
            let line = first + i as u64;
            let at = slot * self.line_bytes;
            inner.data[at..at + self.line_bytes]
                .copy_from_slice(&buf[i * self.line_bytes..(i + 1) * self.line_bytes]);
            inner.slots[slot] = SlotMeta {
                line: Some(line),
                stamp: 0,
                dirty: true,
            };
            inner.map.insert(line, slot);
            self.touch(&mut inner, slot);
        }
        trace!("cached segment {} in slots {}..{}", segment, start, start + span);
        Ok(())
    }

    fn touch(&self, inner: &mut CacheInner, slot: usize) {
        inner.clock += 1;
        inner.slots[slot].stamp = inner.clock;
        inner.heap.push(Reverse((inner.clock, slot)));
        if inner.heap.len() > 4 * self.lines {
            let fresh = inner
                .slots
                .iter()
                .enumerate()
                .map(|(i, meta)| Reverse((meta.stamp, i)))
                .collect();
            inner.heap = fresh;
        }
    }

    fn write_back(&self, inner: &mut CacheInner, slot: usize) -> LfsResult<()> {
        let meta = inner.slots[slot];
        if let (Some(line), true) = (meta.line, meta.dirty) {
            let at = slot * self.line_bytes;
            self.io
                .write_all(line * self.line_bytes as u64, &inner.data[at..at + self.line_bytes])?;
            inner.slots[slot].dirty = false;
        }
        Ok(())
    }

    /// Free a slot, writing it back first when dirty.
    fn release(&self, inner: &mut CacheInner, slot: usize) -> LfsResult<()> {
        self.write_back(inner, slot)?;
        if let Some(line) = inner.slots[slot].line.take() {
            inner.map.remove(&line);
        }
        Ok(())
    }

    fn evict_one(&self, inner: &mut CacheInner) -> LfsResult<usize> {
        while let Some(Reverse((stamp, slot))) = inner.heap.pop() {
            if inner.slots[slot].stamp != stamp {
                continue;
            }
            trace!("evict cache slot {}", slot);
            self.release(inner, slot)?;
            return Ok(slot);
        }
        // Every live slot has a heap entry carrying its current stamp.
        Err(LfsError::corrupt("cache heap exhausted"))
    }

    /// Free the `span` contiguous slots with the smallest summed stamps.
    fn evict_span(&self, inner: &mut CacheInner, span: usize) -> LfsResult<usize> {
        let stamps: Vec<u64> = inner.slots.iter().map(|s| s.stamp).collect();
        let mut sum: u64 = stamps[..span].iter().sum();
        let mut best = (sum, 0);
        for start in 1..=self.lines - span {
            sum = sum - stamps[start - 1] + stamps[start + span - 1];
            if sum < best.0 {
                best = (sum, start);
            }
        }
        for slot in best.1..best.1 + span {
            self.release(inner, slot)?;
        }
        Ok(best.1)
    }
}

impl SegmentSink for WriteBackCache {
    fn store_segment(&self, segment: u32, buf: &[u8]) -> LfsResult<()> {
        self.write_segment_cached(segment, buf)
    }
}
