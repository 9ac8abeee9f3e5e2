//! Segment cleaning
//!
//! A block slot is live when its summary entry still matches the inode
//! table: an inode block must be the table's current copy of its inode, a
//! data block must still be the direct pointer it claims to be. Normal mode
//! copies the live blocks of the emptiest segments into free segments.
//! Thorough mode rewrites the whole log from segment 0 in log order.
//!
//! Both modes read through the write-back cache and build a scratch
//! [`SegmentLog`], which replaces the live one only once every output
//! segment has reached the image.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    format,
    vec::Vec,
};

use log::{debug, warn};
use serde::Serialize;

use crate::{
    blockio::decode_imap,
    cache::WriteBackCache,
    common::{LfsError, LfsResult},
    fs::LfsState,
    inode::Inode,
    layout::{
        BlockAddr, BlockOwner, Geometry, MapEntry, SegmentMeta, SummaryEntry, SEGMENT_META_SIZE,
    },
    segment::SegmentLog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcMode {
    Normal,
    Thorough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub mode: GcMode,
    pub segments_cleaned: usize,
    pub blocks_moved: usize,
    pub inodes_rewritten: usize,
    pub tombstones: usize,
    pub segments_in_use_before: usize,
    pub segments_in_use_after: usize,
}

impl GcReport {
    fn new(mode: GcMode, before: usize) -> Self {
        Self {
            mode,
            segments_cleaned: 0,
            blocks_moved: 0,
            inodes_rewritten: 0,
            tombstones: 0,
            segments_in_use_before: before,
            segments_in_use_after: before,
        }
    }
}

enum NormalOutcome {
    Done(GcReport),
    /// No free segment was left for the output.
    NeedsThoroughCleanup,
}

pub(crate) fn collect(st: &mut LfsState, cache: &WriteBackCache, thorough: bool) -> LfsResult<GcReport> {
    // The collector reads the whole log from the image.
    st.log.flush_current(&st.io)?;
    cache.flush_cache()?;
    cache.init_cache();

    if !thorough {
        match normal(st, cache)? {
            NormalOutcome::Done(report) => return Ok(report),
            NormalOutcome::NeedsThoroughCleanup => {
                warn!("normal collection ran out of free segments, escalating to thorough");
                cache.init_cache();
            }
        }
    }
    thorough_clean(st, cache)
}

/// Answers liveness questions against one inode table.
struct Liveness<'a> {
    geo: Geometry,
    cache: &'a WriteBackCache,
    table: &'a BTreeMap<u32, BlockAddr>,
    inodes: BTreeMap<u32, Inode>,
}

impl<'a> Liveness<'a> {
    fn new(geo: Geometry, cache: &'a WriteBackCache, table: &'a BTreeMap<u32, BlockAddr>) -> Self {
        Self {
            geo,
            cache,
            table,
            inodes: BTreeMap::new(),
        }
    }

    /// Current copy of a live inode; `None` once it is gone from the table.
    fn inode(&mut self, ino: u32) -> LfsResult<Option<&Inode>> {
        let Some(addr) = self.table.get(&ino).copied() else {
            return Ok(None);
        };
        if !self.inodes.contains_key(&ino) {
            let inode = Inode::decode(&self.geo, &self.cache.read_block_cached(addr)?)?;
            if inode.ino != ino {
                return Err(LfsError::corrupt(format!(
                    "block {} holds inode {}, expected {}",
                    addr, inode.ino, ino
                )));
            }
            self.inodes.insert(ino, inode);
        }
        Ok(self.inodes.get(&ino))
    }

    fn is_live(&mut self, addr: BlockAddr, entry: &SummaryEntry) -> LfsResult<bool> {
        match entry.owner {
            BlockOwner::Inode => Ok(self.table.get(&entry.ino) == Some(&addr)),
            BlockOwner::Direct(index) => Ok(self
                .inode(entry.ino)?
                .map_or(false, |inode| inode.direct.get(index as usize) == Some(&addr))),
        }
    }

    fn utilization(&mut self, segment: u32, summary: &[Option<SummaryEntry>]) -> LfsResult<usize> {
        let mut live = 0;
        for (slot, entry) in summary.iter().enumerate() {
            if let Some(entry) = entry {
                if self.is_live(self.geo.addr(segment, slot as u32), entry)? {
                    live += 1;
                }
            }
        }
        Ok(live)
    }
}

fn read_imap_cached(cache: &WriteBackCache, geo: &Geometry, segment: u32) -> LfsResult<Vec<MapEntry>> {
    let mut tail = Vec::new();
    for slot in geo.data_blocks()..geo.blocks_per_segment {
        tail.extend(cache.read_block_cached(geo.addr(segment, slot))?);
    }
    let at = geo.meta_offset() - geo.imap_offset();
    let meta = SegmentMeta::decode(&tail[at..at + SEGMENT_META_SIZE]);
    Ok(decode_imap(geo, &tail, meta.imap_entries))
}

/// Map the allocator's out-of-space signal to the escalation outcome.
macro_rules! or_escalate {
    ($e:expr) => {
        match $e {
            Err(LfsError::NoSpace) => return Ok(NormalOutcome::NeedsThoroughCleanup),
            other => other?,
        }
    };
}

fn normal(st: &mut LfsState, cache: &WriteBackCache) -> LfsResult<NormalOutcome> {
    let geo = *st.geo();
    let before = st.log.segments_in_use();
    let Some(output) = st.log.first_free_segment() else {
        return Ok(NormalOutcome::NeedsThoroughCleanup);
    };
    let mut report = GcReport::new(GcMode::Normal, before);

    let scratch = {
        let log = &st.log;
        let mut live = Liveness::new(geo, cache, &log.table);

        let mut usage = Vec::new();
        for seg in 0..geo.segment_count {
            if log.bitmap[seg as usize] {
                usage.push((live.utilization(seg, &log.summaries[seg as usize])?, seg));
            }
        }
        usage.sort_unstable();
        let threshold = (st.config.gc_utilization_threshold * geo.data_blocks() as f64) as usize;
        let below = usage.iter().take_while(|(util, _)| *util < threshold).count();
        let take = below.max(st.config.gc_min_segments).min(usage.len());
        let (selected, kept) = usage.split_at(take);
        debug!("normal collection selects {:?}", selected);

        // Dead inodes still named by a surviving imap need a tombstone.
        let mut referenced = BTreeSet::new();
        for (_, seg) in kept {
            for entry in read_imap_cached(cache, &geo, *seg)? {
                if entry.addr.is_some() {
                    referenced.insert(entry.ino);
                }
            }
        }

        let mut scratch = log.fork_into(output);
        let mut moved: BTreeMap<u32, Inode> = BTreeMap::new();
        let mut tombstoned = BTreeSet::new();
        for (_, seg) in selected {
            for (slot, entry) in log.summaries[*seg as usize].iter().enumerate() {
                let Some(entry) = entry else { continue };
                let addr = geo.addr(*seg, slot as u32);
                if !live.is_live(addr, entry)? {
                    continue;
                }
                if !moved.contains_key(&entry.ino) {
                    let inode = live
                        .inode(entry.ino)?
                        .cloned()
                        .ok_or_else(|| LfsError::corrupt("live block of a dead inode"))?;
                    moved.insert(entry.ino, inode);
                }
                if let BlockOwner::Direct(index) = entry.owner {
                    let data = cache.read_block_cached(addr)?;
                    let new = or_escalate!(scratch.append_data(cache, entry.ino, index, &data));
                    if let Some(inode) = moved.get_mut(&entry.ino) {
                        inode.direct[index as usize] = new;
                    }
                    report.blocks_moved += 1;
                }
            }
            for entry in read_imap_cached(cache, &geo, *seg)? {
                // Either a stale copy or the tombstone itself is about to go.
                let dead = !log.table.contains_key(&entry.ino);
                if dead && referenced.contains(&entry.ino) && tombstoned.insert(entry.ino) {
                    or_escalate!(scratch.append_tombstone(cache, entry.ino));
                    report.tombstones += 1;
                }
            }
        }
        for inode in moved.values() {
            or_escalate!(scratch.append_inode(cache, inode));
            report.inodes_rewritten += 1;
        }
        for (_, seg) in selected {
            scratch.bitmap[*seg as usize] = false;
        }
        report.segments_cleaned = selected.len();
        scratch
    };

    commit(st, cache, scratch)?;
    report.segments_in_use_after = st.log.segments_in_use();
    Ok(NormalOutcome::Done(report))
}

fn thorough_clean(st: &mut LfsState, cache: &WriteBackCache) -> LfsResult<GcReport> {
    let geo = *st.geo();
    let mut report = GcReport::new(GcMode::Thorough, st.log.segments_in_use());

    let scratch = {
        let log = &st.log;
        let mut order: Vec<u32> = (0..geo.segment_count)
            .filter(|seg| log.bitmap[*seg as usize])
            .collect();
        order.sort_by_key(|seg| (log.sequences[*seg as usize], *seg));

        // Gather every live block before anything is written: the output
        // overwrites the source segments.
        let mut live = Liveness::new(geo, cache, &log.table);
        let mut blocks = Vec::new();
        let mut inode_order = Vec::new();
        for seg in &order {
            for (slot, entry) in log.summaries[*seg as usize].iter().enumerate() {
                let Some(entry) = entry else { continue };
                let addr = geo.addr(*seg, slot as u32);
                if !live.is_live(addr, entry)? {
                    continue;
                }
                match entry.owner {
                    BlockOwner::Inode => inode_order.push(entry.ino),
                    BlockOwner::Direct(index) => {
                        blocks.push((entry.ino, index, cache.read_block_cached(addr)?))
                    }
                }
            }
        }
        if inode_order.len() != log.table.len() {
            return Err(LfsError::corrupt("live inode missing from segment summaries"));
        }
        let mut inodes = BTreeMap::new();
        for ino in &inode_order {
            let inode = live
                .inode(*ino)?
                .cloned()
                .ok_or_else(|| LfsError::corrupt("live inode vanished"))?;
            inodes.insert(*ino, inode);
        }
        let capacity = geo.segment_count as usize * geo.data_blocks() as usize;
        if blocks.len() + inode_order.len() > capacity {
            return Err(LfsError::NoSpace);
        }

        let mut scratch = SegmentLog::fresh(geo, 0, log.next_sequence);
        for (ino, index, data) in &blocks {
            let addr = scratch.append_data(cache, *ino, *index, data)?;
            if let Some(inode) = inodes.get_mut(ino) {
                inode.direct[*index as usize] = addr;
            }
        }
        for ino in &inode_order {
            if let Some(inode) = inodes.get(ino) {
                scratch.append_inode(cache, inode)?;
            }
        }
        report.segments_cleaned = order.len();
        report.blocks_moved = blocks.len();
        report.inodes_rewritten = inode_order.len();
        scratch
    };

    commit(st, cache, scratch)?;
    report.segments_in_use_after = st.log.segments_in_use();
    Ok(report)
}

/// Make the scratch log durable and swap it in.
fn commit(st: &mut LfsState, cache: &WriteBackCache, mut scratch: SegmentLog) -> LfsResult<()> {
    scratch.flush_current(cache)?;
    cache.flush_cache()?;
    cache.init_cache();
    scratch.pending_checkpoint = None;
    scratch.rotated_since_gc = false;
    st.log = scratch;
    st.log.reload_summaries(&st.io)?;
    let cursor = st.log.buffer.cursor();
    st.write_checkpoint(cursor)?;
    st.io.flush()
}
