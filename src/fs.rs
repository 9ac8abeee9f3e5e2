//! The mounted file system: engine state behind one global lock.
//!
//! Every entry point takes the lock for its whole duration, so operations
//! and garbage collection are totally ordered.

use alloc::{format, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use serde::Serialize;
use spin::{Mutex, MutexGuard};

use crate::{
    blockio::{decode_imap, decode_summary, DiskIo},
    cache::WriteBackCache,
    common::{
        AccessMode, Caller, LfsAttr, LfsDirEntry, LfsError, LfsFsStat, LfsPermission, LfsResult,
        LfsTimeSpec, RenameFlags,
    },
    config::LfsConfig,
    device::BlockDevice,
    dir, file,
    gc::{self, GcReport},
    inode::{Inode, InodeKind},
    layout::{
        BlockAddr, Checkpoint, Cursor, Geometry, Superblock, MAP_ENTRY_SIZE, MAX_FILE_SIZE, ROOT_INO,
    },
    meta, path,
    segment::{SegmentBuffer, SegmentLog},
};

/// Appends every mutation may make beyond its own estimate.
const APPEND_SLACK: usize = 2;
/// Worst case for one directory entry edit: the entry block, a new
/// continuation link, the previous tail link and the head.
const DIR_EDIT: usize = 4;

pub(crate) struct LfsState {
    pub io: DiskIo,
    pub config: LfsConfig,
    pub log: SegmentLog,
    /// Highest inode number handed out
    pub count_inode: u32,
    pub root_ino: u32,
    pub is_full: bool,
    /// Timestamp of the last checkpoint written
    pub generation: u64,
}

impl LfsState {
    pub fn geo(&self) -> &Geometry {
        &self.log.geo
    }

    pub fn contains_inode(&self, ino: u32) -> bool {
        self.log.table.contains_key(&ino)
    }

    /// Load the current copy of an inode.
    pub fn get_inode(&self, ino: u32) -> LfsResult<Inode> {
        let addr = *self
            .log
            .table
            .get(&ino)
            .ok_or_else(|| LfsError::corrupt(format!("inode {} is referenced but not live", ino)))?;
        if let Some(inode) = self.log.cached_inode(ino, addr) {
            return Ok(inode.clone());
        }
        let inode = Inode::decode(self.geo(), &self.read_block(addr)?)?;
        if inode.ino != ino {
            return Err(LfsError::corrupt(format!(
                "block {} holds inode {}, expected {}",
                addr, inode.ino, ino
            )));
        }
        Ok(inode)
    }

    /// An inode number handed back by a caller must name a live head inode.
    fn check_handle(&self, ino: u32) -> LfsResult<()> {
        if !self.contains_inode(ino) {
            return Err(LfsError::NotFound);
        }
        if self.get_inode(ino)?.kind == InodeKind::Continuation {
            return Err(LfsError::InvalidArgument);
        }
        Ok(())
    }

    pub fn read_block(&self, addr: BlockAddr) -> LfsResult<Vec<u8>> {
        self.log.read_block(&self.io, addr)
    }

    pub fn append_inode(&mut self, inode: &Inode) -> LfsResult<BlockAddr> {
        self.log.append_inode(&self.io, inode)
    }

    pub fn append_data(&mut self, ino: u32, index: u32, data: &[u8]) -> LfsResult<BlockAddr> {
        self.log.append_data(&self.io, ino, index, data)
    }

    /// Drop an inode from the table, leaving a tombstone in the log.
    pub fn remove_inode(&mut self, ino: u32) -> LfsResult<()> {
        self.log.append_tombstone(&self.io, ino)
    }

    pub fn alloc_ino(&mut self) -> LfsResult<u32> {
        let ino = self.count_inode + 1;
        if ino >= self.geo().max_inodes {
            return Err(LfsError::NoSpace);
        }
        self.count_inode = ino;
        Ok(ino)
    }

    pub fn write_checkpoint(&mut self, cursor: Cursor) -> LfsResult<()> {
        self.generation += 1;
        let slot = ((self.generation - 1) % 2) as usize;
        let ckpt = Checkpoint {
            bitmap: self.log.bitmap.clone(),
            count_inode: self.count_inode,
            cursor,
            root_ino: self.root_ino,
            is_full: self.is_full,
            timestamp: self.generation,
        };
        self.io.write_checkpoint(slot, &ckpt.encode(self.geo()))
    }

    pub fn flush_pending_checkpoint(&mut self) -> LfsResult<()> {
        match self.log.pending_checkpoint.take() {
            Some(cursor) => self.write_checkpoint(cursor),
            None => Ok(()),
        }
    }

    /// Write the open segment and a checkpoint that covers it.
    pub fn sync(&mut self) -> LfsResult<()> {
        self.log.flush_current(&self.io)?;
        self.log.pending_checkpoint = None;
        let cursor = self.log.buffer.cursor();
        self.write_checkpoint(cursor)?;
        self.io.flush()
    }

    pub fn update_full_flag(&mut self) {
        let half = self.geo().data_blocks() as usize / 2;
        let full = self.log.free_segments() == 0 && self.log.remaining_in_segment() < half;
        if full != self.is_full {
            warn!("file system full flag {}", if full { "set" } else { "cleared" });
        }
        self.is_full = full;
    }

    /// Estimated links of the chain at `path`, for space reservation.
    fn links_hint(&self, path: &str, caller: &Caller) -> usize {
        path::locate(self, path, caller)
            .and_then(|ino| self.get_inode(ino))
            .map(|inode| inode.size_blocks as usize / self.geo().direct_per_inode() + 1)
            .unwrap_or(1)
    }

    fn links_hint_ino(&self, ino: u32) -> usize {
        self.contains_inode(ino)
            .then(|| self.get_inode(ino).ok())
            .flatten()
            .map(|inode| inode.size_blocks as usize / self.geo().direct_per_inode() + 1)
            .unwrap_or(1)
    }

    fn write_need(&self, size_now: Option<u64>, offset: u64, len: usize) -> usize {
        let bs = self.geo().block_size as u64;
        let start = size_now.map_or(offset, |s| s.min(offset));
        let end = match offset.checked_add(len as u64) {
            Some(end) if end <= MAX_FILE_SIZE => end,
            // Rejected by the write itself.
            _ => return 0,
        };
        let blocks = (end / bs).saturating_sub(start / bs) as usize + 2;
        blocks + blocks / self.geo().direct_per_inode() + 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LfsStats {
    pub segments_total: usize,
    pub segments_in_use: usize,
    pub free_segments: usize,
    pub live_inodes: usize,
    pub inode_counter: u32,
    pub is_full: bool,
    pub checkpoint_generation: u64,
}

pub struct Lfs {
    state: Mutex<LfsState>,
    cache: WriteBackCache,
    halted: AtomicBool,
}

impl Lfs {
    /// Lay out an empty file system holding only the root directory.
    pub fn format(dev: Arc<dyn BlockDevice>, config: LfsConfig, caller: &Caller) -> LfsResult<Self> {
        config.validate()?;
        let geo = config.geometry();
        if dev.size() < geo.image_size() {
            return Err(LfsError::InvalidArgument);
        }
        info!(
            "formatting LFS: {} segments x {} blocks of {} bytes",
            geo.segment_count, geo.blocks_per_segment, geo.block_size
        );
        let io = DiskIo::new(dev, geo);
        let meta_len = (geo.image_size() - geo.superblock_offset()) as usize;
        io.write_all(geo.superblock_offset(), &vec![0; meta_len])?;
        io.write_superblock(&Superblock::from_geometry(&geo).encode())?;

        let mut st = LfsState {
            io,
            log: SegmentLog::fresh(geo, 0, 1),
            count_inode: 0,
            root_ino: ROOT_INO,
            is_full: false,
            generation: 0,
            config,
        };
        let ino = st.alloc_ino()?;
        let perm = LfsPermission::from_bits_truncate(st.config.root_mode);
        let root = Inode::new(&geo, ino, InodeKind::Directory, perm, caller);
        st.append_inode(&root)?;
        st.sync()?;
        Self::assemble(st)
    }

    /// Load an existing image from its newest checkpoint.
    pub fn mount(dev: Arc<dyn BlockDevice>, config: LfsConfig) -> LfsResult<Self> {
        config.validate()?;
        let geo = config.geometry();
        if dev.size() < geo.image_size() {
            return Err(LfsError::InvalidArgument);
        }
        let io = DiskIo::new(dev, geo);
        let sb = Superblock::decode(&io.read_superblock()?)?;
        if sb.is_blank() {
            return Err(LfsError::corrupt("image is not formatted"));
        }
        let on_disk = sb.geometry()?;
        if on_disk != geo {
            warn!("configured geometry {:?} differs from image {:?}", geo, on_disk);
            return Err(LfsError::InvalidArgument);
        }

        let slots = [io.read_checkpoint(0)?, io.read_checkpoint(1)?];
        let newest = if Checkpoint::timestamp_of(&geo, &slots[1]) > Checkpoint::timestamp_of(&geo, &slots[0]) {
            1
        } else {
            0
        };
        let ckpt = Checkpoint::decode(&geo, &slots[newest])?;
        info!(
            "mounting LFS from checkpoint slot {} (generation {})",
            newest, ckpt.timestamp
        );
        let log = Self::recover_log(&io, &ckpt)?;
        let max_ino = log.table.keys().next_back().copied().unwrap_or(0);
        if !log.table.contains_key(&ckpt.root_ino) {
            return Err(LfsError::corrupt("root inode is not live"));
        }
        let st = LfsState {
            io,
            config,
            log,
            count_inode: ckpt.count_inode.max(max_ino),
            root_ino: ckpt.root_ino,
            is_full: ckpt.is_full,
            generation: ckpt.timestamp,
        };
        debug!(
            "recovered {} inodes, {} segments in use",
            st.log.table.len(),
            st.log.segments_in_use()
        );
        Self::assemble(st)
    }

    /// Rebuild the allocator state by replaying segment inode maps in log
    /// order, the open segment last.
    fn recover_log(io: &DiskIo, ckpt: &Checkpoint) -> LfsResult<SegmentLog> {
        let geo = *io.geometry();
        let bs = geo.block_size as usize;
        let cur = ckpt.cursor;
        let mut log = SegmentLog::fresh(geo, cur.segment, 0);
        log.bitmap = ckpt.bitmap.clone();
        log.bitmap[cur.segment as usize] = true;

        let mut order = Vec::new();
        for seg in 0..geo.segment_count {
            if seg == cur.segment || !log.bitmap[seg as usize] {
                continue;
            }
            let meta = io.read_meta(seg)?;
            log.sequences[seg as usize] = meta.sequence;
            log.summaries[seg as usize] = io.read_summary(seg)?;
            order.push(seg);
        }
        order.sort_by_key(|seg| (log.sequences[*seg as usize], *seg));

        // Anything past the checkpointed cursor was never made durable.
        let mut data = io.read_segment(cur.segment)?;
        data[cur.block as usize * bs..geo.imap_offset()].fill(0);
        let imap_end = geo.imap_offset() + cur.imap as usize * MAP_ENTRY_SIZE;
        data[imap_end..geo.summary_offset()].fill(0);
        let sum_end = geo.summary_offset() + cur.block as usize * MAP_ENTRY_SIZE;
        data[sum_end..geo.meta_offset()].fill(0);

        let sequence = log.sequences.iter().copied().max().unwrap_or(0) + 1;
        log.sequences[cur.segment as usize] = sequence;
        log.next_sequence = sequence + 1;
        log.summaries[cur.segment as usize] = decode_summary(&geo, &data[geo.summary_offset()..]);
        log.buffer = SegmentBuffer {
            segment: cur.segment,
            next_block: cur.block,
            next_imap: cur.imap,
            sequence,
            data,
        };

        for seg in order.iter().copied().chain(core::iter::once(cur.segment)) {
            let entries = if seg == cur.segment {
                decode_imap(&geo, &log.buffer.data[geo.imap_offset()..], cur.imap)
            } else {
                io.read_imap(seg)?
            };
            for entry in entries {
                match entry.addr {
                    Some(addr) if !geo.is_data_addr(addr) => {
                        return Err(LfsError::corrupt(format!(
                            "imap of segment {} points outside the log",
                            seg
                        )))
                    }
                    Some(addr) => {
                        log.table.insert(entry.ino, addr);
                    }
                    None => {
                        log.table.remove(&entry.ino);
                    }
                }
            }
        }
        Ok(log)
    }

    /// Mount `dev`, formatting it first if it was never formatted.
    pub fn mount_or_format(dev: Arc<dyn BlockDevice>, config: LfsConfig, caller: &Caller) -> LfsResult<Self> {
        let io = DiskIo::new(dev.clone(), config.geometry());
        let blank = io
            .read_superblock()
            .and_then(|raw| Superblock::decode(&raw))
            .map(|sb| sb.is_blank())
            .unwrap_or(true);
        if blank {
            Self::format(dev, config, caller)
        } else {
            Self::mount(dev, config)
        }
    }

    /// Open or create an image file.
    #[cfg(feature = "std")]
    pub fn open_image(path: &std::path::Path, config: LfsConfig, caller: &Caller) -> LfsResult<Self> {
        config.validate()?;
        let disk = crate::device::FileDisk::open(path, config.geometry().image_size())?;
        Self::mount_or_format(Arc::new(disk), config, caller)
    }

    fn assemble(st: LfsState) -> LfsResult<Self> {
        let cache = WriteBackCache::new(
            st.io.clone(),
            st.config.cache_bytes,
            st.config.blocks_per_cacheline,
        )?;
        Ok(Self {
            state: Mutex::new(st),
            cache,
            halted: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> LfsResult<MutexGuard<'_, LfsState>> {
        if self.halted.load(Ordering::Acquire) {
            return Err(LfsError::corrupt("engine halted after corruption"));
        }
        Ok(self.state.lock())
    }

    /// Write any checkpoint owed by a rotation and halt on corruption.
    fn settle<T>(&self, st: &mut LfsState, res: LfsResult<T>) -> LfsResult<T> {
        let res = res.and_then(|v| st.flush_pending_checkpoint().map(|_| v));
        if let Err(e) = &res {
            if e.is_fatal() {
                error!("halting LFS: {}", e);
                self.halted.store(true, Ordering::Release);
            }
        }
        res
    }

    fn query<T>(&self, op: impl FnOnce(&mut LfsState) -> LfsResult<T>) -> LfsResult<T> {
        let mut st = self.lock()?;
        let res = op(&mut *st);
        self.settle(&mut *st, res)
    }

    /// Run a mutation that appends at most `need` blocks (plus slack).
    fn mutate<T>(
        &self,
        need: impl FnOnce(&LfsState) -> usize,
        op: impl FnOnce(&mut LfsState) -> LfsResult<T>,
    ) -> LfsResult<T> {
        let mut st = self.lock()?;
        let res = self.reserve(&mut *st, need).and_then(|_| op(&mut *st));
        self.settle(&mut *st, res)
    }

    fn reserve(&self, st: &mut LfsState, need: impl FnOnce(&LfsState) -> usize) -> LfsResult<()> {
        if st.is_full {
            return Err(LfsError::NoSpace);
        }
        self.auto_collect(st)?;
        let need = need(st) + APPEND_SLACK;
        if st.log.capacity() >= need {
            return Ok(());
        }
        if st.config.auto_gc {
            self.collect(st, false)?;
            if st.log.capacity() >= need {
                return Ok(());
            }
        }
        st.update_full_flag();
        Err(LfsError::NoSpace)
    }

    fn auto_collect(&self, st: &mut LfsState) -> LfsResult<()> {
        if !st.config.auto_gc || !st.log.rotated_since_gc {
            return Ok(());
        }
        let used = st.log.segments_in_use() as f64 / st.geo().segment_count as f64;
        if used >= st.config.gc_thorough_trigger {
            self.collect(st, true).map(|_| ())
        } else if used >= st.config.gc_normal_trigger {
            self.collect(st, false).map(|_| ())
        } else {
            Ok(())
        }
    }

    fn collect(&self, st: &mut LfsState, thorough: bool) -> LfsResult<GcReport> {
        let report = gc::collect(st, &self.cache, thorough)?;
        st.update_full_flag();
        info!(
            "{:?} collection cleaned {} segments, moved {} blocks; {} -> {} segments in use",
            report.mode,
            report.segments_cleaned,
            report.blocks_moved,
            report.segments_in_use_before,
            report.segments_in_use_after
        );
        Ok(report)
    }

    /// Run garbage collection now.
    pub fn collect_garbage(&self, thorough: bool) -> LfsResult<GcReport> {
        let mut st = self.lock()?;
        let res = self.collect(&mut *st, thorough);
        self.settle(&mut *st, res)
    }

    pub fn sync(&self) -> LfsResult<()> {
        let mut st = self.lock()?;
        let res = st.sync();
        self.settle(&mut *st, res)
    }

    pub fn unmount(self) -> LfsResult<()> {
        self.sync()?;
        info!("LFS unmounted");
        Ok(())
    }

    pub fn stats(&self) -> LfsResult<LfsStats> {
        self.query(|st| {
            Ok(LfsStats {
                segments_total: st.geo().segment_count as usize,
                segments_in_use: st.log.segments_in_use(),
                free_segments: st.log.free_segments(),
                live_inodes: st.log.table.len(),
                inode_counter: st.count_inode,
                is_full: st.is_full,
                checkpoint_generation: st.generation,
            })
        })
    }

    /// Whether `ino` is in the inode table.
    pub fn contains_inode(&self, ino: u32) -> LfsResult<bool> {
        self.query(|st| Ok(st.contains_inode(ino)))
    }

    pub fn getattr(&self, path: &str, caller: &Caller) -> LfsResult<LfsAttr> {
        self.query(|st| {
            let ino = path::locate(st, path, caller)?;
            meta::getattr(st, ino)
        })
    }

    pub fn access(&self, path: &str, mode: AccessMode, caller: &Caller) -> LfsResult<()> {
        self.query(|st| meta::access(st, path, mode, caller))
    }

    pub fn statfs(&self) -> LfsResult<LfsFsStat> {
        self.query(|st| Ok(meta::statfs(st)))
    }

    /// Resolve a path to the inode number used as the open handle.
    pub fn open(&self, path: &str, caller: &Caller) -> LfsResult<u32> {
        self.query(|st| path::locate(st, path, caller))
    }

    pub fn opendir(&self, path: &str, caller: &Caller) -> LfsResult<u32> {
        self.query(|st| dir::opendir(st, path, caller))
    }

    pub fn readdir(&self, path: &str, caller: &Caller) -> LfsResult<Vec<LfsDirEntry>> {
        self.query(|st| dir::readdir(st, path, caller))
    }

    pub fn create(&self, path: &str, perm: LfsPermission, caller: &Caller) -> LfsResult<u32> {
        debug!("create {}", path);
        self.mutate(
            |_| DIR_EDIT + 1,
            |st| file::create(st, path, InodeKind::File, perm, caller),
        )
    }

    pub fn mkdir(&self, path: &str, perm: LfsPermission, caller: &Caller) -> LfsResult<u32> {
        debug!("mkdir {}", path);
        self.mutate(
            |_| DIR_EDIT + 1,
            |st| file::create(st, path, InodeKind::Directory, perm, caller),
        )
    }

    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64, caller: &Caller) -> LfsResult<usize> {
        debug!("read {} [{}; {}]", path, offset, buf.len());
        self.query(|st| {
            let ino = path::locate(st, path, caller)?;
            file::read(st, ino, buf, offset, caller)
        })
    }

    pub fn read_ino(&self, ino: u32, buf: &mut [u8], offset: u64, caller: &Caller) -> LfsResult<usize> {
        self.query(|st| {
            st.check_handle(ino)?;
            file::read(st, ino, buf, offset, caller)
        })
    }

    pub fn write(&self, path: &str, buf: &[u8], offset: u64, caller: &Caller) -> LfsResult<usize> {
        debug!("write {} [{}; {}]", path, offset, buf.len());
        self.mutate(
            |st| {
                let size = path::locate(st, path, caller)
                    .and_then(|ino| st.get_inode(ino))
                    .map(|inode| inode.size)
                    .ok();
                st.write_need(size, offset, buf.len())
            },
            |st| {
                let ino = path::locate(st, path, caller)?;
                file::write(st, ino, buf, offset, caller)
            },
        )
    }

    pub fn write_ino(&self, ino: u32, buf: &[u8], offset: u64, caller: &Caller) -> LfsResult<usize> {
        self.mutate(
            |st| {
                let size = st
                    .contains_inode(ino)
                    .then(|| st.get_inode(ino).ok())
                    .flatten()
                    .map(|inode| inode.size);
                st.write_need(size, offset, buf.len())
            },
            |st| {
                st.check_handle(ino)?;
                file::write(st, ino, buf, offset, caller)
            },
        )
    }

    pub fn truncate(&self, path: &str, size: u64, caller: &Caller) -> LfsResult<()> {
        debug!("truncate {} to {}", path, size);
        self.mutate(
            |st| st.links_hint(path, caller) + 2,
            |st| {
                let ino = path::locate(st, path, caller)?;
                file::truncate(st, ino, size, caller)
            },
        )
    }

    pub fn truncate_ino(&self, ino: u32, size: u64, caller: &Caller) -> LfsResult<()> {
        self.mutate(
            |st| st.links_hint_ino(ino) + 2,
            |st| {
                st.check_handle(ino)?;
                file::truncate(st, ino, size, caller)
            },
        )
    }

    pub fn rename(&self, from: &str, to: &str, flags: RenameFlags, caller: &Caller) -> LfsResult<()> {
        debug!("rename {} -> {} ({:?})", from, to, flags);
        self.mutate(
            |st| 2 * DIR_EDIT + 2 + st.links_hint(to, caller),
            |st| file::rename(st, from, to, flags, caller),
        )
    }

    pub fn unlink(&self, path: &str, caller: &Caller) -> LfsResult<()> {
        debug!("unlink {}", path);
        self.mutate(
            |st| DIR_EDIT + 1 + st.links_hint(path, caller),
            |st| file::unlink(st, path, caller),
        )
    }

    pub fn rmdir(&self, path: &str, caller: &Caller) -> LfsResult<()> {
        debug!("rmdir {}", path);
        self.mutate(
            |st| DIR_EDIT + 1 + st.links_hint(path, caller),
            |st| dir::rmdir(st, path, caller),
        )
    }

    pub fn link(&self, src: &str, dst: &str, caller: &Caller) -> LfsResult<()> {
        debug!("link {} -> {}", dst, src);
        self.mutate(|_| DIR_EDIT + 1, |st| file::link(st, src, dst, caller))
    }

    pub fn chmod(&self, path: &str, perm: LfsPermission, caller: &Caller) -> LfsResult<()> {
        self.mutate(|_| 1, |st| meta::chmod(st, path, perm, caller))
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>, caller: &Caller) -> LfsResult<()> {
        self.mutate(|_| 1, |st| meta::chown(st, path, uid, gid, caller))
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<LfsTimeSpec>,
        mtime: Option<LfsTimeSpec>,
        caller: &Caller,
    ) -> LfsResult<()> {
        self.mutate(|_| 1, |st| meta::utimens(st, path, atime, mtime, caller))
    }
}
