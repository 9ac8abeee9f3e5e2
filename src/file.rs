//! File operations
//!
//! Each call runs locate, load, permission check, then mutates copies of
//! the affected inodes and appends them to the log. Size and times always
//! live on the head inode of a chain.

use alloc::vec;

use crate::{
    chain::InodeChain,
    common::{AccessMode, Caller, LfsError, LfsPermission, LfsResult, RenameFlags},
    config::AtimePolicy,
    dir,
    fs::LfsState,
    inode::{check_name, Inode, InodeKind},
    layout::MAX_FILE_SIZE,
    meta::check_access,
    path,
};

/// Reads refresh atime under the relative policy once it is this stale.
const RELATIME_SECS: i64 = 3600;

fn load_file(st: &LfsState, ino: u32) -> LfsResult<InodeChain> {
    let chain = InodeChain::load(st, ino)?;
    match chain.head().kind {
        InodeKind::File => Ok(chain),
        InodeKind::Directory => Err(LfsError::IsADirectory),
        InodeKind::Continuation => Err(LfsError::corrupt("path resolved to a continuation inode")),
    }
}

pub(crate) fn read(st: &mut LfsState, ino: u32, buf: &mut [u8], offset: u64, caller: &Caller) -> LfsResult<usize> {
    let mut chain = load_file(st, ino)?;
    check_access(st, chain.head(), caller, AccessMode::READ)?;
    let size = chain.head().size;
    if offset >= size || buf.is_empty() {
        return Ok(0);
    }
    let bs = st.geo().block_size as u64;
    let len = buf.len().min((size - offset) as usize);
    let mut done = 0;
    while done < len {
        let at = offset + done as u64;
        let within = (at % bs) as usize;
        let n = (bs as usize - within).min(len - done);
        let block = chain.read_block(st, (at / bs) as usize)?;
        buf[done..done + n].copy_from_slice(&block[within..within + n]);
        done += n;
    }

    let head = chain.head();
    let refresh = match st.config.atime {
        AtimePolicy::Strict => true,
        AtimePolicy::Relative => {
            head.atime <= head.mtime || caller.now.sec - head.atime.sec >= RELATIME_SECS
        }
        AtimePolicy::Off => false,
    };
    // A full log still serves reads; it only skips the atime copy.
    if refresh && !st.is_full && st.log.capacity() > 2 {
        chain.head_mut().atime = caller.now;
        chain.commit(st)?;
    }
    Ok(len)
}

/// Overwrite or extend `[pos, pos + data.len())`; `pos` must not be past
/// the end of the chain's blocks.
fn write_range(st: &mut LfsState, chain: &mut InodeChain, pos: u64, data: &[u8]) -> LfsResult<()> {
    let bs = st.geo().block_size as usize;
    let mut done = 0;
    while done < data.len() {
        let at = pos + done as u64;
        let index = (at / bs as u64) as usize;
        let within = (at % bs as u64) as usize;
        let n = (bs - within).min(data.len() - done);
        let mut block = if n < bs && index < chain.block_count() {
            chain.read_block(st, index)?
        } else {
            vec![0u8; bs]
        };
        block[within..within + n].copy_from_slice(&data[done..done + n]);
        chain.put_block(st, index, &block)?;
        done += n;
    }
    Ok(())
}

pub(crate) fn write(st: &mut LfsState, ino: u32, buf: &[u8], offset: u64, caller: &Caller) -> LfsResult<usize> {
    let mut chain = load_file(st, ino)?;
    check_access(st, chain.head(), caller, AccessMode::WRITE)?;
    let end = offset
        .checked_add(buf.len() as u64)
        .filter(|end| *end <= MAX_FILE_SIZE)
        .ok_or(LfsError::InvalidArgument)?;
    if buf.is_empty() {
        return Ok(0);
    }
    let size = chain.head().size;
    if offset > size {
        // Zero-fill the hole one block at a time.
        let bs = st.geo().block_size as u64;
        let zeros = vec![0u8; bs as usize];
        let mut pos = size;
        while pos < offset {
            let n = (bs - pos % bs).min(offset - pos);
            write_range(st, &mut chain, pos, &zeros[..n as usize])?;
            pos += n;
        }
    }
    write_range(st, &mut chain, offset, buf)?;

    let bs = st.geo().block_size as u64;
    let head = chain.head_mut();
    head.size = head.size.max(end);
    head.size_blocks = ((head.size + bs - 1) / bs) as u32;
    head.touch_modified(caller.now);
    chain.commit(st)?;
    Ok(buf.len())
}

pub(crate) fn truncate(st: &mut LfsState, ino: u32, size: u64, caller: &Caller) -> LfsResult<()> {
    let mut chain = load_file(st, ino)?;
    check_access(st, chain.head(), caller, AccessMode::WRITE)?;
    if size >= chain.head().size {
        return Ok(());
    }
    let bs = st.geo().block_size as u64;
    let keep = ((size + bs - 1) / bs) as usize;
    let dropped = chain.truncate_blocks(keep);
    let head = chain.head_mut();
    head.size = size;
    head.size_blocks = keep as u32;
    head.touch_modified(caller.now);
    chain.commit(st)?;
    for ino in dropped {
        st.remove_inode(ino)?;
    }
    Ok(())
}

/// Open the parent directory of `path` for an entry edit.
fn parent_for_edit<'p>(st: &LfsState, path: &'p str, caller: &Caller) -> LfsResult<(InodeChain, &'p str)> {
    let (parent, name) = path::locate_parent(st, path, caller)?;
    let dir = InodeChain::load(st, parent)?;
    if dir.head().kind != InodeKind::Directory {
        return Err(LfsError::NotADirectory);
    }
    check_access(st, dir.head(), caller, AccessMode::WRITE | AccessMode::EXEC)?;
    Ok((dir, name))
}

pub(crate) fn create(
    st: &mut LfsState,
    path: &str,
    kind: InodeKind,
    perm: LfsPermission,
    caller: &Caller,
) -> LfsResult<u32> {
    let (mut parent, name) = parent_for_edit(st, path, caller)?;
    check_name(name)?;
    if dir::lookup(st, &parent, name)?.is_some() {
        return Err(LfsError::AlreadyExists);
    }
    let ino = st.alloc_ino()?;
    let inode = Inode::new(st.geo(), ino, kind, perm, caller);
    st.append_inode(&inode)?;
    dir::insert_entry(st, &mut parent, name, ino)?;
    let head = parent.head_mut();
    if kind == InodeKind::Directory {
        head.nlink += 1;
    }
    head.touch_modified(caller.now);
    parent.commit(st)?;
    Ok(ino)
}

pub(crate) fn link(st: &mut LfsState, src: &str, dst: &str, caller: &Caller) -> LfsResult<()> {
    let ino = path::locate(st, src, caller)?;
    let mut inode = st.get_inode(ino)?;
    if inode.kind == InodeKind::Directory {
        return Err(LfsError::IsADirectory);
    }
    let (mut parent, name) = parent_for_edit(st, dst, caller)?;
    check_name(name)?;
    if dir::lookup(st, &parent, name)?.is_some() {
        return Err(LfsError::AlreadyExists);
    }
    inode.nlink += 1;
    inode.ctime = caller.now;
    st.append_inode(&inode)?;
    dir::insert_entry(st, &mut parent, name, ino)?;
    parent.head_mut().touch_modified(caller.now);
    parent.commit(st)
}

/// Remove one link to `ino`, deleting the inode when none remain.
pub(crate) fn drop_link(st: &mut LfsState, ino: u32, caller: &Caller) -> LfsResult<()> {
    let mut inode = st.get_inode(ino)?;
    inode.nlink = inode.nlink.saturating_sub(1);
    if inode.nlink == 0 || inode.kind == InodeKind::Directory {
        return remove_chain(st, ino);
    }
    inode.ctime = caller.now;
    st.append_inode(&inode)?;
    Ok(())
}

/// Tombstone every inode of a chain. Its blocks are left for the collector.
pub(crate) fn remove_chain(st: &mut LfsState, ino: u32) -> LfsResult<()> {
    let chain = InodeChain::load(st, ino)?;
    for member in chain.inode_numbers() {
        st.remove_inode(member)?;
    }
    Ok(())
}

pub(crate) fn unlink(st: &mut LfsState, path: &str, caller: &Caller) -> LfsResult<()> {
    let (mut parent, name) = parent_for_edit(st, path, caller)?;
    let ino = dir::lookup(st, &parent, name)?.ok_or(LfsError::NotFound)?;
    if st.get_inode(ino)?.kind == InodeKind::Directory {
        return Err(LfsError::IsADirectory);
    }
    dir::remove_entry(st, &mut parent, name)?;
    parent.head_mut().touch_modified(caller.now);
    parent.commit(st)?;
    drop_link(st, ino, caller)
}

pub(crate) fn rename(st: &mut LfsState, from: &str, to: &str, flags: RenameFlags, caller: &Caller) -> LfsResult<()> {
    if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE) {
        return Err(LfsError::InvalidArgument);
    }
    let from_parts = path::components(from)?;
    let to_parts = path::components(to)?;
    if from_parts.is_empty() || to_parts.is_empty() {
        return Err(LfsError::InvalidArgument);
    }
    if from_parts == to_parts {
        return Ok(());
    }
    // Neither path may lie inside the other.
    let (short, long) = if from_parts.len() < to_parts.len() {
        (&from_parts, &to_parts)
    } else {
        (&to_parts, &from_parts)
    };
    if long[..short.len()] == short[..] {
        return Err(LfsError::InvalidArgument);
    }

    let (mut src_dir, src_name) = parent_for_edit(st, from, caller)?;
    let (dst_dir, dst_name) = parent_for_edit(st, to, caller)?;
    check_name(dst_name)?;
    let same_dir = src_dir.head().ino == dst_dir.head().ino;
    let mut dst_dir = if same_dir { None } else { Some(dst_dir) };

    let src = dir::lookup(st, &src_dir, src_name)?.ok_or(LfsError::NotFound)?;
    let dst = {
        let target = dst_dir.as_ref().unwrap_or(&src_dir);
        dir::lookup(st, target, dst_name)?
    };
    if dst == Some(src) {
        // Two names for one inode: nothing to do.
        return Ok(());
    }
    let mut src_inode = st.get_inode(src)?;
    let src_is_dir = src_inode.kind == InodeKind::Directory;

    // Link count changes of the two parents.
    let (mut src_delta, mut dst_delta) = (0i64, 0i64);
    if src_is_dir {
        src_delta -= 1;
        dst_delta += 1;
    }

    // Unlinked only once both parents are committed.
    let mut replaced = None;
    match dst {
        Some(_) if flags.contains(RenameFlags::NOREPLACE) => return Err(LfsError::AlreadyExists),
        Some(other) if flags.contains(RenameFlags::EXCHANGE) => {
            let mut other_inode = st.get_inode(other)?;
            if other_inode.kind == InodeKind::Directory {
                src_delta += 1;
                dst_delta -= 1;
            }
            {
                let target = dst_dir.as_mut().unwrap_or(&mut src_dir);
                dir::replace_entry(st, target, dst_name, src)?;
            }
            dir::replace_entry(st, &mut src_dir, src_name, other)?;
            other_inode.ctime = caller.now;
            st.append_inode(&other_inode)?;
        }
        Some(other) => {
            let other_inode = st.get_inode(other)?;
            match (src_is_dir, other_inode.kind == InodeKind::Directory) {
                (false, true) => return Err(LfsError::IsADirectory),
                (true, false) => return Err(LfsError::NotADirectory),
                (true, true) => {
                    let victim = InodeChain::load(st, other)?;
                    if !dir::is_empty(st, &victim)? {
                        return Err(LfsError::NotEmpty);
                    }
                    dst_delta -= 1;
                }
                (false, false) => {}
            }
            {
                let target = dst_dir.as_mut().unwrap_or(&mut src_dir);
                dir::replace_entry(st, target, dst_name, src)?;
            }
            dir::remove_entry(st, &mut src_dir, src_name)?;
            replaced = Some(other);
        }
        None if flags.contains(RenameFlags::EXCHANGE) => return Err(LfsError::NotFound),
        None => {
            dir::remove_entry(st, &mut src_dir, src_name)?;
            let target = dst_dir.as_mut().unwrap_or(&mut src_dir);
            dir::insert_entry(st, target, dst_name, src)?;
        }
    }

    src_inode.ctime = caller.now;
    st.append_inode(&src_inode)?;

    apply_parent(&mut src_dir, src_delta, caller);
    match dst_dir {
        Some(mut dst_dir) => {
            apply_parent(&mut dst_dir, dst_delta, caller);
            dst_dir.commit(st)?;
        }
        None => apply_parent(&mut src_dir, dst_delta, caller),
    }
    src_dir.commit(st)?;
    match replaced {
        Some(other) => drop_link(st, other, caller),
        None => Ok(()),
    }
}

fn apply_parent(dir: &mut InodeChain, delta: i64, caller: &Caller) {
    let head = dir.head_mut();
    head.nlink = (head.nlink as i64 + delta).max(0) as u32;
    head.touch_modified(caller.now);
}
