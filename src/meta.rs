//! Attributes, permission checks and metadata updates.

use crate::{
    common::{AccessMode, Caller, LfsAttr, LfsError, LfsFsStat, LfsPermission, LfsResult, LfsTimeSpec},
    fs::LfsState,
    inode::{Inode, InodeKind},
    layout::MAX_FILENAME_LEN,
    path,
};

/// Classic owner/group/other check; root passes everything.
pub(crate) fn check_access(st: &LfsState, inode: &Inode, caller: &Caller, mode: AccessMode) -> LfsResult<()> {
    if !st.config.check_permissions || caller.uid == 0 || mode.is_empty() {
        return Ok(());
    }
    let bits = inode.perm.bits();
    let shift = if caller.uid == inode.uid {
        6
    } else if caller.gid == inode.gid {
        3
    } else {
        0
    };
    if AccessMode::from_bits_truncate((bits >> shift) & 0o7).contains(mode) {
        Ok(())
    } else {
        Err(LfsError::PermissionDenied)
    }
}

pub(crate) fn getattr(st: &LfsState, ino: u32) -> LfsResult<LfsAttr> {
    let inode = st.get_inode(ino)?;
    if inode.kind == InodeKind::Continuation {
        return Err(LfsError::corrupt("attributes asked of a continuation inode"));
    }
    Ok(LfsAttr {
        ino: inode.ino,
        kind: inode.kind.file_type(),
        size: inode.size,
        blocks: inode.size_blocks as u64,
        nlink: inode.nlink,
        perm: inode.perm,
        uid: inode.uid,
        gid: inode.gid,
        rdev: inode.device,
        blksize: inode.io_block,
        atime: inode.atime,
        mtime: inode.mtime,
        ctime: inode.ctime,
    })
}

pub(crate) fn access(st: &LfsState, path: &str, mode: AccessMode, caller: &Caller) -> LfsResult<()> {
    let ino = path::locate(st, path, caller)?;
    check_access(st, &st.get_inode(ino)?, caller, mode)
}

fn owned_inode(st: &LfsState, path: &str, caller: &Caller) -> LfsResult<Inode> {
    let inode = st.get_inode(path::locate(st, path, caller)?)?;
    if st.config.check_permissions && caller.uid != 0 && caller.uid != inode.uid {
        return Err(LfsError::PermissionDenied);
    }
    Ok(inode)
}

pub(crate) fn chmod(st: &mut LfsState, path: &str, perm: LfsPermission, caller: &Caller) -> LfsResult<()> {
    let mut inode = owned_inode(st, path, caller)?;
    inode.perm = perm;
    inode.ctime = caller.now;
    st.append_inode(&inode)?;
    Ok(())
}

pub(crate) fn chown(
    st: &mut LfsState,
    path: &str,
    uid: Option<u32>,
    gid: Option<u32>,
    caller: &Caller,
) -> LfsResult<()> {
    let mut inode = owned_inode(st, path, caller)?;
    let privileged = !st.config.check_permissions || caller.uid == 0;
    if let Some(uid) = uid {
        if uid != inode.uid && !privileged {
            return Err(LfsError::PermissionDenied);
        }
        inode.uid = uid;
    }
    if let Some(gid) = gid {
        if gid != inode.gid && !privileged && gid != caller.gid {
            return Err(LfsError::PermissionDenied);
        }
        inode.gid = gid;
    }
    inode.ctime = caller.now;
    st.append_inode(&inode)?;
    Ok(())
}

pub(crate) fn utimens(
    st: &mut LfsState,
    path: &str,
    atime: Option<LfsTimeSpec>,
    mtime: Option<LfsTimeSpec>,
    caller: &Caller,
) -> LfsResult<()> {
    let mut inode = owned_inode(st, path, caller)?;
    if let Some(atime) = atime {
        inode.atime = atime;
    }
    if let Some(mtime) = mtime {
        inode.mtime = mtime;
    }
    inode.ctime = caller.now;
    st.append_inode(&inode)?;
    Ok(())
}

pub(crate) fn statfs(st: &LfsState) -> LfsFsStat {
    let geo = st.geo();
    let per_segment = geo.data_blocks() as u64;
    let free_blocks = st.log.free_segments() as u64 * per_segment + st.log.remaining_in_segment() as u64;
    LfsFsStat {
        block_size: geo.block_size,
        total_blocks: geo.segment_count as u64 * per_segment,
        free_blocks,
        total_inodes: geo.max_inodes as u64,
        free_inodes: geo.max_inodes.saturating_sub(st.count_inode + 1) as u64,
        name_max: MAX_FILENAME_LEN as u32 - 1,
    }
}
