//! Directories are files whose data blocks are arrays of fixed-size
//! entries. A block keeps its slot layout: removing an entry only clears
//! the slot, and new entries fill the first free slot.

use alloc::{string::String, vec::Vec};

use crate::{
    chain::InodeChain,
    common::{AccessMode, Caller, LfsDirEntry, LfsError, LfsFileType, LfsResult},
    file,
    fs::LfsState,
    inode::{DirBlock, InodeKind},
    meta::check_access,
    path,
};

fn load_block(st: &LfsState, dir: &InodeChain, index: usize) -> LfsResult<DirBlock> {
    Ok(DirBlock::decode(st.geo(), &dir.read_block(st, index)?))
}

/// Block index and slot of `name`.
fn find(st: &LfsState, dir: &InodeChain, name: &str) -> LfsResult<Option<(usize, DirBlock, usize)>> {
    for index in 0..dir.block_count() {
        let block = load_block(st, dir, index)?;
        if let Some(slot) = block.find(name) {
            return Ok(Some((index, block, slot)));
        }
    }
    Ok(None)
}

pub(crate) fn lookup(st: &LfsState, dir: &InodeChain, name: &str) -> LfsResult<Option<u32>> {
    Ok(find(st, dir, name)?.and_then(|(_, block, slot)| block.slots[slot].as_ref().map(|s| s.ino)))
}

pub(crate) fn insert_entry(st: &mut LfsState, dir: &mut InodeChain, name: &str, ino: u32) -> LfsResult<()> {
    for index in 0..dir.block_count() {
        let mut block = load_block(st, dir, index)?;
        if block.insert(name, ino) {
            let raw = block.encode(st.geo());
            return dir.put_block(st, index, &raw);
        }
    }
    // Every block is full: grow the directory by one block.
    let mut block = DirBlock::empty(st.geo());
    block.insert(name, ino);
    let raw = block.encode(st.geo());
    let index = dir.block_count();
    dir.put_block(st, index, &raw)?;
    let bs = st.geo().block_size as u64;
    let head = dir.head_mut();
    head.size += bs;
    head.size_blocks += 1;
    Ok(())
}

pub(crate) fn remove_entry(st: &mut LfsState, dir: &mut InodeChain, name: &str) -> LfsResult<u32> {
    let (index, mut block, slot) = find(st, dir, name)?.ok_or(LfsError::NotFound)?;
    let ino = block.slots[slot].take().map_or(0, |s| s.ino);
    let raw = block.encode(st.geo());
    dir.put_block(st, index, &raw)?;
    Ok(ino)
}

/// Point an existing entry at another inode.
pub(crate) fn replace_entry(st: &mut LfsState, dir: &mut InodeChain, name: &str, ino: u32) -> LfsResult<()> {
    let (index, mut block, slot) = find(st, dir, name)?.ok_or(LfsError::NotFound)?;
    if let Some(entry) = block.slots[slot].as_mut() {
        entry.ino = ino;
    }
    let raw = block.encode(st.geo());
    dir.put_block(st, index, &raw)
}

pub(crate) fn list(st: &LfsState, dir: &InodeChain) -> LfsResult<Vec<(String, u32)>> {
    let mut out = Vec::new();
    for index in 0..dir.block_count() {
        let block = load_block(st, dir, index)?;
        out.extend(block.entries().map(|s| (s.name.clone(), s.ino)));
    }
    Ok(out)
}

pub(crate) fn is_empty(st: &LfsState, dir: &InodeChain) -> LfsResult<bool> {
    for index in 0..dir.block_count() {
        if load_block(st, dir, index)?.entries().next().is_some() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn load_dir(st: &LfsState, ino: u32) -> LfsResult<InodeChain> {
    let dir = InodeChain::load(st, ino)?;
    if dir.head().kind != InodeKind::Directory {
        return Err(LfsError::NotADirectory);
    }
    Ok(dir)
}

pub(crate) fn opendir(st: &mut LfsState, path: &str, caller: &Caller) -> LfsResult<u32> {
    let ino = path::locate(st, path, caller)?;
    let dir = load_dir(st, ino)?;
    check_access(st, dir.head(), caller, AccessMode::READ)?;
    Ok(ino)
}

/// Entries of a directory, `.` and `..` first.
pub(crate) fn readdir(st: &mut LfsState, path: &str, caller: &Caller) -> LfsResult<Vec<LfsDirEntry>> {
    let ino = path::locate(st, path, caller)?;
    let dir = load_dir(st, ino)?;
    check_access(st, dir.head(), caller, AccessMode::READ)?;
    let parent = path::locate_parent(st, path, caller).map_or(ino, |(parent, _)| parent);

    let mut out = Vec::new();
    for (name, ino) in [(".", ino), ("..", parent)] {
        out.push(LfsDirEntry {
            name: String::from(name),
            ino,
            kind: LfsFileType::Directory,
        });
    }
    for (name, ino) in list(st, &dir)? {
        let kind = st.get_inode(ino)?.kind.file_type();
        out.push(LfsDirEntry { name, ino, kind });
    }
    Ok(out)
}

pub(crate) fn rmdir(st: &mut LfsState, path: &str, caller: &Caller) -> LfsResult<()> {
    let (parent_ino, name) = path::locate_parent(st, path, caller)?;
    let mut parent = load_dir(st, parent_ino)?;
    check_access(st, parent.head(), caller, AccessMode::WRITE | AccessMode::EXEC)?;
    let ino = lookup(st, &parent, name)?.ok_or(LfsError::NotFound)?;
    let victim = load_dir(st, ino)?;
    if !is_empty(st, &victim)? {
        return Err(LfsError::NotEmpty);
    }
    remove_entry(st, &mut parent, name)?;
    let head = parent.head_mut();
    head.nlink = head.nlink.saturating_sub(1);
    head.touch_modified(caller.now);
    parent.commit(st)?;
    file::remove_chain(st, ino)
}
