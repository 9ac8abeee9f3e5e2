//! Path resolution from the root directory.

use smallvec::SmallVec;

use crate::{
    chain::InodeChain,
    common::{AccessMode, Caller, LfsError, LfsResult},
    dir,
    fs::LfsState,
    inode::InodeKind,
    meta::check_access,
};

pub(crate) type Components<'a> = SmallVec<[&'a str; 8]>;

/// Split an absolute path, folding `.` and `..` lexically.
pub(crate) fn components(path: &str) -> LfsResult<Components<'_>> {
    if !path.starts_with('/') {
        return Err(LfsError::InvalidPath);
    }
    let mut parts = Components::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    Ok(parts)
}

fn walk(st: &LfsState, parts: &[&str], caller: &Caller) -> LfsResult<u32> {
    let mut ino = st.root_ino;
    for name in parts {
        let chain = InodeChain::load(st, ino)?;
        if chain.head().kind != InodeKind::Directory {
            return Err(LfsError::NotADirectory);
        }
        check_access(st, chain.head(), caller, AccessMode::EXEC)?;
        ino = dir::lookup(st, &chain, name)?.ok_or(LfsError::NotFound)?;
    }
    Ok(ino)
}

pub(crate) fn locate(st: &LfsState, path: &str, caller: &Caller) -> LfsResult<u32> {
    walk(st, &components(path)?, caller)
}

/// Resolve everything but the last component. The root has no parent.
pub(crate) fn locate_parent<'p>(st: &LfsState, path: &'p str, caller: &Caller) -> LfsResult<(u32, &'p str)> {
    let parts = components(path)?;
    let (name, dirs) = parts.split_last().ok_or(LfsError::InvalidArgument)?;
    Ok((walk(st, dirs, caller)?, *name))
}
