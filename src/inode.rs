//! Inode and directory block codec.

use alloc::{format, string::String, vec, vec::Vec};

use crate::{
    common::{Caller, LfsError, LfsFileType, LfsPermission, LfsResult, LfsTimeSpec},
    layout::{
        decode_addr, encode_addr, non_negative, BlockAddr, Geometry, DIR_ENTRY_SIZE,
        INODE_FIXED_SIZE, MAX_FILENAME_LEN,
    },
    le_i32, le_i64, put_le,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
    /// A later link of a chain; carries pointers only
    Continuation,
}

impl InodeKind {
    fn tag(self) -> i32 {
        match self {
            InodeKind::File => 1,
            InodeKind::Directory => 2,
            InodeKind::Continuation => -1,
        }
    }

    fn from_tag(tag: i32) -> LfsResult<Self> {
        match tag {
            1 => Ok(InodeKind::File),
            2 => Ok(InodeKind::Directory),
            -1 => Ok(InodeKind::Continuation),
            other => Err(LfsError::corrupt(format!("inode mode tag {}", other))),
        }
    }

    pub fn file_type(self) -> LfsFileType {
        match self {
            InodeKind::Directory => LfsFileType::Directory,
            InodeKind::File | InodeKind::Continuation => LfsFileType::RegularFile,
        }
    }
}

/// One inode block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Inode number, never changes
    pub ino: u32,
    pub kind: InodeKind,
    /// Hard link count
    pub nlink: u32,
    /// File size in bytes
    pub size: u64,
    /// File size in blocks, rounded up
    pub size_blocks: u32,
    /// Preferred I/O size
    pub io_block: u32,
    pub perm: LfsPermission,
    /// User ID
    pub uid: u32,
    /// Group ID
    pub gid: u32,
    /// Device number
    pub device: u32,
    /// Last access time
    pub atime: LfsTimeSpec,
    /// Last modification time
    pub mtime: LfsTimeSpec,
    /// Last change time
    pub ctime: LfsTimeSpec,
    /// Valid direct pointers, in block order
    pub direct: Vec<BlockAddr>,
    /// Inode number of the next link in the chain
    pub next: Option<u32>,
}

impl Inode {
    pub fn new(geo: &Geometry, ino: u32, kind: InodeKind, perm: LfsPermission, caller: &Caller) -> Self {
        Self {
            ino,
            kind,
            nlink: if kind == InodeKind::Directory { 2 } else { 1 },
            size: 0,
            size_blocks: 0,
            io_block: geo.block_size,
            perm,
            uid: caller.uid,
            gid: caller.gid,
            device: 0,
            atime: caller.now,
            mtime: caller.now,
            ctime: caller.now,
            direct: Vec::new(),
            next: None,
        }
    }

    /// Continuation link owned by the chain headed by `head`.
    pub fn continuation(ino: u32, head: &Inode) -> Self {
        Self {
            ino,
            kind: InodeKind::Continuation,
            nlink: 1,
            size: 0,
            size_blocks: 0,
            direct: Vec::new(),
            next: None,
            ..head.clone()
        }
    }

    pub fn encode(&self, geo: &Geometry) -> Vec<u8> {
        let mut buf = vec![0u8; geo.block_size as usize];
        put_le!(buf, 0, self.ino as i32);
        put_le!(buf, 4, self.kind.tag());
        put_le!(buf, 8, self.nlink as i32);
        put_le!(buf, 12, self.size as i32);
        put_le!(buf, 16, self.size_blocks as i32);
        put_le!(buf, 20, self.io_block as i32);
        put_le!(buf, 24, self.perm.bits() as i32);
        put_le!(buf, 28, self.uid as i32);
        put_le!(buf, 32, self.gid as i32);
        put_le!(buf, 36, self.device as i32);
        for (i, t) in [self.atime, self.mtime, self.ctime].iter().enumerate() {
            put_le!(buf, 40 + 16 * i, t.sec);
            put_le!(buf, 48 + 16 * i, t.nsec);
        }
        put_le!(buf, 88, self.direct.len() as i32);
        let capacity = geo.direct_per_inode();
        for i in 0..capacity {
            let addr = self.direct.get(i).copied();
            put_le!(buf, 92 + 4 * i, encode_addr(addr));
        }
        let next = self.next.map_or(-1, |n| n as i32);
        put_le!(buf, INODE_FIXED_SIZE - 4 + 4 * capacity, next);
        buf
    }

    pub fn decode(geo: &Geometry, buf: &[u8]) -> LfsResult<Self> {
        let time = |i: usize| LfsTimeSpec::new(le_i64!(buf, 40 + 16 * i), le_i64!(buf, 48 + 16 * i));
        let capacity = geo.direct_per_inode();
        let count = non_negative(le_i32!(buf, 88), "direct count")? as usize;
        if count > capacity {
            return Err(LfsError::corrupt(format!("{} direct pointers", count)));
        }
        let direct = (0..count)
            .map(|i| {
                decode_addr(le_i32!(buf, 92 + 4 * i))
                    .filter(|a| geo.is_data_addr(*a))
                    .ok_or_else(|| LfsError::corrupt("direct pointer"))
            })
            .collect::<LfsResult<Vec<_>>>()?;
        let next = le_i32!(buf, INODE_FIXED_SIZE - 4 + 4 * capacity);
        Ok(Self {
            ino: non_negative(le_i32!(buf, 0), "inode number")?,
            kind: InodeKind::from_tag(le_i32!(buf, 4))?,
            nlink: non_negative(le_i32!(buf, 8), "link count")?,
            size: non_negative(le_i32!(buf, 12), "file size")? as u64,
            size_blocks: non_negative(le_i32!(buf, 16), "block count")?,
            io_block: non_negative(le_i32!(buf, 20), "io block")?,
            perm: LfsPermission::from_bits_truncate(le_i32!(buf, 24) as u32),
            uid: le_i32!(buf, 28) as u32,
            gid: le_i32!(buf, 32) as u32,
            device: le_i32!(buf, 36) as u32,
            atime: time(0),
            mtime: time(1),
            ctime: time(2),
            direct,
            next: u32::try_from(next).ok().filter(|n| *n > 0),
        })
    }

    pub fn touch_modified(&mut self, now: LfsTimeSpec) {
        self.mtime = now;
        self.ctime = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlot {
    pub name: String,
    pub ino: u32,
}

/// One directory data block: a fixed array of optional entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBlock {
    pub slots: Vec<Option<DirSlot>>,
}

impl DirBlock {
    pub fn empty(geo: &Geometry) -> Self {
        Self {
            slots: vec![None; geo.dir_entries_per_block()],
        }
    }

    pub fn decode(geo: &Geometry, buf: &[u8]) -> Self {
        let slots = buf[..geo.dir_entries_per_block() * DIR_ENTRY_SIZE]
            .chunks_exact(DIR_ENTRY_SIZE)
            .map(|raw| {
                let ino = le_i32!(raw, MAX_FILENAME_LEN);
                if ino <= 0 {
                    return None;
                }
                let name = &raw[..MAX_FILENAME_LEN];
                let len = name.iter().position(|b| *b == 0).unwrap_or(MAX_FILENAME_LEN);
                Some(DirSlot {
                    name: String::from_utf8_lossy(&name[..len]).into_owned(),
                    ino: ino as u32,
                })
            })
            .collect();
        Self { slots }
    }

    pub fn encode(&self, geo: &Geometry) -> Vec<u8> {
        let mut buf = vec![0u8; geo.block_size as usize];
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                let at = i * DIR_ENTRY_SIZE;
                let name = slot.name.as_bytes();
                buf[at..at + name.len()].copy_from_slice(name);
                put_le!(buf, at + MAX_FILENAME_LEN, slot.ino as i32);
            }
        }
        buf
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |s| s.name == name))
    }

    /// Fill the first free slot; `false` when the block is full.
    pub fn insert(&mut self, name: &str, ino: u32) -> bool {
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = Some(DirSlot {
                    name: String::from(name),
                    ino,
                });
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirSlot> {
        self.slots.iter().flatten()
    }
}

/// Names must fit the on-disk field with its terminator.
pub fn check_name(name: &str) -> LfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err(LfsError::InvalidArgument);
    }
    if name.len() >= MAX_FILENAME_LEN {
        return Err(LfsError::NameTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_block_is_exactly_one_block() {
        let geo = Geometry::default();
        let caller = Caller::root(LfsTimeSpec::new(100, 5));
        let mut inode = Inode::new(&geo, 7, InodeKind::File, LfsPermission::from_bits_truncate(0o644), &caller);
        inode.size = 4000;
        inode.size_blocks = 4;
        inode.direct = vec![10, 11, 1500, 2];
        inode.next = Some(9);
        let buf = inode.encode(&geo);
        assert_eq!(buf.len(), 1024);
        // Unused direct slots and the next pointer use -1.
        assert_eq!(le_i32!(buf, 92 + 4 * 4), -1);
        assert_eq!(le_i32!(buf, 1020), 9);
        assert_eq!(Inode::decode(&geo, &buf).unwrap(), inode);
    }

    #[test]
    fn continuation_inherits_owner() {
        let geo = Geometry::default();
        let caller = Caller::new(1000, 100, LfsTimeSpec::new(1, 0));
        let head = Inode::new(&geo, 3, InodeKind::File, LfsPermission::S_IRUSR, &caller);
        let link = Inode::continuation(4, &head);
        assert_eq!(link.kind, InodeKind::Continuation);
        assert_eq!((link.uid, link.gid), (1000, 100));
        let decoded = Inode::decode(&geo, &link.encode(&geo)).unwrap();
        assert_eq!(decoded.next, None);
    }

    #[test]
    fn bad_mode_tag_is_corrupt() {
        let geo = Geometry::default();
        let mut buf = vec![0u8; 1024];
        put_le!(buf, 0, 5i32);
        put_le!(buf, 4, 7i32);
        assert!(matches!(Inode::decode(&geo, &buf), Err(LfsError::Corrupt(_))));
    }

    #[test]
    fn dir_block_keeps_insertion_slots() {
        let geo = Geometry::default();
        let mut block = DirBlock::empty(&geo);
        assert!(block.insert("a.txt", 2));
        assert!(block.insert("b", 3));
        block.slots[0] = None;
        assert!(block.insert("c", 4));
        let decoded = DirBlock::decode(&geo, &block.encode(&geo));
        let names: Vec<_> = decoded.entries().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["c", "b"]);
        assert_eq!(decoded.find("b"), Some(1));
        for i in 0..14 {
            assert!(block.insert(&format!("f{}", i), 10 + i));
        }
        assert!(!block.insert("overflow", 99));
    }

    #[test]
    fn name_length_limit() {
        let ok: String = core::iter::repeat('x').take(59).collect();
        let long: String = core::iter::repeat('x').take(60).collect();
        assert!(check_name(&ok).is_ok());
        assert_eq!(check_name(&long), Err(LfsError::NameTooLong));
        assert_eq!(check_name(""), Err(LfsError::InvalidArgument));
    }
}
