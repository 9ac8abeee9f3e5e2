//! Types shared by every layer of the engine: errors, permissions,
//! timestamps and the attribute records handed to the dispatch layer.

use alloc::string::String;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, onlyerror::Error)]
pub enum LfsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file name too long")]
    NameTooLong,
    #[error("no space left on device")]
    NoSpace,
    #[error("path is not absolute")]
    InvalidPath,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file system corrupt: {0}")]
    Corrupt(String),
    #[error("i/o error: {0}")]
    Io(String),
}

pub type LfsResult<T> = Result<T, LfsError>;

impl LfsError {
    /// Corruption is the only error after which the engine stops serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LfsError::Corrupt(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        LfsError::Corrupt(msg.into())
    }

    #[cfg(feature = "std")]
    pub fn errno(&self) -> i32 {
        match self {
            LfsError::NotFound => libc::ENOENT,
            LfsError::PermissionDenied => libc::EACCES,
            LfsError::AlreadyExists => libc::EEXIST,
            LfsError::NotADirectory => libc::ENOTDIR,
            LfsError::IsADirectory => libc::EISDIR,
            LfsError::NotEmpty => libc::ENOTEMPTY,
            LfsError::NameTooLong => libc::ENAMETOOLONG,
            LfsError::NoSpace => libc::ENOSPC,
            LfsError::InvalidPath | LfsError::InvalidArgument => libc::EINVAL,
            LfsError::Corrupt(_) | LfsError::Io(_) => libc::EIO,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LfsTimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl LfsTimeSpec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }
}

bitflags! {
    pub struct LfsPermission: u32 {
        const S_ISUID = 0o4000;
        const S_ISGID = 0o2000;
        const S_ISVTX = 0o1000;
        const S_IRUSR = 0o400;
        const S_IWUSR = 0o200;
        const S_IXUSR = 0o100;
        const S_IRGRP = 0o040;
        const S_IWGRP = 0o020;
        const S_IXGRP = 0o010;
        const S_IROTH = 0o004;
        const S_IWOTH = 0o002;
        const S_IXOTH = 0o001;
    }
}

bitflags! {
    /// Requested access for `access` and the internal permission checks.
    pub struct AccessMode: u32 {
        const READ = 0o4;
        const WRITE = 0o2;
        const EXEC = 0o1;
    }
}

bitflags! {
    pub struct RenameFlags: u32 {
        const NOREPLACE = 1;
        const EXCHANGE = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LfsFileType {
    RegularFile,
    Directory,
}

/// Identity and clock of the caller of one file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub now: LfsTimeSpec,
}

impl Caller {
    pub const fn new(uid: u32, gid: u32, now: LfsTimeSpec) -> Self {
        Self { uid, gid, now }
    }

    pub const fn root(now: LfsTimeSpec) -> Self {
        Self::new(0, 0, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfsAttr {
    pub ino: u32,
    pub kind: LfsFileType,
    /// Size in bytes
    pub size: u64,
    /// Size in blocks, rounded up
    pub blocks: u64,
    pub nlink: u32,
    pub perm: LfsPermission,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: LfsTimeSpec,
    pub mtime: LfsTimeSpec,
    pub ctime: LfsTimeSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfsDirEntry {
    pub name: String,
    pub ino: u32,
    pub kind: LfsFileType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LfsFsStat {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}
