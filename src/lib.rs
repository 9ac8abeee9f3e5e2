#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

mod blockio;
mod cache;
mod chain;
mod common;
mod config;
mod device;
mod dir;
mod file;
mod fs;
mod gc;
mod inode;
mod layout;
mod meta;
mod path;
mod segment;

#[cfg(test)]
mod lfs_test;

pub use cache::WriteBackCache;
pub use common::{
    AccessMode, Caller, LfsAttr, LfsDirEntry, LfsError, LfsFileType, LfsFsStat, LfsPermission,
    LfsResult, LfsTimeSpec, RenameFlags,
};
pub use config::{AtimePolicy, LfsConfig};
#[cfg(feature = "std")]
pub use device::FileDisk;
pub use device::{BlockDevice, MemDisk};
pub use fs::{Lfs, LfsStats};
pub use gc::{GcMode, GcReport};
pub use layout::{BlockAddr, Geometry, MAX_FILENAME_LEN, ROOT_INO};

/// Read a little-endian `i32` at a byte offset.
#[macro_export]
macro_rules! le_i32 {
    ($buf:expr, $off:expr) => {{
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&$buf[$off..$off + 4]);
        i32::from_le_bytes(raw)
    }};
}

/// Read a little-endian `i64` at a byte offset.
#[macro_export]
macro_rules! le_i64 {
    ($buf:expr, $off:expr) => {{
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&$buf[$off..$off + 8]);
        i64::from_le_bytes(raw)
    }};
}

/// Store any integer little-endian at a byte offset.
#[macro_export]
macro_rules! put_le {
    ($buf:expr, $off:expr, $val:expr) => {{
        let raw = $val.to_le_bytes();
        $buf[$off..$off + raw.len()].copy_from_slice(&raw);
    }};
}
