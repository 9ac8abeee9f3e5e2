//! Backing stores for a disk image.

use alloc::{format, vec, vec::Vec};

use spin::Mutex;

use crate::common::{LfsError, LfsResult};

pub trait BlockDevice: Send + Sync {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize>;
    fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize>;
    fn size(&self) -> u64;
    /// Make previous writes durable.
    fn flush(&self) -> LfsResult<()> {
        Ok(())
    }
}

fn range(pos: u64, len: usize, size: usize) -> LfsResult<core::ops::Range<usize>> {
    let start = usize::try_from(pos).map_err(|_| LfsError::Io(format!("offset {} too large", pos)))?;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or_else(|| LfsError::Io(format!("access {}+{} out of bounds", pos, len)))?;
    Ok(start..end)
}

/// A disk image held in memory.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; size]),
        }
    }

    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(image),
        }
    }

    /// Copy of the current image contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize> {
        let data = self.data.lock();
        let r = range(pos, buf.len(), data.len())?;
        buf.copy_from_slice(&data[r]);
        Ok(buf.len())
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize> {
        let mut data = self.data.lock();
        let r = range(pos, buf.len(), data.len())?;
        data[r].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(feature = "std")]
pub use file_disk::FileDisk;

#[cfg(feature = "std")]
mod file_disk {
    use std::{fs::OpenOptions, path::Path, string::ToString};

    use log::info;
    use memmap2::MmapMut;
    use spin::Mutex;

    use super::{range, BlockDevice};
    use crate::common::{LfsError, LfsResult};

    fn io_err(e: std::io::Error) -> LfsError {
        LfsError::Io(e.to_string())
    }

    /// A disk image file mapped into memory.
    pub struct FileDisk {
        map: Mutex<MmapMut>,
    }

    impl FileDisk {
        /// Open `path`, creating it and growing it to `size` bytes as needed.
        pub fn open(path: &Path, size: u64) -> LfsResult<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(io_err)?;
            let len = file.metadata().map_err(io_err)?.len();
            if len < size {
                info!("growing image {} to {} bytes", path.display(), size);
                file.set_len(size).map_err(io_err)?;
            }
            // The mapping is private to this process for the engine's lifetime.
            let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err)?;
            Ok(Self {
                map: Mutex::new(map),
            })
        }
    }

    impl BlockDevice for FileDisk {
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> LfsResult<usize> {
            let map = self.map.lock();
            let r = range(pos, buf.len(), map.len())?;
            buf.copy_from_slice(&map[r]);
            Ok(buf.len())
        }

        fn write_at(&self, pos: u64, buf: &[u8]) -> LfsResult<usize> {
            let mut map = self.map.lock();
            let r = range(pos, buf.len(), map.len())?;
            map[r].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn size(&self) -> u64 {
            self.map.lock().len() as u64
        }

        fn flush(&self) -> LfsResult<()> {
            self.map.lock().flush().map_err(io_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_rejects_out_of_bounds() {
        let disk = MemDisk::new(16);
        disk.write_at(8, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        disk.read_at(8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(disk.write_at(14, &[0; 4]).is_err());
        assert!(disk.read_at(u64::MAX, &mut buf).is_err());
    }
}
