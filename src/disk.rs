//! The block device seam.
//!
//! The cache talks to storage exclusively through [`Disk`]: typed page
//! reads and writes plus the device geometry. Multi-buffer calls address
//! contiguous sectors starting at `start_sector`, which is what lets the
//! eviction path turn an allocation run into a single batched write.

#[cfg(not(target_family = "unix"))]
std::compile_error!("ropestore only supports Unix-based OSs");

use crate::error::{Error, Result};
use crate::pool::PageBuf;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::rc::Rc;

/// Device geometry.
#[derive(Debug, Clone, Copy)]
pub struct DiskInfo {
    /// Size of one sector in bytes. Pages are exactly this size.
    pub sector_size: u32,
    /// Number of sectors on the device.
    pub size_sectors: u64,
}

/// A block device presented as an array of fixed-size sectors.
pub trait Disk {
    /// The device geometry.
    fn info(&self) -> DiskInfo;
    /// Fill `bufs` from the contiguous sectors starting at `start_sector`.
    fn read(&self, start_sector: u64, bufs: &mut [PageBuf]) -> Result<()>;
    /// Write `bufs` to the contiguous sectors starting at `start_sector`.
    fn write(&self, start_sector: u64, bufs: &[PageBuf]) -> Result<()>;
}

impl<D: Disk + ?Sized> Disk for Rc<D> {
    fn info(&self) -> DiskInfo {
        (**self).info()
    }

    fn read(&self, start_sector: u64, bufs: &mut [PageBuf]) -> Result<()> {
        (**self).read(start_sector, bufs)
    }

    fn write(&self, start_sector: u64, bufs: &[PageBuf]) -> Result<()> {
        (**self).write(start_sector, bufs)
    }
}

/// A disk backed by a regular file, using positional reads and writes.
pub struct FileDisk {
    file: File,
    info: DiskInfo,
}

impl FileDisk {
    /// Create (or truncate) a file-backed disk of the given geometry.
    pub fn create(path: impl AsRef<Path>, sector_size: u32, size_sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::Write)?;
        file.set_len(u64::from(sector_size) * size_sectors)
            .map_err(Error::Write)?;
        Ok(FileDisk {
            file,
            info: DiskInfo {
                sector_size,
                size_sectors,
            },
        })
    }

    /// Open an existing file-backed disk. The sector count is derived
    /// from the file length.
    pub fn open(path: impl AsRef<Path>, sector_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Read)?;
        let len = file.metadata().map_err(Error::Read)?.len();
        Ok(FileDisk {
            file,
            info: DiskInfo {
                sector_size,
                size_sectors: len / u64::from(sector_size),
            },
        })
    }
}

impl Disk for FileDisk {
    fn info(&self) -> DiskInfo {
        self.info
    }

    fn read(&self, start_sector: u64, bufs: &mut [PageBuf]) -> Result<()> {
        let sector = u64::from(self.info.sector_size);
        for (i, buf) in bufs.iter_mut().enumerate() {
            let offset = (start_sector + i as u64) * sector;
            self.file.read_exact_at(buf, offset).map_err(Error::Read)?;
        }
        Ok(())
    }

    fn write(&self, start_sector: u64, bufs: &[PageBuf]) -> Result<()> {
        let sector = u64::from(self.info.sector_size);
        for (i, buf) in bufs.iter().enumerate() {
            let offset = (start_sector + i as u64) * sector;
            self.file.write_all_at(buf, offset).map_err(Error::Write)?;
        }
        Ok(())
    }
}

/// An in-memory disk for tests.
pub struct MemDisk {
    info: DiskInfo,
    data: RefCell<Vec<u8>>,
}

impl MemDisk {
    /// A zero-filled in-memory disk.
    pub fn new(sector_size: u32, size_sectors: u64) -> Self {
        MemDisk {
            info: DiskInfo {
                sector_size,
                size_sectors,
            },
            data: RefCell::new(vec![0u8; (u64::from(sector_size) * size_sectors) as usize]),
        }
    }

    /// Flip one byte in place, for corruption tests.
    pub fn flip_byte(&self, offset: usize) {
        self.data.borrow_mut()[offset] ^= 0xFF;
    }

    fn check_bounds(&self, start_sector: u64, count: usize) -> std::io::Result<()> {
        if start_sector + count as u64 > self.info.size_sectors {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "sector range {}..{} out of bounds ({} sectors)",
                    start_sector,
                    start_sector + count as u64,
                    self.info.size_sectors
                ),
            ));
        }
        Ok(())
    }
}

impl Disk for MemDisk {
    fn info(&self) -> DiskInfo {
        self.info
    }

    fn read(&self, start_sector: u64, bufs: &mut [PageBuf]) -> Result<()> {
        self.check_bounds(start_sector, bufs.len()).map_err(Error::Read)?;
        let sector = self.info.sector_size as usize;
        let data = self.data.borrow();
        for (i, buf) in bufs.iter_mut().enumerate() {
            let at = (start_sector as usize + i) * sector;
            buf.copy_from_slice(&data[at..at + sector]);
        }
        Ok(())
    }

    fn write(&self, start_sector: u64, bufs: &[PageBuf]) -> Result<()> {
        self.check_bounds(start_sector, bufs.len()).map_err(Error::Write)?;
        let sector = self.info.sector_size as usize;
        let mut data = self.data.borrow_mut();
        for (i, buf) in bufs.iter().enumerate() {
            let at = (start_sector as usize + i) * sector;
            data[at..at + sector].copy_from_slice(buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_round_trips_pages() {
        let disk = MemDisk::new(64, 8);
        let mut bufs = vec![PageBuf::zeroed(64), PageBuf::zeroed(64)];
        bufs[0].fill(0x11);
        bufs[1].fill(0x22);
        disk.write(3, &bufs).unwrap();

        let mut back = vec![PageBuf::zeroed(64), PageBuf::zeroed(64)];
        disk.read(3, &mut back).unwrap();
        assert!(back[0].iter().all(|&b| b == 0x11));
        assert!(back[1].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn mem_disk_rejects_out_of_bounds() {
        let disk = MemDisk::new(64, 2);
        let mut bufs = vec![PageBuf::zeroed(64)];
        assert!(matches!(disk.read(2, &mut bufs), Err(Error::Read(_))));
        assert!(matches!(disk.write(5, &bufs), Err(Error::Write(_))));
    }

    #[test]
    fn file_disk_round_trips_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let disk = FileDisk::create(&path, 128, 16).unwrap();
        let mut bufs = vec![PageBuf::zeroed(128)];
        bufs[0].fill(0x5A);
        disk.write(7, &bufs).unwrap();
        drop(disk);

        let disk = FileDisk::open(&path, 128).unwrap();
        assert_eq!(disk.info().size_sectors, 16);
        let mut back = vec![PageBuf::zeroed(128)];
        disk.read(7, &mut back).unwrap();
        assert!(back[0].iter().all(|&b| b == 0x5A));
    }
}
