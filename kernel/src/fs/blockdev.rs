//! Block device interface.
//!
//! The swap allocator addresses its backing store through this trait;
//! outside this crate the implementation is the disk driver, in the test
//! suite it is a [`RamDisk`].

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// A fixed-size array of sectors.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Reads one sector into `buf` (`SECTOR_SIZE` bytes).
    fn read(&self, sector: u64, buf: &mut [u8]);

    /// Writes one sector from `buf` (`SECTOR_SIZE` bytes).
    fn write(&self, sector: u64, buf: &[u8]);
}

/// A memory-backed block device.
pub struct RamDisk {
    sectors: u64,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    /// Creates a zeroed RAM disk with the given sector count.
    pub fn new(sectors: u64) -> RamDisk {
        RamDisk {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read(&self, sector: u64, buf: &mut [u8]) {
        assert!(sector < self.sectors, "sector out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        let data = self.data.lock();
        let at = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[at..at + SECTOR_SIZE]);
    }

    fn write(&self, sector: u64, buf: &[u8]) {
        assert!(sector < self.sectors, "sector out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut data = self.data.lock();
        let at = sector as usize * SECTOR_SIZE;
        data[at..at + SECTOR_SIZE].copy_from_slice(buf);
    }
}
