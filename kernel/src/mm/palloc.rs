//! The user page pool.
//!
//! A fixed, contiguous array of page frames with a free bitmap. Frames are
//! identified by index ([`Frame`]); the frame table at `mm::frame` is a
//! parallel array over the same indices. Page contents are only reachable
//! through [`UserPool::with_page`], which serializes raw access per frame;
//! logical exclusion between owners is the frame-lock protocol's job.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use super::bitmap::Bitmap;

/// Bytes per page frame.
pub const PAGE_SIZE: usize = 4096;

/// Index of a physical frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(pub u32);

bitflags! {
    /// Page allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PalFlags: u32 {
        /// Zero the page before returning it.
        const ZERO = 1 << 0;
    }
}

struct PoolFree {
    /// 1 = free.
    map: Bitmap,
    free_count: usize,
}

/// The pool of user frames.
pub struct UserPool {
    pages: Vec<Mutex<Vec<u8>>>,
    free: Mutex<PoolFree>,
}

impl UserPool {
    /// Creates a pool of `page_count` zeroed frames, all free.
    pub fn new(page_count: usize) -> UserPool {
        let mut map = Bitmap::new(page_count);
        map.set_multiple(0, page_count, true);
        UserPool {
            pages: (0..page_count)
                .map(|_| Mutex::new(vec![0u8; PAGE_SIZE]))
                .collect(),
            free: Mutex::new(PoolFree {
                map,
                free_count: page_count,
            }),
        }
    }

    /// Number of frames in the pool.
    pub fn size(&self) -> usize {
        self.pages.len()
    }

    /// Number of currently free frames.
    pub fn free_count(&self) -> usize {
        self.free.lock().free_count
    }

    /// Allocates a frame, or `None` when the pool is exhausted (the caller
    /// then evicts).
    pub fn get_page(&self, flags: PalFlags) -> Option<Frame> {
        let frame = {
            let mut free = self.free.lock();
            let idx = free.map.find_first(true)?;
            free.map.set(idx, false);
            free.free_count -= 1;
            Frame(idx as u32)
        };
        if flags.contains(PalFlags::ZERO) {
            self.with_page(frame, |page| page.fill(0));
        }
        Some(frame)
    }

    /// Returns a frame to the pool.
    pub fn free_page(&self, frame: Frame) {
        let mut free = self.free.lock();
        assert!(
            !free.map.test(frame.0 as usize),
            "double free of user frame"
        );
        free.map.set(frame.0 as usize, true);
        free.free_count += 1;
    }

    /// Runs `body` with exclusive access to the frame's bytes.
    pub fn with_page<R>(&self, frame: Frame, body: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut page = self.pages[frame.0 as usize].lock();
        body(&mut page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let pool = UserPool::new(2);
        let a = pool.get_page(PalFlags::empty()).unwrap();
        let b = pool.get_page(PalFlags::empty()).unwrap();
        assert_ne!(a, b);
        assert!(pool.get_page(PalFlags::empty()).is_none());
        pool.free_page(a);
        assert_eq!(pool.get_page(PalFlags::ZERO), Some(a));
    }

    #[test]
    fn zero_flag_clears_stale_bytes() {
        let pool = UserPool::new(1);
        let f = pool.get_page(PalFlags::empty()).unwrap();
        pool.with_page(f, |p| p.fill(0xaa));
        pool.free_page(f);
        let f = pool.get_page(PalFlags::ZERO).unwrap();
        pool.with_page(f, |p| assert!(p.iter().all(|&b| b == 0)));
    }
}
