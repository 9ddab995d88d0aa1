//! The frame table and page replacement.
//!
//! Every frame in the user pool is in exactly one of three states: free
//! (owned by the pool), present-unlocked (owned by a page and linked into
//! the used queue, eligible for eviction), or locked (owned but removed
//! from the used queue, invisible to the replacement algorithm).
//!
//! A *frame lock* is identity-keyed: the caller presents the frame plus
//! the owner it believes the frame has, and the lock succeeds only if the
//! table entry still agrees under the used-queue lock. Eviction overwrites
//! the entry's owner, so a caller that loses the race fails
//! deterministically and learns that the page has moved to swap or to its
//! file backing; it re-consults the PTE and loads the page back in.
//!
//! The `unlocked_frames` counting semaphore tracks frames in the
//! free-or-unlocked states. Every consumer downs it first, so `frame_get`
//! suspends naturally when no evictable frame exists, and a successful
//! down means the subsequent owner re-check under the used-queue lock
//! decides the race exactly.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::mmap::SharedMmap;
use super::page_table::{PageDir, VirtPage};
use super::palloc::{Frame, PalFlags};
use super::Vm;

/// The tagged owner of a frame-table entry.
pub(crate) enum FrameOwner {
    /// Free or locked; invisible to replacement either way.
    None,
    /// Owned by one page directory; evicts to swap.
    Swappable { pd: Arc<PageDir>, vpage: VirtPage },
    /// Owned by a shared mmap; evicts by write-back to its file.
    Mmaped(Arc<SharedMmap>),
}

/// Frame-table state behind the used-queue lock.
pub(crate) struct FrameTable {
    /// Parallel to the user pool; index = frame number.
    entries: Vec<FrameOwner>,
    /// Present-unlocked frames in second-chance order, eviction candidates
    /// at the front.
    used_queue: VecDeque<u32>,
}

impl FrameTable {
    pub(crate) fn new(frames: usize) -> FrameTable {
        FrameTable {
            entries: (0..frames).map(|_| FrameOwner::None).collect(),
            used_queue: VecDeque::new(),
        }
    }
}

impl Vm {
    /// Returns a *locked* frame, evicting a victim if the pool is dry.
    ///
    /// Second chance: pop the head of the used queue; if its owner saw an
    /// access since the last sweep, clear the access bits and give it one
    /// more round at the tail, otherwise evict it through the
    /// owner-specific callback. The used-queue lock is released inside the
    /// callback before any filesystem or device I/O.
    pub fn frame_get(&self) -> Frame {
        self.unlocked_frames.down();

        if let Some(frame) = self.pool.get_page(PalFlags::empty()) {
            return frame;
        }

        let mut ft = self.frame.lock();
        loop {
            let idx = ft
                .used_queue
                .pop_front()
                .expect("unlocked_frames permit with empty pool and used queue");
            let frame = Frame(idx);

            let accessed = match &ft.entries[idx as usize] {
                FrameOwner::Swappable { pd, vpage } => pd.is_accessed(*vpage),
                FrameOwner::Mmaped(sm) => self.mmap_frame_was_accessed(sm),
                FrameOwner::None => unreachable!("free frame on the used queue"),
            };
            if accessed {
                match &ft.entries[idx as usize] {
                    FrameOwner::Swappable { pd, vpage } => pd.set_accessed(*vpage, false),
                    FrameOwner::Mmaped(sm) => self.mmap_frame_reset_accessed(sm),
                    FrameOwner::None => unreachable!(),
                }
                ft.used_queue.push_back(idx);
                continue;
            }

            // Victim found: clearing the owner is what marks the frame
            // locked and makes concurrent frame-lock attempts fail.
            let owner = core::mem::replace(&mut ft.entries[idx as usize], FrameOwner::None);
            match owner {
                FrameOwner::Swappable { pd, vpage } => {
                    log::trace!("evict frame {} (swappable)", idx);
                    self.swap_page_evict(frame, &pd, vpage, ft);
                }
                FrameOwner::Mmaped(sm) => {
                    log::trace!("evict frame {} (mmaped)", idx);
                    self.mmap_frame_evict(frame, &sm, ft);
                }
                FrameOwner::None => unreachable!(),
            }
            return frame;
        }
    }

    /// Locks a frame the caller believes holds its mmaped page. Returns
    /// false if the frame no longer belongs to `shared`, which means the
    /// page was evicted and the PTE now points back at the user-mmap.
    pub fn frame_lock_mmaped(&self, shared: &Arc<SharedMmap>, frame: Frame) -> bool {
        // The down cannot be skipped: it pairs the lock attempt with any
        // in-flight eviction so that, once the used-queue lock is taken,
        // the owner comparison decides the race exactly.
        self.unlocked_frames.down();
        let mut ft = self.frame.lock();

        let owned = matches!(
            &ft.entries[frame.0 as usize],
            FrameOwner::Mmaped(sm) if Arc::ptr_eq(sm, shared)
        );
        if !owned {
            drop(ft);
            self.unlocked_frames.up();
            return false;
        }

        Self::unlink_used(&mut ft, frame);
        ft.entries[frame.0 as usize] = FrameOwner::None;
        true
    }

    /// Locks a frame the caller believes holds `(pd, vpage)`. Returns
    /// false if the page was evicted; the PTE then carries its swap slot.
    pub fn frame_lock_swappable(
        &self,
        pd: &Arc<PageDir>,
        vpage: VirtPage,
        frame: Frame,
    ) -> bool {
        self.unlocked_frames.down();
        let mut ft = self.frame.lock();

        let owned = matches!(
            &ft.entries[frame.0 as usize],
            FrameOwner::Swappable { pd: p, vpage: v } if Arc::ptr_eq(p, pd) && *v == vpage
        );
        if !owned {
            drop(ft);
            self.unlocked_frames.up();
            return false;
        }

        Self::unlink_used(&mut ft, frame);
        ft.entries[frame.0 as usize] = FrameOwner::None;
        true
    }

    /// Unlocks a frame as mmap-owned, making it evictable again.
    ///
    /// Re-inserted at the *front* of the used queue: the frame gets one
    /// full sweep of the clock before it can be re-evicted.
    pub fn frame_unlock_mmaped(&self, shared: &Arc<SharedMmap>, frame: Frame) {
        let mut ft = self.frame.lock();
        ft.entries[frame.0 as usize] = FrameOwner::Mmaped(Arc::clone(shared));
        ft.used_queue.push_front(frame.0);
        drop(ft);
        self.unlocked_frames.up();
    }

    /// Unlocks a frame as swappable-owned.
    pub fn frame_unlock_swappable(&self, pd: &Arc<PageDir>, vpage: VirtPage, frame: Frame) {
        let mut ft = self.frame.lock();
        ft.entries[frame.0 as usize] = FrameOwner::Swappable {
            pd: Arc::clone(pd),
            vpage,
        };
        ft.used_queue.push_front(frame.0);
        drop(ft);
        self.unlocked_frames.up();
    }

    /// Releases a locked frame back to the pool. The caller must have just
    /// locked it (or received it locked from [`Vm::frame_get`]).
    pub fn frame_free(&self, frame: Frame) {
        {
            let ft = self.frame.lock();
            assert!(
                matches!(ft.entries[frame.0 as usize], FrameOwner::None),
                "freeing an owned frame"
            );
        }
        self.pool.free_page(frame);
        self.unlocked_frames.up();
    }

    fn unlink_used(ft: &mut FrameTable, frame: Frame) {
        let at = ft
            .used_queue
            .iter()
            .position(|&i| i == frame.0)
            .expect("owned frame missing from used queue");
        ft.used_queue.remove(at);
    }
}
