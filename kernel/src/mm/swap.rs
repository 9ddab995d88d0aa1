//! The swap slot allocator.
//!
//! The swap device is partitioned into page-sized slots. Free slots are
//! tracked by an interval tree laid out as a bitmap: a power-of-two leaf
//! row holds one bit per slot (true = free) and each internal node is the
//! OR of its children, rooted at index 1. "Is there a free slot in this
//! subtree" is answered in O(1) and allocation descends in O(log n).
//!
//! Whether an evicted page was writable is stashed per-slot in a second,
//! in-core-only bitmap and handed back at swap-in so the loader reinstalls
//! the page with the same protection. Running out of swap panics; a
//! production kernel would kill the offender instead.

use alloc::sync::Arc;

use spin::MutexGuard;

use super::bitmap::Bitmap;
use super::frame::FrameTable;
use super::page_table::{PageDir, VirtPage};
use super::palloc::{Frame, PAGE_SIZE};
use super::Vm;
use crate::fs::blockdev::SECTOR_SIZE;

/// Sectors occupied by one page-sized slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Largest supported slot count: a 2 TB swap partition.
const MAX_SWAP_SLOTS: u64 = 1 << 29;

/// Id of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

/// Allocator state, behind the interval-tree lock.
pub(crate) struct SwapState {
    /// The interval tree: `[1, leaf_base)` internal nodes, leaves from
    /// `leaf_base`. True = a free slot exists in the subtree.
    tree: Bitmap,
    /// Per-slot writability recorded at evict time.
    writable: Bitmap,
    leaf_base: usize,
    slot_count: usize,
}

impl SwapState {
    /// Builds the allocator for a device with `sectors` sectors.
    pub(crate) fn new(sectors: u64) -> SwapState {
        let slot_count = sectors / SECTORS_PER_PAGE as u64;
        assert!(
            slot_count <= MAX_SWAP_SLOTS,
            "swap partition above the 2 TB limit"
        );
        let slot_count = slot_count as usize;

        let mut leaf_base = 1;
        while leaf_base < slot_count {
            leaf_base *= 2;
        }

        let mut tree = Bitmap::new(leaf_base * 2);
        tree.set_multiple(leaf_base, slot_count, true);
        for node in (1..leaf_base).rev() {
            let free = tree.test(node * 2) || tree.test(node * 2 + 1);
            tree.set(node, free);
        }

        log::debug!("swap up: {} slots", slot_count);
        SwapState {
            tree,
            writable: Bitmap::new(slot_count),
            leaf_base,
            slot_count,
        }
    }

    /// Number of slots on the device.
    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count
    }
}

impl Vm {
    /// Claims the first free slot, recording the page's writability.
    fn swap_alloc(&self, writable: bool) -> SwapSlot {
        let mut swap = self.swap.lock();
        assert!(swap.tree.test(1), "ran out of swap space");

        let mut node = 1;
        while node < swap.leaf_base {
            if swap.tree.test(node * 2) {
                node *= 2;
            } else {
                node = node * 2 + 1;
            }
        }

        let slot = node - swap.leaf_base;
        swap.tree.set(node, false);
        swap.writable.set(slot, writable);
        loop {
            node /= 2;
            if node == 0 {
                break;
            }
            let free = swap.tree.test(node * 2) || swap.tree.test(node * 2 + 1);
            swap.tree.set(node, free);
        }
        SwapSlot(slot as u32)
    }

    /// Frees a slot, returning the writability stashed at evict time.
    pub fn swap_free(&self, slot: SwapSlot) -> bool {
        let mut swap = self.swap.lock();
        let was_writable = swap.writable.test(slot.0 as usize);
        let mut node = swap.leaf_base + slot.0 as usize;
        swap.tree.set(node, true);
        loop {
            node /= 2;
            if node == 0 {
                break;
            }
            swap.tree.set(node, true);
        }
        was_writable
    }

    /// Evicts a swappable page: allocates a slot, writes the page out, and
    /// only then re-points the PTE at the slot, so any peer that observes
    /// the swapped entry finds the data durably on the device.
    ///
    /// `used_queue` is the held used-queue guard; it is released before the
    /// device I/O so other evictions and frame locks can proceed.
    pub(crate) fn swap_page_evict(
        &self,
        frame: Frame,
        pd: &Arc<PageDir>,
        vpage: VirtPage,
        used_queue: MutexGuard<'_, FrameTable>,
    ) {
        let writable = pd.is_writable(vpage);
        let slot = self.swap_alloc(writable);

        drop(used_queue);

        self.pool.with_page(frame, |page| {
            for i in 0..SECTORS_PER_PAGE {
                let sector = slot.0 as u64 * SECTORS_PER_PAGE as u64 + i as u64;
                self.swap_dev
                    .write(sector, &page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            }
        });

        pd.set_swapped_page(vpage, slot);
        log::trace!(
            "swap out: pd {} vpage {:#x} -> slot {}",
            pd.id(),
            vpage.base(),
            slot.0
        );
    }

    /// Loads a slot into a frame-locked page, frees the slot, and returns
    /// the writability the page should be reinstalled with.
    pub fn swap_load(&self, frame: Frame, slot: SwapSlot) -> bool {
        self.pool.with_page(frame, |page| {
            for i in 0..SECTORS_PER_PAGE {
                let sector = slot.0 as u64 * SECTORS_PER_PAGE as u64 + i as u64;
                self.swap_dev
                    .read(sector, &mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            }
        });
        log::trace!("swap in: slot {}", slot.0);
        self.swap_free(slot)
    }

    /// Number of slots currently free.
    pub fn swap_slots_free(&self) -> usize {
        let swap = self.swap.lock();
        (0..swap.slot_count)
            .filter(|&s| swap.tree.test(swap.leaf_base + s))
            .count()
    }
}
