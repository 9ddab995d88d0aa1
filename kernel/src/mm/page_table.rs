//! Page-table entries and per-process page directories.
//!
//! The 32-bit PTE layout is fixed by the ISA. A present entry carries the
//! frame number in bits 31:12 plus the standard flag bits. A not-present
//! entry reuses the low bits as an OS tag describing where the page went:
//!
//! ```text
//!  31                                  5  4    3   2   1   0
//! +--------------------------------------+----+---+---+---+---+
//! |                 aux                  | ZW | Z |   |   |   |   zeroed page
//! +--------------------------------------+----+---+---+---+---+
//!  31                                         3   2   1   0
//! +--------------------------------------------+---+---+---+
//! |                swap slot id                | S |   |   |   swapped page
//! +--------------------------------------------+---+---+---+
//!  31                                              2   1   0
//! +------------------------------------------------+---+---+
//! |              record id (mmap / lazy)           |PTR|   |   pointer page
//! +------------------------------------------------+---+---+
//! ```
//!
//! The pointer tag's payload indexes the directory's record table; whether
//! the record is a user-mmap or a lazy-load decides between `Mmaped` and
//! `Lazy`. An all-zero entry is no mapping at all.
//!
//! Entries are atomics: the owning process installs and clears them while
//! the eviction path flips accessed/dirty bits and re-points them from
//! another execution context, under the locking disciplines of `mm::frame`
//! and `mm::mmap`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, RwLock};

use super::lazy::LazyLoad;
use super::mmap::UserMmap;
use super::palloc::Frame;
use super::swap::SwapSlot;

bitflags! {
    /// Flag bits of a present page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Present.
        const P = 0x1;
        /// Writable.
        const W = 0x2;
        /// User-accessible.
        const U = 0x4;
        /// Accessed by the MMU since last cleared.
        const A = 0x20;
        /// Written by the MMU since last cleared.
        const D = 0x40;
    }
}

/// Address bits of a present entry.
const PTE_ADDR: u32 = 0xffff_f000;

/// Not-present tag: payload is a record id (mmap or lazy page).
const PTE_PTR: u32 = 0x2;
/// Not-present tag: payload is a swap slot id.
const PTE_S: u32 = 0x4;
/// Not-present tag: zero-fill on fault.
const PTE_Z: u32 = 0x8;
/// Zeroed page writability.
const PTE_ZW: u32 = 0x10;
/// Shift of the zeroed page's auxiliary field.
const PTE_ZAUX_SHIFT: u32 = 5;
/// Shift of the swap slot id.
const PTE_SWAPID_SHIFT: u32 = 3;
/// Shift of the record id.
const PTE_RECORD_SHIFT: u32 = 2;

/// What a page-table entry says about its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// No mapping.
    NotSet,
    /// Zero-fill on fault.
    Zeroed,
    /// Contents live in a swap slot.
    Swapped,
    /// Backed by a shared mmap, not present.
    Mmaped,
    /// Backed by a file, loads on fault and then behaves as swappable.
    Lazy,
    /// Present in a physical frame.
    PagedIn,
}

/// A user virtual page number (virtual address >> 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(pub u32);

impl VirtPage {
    /// The page containing a virtual address.
    pub fn containing(vaddr: u32) -> VirtPage {
        VirtPage(vaddr >> 12)
    }

    /// Base virtual address of the page.
    pub fn base(self) -> u32 {
        self.0 << 12
    }
}

/// Byte offset of a virtual address within its page.
pub fn page_offset(vaddr: u32) -> usize {
    (vaddr & 0xfff) as usize
}

/// Id of a record referenced from a pointer-tagged PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub(crate) u32);

/// The object a pointer-tagged PTE refers to.
pub enum PageRecord {
    /// This directory's participation in a shared mmap.
    Mmap(Arc<UserMmap>),
    /// A pending lazy load.
    Lazy(LazyLoad),
}

/// A per-process page directory.
pub struct PageDir {
    id: u64,
    ptes: RwLock<BTreeMap<u32, AtomicU32>>,
    records: Mutex<BTreeMap<u32, PageRecord>>,
    next_record: AtomicU32,
}

impl PageDir {
    pub(crate) fn new(id: u64) -> PageDir {
        PageDir {
            id,
            ptes: RwLock::new(BTreeMap::new()),
            records: Mutex::new(BTreeMap::new()),
            next_record: AtomicU32::new(1),
        }
    }

    /// Stable directory identity, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raw entry value, zero when the page was never mapped.
    pub fn raw_pte(&self, vpage: VirtPage) -> u32 {
        let map = self.ptes.read();
        map.get(&vpage.0)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn store(&self, vpage: VirtPage, raw: u32) {
        {
            let map = self.ptes.read();
            if let Some(a) = map.get(&vpage.0) {
                a.store(raw, Ordering::Release);
                return;
            }
        }
        let mut map = self.ptes.write();
        map.entry(vpage.0)
            .or_insert_with(|| AtomicU32::new(0))
            .store(raw, Ordering::Release);
    }

    /// Classifies the entry for `vpage`.
    pub fn page_type(&self, vpage: VirtPage) -> PageType {
        let raw = self.raw_pte(vpage);
        if raw & PteFlags::P.bits() != 0 {
            PageType::PagedIn
        } else if raw & PTE_PTR != 0 {
            let id = raw >> PTE_RECORD_SHIFT;
            let records = self.records.lock();
            match records.get(&id) {
                Some(PageRecord::Mmap(_)) => PageType::Mmaped,
                Some(PageRecord::Lazy(_)) => PageType::Lazy,
                None => panic!("pointer pte with no record"),
            }
        } else if raw & PTE_S != 0 {
            PageType::Swapped
        } else if raw & PTE_Z != 0 {
            PageType::Zeroed
        } else {
            PageType::NotSet
        }
    }

    /// Maps `vpage` to `frame`, user-accessible, accessed and dirty clear.
    pub fn set_page(&self, vpage: VirtPage, frame: Frame, writable: bool) {
        let mut raw = (frame.0 << 12) & PTE_ADDR;
        raw |= (PteFlags::P | PteFlags::U).bits();
        if writable {
            raw |= PteFlags::W.bits();
        }
        self.store(vpage, raw);
    }

    /// Marks `vpage` zero-fill-on-fault with an OS-defined auxiliary value.
    pub fn set_zeroed_page(&self, vpage: VirtPage, writable: bool, aux: u32) {
        assert!(aux < 1 << (32 - PTE_ZAUX_SHIFT), "zero aux overflow");
        let mut raw = PTE_Z | (aux << PTE_ZAUX_SHIFT);
        if writable {
            raw |= PTE_ZW;
        }
        self.store(vpage, raw);
    }

    /// Points `vpage` at a swap slot.
    pub fn set_swapped_page(&self, vpage: VirtPage, slot: SwapSlot) {
        self.store(vpage, (slot.0 << PTE_SWAPID_SHIFT) | PTE_S);
    }

    /// Points `vpage` at one of this directory's records.
    pub fn set_record_page(&self, vpage: VirtPage, record: RecordId) {
        self.store(vpage, (record.0 << PTE_RECORD_SHIFT) | PTE_PTR);
    }

    /// Removes any mapping for `vpage`; later accesses fault.
    pub fn clear_page(&self, vpage: VirtPage) {
        self.store(vpage, 0);
    }

    /// The frame a present entry maps, if present.
    pub fn get_frame(&self, vpage: VirtPage) -> Option<Frame> {
        let raw = self.raw_pte(vpage);
        if raw & PteFlags::P.bits() != 0 {
            Some(Frame((raw & PTE_ADDR) >> 12))
        } else {
            None
        }
    }

    /// Writability of a present entry.
    pub fn is_writable(&self, vpage: VirtPage) -> bool {
        self.raw_pte(vpage) & PteFlags::W.bits() != 0
    }

    /// Accessed bit of a present entry; false when not present.
    pub fn is_accessed(&self, vpage: VirtPage) -> bool {
        let raw = self.raw_pte(vpage);
        raw & PteFlags::P.bits() != 0 && raw & PteFlags::A.bits() != 0
    }

    /// Dirty bit of a present entry; false when not present.
    pub fn is_dirty(&self, vpage: VirtPage) -> bool {
        let raw = self.raw_pte(vpage);
        raw & PteFlags::P.bits() != 0 && raw & PteFlags::D.bits() != 0
    }

    /// Sets or clears the accessed bit. A no-op when the entry stopped
    /// being present, so a racing eviction is never corrupted.
    pub fn set_accessed(&self, vpage: VirtPage, value: bool) {
        self.update_flag(vpage, PteFlags::A, value);
    }

    /// Sets or clears the dirty bit, with the same race guard.
    pub fn set_dirty(&self, vpage: VirtPage, value: bool) {
        self.update_flag(vpage, PteFlags::D, value);
    }

    fn update_flag(&self, vpage: VirtPage, flag: PteFlags, value: bool) {
        let map = self.ptes.read();
        let Some(a) = map.get(&vpage.0) else {
            return;
        };
        let mut cur = a.load(Ordering::Acquire);
        loop {
            if cur & PteFlags::P.bits() == 0 {
                return;
            }
            let new = if value {
                cur | flag.bits()
            } else {
                cur & !flag.bits()
            };
            match a.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// The swap slot a swapped entry points at.
    pub fn swap_slot_of(&self, vpage: VirtPage) -> SwapSlot {
        let raw = self.raw_pte(vpage);
        assert!(
            raw & (PteFlags::P.bits() | PTE_PTR) == 0 && raw & PTE_S != 0,
            "pte is not a swap entry"
        );
        SwapSlot(raw >> PTE_SWAPID_SHIFT)
    }

    /// The record id a pointer entry carries.
    pub fn record_id_of(&self, vpage: VirtPage) -> RecordId {
        let raw = self.raw_pte(vpage);
        assert!(
            raw & PteFlags::P.bits() == 0 && raw & PTE_PTR != 0,
            "pte is not a pointer entry"
        );
        RecordId(raw >> PTE_RECORD_SHIFT)
    }

    /// Writability a zeroed entry will be installed with.
    pub fn zeroed_writable(&self, vpage: VirtPage) -> bool {
        let raw = self.raw_pte(vpage);
        assert!(raw & PTE_Z != 0, "pte is not a zeroed entry");
        raw & PTE_ZW != 0
    }

    /// Auxiliary value of a zeroed entry.
    pub fn zeroed_aux(&self, vpage: VirtPage) -> u32 {
        let raw = self.raw_pte(vpage);
        assert!(raw & PTE_Z != 0, "pte is not a zeroed entry");
        raw >> PTE_ZAUX_SHIFT
    }

    /// Reserves a record id for a two-phase record installation.
    pub(crate) fn reserve_record_id(&self) -> RecordId {
        RecordId(self.next_record.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn install_record(&self, id: RecordId, record: PageRecord) {
        let prev = self.records.lock().insert(id.0, record);
        assert!(prev.is_none(), "record id reused");
    }

    pub(crate) fn remove_record(&self, id: RecordId) -> PageRecord {
        self.records
            .lock()
            .remove(&id.0)
            .expect("removing a dead record")
    }

    /// This directory's user-mmap for `vpage`, present or not.
    pub(crate) fn user_mmap_at(&self, vpage: VirtPage) -> Option<Arc<UserMmap>> {
        let records = self.records.lock();
        records.values().find_map(|r| match r {
            PageRecord::Mmap(u) if u.vpage == vpage => Some(Arc::clone(u)),
            _ => None,
        })
    }

    /// True if any mmap records remain attached to this directory.
    pub(crate) fn has_mmap_records(&self) -> bool {
        self.records
            .lock()
            .values()
            .any(|r| matches!(r, PageRecord::Mmap(_)))
    }

    /// Snapshot of every page that has a (possibly cleared) entry.
    pub fn pages(&self) -> Vec<VirtPage> {
        self.ptes.read().keys().map(|&v| VirtPage(v)).collect()
    }
}
