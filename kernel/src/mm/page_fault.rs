//! Page-fault resolution.
//!
//! The fault handler proper (trap frame decoding, CR2) lives in the
//! architecture layer; this is the VM half it calls once it has the
//! faulting address and the saved user stack pointer. Every resolvable
//! fault obtains a freshly locked frame, fills it from the right backing
//! (zeros, file, swap, or shared mmap), installs it, and unlocks the frame
//! into the evictable state.

use alloc::sync::Arc;

use super::page_table::{PageDir, PageRecord, PageType, VirtPage};
use super::Vm;

/// Base of kernel virtual memory; user addresses live below it.
pub const PHYS_BASE: u32 = 0xc000_0000;

/// Lowest address of the stack region. Zero-fill faults at or above this
/// must pass the stack heuristic; zero-fill faults below it belong to the
/// process's data segment and always load.
pub const STACK_BOTTOM: u32 = PHYS_BASE - 8 * 1024 * 1024;

/// How far below the saved stack pointer an access may fault and still be
/// treated as stack growth (a `push` writes below `esp`).
pub const STACK_SLACK: u32 = 32;

/// What the fault handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is (being) resolved; the faulting access retries.
    Resolved,
    /// The access was illegal; the process is terminated with status -1.
    Kill,
}

impl Vm {
    /// Resolves a fault at `fault_addr` in `pd`, with `esp` the user stack
    /// pointer saved at trap time.
    pub fn handle_fault(&self, pd: &Arc<PageDir>, fault_addr: u32, esp: u32) -> FaultOutcome {
        let vpage = VirtPage::containing(fault_addr);

        match pd.page_type(vpage) {
            PageType::Mmaped => {
                let user = pd
                    .user_mmap_at(vpage)
                    .expect("mmaped pte without a user mmap");
                self.mmap_load(&user);
                FaultOutcome::Resolved
            }

            PageType::Swapped => {
                let frame = self.frame_get();
                let slot = pd.swap_slot_of(vpage);
                let writable = self.swap_load(frame, slot);
                pd.set_page(vpage, frame, writable);
                self.frame_unlock_swappable(pd, vpage, frame);
                FaultOutcome::Resolved
            }

            PageType::Lazy => {
                let frame = self.frame_get();
                let record = pd.record_id_of(vpage);
                let PageRecord::Lazy(lazy) = pd.remove_record(record) else {
                    panic!("lazy pte with a non-lazy record");
                };
                self.lazy_load_into(frame, lazy);
                pd.set_page(vpage, frame, true);
                self.frame_unlock_swappable(pd, vpage, frame);
                FaultOutcome::Resolved
            }

            PageType::Zeroed => {
                // Stack heuristic: a fault in the stack region is growth
                // only within the push slack below the saved pointer;
                // zero pages below the stack region always fill.
                if fault_addr >= esp.saturating_sub(STACK_SLACK) || fault_addr < STACK_BOTTOM {
                    let frame = self.frame_get();
                    self.pool.with_page(frame, |page| page.fill(0));
                    let writable = pd.zeroed_writable(vpage);
                    pd.set_page(vpage, frame, writable);
                    self.frame_unlock_swappable(pd, vpage, frame);
                    FaultOutcome::Resolved
                } else {
                    log::debug!(
                        "fault {:#x} outside stack slack (esp {:#x}): kill",
                        fault_addr,
                        esp
                    );
                    FaultOutcome::Kill
                }
            }

            // A peer resolved the page between the fault and this call;
            // the retry will find it present.
            PageType::PagedIn => FaultOutcome::Resolved,

            PageType::NotSet => FaultOutcome::Kill,
        }
    }
}
