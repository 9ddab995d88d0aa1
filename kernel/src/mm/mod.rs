//! The VM core.
//!
//! Frame table with second-chance replacement and frame locking, swap slot
//! allocation, shared mmaps, lazy loads and fault resolution, all hanging
//! off one explicit [`Vm`] handle so independent instances can coexist
//! (and be tested) without process-global state.
//!
//! Shared-resource protocol: the used-queue lock guards the frame table
//! and is never held across I/O; the `unlocked_frames` semaphore counts
//! free-or-unlocked frames and is the only primitive that blocks when no
//! frame is evictable; swap bitmaps sit behind the interval-tree lock; the
//! mmap registry map behind the registry lock with a per-entry lock for
//! peer lists and dirty carry; filesystem calls take the volume's own
//! global lock and are only made after the used-queue lock is released.

pub mod bitmap;
mod frame;
pub mod lazy;
pub mod mmap;
pub mod page_fault;
pub mod page_table;
pub mod palloc;
pub mod swap;

pub use mmap::{MmapKey, SharedMmap, UserMmap};
pub use page_fault::{FaultOutcome, PHYS_BASE, STACK_BOTTOM, STACK_SLACK};
pub use page_table::{PageDir, PageType, PteFlags, RecordId, VirtPage};
pub use palloc::{Frame, PalFlags, UserPool, PAGE_SIZE};
pub use swap::{SwapSlot, SECTORS_PER_PAGE};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::error::KernelError;
use crate::fs::blockdev::BlockDevice;
use crate::sync::Semaphore;
use frame::FrameTable;
use page_table::page_offset;
use swap::SwapState;

/// VM construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub user_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { user_frames: 64 }
    }
}

/// The VM subsystem handle.
pub struct Vm {
    pub(crate) pool: UserPool,
    /// The used-queue lock and everything it protects.
    pub(crate) frame: Mutex<FrameTable>,
    /// Counts frames in the free-or-unlocked states.
    pub(crate) unlocked_frames: Semaphore,
    /// The interval-tree lock and the swap bitmaps.
    pub(crate) swap: Mutex<SwapState>,
    pub(crate) swap_dev: Arc<dyn BlockDevice>,
    /// The registry lock and the shared-mmap map.
    pub(crate) mmaps: Mutex<BTreeMap<MmapKey, Arc<SharedMmap>>>,
    next_pd: AtomicU64,
}

impl Vm {
    /// Brings up the VM core over a user pool and a swap device.
    pub fn new(config: VmConfig, swap_dev: Arc<dyn BlockDevice>) -> Vm {
        let pool = UserPool::new(config.user_frames);
        let swap = SwapState::new(swap_dev.sector_count());
        log::debug!(
            "vm up: {} user frames, {} swap slots",
            config.user_frames,
            swap.slot_count()
        );
        Vm {
            frame: Mutex::new(FrameTable::new(config.user_frames)),
            unlocked_frames: Semaphore::new(config.user_frames),
            pool,
            swap: Mutex::new(swap),
            swap_dev,
            mmaps: Mutex::new(BTreeMap::new()),
            next_pd: AtomicU64::new(1),
        }
    }

    /// Number of frames in the user pool.
    pub fn user_pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Number of user frames currently free.
    pub fn user_frames_free(&self) -> usize {
        self.pool.free_count()
    }

    /// Creates an empty address space.
    pub fn create_page_dir(&self) -> Arc<PageDir> {
        let id = self.next_pd.fetch_add(1, Ordering::Relaxed);
        Arc::new(PageDir::new(id))
    }

    /// Destroys an address space: frees every resident frame, swap slot
    /// and lazy record it still references. All mmaps must have been
    /// unregistered first.
    pub fn pagedir_destroy(&self, pd: &Arc<PageDir>) {
        assert!(
            !pd.has_mmap_records(),
            "address space destroyed with live mmaps"
        );
        for vpage in pd.pages() {
            loop {
                match pd.page_type(vpage) {
                    PageType::PagedIn => {
                        let Some(frame) = pd.get_frame(vpage) else {
                            continue;
                        };
                        if self.frame_lock_swappable(pd, vpage, frame) {
                            pd.clear_page(vpage);
                            self.frame_free(frame);
                            break;
                        }
                        // Lost to a concurrent eviction: once the swap
                        // write completes the entry reads as swapped and
                        // the slot is freed below.
                        continue;
                    }
                    PageType::Swapped => {
                        self.swap_free(pd.swap_slot_of(vpage));
                        pd.clear_page(vpage);
                        break;
                    }
                    PageType::Lazy => {
                        let record = pd.record_id_of(vpage);
                        drop(pd.remove_record(record));
                        pd.clear_page(vpage);
                        break;
                    }
                    PageType::Mmaped => unreachable!("checked above"),
                    PageType::Zeroed | PageType::NotSet => break,
                }
            }
        }
        log::debug!("pagedir {} destroyed", pd.id());
    }

    /// Simulated user read: resolves faults, takes the frame lock, copies
    /// out of the page and marks it accessed. `esp` is the saved user
    /// stack pointer used by the stack-growth heuristic.
    pub fn user_read(
        &self,
        pd: &Arc<PageDir>,
        esp: u32,
        vaddr: u32,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        self.user_access(pd, esp, vaddr, buf.len(), false, |page, at| {
            buf.copy_from_slice(&page[at..at + buf.len()]);
        })
    }

    /// Simulated user write: like [`Vm::user_read`] but requires
    /// writability and marks the page dirty.
    pub fn user_write(
        &self,
        pd: &Arc<PageDir>,
        esp: u32,
        vaddr: u32,
        bytes: &[u8],
    ) -> Result<(), KernelError> {
        self.user_access(pd, esp, vaddr, bytes.len(), true, |page, at| {
            page[at..at + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// The access loop shared by reads and writes: consult the PTE, fault
    /// the page in if needed, take the matching frame lock, and retry
    /// whenever the lock is lost to eviction. Lost locks are the expected
    /// failure mode of the protocol, not errors.
    fn user_access(
        &self,
        pd: &Arc<PageDir>,
        esp: u32,
        vaddr: u32,
        len: usize,
        write: bool,
        mut body: impl FnMut(&mut [u8], usize),
    ) -> Result<(), KernelError> {
        let vpage = VirtPage::containing(vaddr);
        let at = page_offset(vaddr);
        assert!(at + len <= PAGE_SIZE, "user access crosses a page boundary");

        loop {
            // Mmap-backed pages are locked by shared-entry identity.
            if let Some(user) = pd.user_mmap_at(vpage) {
                let shared = Arc::clone(user.shared());
                if write && !shared.is_writable() {
                    return Err(KernelError::UserFault { addr: vaddr });
                }
                match pd.get_frame(vpage) {
                    Some(frame) => {
                        if self.frame_lock_mmaped(&shared, frame) {
                            self.pool.with_page(frame, |page| body(page, at));
                            pd.set_accessed(vpage, true);
                            if write {
                                pd.set_dirty(vpage, true);
                            }
                            self.frame_unlock_mmaped(&shared, frame);
                            return Ok(());
                        }
                        // Evicted under us; the PTE points back at the
                        // record now. Go around.
                    }
                    None => self.mmap_load(&user),
                }
                continue;
            }

            match pd.page_type(vpage) {
                PageType::PagedIn => {
                    if write && !pd.is_writable(vpage) {
                        return Err(KernelError::UserFault { addr: vaddr });
                    }
                    let Some(frame) = pd.get_frame(vpage) else {
                        continue;
                    };
                    if self.frame_lock_swappable(pd, vpage, frame) {
                        self.pool.with_page(frame, |page| body(page, at));
                        pd.set_accessed(vpage, true);
                        if write {
                            pd.set_dirty(vpage, true);
                        }
                        self.frame_unlock_swappable(pd, vpage, frame);
                        return Ok(());
                    }
                    // Mid-eviction; once the PTE reads as swapped the
                    // fault path below brings it back.
                }
                _ => match self.handle_fault(pd, vaddr, esp) {
                    FaultOutcome::Resolved => {}
                    FaultOutcome::Kill => return Err(KernelError::UserFault { addr: vaddr }),
                },
            }
        }
    }
}
