//! The shared mmap registry.
//!
//! File-backed pages are shared across address spaces on a per-page basis:
//! every mapping request is keyed by `(inode, offset, length, writability)`
//! and requests with equal keys share one [`SharedMmap`] and therefore one
//! frame. Each participating page-table entry is represented by a
//! [`UserMmap`] on the shared entry's peer list.
//!
//! Coherence invariant: at any instant either every peer PTE is present,
//! pointing at the same frame with the shared writability, or every peer
//! PTE is a pointer tag back at its own user-mmap record. Loads and
//! evictions update all peers under the shared entry's lock.
//!
//! Lock order is registry -> shared entry, and the used-queue lock is only
//! ever taken *before* a shared entry's lock (by the replacement sweep) and
//! released before write-back I/O. The sole-user unregister path drops the
//! shared lock before its frame-lock attempt for the same reason.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard, Once};

use super::frame::FrameTable;
use super::page_table::{PageDir, PageRecord, PageType, RecordId, VirtPage};
use super::palloc::{Frame, PAGE_SIZE};
use super::Vm;
use crate::error::KernelError;
use crate::fs::{File, InodeId};

/// Registry key: mappings share a frame iff all four fields match.
///
/// Field order mirrors the comparison order of the registry's lookups:
/// length, then offset, then writability, then inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MmapKey {
    pub length: u16,
    pub offset: u64,
    pub writable: bool,
    pub inode: InodeId,
}

/// Mutable half of a shared mmap, behind its lock.
pub(crate) struct SharedInner {
    /// Reopened handle; writes denied for read-only shares.
    pub(crate) file: File,
    /// Carry flag preserving the dirtiness of peers that unmapped while
    /// the page was resident.
    pub(crate) dirty: bool,
    /// One entry per page-table entry pointing into this share.
    pub(crate) users: Vec<Arc<UserMmap>>,
}

/// One file-backed shared page.
pub struct SharedMmap {
    inode: InodeId,
    offset: u64,
    length: u16,
    writable: bool,
    pub(crate) inner: Mutex<SharedInner>,
}

impl SharedMmap {
    /// Whether writes through this share are allowed.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn key(&self) -> MmapKey {
        MmapKey {
            length: self.length,
            offset: self.offset,
            writable: self.writable,
            inode: self.inode,
        }
    }
}

/// One address space's participation in a shared mmap.
pub struct UserMmap {
    pub(crate) pd: Arc<PageDir>,
    pub(crate) vpage: VirtPage,
    pub(crate) record: RecordId,
    shared: Once<Arc<SharedMmap>>,
}

impl UserMmap {
    /// The shared entry this user belongs to.
    pub fn shared(&self) -> &Arc<SharedMmap> {
        self.shared.get().expect("user mmap not attached")
    }

    /// The mapped virtual page.
    pub fn vpage(&self) -> VirtPage {
        self.vpage
    }
}

impl Vm {
    /// Registers a mapping of `length` bytes of `file` at `offset` into
    /// `pd[vpage]`, sharing an existing entry when the key matches.
    ///
    /// The new user-mmap is appended to `mmap_list`, the owning process's
    /// bookkeeping of its open mappings.
    pub fn mmap_register(
        &self,
        file: &File,
        offset: u64,
        length: u16,
        writable: bool,
        pd: &Arc<PageDir>,
        vpage: VirtPage,
        mmap_list: &mut Vec<Arc<UserMmap>>,
    ) -> Result<(), KernelError> {
        assert!(length as usize <= PAGE_SIZE, "mmap length above one page");

        let record = pd.reserve_record_id();
        let user = Arc::new(UserMmap {
            pd: Arc::clone(pd),
            vpage,
            record,
            shared: Once::new(),
        });
        pd.install_record(record, PageRecord::Mmap(Arc::clone(&user)));

        let key = MmapKey {
            length,
            offset,
            writable,
            inode: file.inode_id(),
        };

        let mut registry = self.mmaps.lock();
        if let Some(shared) = registry.get(&key) {
            let shared = Arc::clone(shared);
            // Take the entry's lock while still holding the registry lock
            // so the entry cannot be torn down between lookup and attach.
            let mut inner = shared.inner.lock();
            drop(registry);

            assert!(!inner.users.is_empty(), "shared mmap with no users");
            let peer = Arc::clone(&inner.users[0]);

            // Either copy the peer's live mapping or install a pointer
            // entry; both sides of the coherence invariant are reachable
            // here and the shared lock makes the choice atomic.
            if let Some(frame) = peer.pd.get_frame(peer.vpage) {
                pd.set_page(vpage, frame, peer.pd.is_writable(peer.vpage));
            } else {
                pd.set_record_page(vpage, record);
            }
            inner.users.push(Arc::clone(&user));
            drop(inner);
            user.shared.call_once(|| shared);
        } else {
            let mut handle = file.reopen();
            if !writable {
                // Read-only shares also freeze the file: the mapped bytes
                // must not change underneath the sharers.
                handle.deny_write();
            }
            let shared = Arc::new(SharedMmap {
                inode: key.inode,
                offset,
                length,
                writable,
                inner: Mutex::new(SharedInner {
                    file: handle,
                    dirty: false,
                    users: alloc::vec![Arc::clone(&user)],
                }),
            });
            pd.set_record_page(vpage, record);
            registry.insert(key, Arc::clone(&shared));
            drop(registry);
            user.shared.call_once(|| shared);
            log::trace!(
                "mmap: new share inode {} offset {} len {}",
                key.inode.0,
                offset,
                length
            );
        }

        mmap_list.push(user);
        Ok(())
    }

    /// Loads a shared page on fault and installs the frame into *every*
    /// peer's PTE. If a peer raced ahead and the PTE is no longer a
    /// pointer entry, the freshly taken frame is returned and the caller's
    /// retry re-consults the PTE.
    pub fn mmap_load(&self, user: &Arc<UserMmap>) {
        let frame = self.frame_get();
        let shared = Arc::clone(user.shared());
        let mut inner = shared.inner.lock();

        if user.pd.page_type(user.vpage) != PageType::Mmaped {
            drop(inner);
            self.frame_free(frame);
            return;
        }

        // The frame is locked and we hold the shared entry's lock, so the
        // read cannot race with eviction or a peer's load.
        let length = shared.length as usize;
        self.pool.with_page(frame, |page| {
            let n = inner.file.read_at(&mut page[..length], shared.offset);
            page[n..].fill(0);
        });

        for peer in &inner.users {
            peer.pd.set_page(peer.vpage, frame, shared.writable);
        }

        drop(inner);
        self.frame_unlock_mmaped(&shared, frame);
    }

    /// Eviction callback for an mmap-owned frame. Runs with the frame
    /// already locked and the used-queue guard held; the guard is released
    /// once every peer PTE points back at its user-mmap record, before the
    /// write-back touches the filesystem.
    pub(crate) fn mmap_frame_evict(
        &self,
        frame: Frame,
        shared: &Arc<SharedMmap>,
        used_queue: MutexGuard<'_, FrameTable>,
    ) {
        let mut inner = shared.inner.lock();

        // Sample dirtiness now: re-pointing the PTEs below overwrites the
        // hardware dirty bits.
        let pte_dirty = inner.users.iter().any(|u| u.pd.is_dirty(u.vpage));

        for peer in &inner.users {
            peer.pd.set_record_page(peer.vpage, peer.record);
        }

        drop(used_queue);

        self.write_back(shared, &mut inner, frame, pte_dirty);
    }

    /// Removes one user from its shared mmap.
    ///
    /// The last user tears the shared entry down: it is unhooked from the
    /// registry, then the frame is locked and written back if it is still
    /// resident; a failed frame lock means eviction already wrote it back.
    /// A non-final user ORs its PTE dirty bit into the carry flag so the
    /// write-back still happens after it is gone.
    pub fn mmap_unregister(&self, user: &Arc<UserMmap>, mmap_list: &mut Vec<Arc<UserMmap>>) {
        let shared = Arc::clone(user.shared());

        let mut registry = self.mmaps.lock();
        let mut inner = shared.inner.lock();

        if inner.users.len() == 1 {
            assert!(Arc::ptr_eq(&inner.users[0], user), "foreign user mmap");
            // The peer list stays intact until after the frame-lock
            // attempt: an eviction that wins the race below must still see
            // this user's PTE to re-point it and observe its dirty bit.
            drop(inner);

            registry.remove(&shared.key()).expect("share not registered");
            drop(registry);

            if let Some(frame) = user.pd.get_frame(user.vpage) {
                if self.frame_lock_mmaped(&shared, frame) {
                    let mut inner = shared.inner.lock();
                    let pte_dirty = user.pd.is_dirty(user.vpage);
                    self.write_back(&shared, &mut inner, frame, pte_dirty);
                    drop(inner);
                    self.frame_free(frame);
                }
                // Lock failure: eviction won the race and has already
                // written the page back; nothing left to flush.
            }
            shared.inner.lock().users.clear();
            log::trace!("mmap: share inode {} torn down", shared.inode.0);
        } else {
            drop(registry);

            let at = inner
                .users
                .iter()
                .position(|u| Arc::ptr_eq(u, user))
                .expect("foreign user mmap");
            inner.users.remove(at);

            if user.pd.page_type(user.vpage) == PageType::PagedIn {
                let d = user.pd.is_dirty(user.vpage);
                inner.dirty |= d;
            }
            drop(inner);
        }

        user.pd.clear_page(user.vpage);
        drop(user.pd.remove_record(user.record));
        mmap_list.retain(|u| !Arc::ptr_eq(u, user));
    }

    /// OR of the accessed bits across all peer PTEs.
    pub(crate) fn mmap_frame_was_accessed(&self, shared: &Arc<SharedMmap>) -> bool {
        let inner = shared.inner.lock();
        inner.users.iter().any(|u| u.pd.is_accessed(u.vpage))
    }

    /// Clears the accessed bit of every peer PTE.
    pub(crate) fn mmap_frame_reset_accessed(&self, shared: &Arc<SharedMmap>) {
        let inner = shared.inner.lock();
        for peer in &inner.users {
            peer.pd.set_accessed(peer.vpage, false);
        }
    }

    /// Writes the page back to the file if the share is writable and any
    /// dirtiness was observed, then clears the carry flag.
    fn write_back(
        &self,
        shared: &SharedMmap,
        inner: &mut SharedInner,
        frame: Frame,
        pte_dirty: bool,
    ) {
        if !shared.writable {
            return;
        }
        if !inner.dirty && !pte_dirty {
            return;
        }
        let length = shared.length as usize;
        self.pool.with_page(frame, |page| {
            let n = inner.file.write_at(&page[..length], shared.offset);
            if n != length {
                log::warn!(
                    "mmap write-back to inode {} truncated: {}/{} bytes",
                    shared.inode.0,
                    n,
                    length
                );
            }
        });
        inner.dirty = false;
        log::trace!("mmap: wrote back inode {} offset {}", shared.inode.0, shared.offset);
    }
}
