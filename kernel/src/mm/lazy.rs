//! Lazily-loaded pages.
//!
//! A lazy page reads its initial contents from a file on first fault and
//! then lives as an ordinary swappable page; unlike an mmap it is private
//! to one address space and never written back. The record holds its own
//! reopened, write-denied file handle so the backing bytes cannot change
//! underneath it.

use alloc::sync::Arc;

use super::page_table::{PageDir, PageRecord, VirtPage};
use super::palloc::Frame;
use super::Vm;
use crate::error::KernelError;
use crate::fs::File;

/// A pending lazy load: where the page's initial bytes come from.
pub struct LazyLoad {
    file: File,
    offset: u64,
    length: u16,
}

impl Vm {
    /// Marks `vpage` to be loaded from `file` at `offset` on first fault.
    /// At most `length` bytes are read; the rest of the page is zeroed.
    pub fn create_lazy_page(
        &self,
        file: &File,
        offset: u64,
        length: u16,
        pd: &Arc<PageDir>,
        vpage: VirtPage,
    ) -> Result<(), KernelError> {
        assert!(length as usize <= super::palloc::PAGE_SIZE);
        let mut handle = file.reopen();
        handle.deny_write();

        let record = pd.reserve_record_id();
        pd.install_record(
            record,
            PageRecord::Lazy(LazyLoad {
                file: handle,
                offset,
                length,
            }),
        );
        pd.set_record_page(vpage, record);
        Ok(())
    }

    /// Reads a lazy record's bytes into a frame-locked page and closes the
    /// backing handle. The page becomes swappable when the caller installs
    /// and unlocks it.
    pub(crate) fn lazy_load_into(&self, frame: Frame, lazy: LazyLoad) {
        self.pool.with_page(frame, |page| {
            let n = lazy.file.read_at(&mut page[..lazy.length as usize], lazy.offset);
            page[n..].fill(0);
        });
        // Dropping the record closes the reopened handle.
    }
}
