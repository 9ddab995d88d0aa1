//! Filesystem shim.
//!
//! The VM core treats the filesystem as an external collaborator reached
//! through a narrow call surface: open/reopen/close, positioned reads and
//! writes, length, and write denial for read-only mappings. This module
//! provides that surface over an in-memory volume so the VM core can be
//! exercised in isolation.
//!
//! A single lock serializes the whole volume, which is exactly the global
//! filesystem lock discipline the VM's eviction paths are designed around:
//! the used-queue lock is always released before any of these calls.

pub mod blockdev;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

/// Identity of an on-volume inode; part of the shared-mmap key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub u64);

struct Inode {
    data: Vec<u8>,
    /// Writes to this inode fail through any handle while nonzero.
    deny_write_cnt: u32,
    open_cnt: u32,
}

struct FsState {
    inodes: BTreeMap<u64, Inode>,
    names: BTreeMap<String, u64>,
    next_inode: u64,
}

/// An in-memory volume behind the global filesystem lock.
pub struct Filesys {
    state: Mutex<FsState>,
}

impl Filesys {
    pub fn new() -> Arc<Filesys> {
        Arc::new(Filesys {
            state: Mutex::new(FsState {
                inodes: BTreeMap::new(),
                names: BTreeMap::new(),
                next_inode: 1,
            }),
        })
    }

    /// Creates a file with the given initial contents and opens it.
    pub fn create(self: &Arc<Self>, name: &str, data: &[u8]) -> File {
        let mut state = self.state.lock();
        let id = state.next_inode;
        state.next_inode += 1;
        state.inodes.insert(
            id,
            Inode {
                data: data.to_vec(),
                deny_write_cnt: 0,
                open_cnt: 1,
            },
        );
        state.names.insert(String::from(name), id);
        File {
            fs: Arc::clone(self),
            inode: id,
            pos: 0,
            denies_write: false,
        }
    }

    /// Opens an existing file by name.
    pub fn open(self: &Arc<Self>, name: &str) -> Option<File> {
        let mut state = self.state.lock();
        let id = *state.names.get(name)?;
        state
            .inodes
            .get_mut(&id)
            .expect("named inode missing")
            .open_cnt += 1;
        Some(File {
            fs: Arc::clone(self),
            inode: id,
            pos: 0,
            denies_write: false,
        })
    }
}

/// An open file handle.
///
/// Dropping the handle closes it, releasing any write denial it holds.
pub struct File {
    fs: Arc<Filesys>,
    inode: u64,
    pos: u64,
    denies_write: bool,
}

impl File {
    /// Opens a fresh handle to the same inode, positioned at the start.
    pub fn reopen(&self) -> File {
        let mut state = self.fs.state.lock();
        state
            .inodes
            .get_mut(&self.inode)
            .expect("reopen of closed inode")
            .open_cnt += 1;
        File {
            fs: Arc::clone(&self.fs),
            inode: self.inode,
            pos: 0,
            denies_write: false,
        }
    }

    /// The inode this handle refers to.
    pub fn inode_id(&self) -> InodeId {
        InodeId(self.inode)
    }

    /// File length in bytes.
    pub fn length(&self) -> u64 {
        let state = self.fs.state.lock();
        state.inodes[&self.inode].data.len() as u64
    }

    /// Reads at `offset` into `buf`; returns the bytes read, short at EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let state = self.fs.state.lock();
        let data = &state.inodes[&self.inode].data;
        if offset >= data.len() as u64 {
            return 0;
        }
        let at = offset as usize;
        let n = buf.len().min(data.len() - at);
        buf[..n].copy_from_slice(&data[at..at + n]);
        n
    }

    /// Writes `buf` at `offset`, extending the file if needed; returns the
    /// bytes written, which is zero while writes to the inode are denied.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut state = self.fs.state.lock();
        let inode = state.inodes.get_mut(&self.inode).expect("closed inode");
        if inode.deny_write_cnt > 0 {
            return 0;
        }
        let end = offset as usize + buf.len();
        if inode.data.len() < end {
            inode.data.resize(end, 0);
        }
        inode.data[offset as usize..end].copy_from_slice(buf);
        buf.len()
    }

    /// Moves the file position.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Current file position.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Reads from the current position, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_at(buf, self.pos);
        self.pos += n as u64;
        n
    }

    /// Writes at the current position, advancing it.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.write_at(buf, self.pos);
        self.pos += n as u64;
        n
    }

    /// Denies writes to the underlying inode until this handle is closed
    /// or [`File::allow_write`] is called.
    pub fn deny_write(&mut self) {
        if self.denies_write {
            return;
        }
        let mut state = self.fs.state.lock();
        state
            .inodes
            .get_mut(&self.inode)
            .expect("closed inode")
            .deny_write_cnt += 1;
        self.denies_write = true;
    }

    /// Releases this handle's write denial.
    pub fn allow_write(&mut self) {
        if !self.denies_write {
            return;
        }
        let mut state = self.fs.state.lock();
        state
            .inodes
            .get_mut(&self.inode)
            .expect("closed inode")
            .deny_write_cnt -= 1;
        self.denies_write = false;
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let mut state = self.fs.state.lock();
        let inode = state.inodes.get_mut(&self.inode).expect("closed inode");
        if self.denies_write {
            inode.deny_write_cnt -= 1;
        }
        inode.open_cnt -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let fs = Filesys::new();
        let f = fs.create("hello", b"hello world");
        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&mut buf, 6), 5);
        assert_eq!(&buf, b"world");

        assert_eq!(f.write_at(b"forge", 6), 5);
        let again = fs.open("hello").unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(again.read_at(&mut buf, 0), 11);
        assert_eq!(&buf, b"hello forge");
    }

    #[test]
    fn deny_write_blocks_all_handles() {
        let fs = Filesys::new();
        let f = fs.create("ro", b"data");
        let mut reopened = f.reopen();
        reopened.deny_write();

        assert_eq!(f.write_at(b"x", 0), 0);
        drop(reopened);
        assert_eq!(f.write_at(b"x", 0), 1);
    }

    #[test]
    fn reopen_shares_the_inode() {
        let fs = Filesys::new();
        let f = fs.create("shared", b"abc");
        let r = f.reopen();
        assert_eq!(f.inode_id(), r.inode_id());
        assert_eq!(r.length(), 3);
    }
}
