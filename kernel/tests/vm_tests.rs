//! VM core tests: second-chance replacement, the swap round trip, stack
//! growth, lazy loading, address-space teardown, and the frame-lock
//! protocol under real concurrency.

use std::sync::Arc;
use std::vec::Vec;

use corvid_kernel::error::KernelError;
use corvid_kernel::fs::blockdev::RamDisk;
use corvid_kernel::fs::Filesys;
use corvid_kernel::mm::{
    PageType, VirtPage, Vm, VmConfig, PAGE_SIZE, SECTORS_PER_PAGE, STACK_BOTTOM,
};

/// A stack pointer well inside the stack region.
const ESP: u32 = 0xbfff_f000;

/// Base of the simulated data segment, below the stack region.
const DATA_BASE: u32 = 0x0804_8000;

fn data_addr(n: u32) -> u32 {
    DATA_BASE + n * PAGE_SIZE as u32
}

fn vp(addr: u32) -> VirtPage {
    VirtPage::containing(addr)
}

fn setup(frames: usize, swap_slots: u64) -> (Arc<Vm>, Arc<Filesys>) {
    let disk = Arc::new(RamDisk::new(swap_slots * SECTORS_PER_PAGE as u64));
    let vm = Vm::new(
        VmConfig {
            user_frames: frames,
        },
        disk,
    );
    (Arc::new(vm), Filesys::new())
}

// ===== Zero-fill and swap =====

#[test]
fn zero_fill_pages_fault_in_zeroed() {
    let (vm, _fs) = setup(2, 16);
    let pd = vm.create_page_dir();
    pd.set_zeroed_page(vp(data_addr(0)), true, 0);

    let mut buf = [0xffu8; 16];
    vm.user_read(&pd, ESP, data_addr(0), &mut buf).unwrap();
    assert_eq!(buf, [0u8; 16]);
    assert_eq!(pd.page_type(vp(data_addr(0))), PageType::PagedIn);
}

#[test]
fn swap_round_trip_preserves_contents_and_writability() {
    let (vm, _fs) = setup(2, 16);
    let pd = vm.create_page_dir();
    for n in 0..5 {
        pd.set_zeroed_page(vp(data_addr(n)), true, 0);
    }

    let pattern = [0xde, 0xad, 0xde, 0xad];
    vm.user_write(&pd, ESP, data_addr(0), &pattern).unwrap();

    // Touch other pages until the victim page is pushed out to swap.
    let mut n = 1;
    while pd.page_type(vp(data_addr(0))) != PageType::Swapped {
        assert!(n < 5, "page 0 never evicted");
        vm.user_write(&pd, ESP, data_addr(n), &[n as u8]).unwrap();
        n += 1;
    }

    // Faulting it back restores both the bytes and the protection.
    let mut buf = [0u8; 4];
    vm.user_read(&pd, ESP, data_addr(0), &mut buf).unwrap();
    assert_eq!(buf, pattern);
    assert_eq!(pd.page_type(vp(data_addr(0))), PageType::PagedIn);
    vm.user_write(&pd, ESP, data_addr(0), &[1]).unwrap();
}

#[test]
fn read_only_protection_survives_the_swap_round_trip() {
    let (vm, _fs) = setup(2, 16);
    let pd = vm.create_page_dir();
    pd.set_zeroed_page(vp(data_addr(0)), false, 0);
    for n in 1..5 {
        pd.set_zeroed_page(vp(data_addr(n)), true, 0);
    }

    let mut buf = [0u8; 4];
    vm.user_read(&pd, ESP, data_addr(0), &mut buf).unwrap();
    assert!(matches!(
        vm.user_write(&pd, ESP, data_addr(0), &[1]),
        Err(KernelError::UserFault { .. })
    ));

    let mut n = 1;
    while pd.page_type(vp(data_addr(0))) != PageType::Swapped {
        assert!(n < 5, "page 0 never evicted");
        vm.user_write(&pd, ESP, data_addr(n), &[n as u8]).unwrap();
        n += 1;
    }

    vm.user_read(&pd, ESP, data_addr(0), &mut buf).unwrap();
    assert!(matches!(
        vm.user_write(&pd, ESP, data_addr(0), &[1]),
        Err(KernelError::UserFault { .. })
    ));
}

// ===== Second chance =====

#[test]
fn second_chance_spares_recently_accessed_frames() {
    let (vm, _fs) = setup(4, 64);
    let pd = vm.create_page_dir();
    for n in 1..=6 {
        pd.set_zeroed_page(vp(data_addr(n)), true, 0);
    }

    // Fill the pool: pages 1..=4 resident, access bits set.
    for n in 1..=4 {
        vm.user_write(&pd, ESP, data_addr(n), &[n as u8]).unwrap();
    }

    // Page 5 forces the first eviction: every bit is reset in one full
    // pass and the head of the clock (page 4) is the victim.
    vm.user_write(&pd, ESP, data_addr(5), &[5]).unwrap();
    assert_eq!(pd.page_type(vp(data_addr(4))), PageType::Swapped);
    for n in [1, 2, 3, 5] {
        assert_eq!(pd.page_type(vp(data_addr(n))), PageType::PagedIn, "page {}", n);
    }

    // Re-touch page 3; pages 1 and 2 keep cleared access bits.
    vm.user_write(&pd, ESP, data_addr(3), &[33]).unwrap();

    // Page 6 forces the second eviction: the sweep skips the
    // recently-accessed pages 3 and 5 and takes the stale page 2.
    vm.user_write(&pd, ESP, data_addr(6), &[6]).unwrap();
    assert_eq!(pd.page_type(vp(data_addr(2))), PageType::Swapped);
    for n in [1, 3, 5, 6] {
        assert_eq!(pd.page_type(vp(data_addr(n))), PageType::PagedIn, "page {}", n);
    }
}

// ===== Stack growth =====

#[test]
fn stack_growth_within_slack_succeeds() {
    let (vm, _fs) = setup(2, 16);
    let pd = vm.create_page_dir();
    pd.set_zeroed_page(vp(ESP - 8), true, 0);

    vm.user_write(&pd, ESP, ESP - 8, &[7]).unwrap();
    assert_eq!(pd.page_type(vp(ESP - 8)), PageType::PagedIn);
}

#[test]
fn stack_fault_beyond_slack_kills() {
    let (vm, _fs) = setup(2, 16);
    let pd = vm.create_page_dir();
    pd.set_zeroed_page(vp(ESP - 64), true, 0);

    assert!(matches!(
        vm.user_write(&pd, ESP, ESP - 64, &[7]),
        Err(KernelError::UserFault { .. })
    ));
}

#[test]
fn unmapped_access_kills() {
    let (vm, _fs) = setup(2, 16);
    let pd = vm.create_page_dir();
    assert!(matches!(
        vm.user_read(&pd, ESP, data_addr(9), &mut [0u8; 1]),
        Err(KernelError::UserFault { .. })
    ));
    assert!(matches!(
        vm.user_write(&pd, ESP, ESP - 4 * PAGE_SIZE as u32, &[1]),
        Err(KernelError::UserFault { .. })
    ));
}

// ===== Lazy loading =====

#[test]
fn lazy_pages_load_from_their_file_and_become_swappable() {
    let (vm, fs) = setup(2, 16);
    let mut contents = vec![0u8; 300];
    for (i, b) in contents.iter_mut().enumerate() {
        *b = i as u8;
    }
    let file = fs.create("prog.bin", &contents);

    let pd = vm.create_page_dir();
    vm.create_lazy_page(&file, 100, 200, &pd, vp(data_addr(0)))
        .unwrap();

    // While the lazy record is pending, the backing file is frozen.
    assert_eq!(file.write_at(&[1], 0), 0);

    let mut buf = [0u8; 4];
    vm.user_read(&pd, ESP, data_addr(0), &mut buf).unwrap();
    assert_eq!(buf, [100, 101, 102, 103]);

    // The tail past the mapped length reads as zeros.
    vm.user_read(&pd, ESP, data_addr(0) + 200, &mut buf).unwrap();
    assert_eq!(buf, [0; 4]);

    // Loaded lazy pages are private and writable; the handle is closed.
    vm.user_write(&pd, ESP, data_addr(0), &[0xab]).unwrap();
    assert_eq!(file.write_at(&[1], 0), 1);

    // Once evicted they round-trip through swap, not the file.
    for n in 1..4 {
        pd.set_zeroed_page(vp(data_addr(n)), true, 0);
        vm.user_write(&pd, ESP, data_addr(n), &[n as u8]).unwrap();
    }
    assert_eq!(pd.page_type(vp(data_addr(0))), PageType::Swapped);
    vm.user_read(&pd, ESP, data_addr(0), &mut buf).unwrap();
    assert_eq!(buf, [0xab, 101, 102, 103]);
}

// ===== Teardown =====

#[test]
fn pagedir_destroy_releases_frames_slots_and_records() {
    let (vm, fs) = setup(4, 16);
    let file = fs.create("seg.bin", &[9u8; 512]);
    let pd = vm.create_page_dir();

    for n in 0..6 {
        pd.set_zeroed_page(vp(data_addr(n)), true, 0);
    }
    for n in 0..6 {
        vm.user_write(&pd, ESP, data_addr(n), &[n as u8]).unwrap();
    }
    // A lazy page that never loads keeps its file handle until teardown.
    vm.create_lazy_page(&file, 0, 512, &pd, vp(data_addr(8)))
        .unwrap();
    assert_eq!(file.write_at(&[1], 0), 0);

    vm.pagedir_destroy(&pd);

    assert_eq!(vm.user_frames_free(), vm.user_pool_size());
    assert_eq!(vm.swap_slots_free(), 16);
    assert_eq!(file.write_at(&[1], 0), 1);
}

// ===== Concurrency =====

/// Four address spaces hammer a four-frame pool. Any frame-lock
/// unsoundness or double-allocated swap slot shows up as one space
/// reading another's pattern.
#[test]
fn frame_locks_and_swap_slots_are_exclusive_under_contention() {
    let (vm, _fs) = setup(4, 4096);
    let slots_total = vm.swap_slots_free();
    let pages_per_space = 6u32;

    let handles: Vec<_> = (0..4u32)
        .map(|space| {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || {
                let pd = vm.create_page_dir();
                for p in 0..pages_per_space {
                    pd.set_zeroed_page(vp(data_addr(p)), true, 0);
                }
                for iter in 0..25u32 {
                    for p in 0..pages_per_space {
                        let tag = [space as u8, p as u8, iter as u8, 0x5a];
                        vm.user_write(&pd, ESP, data_addr(p), &tag).unwrap();
                    }
                    for p in 0..pages_per_space {
                        let mut buf = [0u8; 4];
                        vm.user_read(&pd, ESP, data_addr(p), &mut buf).unwrap();
                        assert_eq!(buf, [space as u8, p as u8, iter as u8, 0x5a]);
                    }
                }
                vm.pagedir_destroy(&pd);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(vm.user_frames_free(), vm.user_pool_size());
    assert_eq!(vm.swap_slots_free(), slots_total);
}

// ===== Constants sanity =====

#[test]
fn data_segment_sits_below_the_stack_region() {
    assert!(data_addr(16) < STACK_BOTTOM);
    assert!(ESP > STACK_BOTTOM);
}
