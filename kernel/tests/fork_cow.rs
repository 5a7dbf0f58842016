//! Fork and copy-on-write behavior through the syscall surface

mod common;

use common::{boot, make_current, spawn_user};
use kernel::syscall::{SyscallNumber, MAP_ANONYMOUS, MAP_FIXED};
use kernel::x86_64::VirtAddr;
use kernel::ProcessId;

fn sys(kernel: &kernel::Kernel, cpu: usize, number: SyscallNumber, args: [u64; 6]) -> i64 {
    kernel.syscall(cpu, number as u64, args)
}

#[test]
fn test_fork_cow_scenario() {
    let boot = boot(1);
    let kernel = &boot.kernel;

    let parent = spawn_user(kernel, "parent");
    parent.start(kernel.sched());
    make_current(kernel, 0, &parent);

    // Reserve an anonymous page and dirty its first byte
    let base = sys(kernel, 0, SyscallNumber::Mmap, [0, 0x1000, 0, MAP_ANONYMOUS, 0, 0]);
    assert!(base > 0);
    let base = VirtAddr::new(base as u64);
    let parent_space = parent.address_space();
    parent_space.write_user(base, &[7u8]).unwrap();

    let child_pid = sys(kernel, 0, SyscallNumber::Fork, [0; 6]);
    assert!(child_pid > 0);
    let child = parent
        .find_child_by_pid(ProcessId::new(child_pid as u64))
        .unwrap();

    // Child saw fork return 0
    assert_eq!(child.main_thread().registers().lock().rax, 0);

    // Fork sharing: the untouched page has the same physical frame on both
    // sides, and no eager copy happened.
    let child_space = child.address_space();
    assert_eq!(
        parent_space.translate(base).unwrap(),
        child_space.translate(base).unwrap()
    );

    let arena = kernel.memory().arena();
    let frames_before = arena.allocated_frames();

    // Child writes one byte at offset 0 of the shared anonymous page
    child_space.write_user(base, &[1u8]).unwrap();

    // Parent's view at offset 0 is unchanged
    let mut parent_byte = [0u8];
    parent_space.read_user(base, &mut parent_byte).unwrap();
    assert_eq!(parent_byte[0], 7);

    // The child's object for that region is now private
    let child_region = child_space.region_containing(base).unwrap();
    assert_eq!(child_region.object_ref_count(), 1);
    assert!(!child_region.is_copy_on_write());

    // Exactly one new physical frame was allocated by the resolution
    assert_eq!(arena.allocated_frames(), frames_before + 1);

    // And the child's byte is its own
    let mut child_byte = [0u8];
    child_space.read_user(base, &mut child_byte).unwrap();
    assert_eq!(child_byte[0], 1);
}

#[test]
fn test_fork_isolation_both_directions() {
    let boot = boot(1);
    let kernel = &boot.kernel;

    let parent = spawn_user(kernel, "parent");
    parent.start(kernel.sched());
    make_current(kernel, 0, &parent);

    let base = sys(kernel, 0, SyscallNumber::Mmap, [0, 0x2000, 0, MAP_ANONYMOUS, 0, 0]) as u64;
    let base = VirtAddr::new(base);
    parent.address_space().write_user(base, b"AA").unwrap();

    let child_pid = sys(kernel, 0, SyscallNumber::Fork, [0; 6]) as u64;
    let child = parent.find_child_by_pid(ProcessId::new(child_pid)).unwrap();

    parent.address_space().write_user(base, b"PP").unwrap();

    let mut seen = [0u8; 2];
    child.address_space().read_user(base, &mut seen).unwrap();
    assert_eq!(&seen, b"AA", "parent write leaked into child");

    child.address_space().write_user(base, b"CC").unwrap();
    parent.address_space().read_user(base, &mut seen).unwrap();
    assert_eq!(&seen, b"PP", "child write leaked into parent");
}

#[test]
fn test_cow_sibling_unmap_keeps_frames() {
    let boot = boot(1);
    let kernel = &boot.kernel;

    let parent = spawn_user(kernel, "parent");
    parent.start(kernel.sched());
    make_current(kernel, 0, &parent);

    let base = sys(kernel, 0, SyscallNumber::Mmap, [0, 0x1000, 0, MAP_ANONYMOUS, 0, 0]) as u64;
    let addr = VirtAddr::new(base);
    parent.address_space().write_user(addr, b"live").unwrap();

    let child_pid = sys(kernel, 0, SyscallNumber::Fork, [0; 6]) as u64;
    let child = parent.find_child_by_pid(ProcessId::new(child_pid)).unwrap();

    let arena = kernel.memory().arena();
    let frames_before = arena.allocated_frames();

    // Parent unmaps its side; the child's reference keeps the frame alive
    assert_eq!(sys(kernel, 0, SyscallNumber::Munmap, [base, 0x1000, 0, 0, 0, 0]), 0);
    assert_eq!(arena.allocated_frames(), frames_before);

    let mut bytes = [0u8; 4];
    child.address_space().read_user(addr, &mut bytes).unwrap();
    assert_eq!(&bytes, b"live");

    // The last unmap frees it
    child.address_space().unmap(addr, 0x1000).unwrap();
    assert!(arena.allocated_frames() < frames_before);
}

#[test]
fn test_mmap_fixed_conflict_is_typed() {
    let boot = boot(1);
    let kernel = &boot.kernel;

    let process = spawn_user(kernel, "proc");
    process.start(kernel.sched());
    make_current(kernel, 0, &process);

    let base = 0x5000_0000u64;
    assert_eq!(
        sys(kernel, 0, SyscallNumber::Mmap, [base, 0x1000, 0, MAP_ANONYMOUS | MAP_FIXED, 0, 0]),
        base as i64
    );
    // Fixed request over an existing region fails instead of relocating
    assert_eq!(
        sys(kernel, 0, SyscallNumber::Mmap, [base, 0x1000, 0, MAP_ANONYMOUS | MAP_FIXED, 0, 0]),
        -17 // EEXIST
    );
    // Without MAP_FIXED the same hint falls back to another range
    let relocated = sys(kernel, 0, SyscallNumber::Mmap, [base, 0x1000, 0, MAP_ANONYMOUS, 0, 0]);
    assert!(relocated > 0 && relocated as u64 != base);
}

#[test]
fn test_munmap_misaligned_is_fault() {
    let boot = boot(1);
    let kernel = &boot.kernel;
    let process = spawn_user(kernel, "proc");
    process.start(kernel.sched());
    make_current(kernel, 0, &process);

    assert_eq!(
        sys(kernel, 0, SyscallNumber::Munmap, [0x1234, 0x1000, 0, 0, 0, 0]),
        -14 // EFAULT
    );
}

#[test]
fn test_fork_chain_shares_then_isolates() {
    let boot = boot(1);
    let kernel = &boot.kernel;

    let a = spawn_user(kernel, "a");
    a.start(kernel.sched());
    make_current(kernel, 0, &a);

    let base = sys(kernel, 0, SyscallNumber::Mmap, [0, 0x1000, 0, MAP_ANONYMOUS, 0, 0]) as u64;
    let addr = VirtAddr::new(base);
    a.address_space().write_user(addr, &[0xAB]).unwrap();

    let b_pid = sys(kernel, 0, SyscallNumber::Fork, [0; 6]) as u64;
    let b = a.find_child_by_pid(ProcessId::new(b_pid)).unwrap();

    // Three-way sharing after a second fork from the child
    let c = b.fork(kernel.memory(), kernel.processes()).unwrap();
    let region = b.address_space().region_containing(addr).unwrap();
    assert_eq!(region.object_ref_count(), 3);

    // B resolves its COW; A and C still share
    b.address_space().write_user(addr, &[0xCD]).unwrap();
    assert_eq!(
        b.address_space()
            .region_containing(addr)
            .unwrap()
            .object_ref_count(),
        1
    );
    assert_eq!(
        a.address_space().translate(addr),
        c.address_space().translate(addr)
    );
}
