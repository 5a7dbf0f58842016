//! ELF process creation, the ABI stack layout and exec semantics

mod common;

use common::{boot, make_current, make_image, spawn_user, IMAGE_BASE};
use kernel::elf::{ExecError, AT_ENTRY, AT_NULL};
use kernel::memory::layout::LINKER_BASE;
use kernel::signal::SIGNAL_TRAMPOLINE;
use kernel::syscall::SyscallNumber;
use kernel::x86_64::VirtAddr;
use kernel::AddressSpace;

fn read_u64(space: &AddressSpace, addr: u64) -> u64 {
    let mut bytes = [0u8; 8];
    space.read_user(VirtAddr::new(addr), &mut bytes).unwrap();
    u64::from_le_bytes(bytes)
}

fn read_cstring(space: &AddressSpace, addr: u64) -> String {
    let mut out = Vec::new();
    let mut cursor = addr;
    loop {
        let mut byte = [0u8];
        space.read_user(VirtAddr::new(cursor), &mut byte).unwrap();
        if byte[0] == 0 {
            break;
        }
        out.push(byte[0]);
        cursor += 1;
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn test_abi_stack_layout() {
    let boot = boot(1);
    let image = make_image(b"code", false);
    let process = boot
        .kernel
        .create_elf_process(
            &image,
            &["app".to_string(), "arg1".to_string()],
            &["TERM=dumb".to_string()],
            Some("/bin/app"),
            None,
        )
        .unwrap();

    let registers = process.main_thread().registers().lock().clone();
    assert!(registers.is_user());
    assert_eq!(registers.rip, IMAGE_BASE);
    assert_eq!(registers.rsp % 16, 0);

    let space = process.address_space();
    let mut cursor = registers.rsp;

    // argc
    assert_eq!(read_u64(&space, cursor), 2);
    cursor += 8;
    // argv pointers, NULL terminated
    assert_eq!(read_cstring(&space, read_u64(&space, cursor)), "app");
    cursor += 8;
    assert_eq!(read_cstring(&space, read_u64(&space, cursor)), "arg1");
    cursor += 8;
    assert_eq!(read_u64(&space, cursor), 0);
    cursor += 8;
    // envp, NULL terminated
    assert_eq!(read_cstring(&space, read_u64(&space, cursor)), "TERM=dumb");
    cursor += 8;
    assert_eq!(read_u64(&space, cursor), 0);
    cursor += 8;

    // auxv: pairs until AT_NULL, containing the image entry point
    let mut entry = None;
    loop {
        let key = read_u64(&space, cursor);
        if key == AT_NULL {
            break;
        }
        let value = read_u64(&space, cursor + 8);
        if key == AT_ENTRY {
            entry = Some(value);
        }
        cursor += 16;
    }
    assert_eq!(entry, Some(IMAGE_BASE));
}

#[test]
fn test_malformed_image_aborts_creation() {
    let boot = boot(1);
    let before = boot.kernel.processes().process_count();
    let result =
        boot.kernel
            .create_elf_process(b"not an executable", &["x".to_string()], &[], None, None);
    assert!(matches!(result, Err(ExecError::InvalidImage)));
    assert_eq!(boot.kernel.processes().process_count(), before);
}

#[test]
fn test_signal_trampoline_is_mapped() {
    let boot = boot(1);
    let process = spawn_user(&boot.kernel, "app");
    let base = process.signal_trampoline().unwrap();

    let mut code = vec![0u8; SIGNAL_TRAMPOLINE.len()];
    process.address_space().read_user(base, &mut code).unwrap();
    assert_eq!(code, SIGNAL_TRAMPOLINE);
}

#[test]
fn test_dynamic_linker_entry() {
    let boot = boot(1);
    boot.vfs.add("/lib/ld.so", &make_image(b"linker", false));

    let image = make_image(b"needs-interp", true);
    let process = boot
        .kernel
        .create_elf_process(&image, &["dyn".to_string()], &[], None, None)
        .unwrap();

    // Entered through the linker, not the executable
    assert_eq!(
        process.main_thread().registers().lock().rip,
        LINKER_BASE
    );
}

#[test]
fn test_missing_linker_aborts_creation() {
    let boot = boot(1);
    let image = make_image(b"needs-interp", true);
    let result = boot
        .kernel
        .create_elf_process(&image, &["dyn".to_string()], &[], None, None);
    assert!(matches!(result, Err(ExecError::LinkerNotFound)));
}

#[test]
fn test_execve_replaces_the_image() {
    let boot = boot(1);
    let kernel = &boot.kernel;
    boot.vfs.add("/bin/two", &make_image(b"second", false));

    let process = spawn_user(kernel, "one");
    process.start(kernel.sched());
    make_current(kernel, 0, &process);

    // A close-on-exec handle that must not survive the exec
    struct Dummy;
    impl kernel::object::KernelObject for Dummy {
        fn class(&self) -> kernel::object::KoClass {
            kernel::object::KoClass::File
        }
    }
    let mut handle = kernel::object::Handle::new(std::sync::Arc::new(Dummy));
    handle.close_on_exec = true;
    let handle_index = {
        let mut handles = process.handles().lock();
        handles.insert(handle)
    };

    let old_space = process.address_space();

    // Stage path and argv in the old image's memory
    let space = process.address_space();
    let staging = space.allocate_anonymous(0x1000, None, false).unwrap();
    let path_ptr = staging.base().as_u64();
    space.write_user(staging.base(), b"/bin/two\0").unwrap();
    let arg_ptr = path_ptr + 0x20;
    space
        .write_user(VirtAddr::new(arg_ptr), b"two\0")
        .unwrap();
    let argv_ptr = path_ptr + 0x40;
    space
        .write_user(VirtAddr::new(argv_ptr), &arg_ptr.to_le_bytes())
        .unwrap();
    space
        .write_user(VirtAddr::new(argv_ptr + 8), &0u64.to_le_bytes())
        .unwrap();

    let result = kernel.syscall(
        0,
        SyscallNumber::Execve as u64,
        [path_ptr, argv_ptr, 0, 0, 0, 0],
    );
    assert_eq!(result, 0);

    assert_eq!(process.name(), "two");
    assert!(!std::sync::Arc::ptr_eq(&old_space, &process.address_space()));
    assert!(process.handles().lock().get(handle_index).is_none());

    // The new image is in place and entered from scratch
    let registers = process.main_thread().registers().lock().clone();
    assert_eq!(registers.rip, IMAGE_BASE);
    let mut probe = [0u8; 4];
    process
        .address_space()
        .read_user(VirtAddr::new(IMAGE_BASE + 4), &mut probe)
        .unwrap();
    assert_eq!(&probe, b"seco");
}

#[test]
fn test_execve_failure_leaves_caller_untouched() {
    let boot = boot(1);
    let kernel = &boot.kernel;

    let process = spawn_user(kernel, "keeper");
    process.start(kernel.sched());
    make_current(kernel, 0, &process);

    let old_space = process.address_space();
    let space = process.address_space();
    let staging = space.allocate_anonymous(0x1000, None, false).unwrap();
    space
        .write_user(staging.base(), b"/bin/missing\0")
        .unwrap();

    let result = kernel.syscall(
        0,
        SyscallNumber::Execve as u64,
        [staging.base().as_u64(), 0, 0, 0, 0, 0],
    );
    assert_eq!(result, -2); // ENOENT

    assert_eq!(process.name(), "keeper");
    assert!(std::sync::Arc::ptr_eq(&old_space, &process.address_space()));
}
