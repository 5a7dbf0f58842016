//! Process creation paths
//!
//! The ELF path verifies the image before anything is allocated, maps its
//! segments through the external loader, reserves and pre-faults the user
//! stack, optionally loads the dynamic linker the image names, builds the
//! ABI argv/envp/auxv stack layout, reserves handles 0-2 for stdio and maps
//! the signal trampoline — all before the first scheduling.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::elf::{
    ElfInfo, ExecError, AT_ENTRY, AT_EXECPATH, AT_NULL, AT_PHDR, AT_PHENT, AT_PHNUM,
};
use crate::fs;
use crate::memory::address_space::AddressSpace;
use crate::memory::layout::{LINKER_BASE, PAGE_SIZE_4K, USER_STACK_SIZE};
use crate::memory::MapError;
use crate::object::Handle;
use crate::task::thread::{THREAD_PRIORITY_DEFAULT, THREAD_TIMESLICE_DEFAULT};
use crate::Kernel;

use super::process::Process;

/// Entry point and initial stack pointer of a freshly built user image
pub(crate) struct UserImage {
    pub entry: VirtAddr,
    pub stack_pointer: VirtAddr,
}

impl Kernel {
    /// Create (but do not yet schedule) a kernel-mode process
    pub fn create_kernel_process(
        &self,
        name: &str,
        entry: VirtAddr,
    ) -> Result<Arc<Process>, MapError> {
        Process::create_kernel(&self.memory, &self.processes, name, entry, None)
    }

    /// Create a user process from an ELF image. A malformed image aborts
    /// creation before any resource is touched.
    pub fn create_elf_process(
        &self,
        image: &[u8],
        argv: &[String],
        envp: &[String],
        exec_path: Option<&str>,
        parent: Option<&Arc<Process>>,
    ) -> Result<Arc<Process>, ExecError> {
        if !self.elf.verify(image) {
            return Err(ExecError::InvalidImage);
        }

        let name = argv.first().map(String::as_str).unwrap_or("unknown");
        let process = Process::create_kernel(
            &self.memory,
            &self.processes,
            name,
            VirtAddr::new(0),
            parent,
        )?;

        let thread = process.main_thread();
        thread.set_time_slice_default(THREAD_TIMESLICE_DEFAULT);
        thread.set_priority(THREAD_PRIORITY_DEFAULT);

        let space = process.address_space();
        let user = self.build_user_image(&space, image, argv, envp, exec_path)?;
        {
            let mut registers = thread.registers().lock();
            *registers = crate::task::context::RegisterContext::user_entry(
                user.entry,
                user.stack_pointer,
            );
        }

        self.setup_stdio(&process);
        process.map_signal_trampoline()?;

        log::info!(
            "created process {} (pid {})",
            process.name(),
            process.pid().as_u64()
        );
        Ok(process)
    }

    /// Map segments, stack and linker into `space` and lay out the ABI
    /// stack. Shared by process creation and exec.
    pub(crate) fn build_user_image(
        &self,
        space: &AddressSpace,
        image: &[u8],
        argv: &[String],
        envp: &[String],
        exec_path: Option<&str>,
    ) -> Result<UserImage, ExecError> {
        let info = self.elf.load_segments(space, image, VirtAddr::new(0))?;

        // Reserve the user stack lazily; only its top pages are faulted in
        // up front.
        let stack_region = space.allocate_anonymous(USER_STACK_SIZE, None, false)?;
        if let Some(object) = stack_region.object() {
            for back in 1..=3u64 {
                object.hit(
                    stack_region.base(),
                    USER_STACK_SIZE as u64 - back * PAGE_SIZE_4K,
                    space.page_map(),
                    false,
                )?;
            }
        }
        let stack_top = stack_region.base() + USER_STACK_SIZE as u64;

        let entry = match info.linker_path.as_deref() {
            Some(_) => {
                // The image wants a dynamic linker; load it at its own base
                // and enter through it instead.
                let node = self
                    .vfs
                    .resolve("/lib/ld.so")
                    .ok_or(ExecError::LinkerNotFound)?;
                let linker = fs::read_all(&node).map_err(|_| ExecError::LinkerNotFound)?;
                if !self.elf.verify(&linker) {
                    log::warn!("invalid dynamic linker image");
                    return Err(ExecError::LinkerNotFound);
                }
                let linker_info =
                    self.elf
                        .load_segments(space, &linker, VirtAddr::new(LINKER_BASE))?;
                linker_info.entry
            }
            None => info.entry,
        };

        let stack_pointer = build_abi_stack(space, stack_top, argv, envp, exec_path, &info)?;
        Ok(UserImage {
            entry,
            stack_pointer,
        })
    }

    /// Reserve handles 0-2 for stdio. Missing device nodes degrade to a
    /// warning, not an error.
    pub(crate) fn setup_stdio(&self, process: &Arc<Process>) {
        let mut handles = process.handles().lock();
        match self.vfs.resolve("/dev/null") {
            Some(node) => handles.set(0, Handle::new(fs::open(node))),
            None => log::warn!("failed to find /dev/null"),
        }
        match self.vfs.resolve("/dev/kernellog") {
            Some(node) => {
                handles.set(1, Handle::new(fs::open(node.clone())));
                handles.set(2, Handle::new(fs::open(node)));
            }
            None => log::warn!("failed to find /dev/kernellog"),
        }
    }
}

fn push_u64(space: &AddressSpace, sp: &mut u64, value: u64) -> Result<(), MapError> {
    *sp -= 8;
    space.write_user(VirtAddr::new(*sp), &value.to_le_bytes())
}

fn push_bytes(space: &AddressSpace, sp: &mut u64, bytes: &[u8]) -> Result<u64, MapError> {
    *sp -= bytes.len() as u64;
    space.write_user(VirtAddr::new(*sp), bytes)?;
    Ok(*sp)
}

fn push_cstr(space: &AddressSpace, sp: &mut u64, value: &str) -> Result<u64, MapError> {
    push_bytes(space, sp, &[0u8])?;
    push_bytes(space, sp, value.as_bytes())
}

/// Lay out argc/argv/envp/auxv on the initial user stack, 16-byte aligned
fn build_abi_stack(
    space: &AddressSpace,
    stack_top: VirtAddr,
    argv: &[String],
    envp: &[String],
    exec_path: Option<&str>,
    info: &ElfInfo,
) -> Result<VirtAddr, MapError> {
    let mut sp = stack_top.as_u64();

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_ptrs.push(push_cstr(space, &mut sp, arg)?);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for var in envp {
        envp_ptrs.push(push_cstr(space, &mut sp, var)?);
    }
    let exec_path_ptr = match exec_path {
        Some(path) => Some(push_cstr(space, &mut sp, path)?),
        None => None,
    };

    sp &= !0xF;
    // Keep the final frame 16-byte aligned: the word count below is even
    // except when argc + envc is odd.
    if (argv.len() + envp.len()) % 2 == 1 {
        sp -= 8;
    }

    push_u64(space, &mut sp, AT_NULL)?;
    let aux = |sp: &mut u64, key: u64, value: u64| -> Result<(), MapError> {
        push_u64(space, sp, value)?;
        push_u64(space, sp, key)
    };
    aux(&mut sp, AT_PHDR, info.phdr_vaddr)?;
    aux(&mut sp, AT_PHENT, info.ph_entry_size)?;
    aux(&mut sp, AT_PHNUM, info.ph_count)?;
    aux(&mut sp, AT_ENTRY, info.entry.as_u64())?;
    if let Some(path_ptr) = exec_path_ptr {
        aux(&mut sp, AT_EXECPATH, path_ptr)?;
    }

    push_u64(space, &mut sp, 0)?; // envp terminator
    for ptr in envp_ptrs.iter().rev() {
        push_u64(space, &mut sp, *ptr)?;
    }
    push_u64(space, &mut sp, 0)?; // argv terminator
    for ptr in argv_ptrs.iter().rev() {
        push_u64(space, &mut sp, *ptr)?;
    }
    push_u64(space, &mut sp, argv.len() as u64)?;

    debug_assert!(sp % 16 == 0, "misaligned initial stack");
    Ok(VirtAddr::new(sp))
}
