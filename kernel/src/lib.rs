//! Process lifecycle, SMP scheduling and virtual memory
//!
//! The `Kernel` context owns everything, explicitly initialized in order:
//! page tables first, then the scheduler, and only then processes. There is
//! no ambient global state; the hardware, filesystem and ELF loader are
//! injected behind traits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod elf;
pub mod fs;
pub mod memory;
pub mod object;
pub mod platform;
pub mod process;
pub mod signal;
pub mod syscall;
pub mod task;

use alloc::sync::Arc;
use x86_64::VirtAddr;

use elf::ElfLoader;
use fs::Vfs;
use memory::address_space::{AccessKind, FaultOutcome};
use memory::{MapError, MemoryManager};
use platform::Platform;
use process::ProcessTable;
use task::scheduler::{ScheduleOutcome, Scheduler};
use task::thread::Thread;

pub use memory::address_space::AddressSpace;
pub use process::{Process, ProcessId, ProcessState};
pub use syscall::errno::Errno;
pub use task::thread::ThreadState;

// Re-export the address types for embedders and tests
pub use x86_64;

/// Boot-time parameters
pub struct KernelConfig {
    pub cpus: usize,
    /// Physical memory handed to the frame arena, in 4 KiB frames
    pub memory_frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            cpus: 1,
            memory_frames: 4096,
        }
    }
}

/// How a page-fault vector invocation was disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    Resolved,
    /// User-mode fault with no backing: only the faulting process died
    ProcessKilled,
}

pub struct Kernel {
    pub(crate) memory: MemoryManager,
    pub(crate) processes: ProcessTable,
    pub(crate) sched: Scheduler,
    pub(crate) vfs: Arc<dyn Vfs>,
    pub(crate) elf: Arc<dyn ElfLoader>,
}

impl Kernel {
    /// Bring the kernel up: memory manager, then scheduler (with its
    /// per-CPU idle processes), ready for the first real process.
    pub fn new(
        config: KernelConfig,
        platform: Arc<dyn Platform>,
        vfs: Arc<dyn Vfs>,
        elf: Arc<dyn ElfLoader>,
    ) -> Result<Kernel, MapError> {
        let memory = MemoryManager::new(platform.clone(), config.memory_frames)?;
        let processes = ProcessTable::new();
        let sched = Scheduler::new(platform, &memory, &processes, config.cpus)?;
        log::info!(
            "kernel up: {} cpus, {} frames",
            config.cpus,
            config.memory_frames
        );
        Ok(Kernel {
            memory,
            processes,
            sched,
            vfs,
            elf,
        })
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    /// Timer interrupt vector: broadcast preemption and reschedule locally
    pub fn timer_tick(&self, cpu: usize) -> ScheduleOutcome {
        self.sched.tick(cpu)
    }

    /// Page-fault vector. Faults with a backing region are resolved
    /// (lazily allocated or copy-on-write). A user-mode fault with no
    /// backing kills only the faulting process; a kernel-mode one halts
    /// every other CPU and panics.
    pub fn handle_page_fault(
        &self,
        cpu: usize,
        address: VirtAddr,
        write: bool,
        user: bool,
    ) -> FaultVerdict {
        let kind = if write {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        let current = self.sched.current_thread(cpu);
        let process = current.as_ref().and_then(|t| t.process());

        if let Some(process) = process.as_ref() {
            // This Arc keeps the address space alive until the fault is
            // fully disposed of, even while another CPU tears the process
            // down.
            let space = process.address_space();
            if space.handle_fault(address, kind) == FaultOutcome::Resolved {
                return FaultVerdict::Resolved;
            }
        }

        dump_fault(current.as_ref(), address, write, user);

        if user {
            if let Some(process) = process {
                log::error!(
                    "process {} (pid {}) killed by page fault",
                    process.name(),
                    process.pid().as_u64()
                );
                process.die(&self.sched, &self.processes, cpu);
                return FaultVerdict::ProcessKilled;
            }
        }

        self.sched.halt_others(cpu);
        panic!("kernel page fault at {:#x}", address.as_u64());
    }
}

fn dump_fault(thread: Option<&Arc<Thread>>, address: VirtAddr, write: bool, user: bool) {
    log::error!(
        "page fault: address {:#x}, {} access, {} mode",
        address.as_u64(),
        if write { "write" } else { "read" },
        if user { "user" } else { "kernel" }
    );
    if let Some(thread) = thread {
        let registers = thread.registers().lock();
        log::error!(
            "rip: {:#x} rsp: {:#x} rbp: {:#x} rax: {:#x} rbx: {:#x} rcx: {:#x} rdx: {:#x}",
            registers.rip,
            registers.rsp,
            registers.rbp,
            registers.rax,
            registers.rbx,
            registers.rcx,
            registers.rdx
        );
        log::error!(
            "rsi: {:#x} rdi: {:#x} r8: {:#x} r9: {:#x} rflags: {:#x} cs: {:#x}",
            registers.rsi,
            registers.rdi,
            registers.r8,
            registers.r9,
            registers.rflags,
            registers.cs
        );
    }
}
