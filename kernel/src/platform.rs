//! Hardware interface consumed by the scheduler and memory manager
//!
//! Everything the kernel model needs from the machine goes through this
//! trait: inter-processor interrupts, TLB maintenance, and the per-CPU state
//! loaded during a context switch. `NullPlatform` is the no-op
//! implementation used when no hardware layer is attached (hosted runs and
//! tests).

use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use crate::task::context::{FxState, RegisterContext};

/// IPI destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
    Cpu(usize),
    /// Every CPU except the sender
    AllExcept(usize),
}

/// IPI vectors the kernel uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiVector {
    /// Force the target through the schedule path
    Reschedule,
    /// Stop executing; used when panicking
    Halt,
}

pub trait Platform: Send + Sync {
    /// Send an inter-processor interrupt
    fn send_ipi(&self, _target: IpiTarget, _vector: IpiVector) {}

    /// Invalidate a stale TLB entry after map/unmap
    fn invalidate_page(&self, _virt: VirtAddr) {}

    /// Point the CPU's translation root at another hierarchy
    fn load_address_space(&self, _cpu: usize, _root: PhysFrame) {}

    /// Kernel stack used on the next privilege transition
    fn set_kernel_stack(&self, _cpu: usize, _top: VirtAddr) {}

    /// Thread-local storage base of the incoming thread
    fn set_tls_base(&self, _cpu: usize, _fs_base: u64) {}

    /// Save the outgoing thread's FPU/SSE state
    fn save_fpu(&self, _cpu: usize, _state: &mut FxState) {}

    /// Restore the incoming thread's FPU/SSE state
    fn restore_fpu(&self, _cpu: usize, _state: &FxState) {}

    /// The non-returning low-level switch; the model records the frame and
    /// returns to its caller.
    fn context_switch(&self, _cpu: usize, _registers: &RegisterContext) {}

    /// Pause briefly between retries of a bounded wait
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// Platform with no hardware behind it
pub struct NullPlatform;

impl Platform for NullPlatform {}
