//! CPU context and the context-switch primitive
//!
//! All register save/restore, TLS, kernel-stack and address-space switching
//! is concentrated in `switch_to`; the scheduler decides *what* runs, this
//! module is the only place that touches *how*.

use alloc::sync::Arc;
use x86_64::VirtAddr;

use super::thread::Thread;
use crate::platform::Platform;

/// Kernel code segment selector
pub const KERNEL_CS: u64 = 0x08;
/// Kernel stack segment selector
pub const KERNEL_SS: u64 = 0x10;
/// User code segment selector (RPL 3)
pub const USER_CS: u64 = 0x33;
/// User stack segment selector (RPL 3)
pub const USER_SS: u64 = 0x2b;

/// RFLAGS bit 1 is always set; bit 9 enables interrupts
const RFLAGS_BASE: u64 = 0x002;
const RFLAGS_IF: u64 = 0x200;

/// General-purpose register snapshot saved on interrupt entry
#[derive(Debug, Clone)]
#[repr(C)]
pub struct RegisterContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl RegisterContext {
    pub fn zeroed() -> Self {
        RegisterContext {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: RFLAGS_BASE,
            cs: KERNEL_CS,
            ss: KERNEL_SS,
        }
    }

    /// Entry context for a kernel-mode thread
    pub fn kernel_entry(entry: VirtAddr, stack_top: VirtAddr) -> Self {
        let mut context = Self::zeroed();
        context.rip = entry.as_u64();
        context.rsp = stack_top.as_u64();
        context.rbp = stack_top.as_u64();
        context.rflags = RFLAGS_BASE | RFLAGS_IF;
        context
    }

    /// Entry context for a user-mode thread
    pub fn user_entry(entry: VirtAddr, stack_top: VirtAddr) -> Self {
        let mut context = Self::kernel_entry(entry, stack_top);
        context.cs = USER_CS;
        context.ss = USER_SS;
        context
    }

    /// Was this context captured in user mode?
    pub fn is_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

/// FPU/SSE register block as stored by FXSAVE64
#[repr(C, align(16))]
pub struct FxState(pub [u8; 512]);

impl FxState {
    /// Power-on defaults: x87 control word 0x037F, MXCSR 0x1F80
    pub fn new() -> Self {
        let mut state = FxState([0u8; 512]);
        state.0[0] = 0x7F;
        state.0[1] = 0x03;
        state.0[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        state
    }
}

impl Default for FxState {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch the CPU from `prev` to `next`: save the outgoing FPU state,
/// restore the incoming FPU state, TLS base and kernel stack, switch the
/// translation root to the incoming thread's process, and hand the register
/// frame to the platform's low-level switch.
pub(crate) fn switch_to(
    platform: &dyn Platform,
    cpu: usize,
    prev: Option<&Arc<Thread>>,
    next: &Arc<Thread>,
) {
    if let Some(prev) = prev {
        if !Arc::ptr_eq(prev, next) {
            platform.save_fpu(cpu, &mut prev.fx_state().lock());
        }
    }

    platform.restore_fpu(cpu, &next.fx_state().lock());
    platform.set_tls_base(cpu, next.fs_base());
    platform.set_kernel_stack(cpu, next.kernel_stack_top());

    if let Some(process) = next.process() {
        platform.load_address_space(cpu, process.address_space().page_map().root_frame());
    }

    let frame = next.registers().lock().clone();
    platform.context_switch(cpu, &frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_contexts() {
        let kernel = RegisterContext::kernel_entry(VirtAddr::new(0x1000), VirtAddr::new(0x8000));
        assert_eq!(kernel.rip, 0x1000);
        assert_eq!(kernel.rsp, 0x8000);
        assert!(!kernel.is_user());
        assert_eq!(kernel.rflags & RFLAGS_BASE, RFLAGS_BASE);

        let user = RegisterContext::user_entry(VirtAddr::new(0x1000), VirtAddr::new(0x8000));
        assert!(user.is_user());
    }

    #[test]
    fn test_fx_defaults() {
        let fx = FxState::new();
        assert_eq!(u16::from_le_bytes([fx.0[0], fx.0[1]]), 0x037F);
        assert_eq!(
            u32::from_le_bytes([fx.0[24], fx.0[25], fx.0[26], fx.0[27]]),
            0x1F80
        );
    }
}
