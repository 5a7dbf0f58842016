//! POSIX-style signals
//!
//! Per-process action table plus per-thread pending/mask bitmaps. Only the
//! kernel-side semantics are modeled: delivery bookkeeping, default
//! dispositions, and the trampoline mapping set up at process creation.

use x86_64::VirtAddr;

/// Number of signal slots in the action table
pub const SIGNAL_MAX: usize = 32;

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGKILL: u8 = 9;
pub const SIGSEGV: u8 = 11;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGURG: u8 = 23;
pub const SIGWINCH: u8 = 28;

/// Bit for `signal` in a pending/mask bitmap
pub fn sig_bit(signal: u8) -> u64 {
    1u64 << signal
}

/// What a delivered signal does when the action table says `Default`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Terminate,
    Ignore,
}

pub fn default_disposition(signal: u8) -> Disposition {
    match signal {
        SIGCHLD | SIGCONT | SIGURG | SIGWINCH => Disposition::Ignore,
        _ => Disposition::Terminate,
    }
}

/// One entry of the per-process signal table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Default,
    Ignore,
    Handler {
        entry: VirtAddr,
        flags: u32,
        mask: u64,
    },
}

impl SignalAction {
    pub const fn default_table() -> [SignalAction; SIGNAL_MAX] {
        [SignalAction::Default; SIGNAL_MAX]
    }
}

/// Code mapped into every user process for returning from a signal
/// handler: `mov rax, SYS_rt_sigreturn; int 0x80`.
pub const SIGNAL_TRAMPOLINE: &[u8] = &[0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0xcd, 0x80];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dispositions() {
        assert_eq!(default_disposition(SIGKILL), Disposition::Terminate);
        assert_eq!(default_disposition(SIGSEGV), Disposition::Terminate);
        assert_eq!(default_disposition(SIGCHLD), Disposition::Ignore);
    }

    #[test]
    fn test_sig_bits_are_distinct() {
        assert_ne!(sig_bit(SIGKILL), sig_bit(SIGTERM));
        assert_eq!(sig_bit(SIGKILL), 1 << 9);
    }
}
