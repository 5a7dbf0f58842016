//! Threads and blockers
//!
//! A thread is one schedulable execution context: saved registers, FPU
//! block, kernel stack, TLS base and scheduling fields, plus a non-owning
//! back-reference to its process. Blocking is modeled by the
//! `Running | Blocked | Zombie | Dying` state machine; a thread never runs
//! code while another CPU tears it down.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use spin::Mutex;

use super::context::{FxState, RegisterContext};
use super::scheduler::Scheduler;
use crate::memory::KernelStack;
use crate::process::Process;
use crate::signal::{sig_bit, SIGNAL_MAX};

/// Scheduler ticks a fresh thread runs before being reconsidered
pub const THREAD_TIMESLICE_DEFAULT: u32 = 10;

/// Default priority of user threads
pub const THREAD_PRIORITY_DEFAULT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Eligible to run (possibly currently on a CPU)
    Running = 0,
    /// Waiting on a blocker; skipped by the scheduler
    Blocked = 1,
    /// Coerced out of execution during process teardown
    Zombie = 2,
    /// Actively being killed; removed from its queue on the next pass
    Dying = 3,
}

impl ThreadState {
    fn from_u8(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Running,
            1 => ThreadState::Blocked,
            2 => ThreadState::Zombie,
            _ => ThreadState::Dying,
        }
    }
}

pub struct Thread {
    tid: u64,
    process: Weak<Process>,
    state: AtomicU8,
    time_slice: AtomicU32,
    time_slice_default: AtomicU32,
    priority: AtomicU8,
    fs_base: AtomicU64,
    registers: Mutex<RegisterContext>,
    fx_state: Mutex<FxState>,
    kernel_stack: KernelStack,
    blocker: Mutex<Option<Arc<BlockerCore>>>,
    pending_signals: AtomicU64,
    signal_mask: AtomicU64,
}

impl Thread {
    pub(crate) fn new(process: Weak<Process>, tid: u64, kernel_stack: KernelStack) -> Arc<Thread> {
        let registers =
            RegisterContext::kernel_entry(x86_64::VirtAddr::new(0), kernel_stack.top());
        Arc::new(Thread {
            tid,
            process,
            state: AtomicU8::new(ThreadState::Running as u8),
            time_slice: AtomicU32::new(THREAD_TIMESLICE_DEFAULT),
            time_slice_default: AtomicU32::new(THREAD_TIMESLICE_DEFAULT),
            priority: AtomicU8::new(0),
            fs_base: AtomicU64::new(0),
            registers: Mutex::new(registers),
            fx_state: Mutex::new(FxState::new()),
            kernel_stack,
            blocker: Mutex::new(None),
            pending_signals: AtomicU64::new(0),
            signal_mask: AtomicU64::new(0),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Owning process, unless it is already gone
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn belongs_to(&self, process: &Process) -> bool {
        Weak::as_ptr(&self.process) == process as *const Process
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn time_slice(&self) -> u32 {
        self.time_slice.load(Ordering::Relaxed)
    }

    /// Consume one tick of budget; returns the remaining slice
    pub fn consume_tick(&self) -> u32 {
        let slice = self.time_slice.load(Ordering::Relaxed);
        if slice > 0 {
            self.time_slice.store(slice - 1, Ordering::Relaxed);
            slice - 1
        } else {
            0
        }
    }

    pub fn reset_time_slice(&self) {
        self.time_slice
            .store(self.time_slice_default.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn zero_time_slice(&self) {
        self.time_slice.store(0, Ordering::Relaxed);
    }

    pub fn set_time_slice_default(&self, ticks: u32) {
        self.time_slice_default.store(ticks, Ordering::Relaxed);
        self.time_slice.store(ticks, Ordering::Relaxed);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn fs_base(&self) -> u64 {
        self.fs_base.load(Ordering::Relaxed)
    }

    pub fn set_fs_base(&self, base: u64) {
        self.fs_base.store(base, Ordering::Relaxed);
    }

    pub fn registers(&self) -> &Mutex<RegisterContext> {
        &self.registers
    }

    pub fn fx_state(&self) -> &Mutex<FxState> {
        &self.fx_state
    }

    pub fn kernel_stack_top(&self) -> x86_64::VirtAddr {
        self.kernel_stack.top()
    }

    pub(crate) fn current_blocker(&self) -> Option<Arc<BlockerCore>> {
        self.blocker.lock().clone()
    }

    pub(crate) fn install_blocker(&self, core: Option<Arc<BlockerCore>>) {
        *self.blocker.lock() = core;
    }

    /// Block on a caller-owned blocker and yield. Returns whether the wait
    /// was interrupted (process kill, signal) rather than unblocked.
    ///
    /// Resumption happens through the normal scheduling path; this only
    /// spins until the state machine says the thread is eligible again.
    pub fn block_on(self: Arc<Self>, blocker: &Blocker, sched: &Scheduler, cpu: usize) -> bool {
        let core = blocker.core();
        core.attach(&self);
        self.install_blocker(Some(core.clone()));

        if core.should_block() {
            self.set_state(ThreadState::Blocked);
            sched.yield_current(cpu);
            while self.state() == ThreadState::Blocked {
                core::hint::spin_loop();
            }
        }

        self.install_blocker(None);
        core.detach();
        core.was_interrupted()
    }

    /// Dispatch a signal to this thread. A blocked thread is interrupted so
    /// its wait observes the signal instead of hanging.
    pub fn signal(&self, signal: u8) {
        assert!((signal as usize) < SIGNAL_MAX);
        self.pending_signals.fetch_or(sig_bit(signal), Ordering::AcqRel);

        let masked = self.signal_mask.load(Ordering::Acquire) & sig_bit(signal) != 0;
        if !masked && self.state() == ThreadState::Blocked {
            if let Some(blocker) = self.current_blocker() {
                blocker.interrupt();
            }
        }
    }

    pub fn pending_signals(&self) -> u64 {
        self.pending_signals.load(Ordering::Acquire)
    }

    pub fn set_signal_mask(&self, mask: u64) {
        self.signal_mask.store(mask, Ordering::Release);
    }
}

/// Shared core of a blocker. The caller-facing `Blocker` lives on the
/// waiter's stack; the core is reference-counted so wait structures and
/// killers can signal it without any use-after-free window.
pub struct BlockerCore {
    thread: Mutex<Option<Arc<Thread>>>,
    should_block: AtomicBool,
    interrupted: AtomicBool,
}

impl BlockerCore {
    fn new() -> Arc<BlockerCore> {
        Arc::new(BlockerCore {
            thread: Mutex::new(None),
            should_block: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
        })
    }

    fn attach(&self, thread: &Arc<Thread>) {
        *self.thread.lock() = Some(thread.clone());
    }

    fn detach(&self) {
        *self.thread.lock() = None;
    }

    pub fn should_block(&self) -> bool {
        self.should_block.load(Ordering::Acquire)
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Make the waiter eligible again. If the waiter has not blocked yet,
    /// this turns the upcoming block into a no-op.
    pub fn unblock(&self) {
        self.should_block.store(false, Ordering::Release);
        let thread = self.thread.lock();
        if let Some(thread) = thread.as_ref() {
            if thread.state() == ThreadState::Blocked {
                thread.set_state(ThreadState::Running);
            }
        }
    }

    /// Abort the wait, e.g. because the process is being killed
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.unblock();
    }
}

/// Caller-owned handle to a wait; short-lived and typically stack-allocated
pub struct Blocker {
    core: Arc<BlockerCore>,
}

impl Blocker {
    pub fn new() -> Blocker {
        Blocker {
            core: BlockerCore::new(),
        }
    }

    pub fn core(&self) -> &Arc<BlockerCore> {
        &self.core
    }

    pub fn unblock(&self) {
        self.core.unblock();
    }

    pub fn interrupt(&self) {
        self.core.interrupt();
    }

    pub fn was_interrupted(&self) -> bool {
        self.core.was_interrupted()
    }
}

impl Default for Blocker {
    fn default() -> Self {
        Self::new()
    }
}
