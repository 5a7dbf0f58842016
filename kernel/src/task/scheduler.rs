//! SMP scheduler
//!
//! One circular run queue and one current-thread slot per CPU, each behind
//! its own spinlock, plus a zero-time-slice idle thread per CPU. A broadcast
//! IPI on every tick makes all CPUs reschedule at the same cadence;
//! voluntary yields zero the slice and raise a self-directed IPI into the
//! same path. Cross-CPU teardown is message passing: mark the thread
//! unrunnable, post a quiesce request to the owning CPU's mailbox, and wait
//! for the bounded acknowledgment.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_queue::SegQueue;
use spin::Mutex;

use super::context;
use super::thread::{Thread, ThreadState};
use crate::memory::{MapError, MemoryManager};
use crate::platform::{IpiTarget, IpiVector, Platform};
use crate::process::{Process, ProcessTable};

/// Quiesce retries between re-sent reschedule IPIs
const QUIESCE_RESEND_INTERVAL: u32 = 1024;

/// Result of one pass through `schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The current thread still has slice budget; nothing changed
    Continued,
    /// The run-queue lock was contended; this tick was skipped
    Skipped,
    /// A thread (possibly idle) was installed as current
    Switched,
}

/// Circular list of threads assigned to one CPU. Blocked threads stay in
/// the ring and are skipped during selection.
struct RunQueue {
    threads: VecDeque<Arc<Thread>>,
}

impl RunQueue {
    fn new() -> RunQueue {
        RunQueue {
            threads: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.threads.len()
    }

    fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn push(&mut self, thread: Arc<Thread>) {
        self.threads.push_back(thread);
    }

    fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        let before = self.threads.len();
        self.threads.retain(|t| !Arc::ptr_eq(t, thread));
        before != self.threads.len()
    }

    fn front(&self) -> Option<Arc<Thread>> {
        self.threads.front().cloned()
    }

    fn position(&self, thread: &Arc<Thread>) -> Option<usize> {
        self.threads.iter().position(|t| Arc::ptr_eq(t, thread))
    }

    /// The ring successor of `thread`, or the front if it left the ring
    fn next_after(&self, thread: &Arc<Thread>) -> Option<Arc<Thread>> {
        match self.position(thread) {
            Some(index) => self.threads.get((index + 1) % self.threads.len()).cloned(),
            None => self.front(),
        }
    }

    /// Scan forward from `start` (exclusive), wrapping once, for a thread
    /// that is eligible to run.
    fn scan_runnable_from(&self, start: &Arc<Thread>) -> Option<Arc<Thread>> {
        let len = self.threads.len();
        let begin = self.position(start)?;
        for step in 1..=len {
            let candidate = &self.threads[(begin + step) % len];
            if candidate.state() == ThreadState::Running {
                return Some(candidate.clone());
            }
        }
        None
    }
}

/// Messages delivered to a CPU through its mailbox
enum CpuMessage {
    /// "Confirm this thread is no longer executing here"
    Quiesce {
        thread: Arc<Thread>,
        ack: Arc<AtomicBool>,
    },
}

struct Cpu {
    id: usize,
    run_queue: Mutex<RunQueue>,
    current: Mutex<Option<Arc<Thread>>>,
    idle: Arc<Thread>,
    // Keeps the per-CPU idle process (and its address space) alive
    _idle_process: Arc<Process>,
    mailbox: SegQueue<CpuMessage>,
}

pub struct Scheduler {
    cpus: Vec<Cpu>,
    platform: Arc<dyn Platform>,
}

impl Scheduler {
    /// Bring up per-CPU state: one idle process/thread per CPU, empty run
    /// queues, empty mailboxes.
    pub fn new(
        platform: Arc<dyn Platform>,
        memory: &MemoryManager,
        table: &ProcessTable,
        cpu_count: usize,
    ) -> Result<Scheduler, MapError> {
        assert!(cpu_count > 0);
        let mut cpus = Vec::with_capacity(cpu_count);
        for id in 0..cpu_count {
            let idle_process = Process::create_idle(memory, table, &format!("idle_cpu{}", id))?;
            let idle = idle_process.main_thread();
            cpus.push(Cpu {
                id,
                run_queue: Mutex::new(RunQueue::new()),
                current: Mutex::new(None),
                idle,
                _idle_process: idle_process,
                mailbox: SegQueue::new(),
            });
        }
        log::info!("scheduler initialized for {} cpus", cpu_count);
        Ok(Scheduler { cpus, platform })
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub(crate) fn relax(&self) {
        self.platform.relax();
    }

    /// The thread currently installed on `cpu`
    pub fn current_thread(&self, cpu: usize) -> Option<Arc<Thread>> {
        self.cpus[cpu].current.lock().clone()
    }

    /// The idle thread of `cpu`
    pub fn idle_thread(&self, cpu: usize) -> Arc<Thread> {
        self.cpus[cpu].idle.clone()
    }

    pub fn run_queue_len(&self, cpu: usize) -> usize {
        self.cpus[cpu].run_queue.lock().len()
    }

    /// Place a newly runnable thread on the CPU with the shortest run
    /// queue. Greedy, computed once at insertion.
    pub fn insert_new_thread(&self, thread: Arc<Thread>) {
        let mut target = 0;
        let mut best = usize::MAX;
        for cpu in &self.cpus {
            let len = cpu.run_queue.lock().len();
            if len < best {
                best = len;
                target = cpu.id;
            }
            if best == 0 {
                break;
            }
        }
        log::debug!(
            "thread {} placed on cpu {} (queue length {})",
            thread.tid(),
            target,
            best
        );
        self.cpus[target].run_queue.lock().push(thread);
    }

    /// Timer tick: broadcast a reschedule IPI so every CPU reschedules at
    /// roughly the same cadence, then reschedule locally.
    pub fn tick(&self, cpu: usize) -> ScheduleOutcome {
        self.platform
            .send_ipi(IpiTarget::AllExcept(cpu), IpiVector::Reschedule);
        self.schedule(cpu)
    }

    /// Voluntary yield: zero the slice and raise a self-directed IPI into
    /// the normal schedule path. There is no separate yield path.
    pub fn yield_current(&self, cpu: usize) {
        if let Some(current) = self.current_thread(cpu) {
            current.zero_time_slice();
        }
        self.platform
            .send_ipi(IpiTarget::Cpu(cpu), IpiVector::Reschedule);
    }

    /// One scheduling decision on `cpu`
    pub fn schedule(&self, cpu_id: usize) -> ScheduleOutcome {
        let cpu = &self.cpus[cpu_id];

        // Cheapest path: current thread still has budget. No queue lock.
        if let Some(current) = cpu.current.lock().as_ref() {
            if let Some(process) = current.process() {
                process.add_active_tick();
            }
            if current.time_slice() > 0 {
                current.consume_tick();
                return ScheduleOutcome::Continued;
            }
        }

        // Contended queue: skip this tick rather than block in interrupt
        // context.
        let Some(mut queue) = cpu.run_queue.try_lock() else {
            return ScheduleOutcome::Skipped;
        };

        let mut pending = Vec::new();
        while let Some(message) = cpu.mailbox.pop() {
            pending.push(message);
        }

        let mut current = cpu.current.lock();
        let prev = current.clone();

        let next = if queue.is_empty() || prev.is_none() {
            cpu.idle.clone()
        } else {
            let running = prev.as_ref().unwrap();
            let mut next = if running.state() == ThreadState::Dying {
                queue.remove(running);
                cpu.idle.clone()
            } else if !Arc::ptr_eq(running, &cpu.idle) {
                running.reset_time_slice();
                queue.next_after(running).unwrap_or_else(|| cpu.idle.clone())
            } else {
                queue.front().unwrap_or_else(|| cpu.idle.clone())
            };

            if !Arc::ptr_eq(&next, &cpu.idle) && next.state() != ThreadState::Running {
                next = queue
                    .scan_runnable_from(&next)
                    .unwrap_or_else(|| cpu.idle.clone());
            }
            next
        };

        context::switch_to(&*self.platform, cpu_id, prev.as_ref(), &next);
        *current = Some(next.clone());
        drop(current);
        drop(queue);

        // Acknowledge quiesce requests for anything that is no longer the
        // current thread here.
        for message in pending {
            match message {
                CpuMessage::Quiesce { thread, ack } => {
                    if Arc::ptr_eq(&thread, &next) {
                        cpu.mailbox.push(CpuMessage::Quiesce { thread, ack });
                    } else {
                        ack.store(true, Ordering::Release);
                    }
                }
            }
        }

        ScheduleOutcome::Switched
    }

    /// Remove every thread of `process` from every run queue, except the
    /// caller's own thread which leaves through the Dying path.
    pub(crate) fn purge_process(&self, process: &Process, keep: Option<&Arc<Thread>>) {
        for cpu in &self.cpus {
            let mut queue = cpu.run_queue.lock();
            queue.threads.retain(|t| {
                let keep_this = keep.map_or(false, |k| Arc::ptr_eq(k, t));
                keep_this || !t.belongs_to(process)
            });
        }
    }

    /// Two-phase remote teardown: the thread is already marked unrunnable;
    /// confirm it is not executing on any CPU before the caller proceeds.
    /// No thread object is freed while another CPU might dereference it.
    pub(crate) fn quiesce_thread(&self, thread: &Arc<Thread>) {
        debug_assert!(thread.state() != ThreadState::Running);

        for cpu in &self.cpus {
            cpu.run_queue.lock().remove(thread);
        }

        for cpu in &self.cpus {
            let executing = {
                let current = cpu.current.lock();
                current.as_ref().map_or(false, |c| Arc::ptr_eq(c, thread))
            };
            if !executing {
                continue;
            }

            let ack = Arc::new(AtomicBool::new(false));
            cpu.mailbox.push(CpuMessage::Quiesce {
                thread: thread.clone(),
                ack: ack.clone(),
            });
            self.platform
                .send_ipi(IpiTarget::Cpu(cpu.id), IpiVector::Reschedule);

            let mut attempts: u32 = 0;
            while !ack.load(Ordering::Acquire) {
                self.platform.relax();
                attempts += 1;
                if attempts % QUIESCE_RESEND_INTERVAL == 0 {
                    log::warn!(
                        "thread {} still executing on cpu {} after {} waits",
                        thread.tid(),
                        cpu.id,
                        attempts
                    );
                    self.platform
                        .send_ipi(IpiTarget::Cpu(cpu.id), IpiVector::Reschedule);
                }
            }
        }
    }

    /// Tell every other CPU to stop; used on kernel panic
    pub fn halt_others(&self, cpu: usize) {
        self.platform
            .send_ipi(IpiTarget::AllExcept(cpu), IpiVector::Halt);
    }
}
