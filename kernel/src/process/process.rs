//! Process structure and lifecycle
//!
//! A process is a protection domain: address space, handle table, thread
//! list, signal table and the `Running -> Dying -> Dead` state machine.
//! Dying is synchronous: by the time the state advances to Dead, no thread
//! of the process executes on any CPU. A dead process stays reachable (and
//! its memory allocated) until the parent retrieves the exit status.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use spin::{Mutex, RwLock};
use x86_64::VirtAddr;

use crate::memory::address_space::AddressSpace;
use crate::memory::layout::{align_up, PAGE_SIZE_4K};
use crate::memory::{MapError, MemoryManager};
use crate::object::{Handle, HandleTable, KernelObject, KernelObjectWatcher, KoClass};
use crate::signal::{SignalAction, SIGCHLD, SIGNAL_MAX, SIGNAL_TRAMPOLINE};
use crate::syscall::errno::Errno;
use crate::task::context::RegisterContext;
use crate::task::scheduler::Scheduler;
use crate::task::thread::{Thread, ThreadState, THREAD_PRIORITY_DEFAULT, THREAD_TIMESLICE_DEFAULT};

use super::manager::ProcessTable;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn new(id: u64) -> Self {
        ProcessId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle states; transitions are monotonic and Dead is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Running = 0,
    Dying = 1,
    Dead = 3,
}

impl ProcessState {
    fn from_u8(value: u8) -> ProcessState {
        match value {
            0 => ProcessState::Running,
            1 => ProcessState::Dying,
            _ => ProcessState::Dead,
        }
    }
}

pub struct Process {
    pid: ProcessId,
    name: Mutex<String>,
    working_dir: Mutex<String>,
    is_idle: bool,
    /// Back-reference handed to threads and children
    self_ref: Weak<Process>,

    state: AtomicU8,
    started: AtomicBool,
    exit_code: AtomicI64,
    active_ticks: AtomicU64,

    /// Swappable so exec can replace the image while threads mid-fault on
    /// other CPUs keep the old space alive through their own `Arc`.
    address_space: RwLock<Arc<AddressSpace>>,

    next_tid: AtomicU64,
    main_thread: Arc<Thread>,
    threads: Mutex<Vec<Arc<Thread>>>,

    parent: Mutex<Weak<Process>>,
    children: Mutex<Vec<Arc<Process>>>,

    handles: Mutex<HandleTable>,
    signal_actions: Mutex<[SignalAction; SIGNAL_MAX]>,
    watchers: Mutex<Vec<Arc<crate::task::thread::BlockerCore>>>,

    signal_trampoline: Mutex<Option<VirtAddr>>,
}

impl Process {
    fn build(
        memory: &MemoryManager,
        pid: ProcessId,
        name: &str,
        working_dir: &str,
        parent: Weak<Process>,
        space: AddressSpace,
        is_idle: bool,
    ) -> Arc<Process> {
        let kernel_stack = memory.allocate_kernel_stack();
        Arc::new_cyclic(|weak: &Weak<Process>| {
            let main_thread = Thread::new(weak.clone(), 1, kernel_stack);
            Process {
                pid,
                name: Mutex::new(String::from(name)),
                working_dir: Mutex::new(String::from(working_dir)),
                is_idle,
                self_ref: weak.clone(),
                state: AtomicU8::new(ProcessState::Running as u8),
                started: AtomicBool::new(false),
                exit_code: AtomicI64::new(0),
                active_ticks: AtomicU64::new(0),
                address_space: RwLock::new(Arc::new(space)),
                next_tid: AtomicU64::new(2),
                main_thread: main_thread.clone(),
                threads: Mutex::new(alloc::vec![main_thread]),
                parent: Mutex::new(parent),
                children: Mutex::new(Vec::new()),
                handles: Mutex::new(HandleTable::new()),
                signal_actions: Mutex::new(SignalAction::default_table()),
                watchers: Mutex::new(Vec::new()),
                signal_trampoline: Mutex::new(None),
            }
        })
    }

    /// The per-CPU idle process: always eligible, zero time slice, never
    /// prioritized over real work.
    pub fn create_idle(
        memory: &MemoryManager,
        table: &ProcessTable,
        name: &str,
    ) -> Result<Arc<Process>, MapError> {
        let space = memory.create_address_space()?;
        let process = Process::build(memory, table.next_pid(), name, "/", Weak::new(), space, true);
        process.main_thread.set_time_slice_default(0);
        table.register(process.clone());
        Ok(process)
    }

    /// A kernel-mode process with its main thread entering at `entry`
    pub fn create_kernel(
        memory: &MemoryManager,
        table: &ProcessTable,
        name: &str,
        entry: VirtAddr,
        parent: Option<&Arc<Process>>,
    ) -> Result<Arc<Process>, MapError> {
        let space = memory.create_address_space()?;
        let parent_ref = parent.map_or_else(Weak::new, Arc::downgrade);
        let process = Process::build(memory, table.next_pid(), name, "/", parent_ref, space, false);
        *process.main_thread.registers().lock() =
            RegisterContext::kernel_entry(entry, process.main_thread.kernel_stack_top());
        if let Some(parent) = parent {
            parent.children.lock().push(process.clone());
        }
        table.register(process.clone());
        Ok(process)
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    pub fn working_dir(&self) -> String {
        self.working_dir.lock().clone()
    }

    pub fn set_working_dir(&self, dir: &str) {
        *self.working_dir.lock() = String::from(dir);
    }

    pub fn is_idle_process(&self) -> bool {
        self.is_idle
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_dead(&self) -> bool {
        self.state() == ProcessState::Dead
    }

    /// Running -> Dying, exactly once. Losing the race makes `die`
    /// idempotent.
    fn begin_dying(&self) -> bool {
        self.state
            .compare_exchange(
                ProcessState::Running as u8,
                ProcessState::Dying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish_dead(&self) {
        debug_assert_eq!(self.state(), ProcessState::Dying);
        self.state.store(ProcessState::Dead as u8, Ordering::Release);
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: i64) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn add_active_tick(&self) {
        self.active_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_ticks(&self) -> u64 {
        self.active_ticks.load(Ordering::Relaxed)
    }

    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.address_space.read().clone()
    }

    pub(crate) fn replace_address_space(&self, space: Arc<AddressSpace>) {
        *self.address_space.write() = space;
    }

    pub fn main_thread(&self) -> Arc<Thread> {
        self.main_thread.clone()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    pub fn thread_by_tid(&self, tid: u64) -> Option<Arc<Thread>> {
        self.threads.lock().iter().find(|t| t.tid() == tid).cloned()
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Process>) {
        *self.parent.lock() = parent;
    }

    pub fn children(&self) -> Vec<Arc<Process>> {
        self.children.lock().clone()
    }

    pub fn find_child_by_pid(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.children.lock().iter().find(|c| c.pid() == pid).cloned()
    }

    pub fn handles(&self) -> &Mutex<HandleTable> {
        &self.handles
    }

    pub fn signal_action(&self, signal: u8) -> SignalAction {
        self.signal_actions.lock()[signal as usize]
    }

    pub fn set_signal_action(&self, signal: u8, action: SignalAction) {
        self.signal_actions.lock()[signal as usize] = action;
    }

    pub(crate) fn reset_signal_actions(&self) {
        *self.signal_actions.lock() = SignalAction::default_table();
    }

    pub fn signal_trampoline(&self) -> Option<VirtAddr> {
        *self.signal_trampoline.lock()
    }

    /// Queue the main thread for its first scheduling
    pub fn start(&self, sched: &Scheduler) {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "process started twice"
        );
        sched.insert_new_thread(self.main_thread.clone());
    }

    /// Add a thread sharing this address space; independent kernel stack
    /// and FPU state, queued directly on the shortest-queue CPU.
    pub fn create_child_thread(
        &self,
        memory: &MemoryManager,
        sched: &Scheduler,
        entry: VirtAddr,
        stack: VirtAddr,
        user_mode: bool,
    ) -> u64 {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let kernel_stack = memory.allocate_kernel_stack();
        let thread = Thread::new(self.self_ref.clone(), tid, kernel_stack);
        *thread.registers().lock() = if user_mode {
            RegisterContext::user_entry(entry, stack)
        } else {
            RegisterContext::kernel_entry(entry, stack)
        };
        thread.set_time_slice_default(THREAD_TIMESLICE_DEFAULT);
        thread.set_priority(THREAD_PRIORITY_DEFAULT);

        self.threads.lock().push(thread.clone());
        sched.insert_new_thread(thread);
        tid
    }

    /// Clone this process: COW address space, duplicated handle table,
    /// inherited signal actions and working directory. The child is not
    /// queued until `start` is called.
    pub fn fork(
        &self,
        memory: &MemoryManager,
        table: &ProcessTable,
    ) -> Result<Arc<Process>, MapError> {
        let space = self.address_space().fork()?;
        let child = Process::build(
            memory,
            table.next_pid(),
            &self.name(),
            &self.working_dir(),
            self.self_ref.clone(),
            space,
            false,
        );
        child.main_thread.set_time_slice_default(THREAD_TIMESLICE_DEFAULT);
        child.main_thread.set_priority(THREAD_PRIORITY_DEFAULT);

        *child.handles.lock() = self.handles.lock().duplicate();
        *child.signal_actions.lock() = *self.signal_actions.lock();
        *child.signal_trampoline.lock() = *self.signal_trampoline.lock();

        self.children.lock().push(child.clone());
        table.register(child.clone());
        log::debug!(
            "process {} forked into {}",
            self.pid.as_u64(),
            child.pid.as_u64()
        );
        Ok(child)
    }

    /// Map the signal-return trampoline into the address space
    pub fn map_signal_trampoline(&self) -> Result<(), MapError> {
        let space = self.address_space();
        let len = align_up(SIGNAL_TRAMPOLINE.len() as u64, PAGE_SIZE_4K) as usize;
        let object = Arc::new(crate::memory::vm_object::VmObject::prefilled(
            space.page_map().arena().clone(),
            len,
        )?);
        let region = space.map_object(object, None, false)?;
        space.write_user(region.base(), SIGNAL_TRAMPOLINE)?;
        *self.signal_trampoline.lock() = Some(region.base());
        Ok(())
    }

    /// Kill this process. Idempotent; only the Running -> Dying winner
    /// performs teardown. When this returns, the state is Dead, no thread
    /// of the process executes on any CPU, handles are released and the
    /// parent (if alive) got SIGCHLD. The process object itself stays
    /// parked until `waitpid`/`destroy` retires it.
    pub fn die(&self, sched: &Scheduler, table: &ProcessTable, cpu: usize) {
        if !self.begin_dying() {
            // Already dying on another path; a second kill must not tear
            // down twice.
            return;
        }
        log::debug!("killing process {} (pid {})", self.name(), self.pid.as_u64());

        let caller = sched
            .current_thread(cpu)
            .filter(|t| t.belongs_to(self));

        // Coerce every other thread out of execution. Interrupting the
        // blocker first lets in-flight waits observe death instead of
        // hanging.
        let threads = self.threads();
        for thread in &threads {
            if caller.as_ref().map_or(false, |c| Arc::ptr_eq(c, thread)) {
                continue;
            }
            if let Some(blocker) = thread.current_blocker() {
                blocker.interrupt();
            }
            thread.set_state(ThreadState::Zombie);
            thread.set_time_slice_default(0);
        }

        // Children: kill running ones, wait out dying ones, detach all.
        loop {
            let child = { self.children.lock().first().cloned() };
            let Some(child) = child else { break };
            match child.state() {
                ProcessState::Running => child.die(sched, table, cpu),
                ProcessState::Dying => {
                    while child.state() != ProcessState::Dead {
                        sched.relax();
                    }
                }
                ProcessState::Dead => {}
            }
            child.set_parent(Weak::new());
            self.children.lock().retain(|c| c.pid() != child.pid());
        }

        // Unlink from every run queue, then confirm no other CPU is still
        // executing one of our threads.
        sched.purge_process(self, caller.as_ref());
        for thread in &threads {
            if caller.as_ref().map_or(false, |c| Arc::ptr_eq(c, thread)) {
                continue;
            }
            sched.quiesce_thread(thread);
        }

        // No thread of this process executes anywhere anymore.
        self.finish_dead();

        // Release handles and fds.
        let handles = { self.handles.lock().drain() };
        for handle in handles {
            handle.object.destroy();
        }

        // Wake watchers (waitpid observers).
        for watcher in self.watchers.lock().drain(..) {
            watcher.unblock();
        }

        if let Some(parent) = self.parent() {
            if parent.state() == ProcessState::Running {
                parent.main_thread().signal(SIGCHLD);
            }
        }

        table.mark_for_destruction(self);

        // If the caller belongs to this process, it leaves through the
        // Dying path of the scheduler.
        if let Some(caller) = caller {
            caller.set_state(ThreadState::Dying);
            sched.yield_current(cpu);
        }
    }

    /// Remove the first dead child, detaching it from this process
    pub fn remove_dead_child(&self) -> Option<Arc<Process>> {
        let mut children = self.children.lock();
        let index = children.iter().position(|c| c.is_dead())?;
        let child = children.remove(index);
        child.set_parent(Weak::new());
        Some(child)
    }

    /// Remove a specific dead child
    pub fn remove_dead_child_by_pid(&self, pid: ProcessId) -> Option<Arc<Process>> {
        let mut children = self.children.lock();
        let index = children
            .iter()
            .position(|c| c.pid() == pid && c.is_dead())?;
        let child = children.remove(index);
        child.set_parent(Weak::new());
        Some(child)
    }

    /// Insert a kernel object into the handle table, returning the opaque
    /// handle userspace refers to it by
    pub fn add_handle(&self, handle: Handle) -> usize {
        self.handles.lock().insert(handle)
    }

    /// Wait for a child (any, or a specific PID) to die and reap it:
    /// detach it from this process and drop the table's parked reference,
    /// which is what finally frees the child. Completion is only observed
    /// once the child's state is Dead.
    pub fn wait_for_child(
        &self,
        pid: Option<ProcessId>,
        sched: &Scheduler,
        table: &ProcessTable,
        cpu: usize,
    ) -> Result<(ProcessId, i64), Errno> {
        loop {
            let reaped = match pid {
                Some(pid) => {
                    if self.find_child_by_pid(pid).is_none() {
                        return Err(Errno::NoChild);
                    }
                    self.remove_dead_child_by_pid(pid)
                }
                None => {
                    if self.children.lock().is_empty() {
                        return Err(Errno::NoChild);
                    }
                    self.remove_dead_child()
                }
            };
            if let Some(child) = reaped {
                debug_assert!(child.is_dead());
                let result = (child.pid(), child.exit_code());
                table.release(child.pid());
                return Ok(result);
            }

            // Nothing dead yet: watch the candidates and block. The
            // watcher unhooks itself from every watched process when it
            // goes out of scope.
            let watcher = KernelObjectWatcher::new();
            match pid {
                Some(pid) => {
                    let child = self.find_child_by_pid(pid).ok_or(Errno::NoChild)?;
                    watcher.watch(child);
                }
                None => {
                    for child in self.children() {
                        watcher.watch(child);
                    }
                }
            }

            let Some(current) = sched.current_thread(cpu).filter(|t| t.belongs_to(self)) else {
                // No thread context to block in; report an interrupted wait
                return Err(Errno::Interrupted);
            };
            if watcher.wait(&current, sched, cpu) {
                return Err(Errno::Interrupted);
            }
        }
    }

    /// The `Destroy` operation of the process object: make sure it is dead,
    /// detach it from its parent and drop the parked reference. After this
    /// the process object (address space included) is freed as the last
    /// `Arc` goes away.
    pub fn destroy(&self, sched: &Scheduler, table: &ProcessTable, cpu: usize) {
        if !self.is_dead() {
            self.die(sched, table, cpu);
        }
        if let Some(parent) = self.parent() {
            parent.children.lock().retain(|c| c.pid() != self.pid);
            self.set_parent(Weak::new());
        }
        table.release(self.pid);
    }
}

impl KernelObject for Process {
    fn class(&self) -> KoClass {
        KoClass::Process
    }

    fn watch(&self, watcher: &Arc<crate::task::thread::BlockerCore>, _events: u32) {
        let mut watchers = self.watchers.lock();
        if self.is_dead() {
            // Already dead: signal immediately
            watcher.unblock();
            return;
        }
        watchers.push(watcher.clone());
    }

    fn unwatch(&self, watcher: &Arc<crate::task::thread::BlockerCore>) {
        self.watchers
            .lock()
            .retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn destroy(&self) {
        // Handle-table teardown path: children are already dead by the time
        // their handles are closed, so only the parent link is undone here.
        // Live processes are killed through `die`, which needs the
        // scheduler context.
        if !self.is_dead() {
            log::warn!(
                "destroy on live process {} ignored; kill it first",
                self.pid.as_u64()
            );
            return;
        }
        if let Some(parent) = self.parent() {
            parent.children.lock().retain(|c| c.pid() != self.pid);
            self.set_parent(Weak::new());
        }
    }
}
