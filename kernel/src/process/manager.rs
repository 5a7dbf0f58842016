//! Process table
//!
//! PID allocation, registration and lookup, plus the parking list for dead
//! processes. A dead process moves to the parking list during teardown and
//! is only released once the parent retrieves its exit status, decoupling
//! termination from reclamation.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::process::{Process, ProcessId};

pub struct ProcessTable {
    processes: Mutex<Vec<Arc<Process>>>,
    destroyed: Mutex<Vec<Arc<Process>>>,
    next_pid: AtomicU64,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            processes: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            next_pid: AtomicU64::new(1),
        }
    }

    pub fn next_pid(&self) -> ProcessId {
        ProcessId::new(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, process: Arc<Process>) {
        self.processes.lock().push(process);
    }

    pub fn find_by_pid(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes
            .lock()
            .iter()
            .find(|p| p.pid() == pid)
            .cloned()
    }

    /// Smallest registered PID greater than `pid`; used to iterate the
    /// process list without holding its lock.
    pub fn next_process_pid(&self, pid: ProcessId) -> Option<ProcessId> {
        self.processes
            .lock()
            .iter()
            .map(|p| p.pid())
            .filter(|p| *p > pid)
            .min()
    }

    /// Move a dead process to the parking list so it stays reachable until
    /// the parent reaps it.
    pub fn mark_for_destruction(&self, process: &Process) {
        let mut processes = self.processes.lock();
        let mut destroyed = self.destroyed.lock();
        match processes.iter().position(|p| p.pid() == process.pid()) {
            Some(index) => {
                let parked = processes.remove(index);
                destroyed.push(parked);
            }
            None => log::warn!(
                "process {} was not registered at destruction",
                process.pid().as_u64()
            ),
        }
    }

    /// Drop the parked reference; with the parent link gone this frees the
    /// process and its memory.
    pub fn release(&self, pid: ProcessId) {
        self.destroyed.lock().retain(|p| p.pid() != pid);
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.lock().len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
