//! Kernel objects, handles and watchers
//!
//! Everything a process can hold a handle to implements `KernelObject`.
//! Handles are reference-counted pointers plus a close-on-exec flag; the
//! per-process `HandleTable` reserves entries 0 through 2 for stdio.
//! `KernelObjectWatcher` is the blocker-backed waiter used by `waitpid`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::task::scheduler::Scheduler;
use crate::task::thread::{Blocker, BlockerCore, Thread};

/// Handle slots reserved for stdin, stdout and stderr
pub const STDIO_HANDLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KoClass {
    Process,
    File,
}

pub trait KernelObject: Send + Sync {
    fn class(&self) -> KoClass;

    /// Register a watcher to be signalled on state change (e.g. death).
    /// The events mask is currently unused.
    fn watch(&self, _watcher: &Arc<BlockerCore>, _events: u32) {}

    fn unwatch(&self, _watcher: &Arc<BlockerCore>) {}

    /// Release the object's resources; called when the last handle closes
    /// during teardown.
    fn destroy(&self) {}
}

/// A reference-counted pointer into the handle table
#[derive(Clone)]
pub struct Handle {
    pub object: Arc<dyn KernelObject>,
    pub close_on_exec: bool,
}

impl Handle {
    pub fn new(object: Arc<dyn KernelObject>) -> Handle {
        Handle {
            object,
            close_on_exec: false,
        }
    }
}

/// Per-process table of handles. Entry `i` is the opaque integer userspace
/// sees; raw pointers never cross the boundary.
pub struct HandleTable {
    entries: Vec<Option<Handle>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        let mut entries = Vec::new();
        entries.resize_with(STDIO_HANDLES, || None);
        HandleTable { entries }
    }

    /// Insert at the lowest free slot
    pub fn insert(&mut self, handle: Handle) -> usize {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(handle);
                return index;
            }
        }
        self.entries.push(Some(handle));
        self.entries.len() - 1
    }

    /// Install a handle at a specific slot (stdio setup, dup2)
    pub fn set(&mut self, index: usize, handle: Handle) {
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        self.entries[index] = Some(handle);
    }

    pub fn get(&self, index: usize) -> Option<Handle> {
        self.entries.get(index).and_then(|e| e.clone())
    }

    pub fn remove(&mut self, index: usize) -> Option<Handle> {
        self.entries.get_mut(index).and_then(|e| e.take())
    }

    /// Number of slots, including closed ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    /// Drop every handle marked close-on-exec; the exec path calls this
    /// after the new image is committed.
    pub fn close_exec(&mut self) {
        for entry in self.entries.iter_mut() {
            if entry.as_ref().map_or(false, |h| h.close_on_exec) {
                *entry = None;
            }
        }
    }

    /// Take every live handle out of the table (process teardown)
    pub fn drain(&mut self) -> Vec<Handle> {
        let mut handles = Vec::new();
        for entry in self.entries.iter_mut() {
            if let Some(handle) = entry.take() {
                handles.push(handle);
            }
        }
        handles
    }

    /// Duplicate the table for fork; close-on-exec flags are preserved
    pub fn duplicate(&self) -> HandleTable {
        HandleTable {
            entries: self.entries.clone(),
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for any of a set of kernel objects to signal. The wait core is
/// shared with the watched objects; dropping the watcher unhooks it from
/// every object under that object's own lock.
pub struct KernelObjectWatcher {
    blocker: Blocker,
    watched: Mutex<Vec<Arc<dyn KernelObject>>>,
}

impl KernelObjectWatcher {
    pub fn new() -> KernelObjectWatcher {
        KernelObjectWatcher {
            blocker: Blocker::new(),
            watched: Mutex::new(Vec::new()),
        }
    }

    pub fn watch(&self, object: Arc<dyn KernelObject>) {
        object.watch(self.blocker.core(), 0);
        self.watched.lock().push(object);
    }

    /// Block the calling thread until one of the watched objects signals.
    /// Returns whether the wait was interrupted.
    pub fn wait(&self, thread: &Arc<Thread>, sched: &Scheduler, cpu: usize) -> bool {
        thread.clone().block_on(&self.blocker, sched, cpu)
    }

    pub fn was_signalled(&self) -> bool {
        !self.blocker.core().should_block()
    }
}

impl Default for KernelObjectWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KernelObjectWatcher {
    fn drop(&mut self) {
        for object in self.watched.lock().drain(..) {
            object.unwatch(self.blocker.core());
        }
    }
}
