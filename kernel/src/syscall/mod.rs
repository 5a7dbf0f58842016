//! System call surface
//!
//! Entry points take and return plain data; only opaque integers (handles,
//! PIDs, addresses) cross the boundary. User pointers are validated against
//! the caller's address space and surface as `Errno::Fault`, never as a raw
//! fault. Numbers follow the x86_64 Linux convention.

pub mod errno;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::memory::address_space::AddressSpace;
use crate::memory::layout::{align_up, PAGE_SIZE_4K};
use crate::process::{Process, ProcessId};
use crate::signal::{default_disposition, Disposition, SignalAction, SIGKILL, SIGNAL_MAX};
use crate::task::context::RegisterContext;
use crate::Kernel;
use errno::Errno;

/// Longest C string accepted from user memory
const MAX_USER_STRING: usize = 4096;
/// Longest argv/envp vector accepted from user memory
const MAX_USER_VECTOR: usize = 256;

/// mmap flag: fail instead of relocating when the range is taken
pub const MAP_FIXED: u64 = 0x10;
/// mmap flag: anonymous memory, no file backing
pub const MAP_ANONYMOUS: u64 = 0x20;

/// System call numbers (x86_64 Linux convention)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Mmap = 9,
    Munmap = 11,
    Sigaction = 13,
    Yield = 24,
    Getpid = 39,
    Fork = 57,
    Execve = 59,
    Exit = 60,
    Waitpid = 61,
    Kill = 62,
}

impl SyscallNumber {
    pub fn from_u64(value: u64) -> Option<SyscallNumber> {
        match value {
            9 => Some(Self::Mmap),
            11 => Some(Self::Munmap),
            13 => Some(Self::Sigaction),
            24 => Some(Self::Yield),
            39 => Some(Self::Getpid),
            57 => Some(Self::Fork),
            59 => Some(Self::Execve),
            60 => Some(Self::Exit),
            61 => Some(Self::Waitpid),
            62 => Some(Self::Kill),
            _ => None,
        }
    }
}

impl Kernel {
    /// Dispatch a system call issued by the current thread of `cpu`
    pub fn syscall(&self, cpu: usize, number: u64, args: [u64; 6]) -> i64 {
        let result = match SyscallNumber::from_u64(number) {
            Some(SyscallNumber::Mmap) => self.sys_mmap(cpu, args[0], args[1], args[3]),
            Some(SyscallNumber::Munmap) => self.sys_munmap(cpu, args[0], args[1]),
            Some(SyscallNumber::Sigaction) => {
                self.sys_sigaction(cpu, args[0], args[1], args[2], args[3])
            }
            Some(SyscallNumber::Yield) => self.sys_yield(cpu),
            Some(SyscallNumber::Getpid) => self.sys_getpid(cpu),
            Some(SyscallNumber::Fork) => self.sys_fork(cpu),
            Some(SyscallNumber::Execve) => self.sys_execve(cpu, args[0], args[1], args[2]),
            Some(SyscallNumber::Exit) => self.sys_exit(cpu, args[0]),
            Some(SyscallNumber::Waitpid) => self.sys_waitpid(cpu, args[0] as i64, args[1]),
            Some(SyscallNumber::Kill) => self.sys_kill(cpu, args[0] as i64, args[1]),
            None => {
                log::warn!("unknown syscall {}", number);
                Err(Errno::NoSys)
            }
        };
        match result {
            Ok(value) => value as i64,
            Err(errno) => errno.as_return_value(),
        }
    }

    fn current_process(&self, cpu: usize) -> Result<Arc<Process>, Errno> {
        self.sched
            .current_thread(cpu)
            .and_then(|t| t.process())
            .ok_or(Errno::NoSuchProcess)
    }

    fn sys_yield(&self, cpu: usize) -> Result<u64, Errno> {
        self.sched.yield_current(cpu);
        Ok(0)
    }

    fn sys_getpid(&self, cpu: usize) -> Result<u64, Errno> {
        Ok(self.current_process(cpu)?.pid().as_u64())
    }

    /// Clone the calling process. The child resumes from the same register
    /// context with rax = 0; the parent gets the child's PID.
    fn sys_fork(&self, cpu: usize) -> Result<u64, Errno> {
        let process = self.current_process(cpu)?;
        let caller = self
            .sched
            .current_thread(cpu)
            .ok_or(Errno::NoSuchProcess)?;

        let child = process.fork(&self.memory, &self.processes)?;
        {
            let child_thread = child.main_thread();
            let mut child_registers = child_thread.registers().lock();
            *child_registers = caller.registers().lock().clone();
            child_registers.rax = 0;
        }
        child.start(&self.sched);
        Ok(child.pid().as_u64())
    }

    /// Replace the calling process's image. The caller is untouched until
    /// the new image is fully built; any failure surfaces as an error
    /// instead of a half-replaced process.
    fn sys_execve(
        &self,
        cpu: usize,
        path_ptr: u64,
        argv_ptr: u64,
        envp_ptr: u64,
    ) -> Result<u64, Errno> {
        let process = self.current_process(cpu)?;
        let old_space = process.address_space();

        let path = read_user_cstring(&old_space, path_ptr)?;
        let argv = read_user_string_vec(&old_space, argv_ptr)?;
        let envp = read_user_string_vec(&old_space, envp_ptr)?;

        let node = self.vfs.resolve(&path).ok_or(Errno::NoEntry)?;
        let image = crate::fs::read_all(&node)?;
        if !self.elf.verify(&image) {
            return Err(Errno::NotExecutable);
        }

        let new_space = Arc::new(self.memory.create_address_space()?);
        let user = self.build_user_image(&new_space, &image, &argv, &envp, Some(&path))?;

        // Point of no return: commit the new image.
        process.replace_address_space(new_space);
        process.set_name(argv.first().map(String::as_str).unwrap_or(&path));
        process.reset_signal_actions();
        process.handles().lock().close_exec();
        process.map_signal_trampoline()?;

        let thread = process.main_thread();
        *thread.registers().lock() = RegisterContext::user_entry(user.entry, user.stack_pointer);
        thread.set_fs_base(0);
        Ok(0)
    }

    fn sys_exit(&self, cpu: usize, code: u64) -> Result<u64, Errno> {
        let process = self.current_process(cpu)?;
        process.set_exit_code(code as i64);
        process.die(&self.sched, &self.processes, cpu);
        Ok(0)
    }

    fn sys_waitpid(&self, cpu: usize, pid: i64, status_ptr: u64) -> Result<u64, Errno> {
        let process = self.current_process(cpu)?;
        let target = match pid {
            p if p > 0 => Some(ProcessId::new(p as u64)),
            0 | -1 => None,
            _ => return Err(Errno::InvalidArgument),
        };

        let (child, exit_code) =
            process.wait_for_child(target, &self.sched, &self.processes, cpu)?;
        if status_ptr != 0 {
            let space = process.address_space();
            space
                .write_user(user_addr(status_ptr)?, &(exit_code as i32).to_le_bytes())
                .map_err(|_| Errno::Fault)?;
        }
        Ok(child.as_u64())
    }

    fn sys_mmap(&self, cpu: usize, addr: u64, len: u64, flags: u64) -> Result<u64, Errno> {
        if len == 0 {
            return Err(Errno::InvalidArgument);
        }
        if flags & MAP_ANONYMOUS == 0 {
            // File mappings stay behind the filesystem boundary
            return Err(Errno::NoSys);
        }
        let process = self.current_process(cpu)?;
        let space = process.address_space();

        let at = if addr != 0 {
            Some(user_addr(addr)?)
        } else {
            None
        };
        let len = align_up(len, PAGE_SIZE_4K) as usize;
        let region = space.allocate_anonymous(len, at, flags & MAP_FIXED != 0)?;
        Ok(region.base().as_u64())
    }

    fn sys_munmap(&self, cpu: usize, addr: u64, len: u64) -> Result<u64, Errno> {
        let process = self.current_process(cpu)?;
        let space = process.address_space();
        space.unmap(user_addr(addr)?, len as usize)?;
        Ok(0)
    }

    fn sys_sigaction(
        &self,
        cpu: usize,
        signal: u64,
        handler: u64,
        flags: u64,
        mask: u64,
    ) -> Result<u64, Errno> {
        let process = self.current_process(cpu)?;
        if signal as usize >= SIGNAL_MAX || signal as u8 == SIGKILL {
            return Err(Errno::InvalidArgument);
        }
        let action = match handler {
            0 => SignalAction::Default,
            1 => SignalAction::Ignore,
            entry => SignalAction::Handler {
                entry: user_addr(entry)?,
                flags: flags as u32,
                mask,
            },
        };
        process.set_signal_action(signal as u8, action);
        Ok(0)
    }

    /// Deliver a signal. Default-disposition fatal signals terminate the
    /// target; SIGKILL cannot be caught or ignored.
    fn sys_kill(&self, cpu: usize, pid: i64, signal: u64) -> Result<u64, Errno> {
        if pid <= 0 {
            // Process groups are out of scope
            return Err(Errno::InvalidArgument);
        }
        if signal as usize >= SIGNAL_MAX {
            return Err(Errno::InvalidArgument);
        }
        let target = self
            .processes
            .find_by_pid(ProcessId::new(pid as u64))
            .ok_or(Errno::NoSuchProcess)?;
        let signal = signal as u8;
        if signal == 0 {
            return Ok(0); // existence probe
        }

        let action = if signal == SIGKILL {
            SignalAction::Default
        } else {
            target.signal_action(signal)
        };
        match action {
            SignalAction::Ignore => {}
            SignalAction::Handler { .. } => target.main_thread().signal(signal),
            SignalAction::Default => match default_disposition(signal) {
                Disposition::Ignore => {}
                Disposition::Terminate => {
                    target.main_thread().signal(signal);
                    target.set_exit_code(signal as i64);
                    target.die(&self.sched, &self.processes, cpu);
                }
            },
        }
        Ok(0)
    }
}

fn user_addr(addr: u64) -> Result<VirtAddr, Errno> {
    VirtAddr::try_new(addr).map_err(|_| Errno::Fault)
}

/// Read a NUL-terminated string out of user memory
fn read_user_cstring(space: &AddressSpace, addr: u64) -> Result<String, Errno> {
    let base = user_addr(addr)?;
    let mut bytes = Vec::new();
    for offset in 0..MAX_USER_STRING {
        let mut byte = [0u8];
        space
            .read_user(base + offset as u64, &mut byte)
            .map_err(|_| Errno::Fault)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| Errno::InvalidArgument);
        }
        bytes.push(byte[0]);
    }
    Err(Errno::InvalidArgument)
}

/// Read a NULL-terminated vector of string pointers (argv, envp)
fn read_user_string_vec(space: &AddressSpace, addr: u64) -> Result<Vec<String>, Errno> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let base = user_addr(addr)?;
    let mut strings = Vec::new();
    for index in 0..MAX_USER_VECTOR {
        let mut pointer = [0u8; 8];
        space
            .read_user(base + (index * 8) as u64, &mut pointer)
            .map_err(|_| Errno::Fault)?;
        let pointer = u64::from_le_bytes(pointer);
        if pointer == 0 {
            return Ok(strings);
        }
        strings.push(read_user_cstring(space, pointer)?);
    }
    Err(Errno::InvalidArgument)
}
