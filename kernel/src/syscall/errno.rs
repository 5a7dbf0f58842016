//! Error numbers crossing the user/kernel boundary

use thiserror::Error;

use crate::memory::MapError;

/// Errors returned from system calls as negative values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    #[error("no such process")]
    NoSuchProcess = 3,
    #[error("interrupted system call")]
    Interrupted = 4,
    #[error("exec format error")]
    NotExecutable = 8,
    #[error("bad handle")]
    BadHandle = 9,
    #[error("no child processes")]
    NoChild = 10,
    #[error("resource temporarily unavailable")]
    Again = 11,
    #[error("out of memory")]
    NoMemory = 12,
    #[error("bad address")]
    Fault = 14,
    #[error("address already in use")]
    Exists = 17,
    #[error("invalid argument")]
    InvalidArgument = 22,
    #[error("no such file or directory")]
    NoEntry = 2,
    #[error("function not implemented")]
    NoSys = 38,
}

impl Errno {
    /// The negative value placed in rax on error
    pub fn as_return_value(self) -> i64 {
        -(self as i64)
    }
}

impl From<MapError> for Errno {
    fn from(error: MapError) -> Errno {
        match error {
            MapError::AddressInUse => Errno::Exists,
            MapError::InvalidRange => Errno::Fault,
            MapError::OutOfMemory => Errno::NoMemory,
        }
    }
}

impl From<crate::elf::ExecError> for Errno {
    fn from(error: crate::elf::ExecError) -> Errno {
        match error {
            crate::elf::ExecError::InvalidImage => Errno::NotExecutable,
            crate::elf::ExecError::LinkerNotFound => Errno::NotExecutable,
            crate::elf::ExecError::Memory(e) => e.into(),
        }
    }
}
