//! ELF loader interface
//!
//! Verification, relocation and segment mapping live in the external
//! loader; the kernel only consumes the result. A malformed image aborts
//! process creation with a typed error instead of replacing the caller.

use alloc::string::String;
use thiserror::Error;
use x86_64::VirtAddr;

use crate::memory::address_space::AddressSpace;
use crate::memory::MapError;

/// auxv keys pushed onto the initial user stack
pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;
pub const AT_EXECPATH: u64 = 31;

/// What the loader reports after mapping an image
pub struct ElfInfo {
    pub entry: VirtAddr,
    pub phdr_vaddr: u64,
    pub ph_entry_size: u64,
    pub ph_count: u64,
    /// PT_INTERP path, if the image wants a dynamic linker
    pub linker_path: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// Bad magic, malformed header, unsupported class
    #[error("invalid executable image")]
    InvalidImage,
    /// The image names an interpreter that cannot be loaded
    #[error("dynamic linker missing or invalid")]
    LinkerNotFound,
    #[error("image mapping failed: {0}")]
    Memory(#[from] MapError),
}

pub trait ElfLoader: Send + Sync {
    /// Cheap header validation before anything is allocated
    fn verify(&self, image: &[u8]) -> bool;

    /// Map the image's segments into `space` at `base` and describe the
    /// result.
    fn load_segments(
        &self,
        space: &AddressSpace,
        image: &[u8],
        base: VirtAddr,
    ) -> Result<ElfInfo, ExecError>;
}
