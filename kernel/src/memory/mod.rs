//! Memory management
//!
//! The `MemoryManager` is the explicitly initialized context everything else
//! hangs off: the physical frame arena, the shared kernel page tables with
//! their 2 MiB direct map of physical memory, and the kernel stack area.
//! Address spaces are created through it and share the kernel half by
//! construction.

pub mod address_space;
pub mod frame_allocator;
pub mod kernel_page_table;
pub mod layout;
pub mod paging;
pub mod vm_object;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use x86_64::{PhysAddr, VirtAddr};

use crate::platform::Platform;
use address_space::AddressSpace;
use frame_allocator::FrameArena;
use kernel_page_table::KernelTables;
use layout::{
    align_up, KERNEL_BASE, KERNEL_STACKS_BASE, KERNEL_STACK_GUARD, KERNEL_STACK_SIZE, PAGE_SIZE_2M,
};
use paging::PageMap;

/// Typed errors for the mapping entry points. Only user-triggerable
/// conditions are modeled; invariant violations assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// A fixed placement overlaps an existing region
    #[error("address range already in use")]
    AddressInUse,
    /// Misaligned, empty, or out-of-bounds range
    #[error("invalid address range")]
    InvalidRange,
    /// Physical frame allocator exhausted
    #[error("out of physical memory")]
    OutOfMemory,
}

/// A kernel stack carved from the kernel stack area, separated from its
/// neighbours by an unmapped guard gap.
pub struct KernelStack {
    top: VirtAddr,
    size: usize,
}

impl KernelStack {
    pub fn top(&self) -> VirtAddr {
        self.top
    }

    pub fn bottom(&self) -> VirtAddr {
        self.top - self.size as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

pub struct MemoryManager {
    arena: Arc<FrameArena>,
    platform: Arc<dyn Platform>,
    kernel_tables: Arc<KernelTables>,
    stack_cursor: AtomicU64,
}

impl MemoryManager {
    /// Build the kernel tables and direct-map the whole physical range at
    /// `KERNEL_BASE` with 2 MiB pages.
    pub fn new(platform: Arc<dyn Platform>, frame_count: usize) -> Result<MemoryManager, MapError> {
        let arena = Arc::new(FrameArena::new(frame_count));
        let kernel_tables = Arc::new(KernelTables::new(arena.clone())?);

        let span = align_up(
            frame_count as u64 * frame_allocator::FRAME_SIZE as u64,
            PAGE_SIZE_2M,
        );
        let mut offset = 0;
        while offset < span {
            kernel_tables.map_2m(VirtAddr::new(KERNEL_BASE + offset), PhysAddr::new(offset))?;
            offset += PAGE_SIZE_2M;
        }
        log::info!(
            "kernel direct map covers {} MiB of physical memory",
            span / (1024 * 1024)
        );

        Ok(MemoryManager {
            arena,
            platform,
            kernel_tables,
            stack_cursor: AtomicU64::new(KERNEL_STACKS_BASE),
        })
    }

    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    pub fn kernel_tables(&self) -> &Arc<KernelTables> {
        &self.kernel_tables
    }

    /// Fresh address space with the shared kernel half installed
    pub fn create_address_space(&self) -> Result<AddressSpace, MapError> {
        let map = PageMap::new(
            self.arena.clone(),
            self.platform.clone(),
            self.kernel_tables.clone(),
        )?;
        Ok(AddressSpace::new(map))
    }

    /// Extend the kernel mappings; visible in every address space
    pub fn kernel_map_2m(&self, virt: VirtAddr, phys: PhysAddr) -> Result<(), MapError> {
        self.kernel_tables.map_2m(virt, phys)
    }

    /// Virtual address of a physical address through the direct map
    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(KERNEL_BASE + phys.as_u64())
    }

    /// Carve a kernel stack out of the stack area
    pub fn allocate_kernel_stack(&self) -> KernelStack {
        let step = KERNEL_STACK_SIZE as u64 + KERNEL_STACK_GUARD;
        let base = self.stack_cursor.fetch_add(step, Ordering::Relaxed);
        KernelStack {
            top: VirtAddr::new(base + KERNEL_STACK_SIZE as u64),
            size: KERNEL_STACK_SIZE,
        }
    }
}
