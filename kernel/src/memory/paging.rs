//! Per-address-space page tables
//!
//! A `PageMap` is a 4-level radix tree whose table levels live in arena
//! frames of 512 packed 64-bit entries. The kernel half (PML4 entries 256
//! and up) points at tables shared between every map, so kernel mappings
//! added after a process was created are visible to it without per-process
//! updates. The user half is private and always uses 4 KiB leaves.

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::frame_allocator::FrameArena;
use super::kernel_page_table::KernelTables;
use super::layout::{ENTRY_COUNT, KERNEL_P4_INDEX, PAGE_SIZE_2M, PAGE_SIZE_4K, USER_END};
use super::MapError;
use crate::platform::Platform;

/// Mask selecting the frame address bits of a table entry
pub(super) const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Mask selecting the 2 MiB frame address bits of a huge leaf
const ENTRY_ADDR_MASK_2M: u64 = 0x000F_FFFF_FFE0_0000;

pub(super) fn entry_present(entry: u64) -> bool {
    entry & PageTableFlags::PRESENT.bits() != 0
}

pub(super) fn entry_frame(entry: u64) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new(entry & ENTRY_ADDR_MASK))
}

fn entry_is_huge(entry: u64) -> bool {
    entry & PageTableFlags::HUGE_PAGE.bits() != 0
}

/// One address space's page-table hierarchy
pub struct PageMap {
    arena: Arc<FrameArena>,
    platform: Arc<dyn Platform>,
    kernel: Arc<KernelTables>,
    root: PhysFrame,
    /// Serializes intermediate-table creation and teardown; reads
    /// (`translate`) only ever observe fully linked tables.
    tables: Mutex<()>,
}

impl PageMap {
    /// Create a fresh hierarchy with the shared kernel half installed
    pub fn new(
        arena: Arc<FrameArena>,
        platform: Arc<dyn Platform>,
        kernel: Arc<KernelTables>,
    ) -> Result<PageMap, MapError> {
        let root = arena.allocate_frame().ok_or(MapError::OutOfMemory)?;

        // Every kernel PML4 entry points at the one shared kernel PDPT, so
        // kernel-heap growth is visible to all processes by construction.
        let kernel_entry = kernel.pdpt_frame().start_address().as_u64()
            | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits();
        arena.write_u64(root, KERNEL_P4_INDEX, kernel_entry);

        Ok(PageMap {
            arena,
            platform,
            kernel,
            root,
            tables: Mutex::new(()),
        })
    }

    /// Physical frame of the root (PML4) table
    pub fn root_frame(&self) -> PhysFrame {
        self.root
    }

    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    /// Install a 4 KiB user mapping, creating intermediate levels as needed
    pub fn map(&self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MapError> {
        debug_assert!(virt.as_u64() < USER_END, "user mapping outside user range");
        debug_assert!(virt.as_u64() % PAGE_SIZE_4K == 0);

        let table = self.walk_create(virt)?;
        let entry = (phys.as_u64() & ENTRY_ADDR_MASK) | (flags | PageTableFlags::PRESENT).bits();
        self.arena.write_u64(table, usize::from(virt.p1_index()), entry);
        self.platform.invalidate_page(virt);
        Ok(())
    }

    /// Clear the leaf for `virt`. The data frame is not freed; frame
    /// ownership belongs to the VM object, not the table.
    pub fn unmap(&self, virt: VirtAddr) {
        debug_assert!(virt.as_u64() % PAGE_SIZE_4K == 0);
        let _guard = self.tables.lock();

        let mut table = self.root;
        for index in [
            usize::from(virt.p4_index()),
            usize::from(virt.p3_index()),
            usize::from(virt.p2_index()),
        ] {
            let entry = self.arena.read_u64(table, index);
            if !entry_present(entry) {
                return;
            }
            table = entry_frame(entry);
        }
        self.arena.write_u64(table, usize::from(virt.p1_index()), 0);
        self.platform.invalidate_page(virt);
    }

    /// Read-only walk; handles the kernel half's 2 MiB leaves
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table = self.root;
        for (level, index) in [
            (4u8, usize::from(virt.p4_index())),
            (3, usize::from(virt.p3_index())),
            (2, usize::from(virt.p2_index())),
        ] {
            let entry = self.arena.read_u64(table, index);
            if !entry_present(entry) {
                return None;
            }
            if level == 2 && entry_is_huge(entry) {
                let base = entry & ENTRY_ADDR_MASK_2M;
                return Some(PhysAddr::new(base + (virt.as_u64() % PAGE_SIZE_2M)));
            }
            table = entry_frame(entry);
        }
        let entry = self.arena.read_u64(table, usize::from(virt.p1_index()));
        if !entry_present(entry) {
            return None;
        }
        Some(PhysAddr::new((entry & ENTRY_ADDR_MASK) + (virt.as_u64() % PAGE_SIZE_4K)))
    }

    /// Deep-copy the user half of the hierarchy. Only table levels are
    /// duplicated; leaves alias the same data frames, so the caller must
    /// mark the resulting regions copy-on-write.
    pub fn clone_hierarchy(&self) -> Result<PageMap, MapError> {
        let _guard = self.tables.lock();

        let clone = PageMap::new(self.arena.clone(), self.platform.clone(), self.kernel.clone())?;
        for index in 0..ENTRY_COUNT {
            let entry = self.arena.read_u64(self.root, index);
            if !entry_present(entry) {
                continue;
            }
            if index >= KERNEL_P4_INDEX {
                // Shared kernel half: copied by reference
                self.arena.write_u64(clone.root, index, entry);
                continue;
            }
            let copy = self.copy_table(entry_frame(entry), 3)?;
            let flags = entry & !ENTRY_ADDR_MASK;
            self.arena
                .write_u64(clone.root, index, copy.start_address().as_u64() | flags);
        }
        Ok(clone)
    }

    fn copy_table(&self, source: PhysFrame, level: u8) -> Result<PhysFrame, MapError> {
        let copy = self.arena.allocate_frame().ok_or(MapError::OutOfMemory)?;
        for index in 0..ENTRY_COUNT {
            let entry = self.arena.read_u64(source, index);
            if !entry_present(entry) {
                continue;
            }
            if level == 1 {
                // Leaf entries alias the same physical frame
                self.arena.write_u64(copy, index, entry);
            } else {
                let child = self.copy_table(entry_frame(entry), level - 1)?;
                let flags = entry & !ENTRY_ADDR_MASK;
                self.arena
                    .write_u64(copy, index, child.start_address().as_u64() | flags);
            }
        }
        Ok(copy)
    }

    fn walk_create(&self, virt: VirtAddr) -> Result<PhysFrame, MapError> {
        let _guard = self.tables.lock();

        let intermediate = (PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE)
            .bits();

        let mut table = self.root;
        for index in [
            usize::from(virt.p4_index()),
            usize::from(virt.p3_index()),
            usize::from(virt.p2_index()),
        ] {
            let entry = self.arena.read_u64(table, index);
            table = if entry_present(entry) {
                debug_assert!(!entry_is_huge(entry), "huge page in user walk");
                entry_frame(entry)
            } else {
                let frame = self.arena.allocate_frame().ok_or(MapError::OutOfMemory)?;
                self.arena
                    .write_u64(table, index, frame.start_address().as_u64() | intermediate);
                frame
            };
        }
        Ok(table)
    }

    fn free_table(&self, table: PhysFrame, level: u8) {
        if level > 1 {
            for index in 0..ENTRY_COUNT {
                let entry = self.arena.read_u64(table, index);
                if entry_present(entry) && !entry_is_huge(entry) {
                    self.free_table(entry_frame(entry), level - 1);
                }
            }
        }
        // Level 1: the table frame itself is freed, never the data frames
        self.arena.free_frame(table);
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        // Free the private user half; the kernel half is shared and outlives
        // every process.
        for index in 0..KERNEL_P4_INDEX {
            let entry = self.arena.read_u64(self.root, index);
            if entry_present(entry) {
                self.free_table(entry_frame(entry), 3);
            }
        }
        self.arena.free_frame(self.root);
    }
}
