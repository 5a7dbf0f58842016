//! Shared kernel page tables
//!
//! One PDPT (and the page directories hanging off it) is shared by every
//! address space: `PageMap::new` links PML4 entry 256 straight at it. Kernel
//! mappings always use 2 MiB pages and are installed here once, becoming
//! visible to all processes without per-process updates.

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::frame_allocator::FrameArena;
use super::layout::{KERNEL_BASE, PAGE_SIZE_2M, PML4_SPAN};
use super::paging::{entry_frame, entry_present};
use super::MapError;

pub struct KernelTables {
    arena: Arc<FrameArena>,
    pdpt: PhysFrame,
    /// Guards directory creation; kernel mappings are rare and happen under
    /// this one lock.
    lock: Mutex<()>,
}

impl KernelTables {
    pub fn new(arena: Arc<FrameArena>) -> Result<KernelTables, MapError> {
        let pdpt = arena.allocate_frame().ok_or(MapError::OutOfMemory)?;
        Ok(KernelTables {
            arena,
            pdpt,
            lock: Mutex::new(()),
        })
    }

    /// The shared PDPT every PML4 kernel entry points at
    pub fn pdpt_frame(&self) -> PhysFrame {
        self.pdpt
    }

    /// Install a 2 MiB kernel mapping. Visible in every address space by
    /// construction.
    pub fn map_2m(&self, virt: VirtAddr, phys: PhysAddr) -> Result<(), MapError> {
        assert!(
            virt.as_u64() >= KERNEL_BASE && virt.as_u64() < KERNEL_BASE + PML4_SPAN,
            "kernel mapping outside the kernel PML4 slot"
        );
        assert!(virt.as_u64() % PAGE_SIZE_2M == 0);
        assert!(phys.as_u64() % PAGE_SIZE_2M == 0);

        let _guard = self.lock.lock();

        let intermediate =
            (PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL).bits();

        let p3_index = usize::from(virt.p3_index());
        let entry = self.arena.read_u64(self.pdpt, p3_index);
        let directory = if entry_present(entry) {
            entry_frame(entry)
        } else {
            let frame = self.arena.allocate_frame().ok_or(MapError::OutOfMemory)?;
            self.arena
                .write_u64(self.pdpt, p3_index, frame.start_address().as_u64() | intermediate);
            frame
        };

        let leaf = phys.as_u64()
            | (PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::HUGE_PAGE
                | PageTableFlags::GLOBAL)
                .bits();
        self.arena
            .write_u64(directory, usize::from(virt.p2_index()), leaf);
        Ok(())
    }
}
