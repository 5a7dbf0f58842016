//! VM objects: the backing store of mapped regions
//!
//! A `VmObject` describes the physical blocks behind a region, independent of
//! which address space(s) reference it. Anonymous objects are lazily
//! populated one 4 KiB block at a time as faults arrive. Sharing between
//! address spaces is expressed by the `Arc` reference count; copy-on-write
//! resolution clones the contents into a private object.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::VirtAddr;

use super::frame_allocator::FrameArena;
use super::layout::{PAGE_SHIFT_4K, PAGE_SIZE_4K};
use super::paging::PageMap;
use super::MapError;

pub struct VmObject {
    size: usize,
    anonymous: bool,
    shared: bool,
    arena: Arc<FrameArena>,
    blocks: Mutex<Vec<Option<PhysFrame>>>,
}

fn leaf_flags(copy_on_write: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if !copy_on_write {
        flags |= PageTableFlags::WRITABLE;
    }
    flags
}

impl VmObject {
    /// Anonymous, lazily populated object: no frames until first touch
    pub fn anonymous(arena: Arc<FrameArena>, size: usize) -> VmObject {
        assert!(size as u64 % PAGE_SIZE_4K == 0 && size > 0);
        let count = size >> PAGE_SHIFT_4K;
        VmObject {
            size,
            anonymous: true,
            shared: false,
            arena,
            blocks: Mutex::new(alloc::vec![None; count]),
        }
    }

    /// Eagerly allocated object, used for process images and the signal
    /// trampoline where every block must exist up front.
    pub fn prefilled(arena: Arc<FrameArena>, size: usize) -> Result<VmObject, MapError> {
        let object = VmObject::anonymous(arena, size);
        object.force_allocate()?;
        Ok(object)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.size >> PAGE_SHIFT_4K
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Fault one page in: map the existing block (a sibling may already have
    /// allocated it) or allocate and zero a fresh one.
    pub fn hit(
        &self,
        base: VirtAddr,
        offset: u64,
        map: &PageMap,
        copy_on_write: bool,
    ) -> Result<(), MapError> {
        let index = (offset >> PAGE_SHIFT_4K) as usize;
        assert!(index < self.page_count(), "fault offset outside object");

        let virt = base + (index as u64) * PAGE_SIZE_4K;
        let mut blocks = self.blocks.lock();
        let frame = match blocks[index] {
            Some(frame) => frame,
            None => {
                assert!(self.anonymous, "non-anonymous object missing a block");
                let frame = self.arena.allocate_frame().ok_or(MapError::OutOfMemory)?;
                blocks[index] = Some(frame);
                frame
            }
        };
        map.map(virt, frame.start_address(), leaf_flags(copy_on_write))
    }

    /// (Re)map every allocated block; write permission is withheld while the
    /// region is copy-on-write.
    pub fn map_allocated(
        &self,
        base: VirtAddr,
        map: &PageMap,
        copy_on_write: bool,
    ) -> Result<(), MapError> {
        let blocks = self.blocks.lock();
        for (index, block) in blocks.iter().enumerate() {
            if let Some(frame) = block {
                let virt = base + (index as u64) * PAGE_SIZE_4K;
                map.map(virt, frame.start_address(), leaf_flags(copy_on_write))?;
            }
        }
        Ok(())
    }

    /// Populate every block eagerly
    pub fn force_allocate(&self) -> Result<(), MapError> {
        let mut blocks = self.blocks.lock();
        for block in blocks.iter_mut() {
            if block.is_none() {
                *block = Some(self.arena.allocate_frame().ok_or(MapError::OutOfMemory)?);
            }
        }
        Ok(())
    }

    /// Copy-on-write resolution: a private object with fresh frames holding
    /// the same bytes for every allocated block.
    pub fn clone_contents(&self) -> Result<VmObject, MapError> {
        assert!(!self.shared, "shared objects are never cloned");
        let clone = VmObject::anonymous(self.arena.clone(), self.size);
        {
            let source = self.blocks.lock();
            let mut dest = clone.blocks.lock();
            for (index, block) in source.iter().enumerate() {
                if let Some(frame) = block {
                    let copy = self.arena.allocate_frame().ok_or(MapError::OutOfMemory)?;
                    self.arena.copy_frame(*frame, copy);
                    dest[index] = Some(copy);
                }
            }
        }
        Ok(clone)
    }

    /// Bytes of physical memory currently backing this object
    pub fn used_physical(&self) -> usize {
        let blocks = self.blocks.lock();
        blocks.iter().filter(|b| b.is_some()).count() << PAGE_SHIFT_4K
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();
        for block in blocks.iter().flatten() {
            self.arena.free_frame(*block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::kernel_page_table::KernelTables;
    use crate::platform::{NullPlatform, Platform};

    fn fixture() -> (Arc<FrameArena>, PageMap) {
        let arena = Arc::new(FrameArena::new(512));
        let platform: Arc<dyn Platform> = Arc::new(NullPlatform);
        let kernel = Arc::new(KernelTables::new(arena.clone()).unwrap());
        let map = PageMap::new(arena.clone(), platform, kernel).unwrap();
        (arena, map)
    }

    #[test]
    fn test_lazy_object_allocates_on_hit_only() {
        let (arena, map) = fixture();
        let object = VmObject::anonymous(arena.clone(), 4 * PAGE_SIZE_4K as usize);
        let baseline = arena.allocated_frames();

        let base = VirtAddr::new(0x10_0000);
        object.hit(base, 2 * PAGE_SIZE_4K, &map, false).unwrap();

        assert_eq!(object.used_physical(), PAGE_SIZE_4K as usize);
        assert!(map.translate(base + 2 * PAGE_SIZE_4K).is_some());
        assert!(map.translate(base).is_none());
        // One data frame plus the intermediate tables
        assert!(arena.allocated_frames() > baseline);
    }

    #[test]
    fn test_second_hit_reuses_block() {
        let (arena, map) = fixture();
        let object = VmObject::anonymous(arena, 2 * PAGE_SIZE_4K as usize);
        let base = VirtAddr::new(0x20_0000);

        object.hit(base, 0, &map, false).unwrap();
        let first = map.translate(base).unwrap();
        object.hit(base, 0, &map, false).unwrap();
        assert_eq!(map.translate(base), Some(first));
        assert_eq!(object.used_physical(), PAGE_SIZE_4K as usize);
    }

    #[test]
    fn test_clone_contents_copies_bytes() {
        let (arena, map) = fixture();
        let object = VmObject::anonymous(arena.clone(), 2 * PAGE_SIZE_4K as usize);
        let base = VirtAddr::new(0x30_0000);
        object.hit(base, 0, &map, false).unwrap();

        let phys = map.translate(base).unwrap();
        arena.write_bytes(phys, b"payload");

        let clone = object.clone_contents().unwrap();
        let clone_phys = {
            let blocks = clone.blocks.lock();
            blocks[0].unwrap().start_address()
        };
        assert_ne!(clone_phys, phys);
        let mut buf = [0u8; 7];
        arena.read_bytes(clone_phys, &mut buf);
        assert_eq!(&buf, b"payload");
        // Untouched pages stay unallocated in the clone
        assert_eq!(clone.used_physical(), PAGE_SIZE_4K as usize);
    }

    #[test]
    fn test_drop_returns_frames() {
        let (arena, map) = fixture();
        let baseline = arena.allocated_frames();
        let object = VmObject::anonymous(arena.clone(), 4 * PAGE_SIZE_4K as usize);
        object.hit(VirtAddr::new(0x40_0000), 0, &map, false).unwrap();
        object
            .hit(VirtAddr::new(0x40_0000), PAGE_SIZE_4K, &map, false)
            .unwrap();

        let with_tables = arena.allocated_frames();
        drop(object);
        assert_eq!(arena.allocated_frames(), with_tables - 2);
        assert!(arena.allocated_frames() >= baseline);
    }

    #[test]
    fn test_cow_mapping_is_read_only() {
        let flags = leaf_flags(true);
        assert!(!flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::PRESENT));
        let flags = leaf_flags(false);
        assert!(flags.contains(PageTableFlags::WRITABLE));
    }
}
