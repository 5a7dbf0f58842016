//! Address spaces and copy-on-write fault handling
//!
//! An `AddressSpace` owns one `PageMap` and an ordered list of mapped
//! regions. Region lookup hands back a clone of the region's `Arc`, and the
//! fault path takes the region's read lock so faults in disjoint regions
//! proceed in parallel; copy-on-write resolution upgrades to the region's
//! write lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};
use x86_64::VirtAddr;

use super::layout::{is_page_aligned, PAGE_SIZE_4K, USER_END};
use super::paging::PageMap;
use super::vm_object::VmObject;
use super::MapError;

/// Access kind reported by the fault vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Result of resolving a page fault against the region list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    /// No region, no backing object, or allocation exhaustion mid-fault
    Fatal,
}

pub struct RegionState {
    pub object: Option<Arc<VmObject>>,
    pub copy_on_write: bool,
}

/// A contiguous mapped range `[base, base + size)`
pub struct MappedRegion {
    base: VirtAddr,
    size: usize,
    state: RwLock<RegionState>,
}

impl core::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

impl MappedRegion {
    fn new(base: VirtAddr, size: usize, object: Arc<VmObject>, copy_on_write: bool) -> Arc<Self> {
        Arc::new(MappedRegion {
            base,
            size,
            state: RwLock::new(RegionState {
                object: Some(object),
                copy_on_write,
            }),
        })
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> VirtAddr {
        self.base + self.size as u64
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn object(&self) -> Option<Arc<VmObject>> {
        self.state.read().object.clone()
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.state.read().copy_on_write
    }

    /// References to the backing object across all address spaces
    pub fn object_ref_count(&self) -> usize {
        self.state
            .read()
            .object
            .as_ref()
            .map_or(0, Arc::strong_count)
    }
}

pub struct AddressSpace {
    page_map: PageMap,
    regions: Mutex<Vec<Arc<MappedRegion>>>,
}

impl AddressSpace {
    pub fn new(page_map: PageMap) -> AddressSpace {
        AddressSpace {
            page_map,
            regions: Mutex::new(Vec::new()),
        }
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    /// Reserve a virtual range backed by a lazily populated anonymous
    /// object. No frames are allocated until the first touch.
    pub fn allocate_anonymous(
        &self,
        len: usize,
        at: Option<VirtAddr>,
        fixed: bool,
    ) -> Result<Arc<MappedRegion>, MapError> {
        self.insert_object_at(
            Arc::new(VmObject::anonymous(self.page_map.arena().clone(), page_round(len)?)),
            at,
            fixed,
            /* map_now */ false,
        )
    }

    /// Map an already populated object (process image, trampoline)
    pub fn map_object(
        &self,
        object: Arc<VmObject>,
        at: Option<VirtAddr>,
        fixed: bool,
    ) -> Result<Arc<MappedRegion>, MapError> {
        self.insert_object_at(object, at, fixed, /* map_now */ true)
    }

    fn insert_object_at(
        &self,
        object: Arc<VmObject>,
        at: Option<VirtAddr>,
        fixed: bool,
        map_now: bool,
    ) -> Result<Arc<MappedRegion>, MapError> {
        let len = object.size();
        let mut regions = self.regions.lock();

        let base = match at {
            Some(base) if Self::range_is_free(&regions, base, len) => base,
            Some(base) => {
                if fixed {
                    log::warn!(
                        "fixed region {:#x}..{:#x} is in use",
                        base.as_u64(),
                        base.as_u64() + len as u64
                    );
                    return Err(MapError::AddressInUse);
                }
                Self::find_available(&regions, len).ok_or(MapError::OutOfMemory)?
            }
            None => Self::find_available(&regions, len).ok_or(MapError::OutOfMemory)?,
        };
        if !is_page_aligned(base.as_u64()) {
            return Err(MapError::InvalidRange);
        }

        let region = MappedRegion::new(base, len, object, false);
        if map_now {
            let state = region.state.read();
            if let Some(object) = state.object.as_ref() {
                object.map_allocated(base, &self.page_map, false)?;
            }
        }

        let position = regions
            .iter()
            .position(|r| r.base > base)
            .unwrap_or(regions.len());
        regions.insert(position, region.clone());
        Ok(region)
    }

    fn range_is_free(regions: &[Arc<MappedRegion>], base: VirtAddr, len: usize) -> bool {
        let end = base.as_u64() + len as u64;
        if end > USER_END {
            return false;
        }
        !regions
            .iter()
            .any(|r| r.base.as_u64() < end && base < r.end())
    }

    /// First-fit scan through the ordered region list. Zero addresses are
    /// never handed out.
    fn find_available(regions: &[Arc<MappedRegion>], len: usize) -> Option<VirtAddr> {
        let mut base = PAGE_SIZE_4K;
        for region in regions {
            if base + len as u64 <= region.base.as_u64() {
                break;
            }
            if base < region.end().as_u64() {
                base = region.end().as_u64();
            }
        }
        if base + len as u64 <= USER_END {
            Some(VirtAddr::new(base))
        } else {
            None
        }
    }

    /// The region containing `addr`, if any
    pub fn region_containing(&self, addr: VirtAddr) -> Option<Arc<MappedRegion>> {
        let regions = self.regions.lock();
        regions.iter().find(|r| r.contains(addr)).cloned()
    }

    /// Check a user byte range lies entirely within mapped regions
    pub fn range_mapped(&self, base: VirtAddr, len: usize) -> bool {
        let end = base.as_u64() + len as u64;
        let mut cursor = base.as_u64();
        let regions = self.regions.lock();
        for region in regions.iter() {
            if cursor < region.base.as_u64() {
                return false; // gap before this region; list is ordered
            }
            if cursor < region.end().as_u64() {
                cursor = region.end().as_u64();
            }
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }

    pub fn translate(&self, addr: VirtAddr) -> Option<x86_64::PhysAddr> {
        self.page_map.translate(addr)
    }

    /// Fork-clone: duplicate the table hierarchy, share every object, and
    /// flag all private regions copy-on-write on both sides. No data copied.
    pub fn fork(&self) -> Result<AddressSpace, MapError> {
        let regions = self.regions.lock();
        let clone_map = self.page_map.clone_hierarchy()?;
        let mut clone_regions = Vec::with_capacity(regions.len());

        for region in regions.iter() {
            let mut state = region.state.write();
            let Some(object) = state.object.clone() else {
                continue;
            };
            let copy_on_write = if object.is_shared() {
                // Shared objects stay shared; no COW
                state.copy_on_write
            } else {
                if !state.copy_on_write {
                    state.copy_on_write = true;
                    // Strip write permission from our own mappings
                    object.map_allocated(region.base, &self.page_map, true)?;
                }
                true
            };

            object.map_allocated(region.base, &clone_map, copy_on_write)?;
            clone_regions.push(MappedRegion::new(
                region.base,
                region.size,
                object,
                copy_on_write,
            ));
        }

        Ok(AddressSpace {
            page_map: clone_map,
            regions: Mutex::new(clone_regions),
        })
    }

    /// Resolve a page fault at `addr`
    pub fn handle_fault(&self, addr: VirtAddr, kind: AccessKind) -> FaultOutcome {
        let Some(region) = self.region_containing(addr) else {
            return FaultOutcome::Fatal;
        };
        let offset = (addr - region.base) & !(PAGE_SIZE_4K - 1);

        {
            let state = region.state.read();
            let Some(object) = state.object.as_ref() else {
                return FaultOutcome::Fatal;
            };
            if !(state.copy_on_write && kind == AccessKind::Write) {
                // Plain lazy first touch (or read of a COW page)
                return match object.hit(region.base, offset, &self.page_map, state.copy_on_write) {
                    Ok(()) => FaultOutcome::Resolved,
                    Err(e) => {
                        log::error!("fault allocation failed at {:#x}: {}", addr.as_u64(), e);
                        FaultOutcome::Fatal
                    }
                };
            }
        }

        // Write to a copy-on-write region: resolve under the write lock
        let mut state = region.state.write();
        let Some(object) = state.object.as_ref() else {
            return FaultOutcome::Fatal;
        };

        let result = if !state.copy_on_write {
            // Another thread resolved this region while we upgraded
            object.hit(region.base, offset, &self.page_map, false)
        } else if Arc::strong_count(object) == 1 {
            // Last reference: flip writable in place, no copy
            let object = object.clone();
            state.copy_on_write = false;
            object
                .map_allocated(region.base, &self.page_map, false)
                .and_then(|()| object.hit(region.base, offset, &self.page_map, false))
        } else {
            // Clone this region's contents into a private object; dropping
            // the old reference decrements the shared count
            match object.clone_contents() {
                Ok(private) => {
                    let private = Arc::new(private);
                    state.copy_on_write = false;
                    state.object = Some(private.clone());
                    private
                        .map_allocated(region.base, &self.page_map, false)
                        .and_then(|()| private.hit(region.base, offset, &self.page_map, false))
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => FaultOutcome::Resolved,
            Err(e) => {
                log::error!("copy-on-write resolution failed at {:#x}: {}", addr.as_u64(), e);
                FaultOutcome::Fatal
            }
        }
    }

    /// Remove every region wholly contained in `[base, base + len)`,
    /// dropping the object references and clearing the affected leaves.
    pub fn unmap(&self, base: VirtAddr, len: usize) -> Result<(), MapError> {
        if len == 0 || !is_page_aligned(base.as_u64()) || !is_page_aligned(len as u64) {
            return Err(MapError::InvalidRange);
        }
        let end = base + len as u64;
        let mut regions = self.regions.lock();
        let mut removed = false;

        regions.retain(|region| {
            if region.base >= base && region.end() <= end {
                let mut state = region.state.write();
                state.object = None; // last drop frees the frames
                let mut page = region.base;
                while page < region.end() {
                    self.page_map.unmap(page);
                    page += PAGE_SIZE_4K;
                }
                removed = true;
                false
            } else {
                true
            }
        });

        if removed {
            Ok(())
        } else {
            Err(MapError::InvalidRange)
        }
    }

    /// Copy bytes out of user memory, faulting pages in as needed. Fails
    /// with a typed error instead of ever taking a raw fault.
    pub fn read_user(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), MapError> {
        self.user_access(addr, buf.len(), AccessKind::Read, |arena, phys, range| {
            arena.read_bytes(phys, &mut buf[range]);
        })
    }

    /// Copy bytes into user memory, faulting and resolving COW as needed
    pub fn write_user(&self, addr: VirtAddr, data: &[u8]) -> Result<(), MapError> {
        self.user_access(addr, data.len(), AccessKind::Write, |arena, phys, range| {
            arena.write_bytes(phys, &data[range]);
        })
    }

    fn user_access(
        &self,
        addr: VirtAddr,
        len: usize,
        kind: AccessKind,
        mut op: impl FnMut(&super::frame_allocator::FrameArena, x86_64::PhysAddr, core::ops::Range<usize>),
    ) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < len {
            let cursor = addr + done as u64;
            let page_offset = (cursor.as_u64() % PAGE_SIZE_4K) as usize;
            let chunk = core::cmp::min(PAGE_SIZE_4K as usize - page_offset, len - done);

            if self.handle_fault(cursor, kind) != FaultOutcome::Resolved {
                return Err(MapError::InvalidRange);
            }
            let phys = self.page_map.translate(cursor).ok_or(MapError::InvalidRange)?;
            op(self.page_map.arena(), phys, done..done + chunk);
            done += chunk;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

fn page_round(len: usize) -> Result<usize, MapError> {
    if len == 0 {
        return Err(MapError::InvalidRange);
    }
    Ok(super::layout::align_up(len as u64, PAGE_SIZE_4K) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::FrameArena;
    use crate::memory::kernel_page_table::KernelTables;
    use crate::platform::{NullPlatform, Platform};

    fn space() -> AddressSpace {
        space_with_frames(2048).1
    }

    fn space_with_frames(frames: usize) -> (Arc<FrameArena>, AddressSpace) {
        let arena = Arc::new(FrameArena::new(frames));
        let platform: Arc<dyn Platform> = Arc::new(NullPlatform);
        let kernel = Arc::new(KernelTables::new(arena.clone()).unwrap());
        let map = PageMap::new(arena.clone(), platform, kernel).unwrap();
        (arena, AddressSpace::new(map))
    }

    #[test]
    fn test_anonymous_allocation_is_lazy() {
        let (arena, space) = space_with_frames(256);
        let baseline = arena.allocated_frames();
        let region = space.allocate_anonymous(0x10000, None, false).unwrap();
        // Reserving the range allocates nothing
        assert_eq!(arena.allocated_frames(), baseline);
        assert!(region.base().as_u64() >= PAGE_SIZE_4K);
    }

    #[test]
    fn test_fixed_overlap_is_address_in_use() {
        let space = space();
        let base = VirtAddr::new(0x100_0000);
        space.allocate_anonymous(0x4000, Some(base), true).unwrap();
        let err = space
            .allocate_anonymous(0x4000, Some(base + 0x1000u64), true)
            .unwrap_err();
        assert_eq!(err, MapError::AddressInUse);

        // Non-fixed requests fall back to an available range
        let region = space
            .allocate_anonymous(0x4000, Some(base + 0x1000u64), false)
            .unwrap();
        assert!(!region.contains(base + 0x1000u64) || region.base() != base + 0x1000u64);
    }

    #[test]
    fn test_first_touch_allocates_and_zeroes() {
        let (arena, space) = space_with_frames(256);
        let region = space.allocate_anonymous(0x4000, None, false).unwrap();
        let addr = region.base() + 0x1000u64;

        assert_eq!(space.handle_fault(addr, AccessKind::Read), FaultOutcome::Resolved);
        let phys = space.translate(addr).unwrap();
        let mut buf = [0xFFu8; 16];
        arena.read_bytes(phys, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_fault_outside_regions_is_fatal() {
        let space = space();
        assert_eq!(
            space.handle_fault(VirtAddr::new(0xdead_b000), AccessKind::Write),
            FaultOutcome::Fatal
        );
    }

    #[test]
    fn test_fork_shares_untouched_pages() {
        let space = space();
        let region = space.allocate_anonymous(0x2000, None, false).unwrap();
        let addr = region.base();
        space.handle_fault(addr, AccessKind::Write).unwrap_resolved();

        let child = space.fork().unwrap();
        // Identical physical frame on both sides right after fork
        assert_eq!(space.translate(addr), child.translate(addr));
        assert!(region.is_copy_on_write());
    }

    #[test]
    fn test_cow_write_copies_once() {
        let (arena, space) = space_with_frames(2048);
        let region = space.allocate_anonymous(0x2000, None, false).unwrap();
        let addr = region.base();
        space.write_user(addr, b"parent").unwrap();

        let child = space.fork().unwrap();
        let shared_phys = space.translate(addr).unwrap();
        let frames_before = arena.allocated_frames();

        // Child writes: private clone for the child's region only
        let child_region = child.region_containing(addr).unwrap();
        assert_eq!(child.handle_fault(addr, AccessKind::Write), FaultOutcome::Resolved);
        assert_eq!(child_region.object_ref_count(), 1);
        assert!(!child_region.is_copy_on_write());

        // Exactly one new frame was allocated for the copied page
        assert_eq!(arena.allocated_frames(), frames_before + 1);

        // Parent's view is unchanged and still points at the old frame
        assert_eq!(space.translate(addr), Some(shared_phys));
        assert_ne!(child.translate(addr), Some(shared_phys));

        let mut buf = [0u8; 6];
        child.read_user(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn test_cow_last_owner_flips_in_place() {
        let space = space();
        let region = space.allocate_anonymous(0x1000, None, false).unwrap();
        let addr = region.base();
        space.write_user(addr, b"x").unwrap();

        {
            let child = space.fork().unwrap();
            // Child dropped here: parent is the last owner again
            drop(child);
        }
        let phys = space.translate(addr).unwrap();
        assert_eq!(space.handle_fault(addr, AccessKind::Write), FaultOutcome::Resolved);
        // No copy happened: same frame, now writable
        assert_eq!(space.translate(addr), Some(phys));
        assert!(!region.is_copy_on_write());
    }

    #[test]
    fn test_fork_isolation() {
        let space = space();
        let region = space.allocate_anonymous(0x1000, None, false).unwrap();
        let addr = region.base();
        space.write_user(addr, &[7u8]).unwrap();

        let child = space.fork().unwrap();
        child.write_user(addr, &[9u8]).unwrap();

        let mut parent_byte = [0u8];
        space.read_user(addr, &mut parent_byte).unwrap();
        let mut child_byte = [0u8];
        child.read_user(addr, &mut child_byte).unwrap();
        assert_eq!(parent_byte[0], 7);
        assert_eq!(child_byte[0], 9);

        // And the other direction
        space.write_user(addr, &[3u8]).unwrap();
        child.read_user(addr, &mut child_byte).unwrap();
        assert_eq!(child_byte[0], 9);
    }

    #[test]
    fn test_unmap_drops_reference_not_siblings_frames() {
        let (arena, space) = space_with_frames(2048);
        let region = space.allocate_anonymous(0x1000, None, false).unwrap();
        let addr = region.base();
        space.write_user(addr, b"kept").unwrap();
        let child = space.fork().unwrap();

        let frames_before = arena.allocated_frames();
        // Parent unmaps its COW sibling; the child still references the
        // object so no frame may be freed.
        space.unmap(addr, 0x1000).unwrap();
        drop(region);
        assert_eq!(arena.allocated_frames(), frames_before);
        assert_eq!(space.translate(addr), None);

        let mut buf = [0u8; 4];
        child.read_user(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");

        // Last unmap frees the frame
        child.unmap(addr, 0x1000).unwrap();
        assert!(arena.allocated_frames() < frames_before);
    }

    #[test]
    fn test_unmap_misaligned_is_invalid_range() {
        let space = space();
        assert_eq!(
            space.unmap(VirtAddr::new(0x123), 0x1000).unwrap_err(),
            MapError::InvalidRange
        );
        assert_eq!(
            space.unmap(VirtAddr::new(0x1000), 0).unwrap_err(),
            MapError::InvalidRange
        );
    }

    #[test]
    fn test_range_mapped_validation() {
        let space = space();
        let region = space.allocate_anonymous(0x3000, None, false).unwrap();
        assert!(space.range_mapped(region.base(), 0x3000));
        assert!(space.range_mapped(region.base() + 0x1000u64, 0x800));
        assert!(!space.range_mapped(region.base(), 0x4000));
        assert!(!space.range_mapped(VirtAddr::new(0x7000_0000), 8));
    }

    impl FaultOutcome {
        fn unwrap_resolved(self) {
            assert_eq!(self, FaultOutcome::Resolved);
        }
    }
}
