//! Physical frame arena
//!
//! Hands out fixed 4 KiB frames by index; frame `i` lives at physical address
//! `i * 4096`. Frame contents are backed by the arena so page-table levels and
//! user data can be read and written through physical addresses. No contiguity
//! is guaranteed between allocations.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::PhysAddr;

/// Size of one physical frame in bytes
pub const FRAME_SIZE: usize = 4096;

/// Frame 0 is never handed out; a zero physical address always means
/// "no frame", matching the null-pointer floor of the boot allocator.
const FIRST_USABLE_FRAME: u32 = 1;

struct Slot {
    /// Backing bytes, materialized on first write
    data: Option<Box<[u8; FRAME_SIZE]>>,
    allocated: bool,
}

struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Fixed-size pool of physical frames
pub struct FrameArena {
    inner: Mutex<ArenaInner>,
    allocated: AtomicUsize,
}

impl FrameArena {
    /// Create an arena backing `frame_count` physical frames
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count > FIRST_USABLE_FRAME as usize);
        let mut slots = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            slots.push(Slot {
                data: None,
                allocated: false,
            });
        }
        // Pop order hands frames out in ascending address order
        let free: Vec<u32> = (FIRST_USABLE_FRAME..frame_count as u32).rev().collect();

        log::info!(
            "frame arena initialized with {} KiB in {} frames",
            frame_count * FRAME_SIZE / 1024,
            frame_count
        );

        FrameArena {
            inner: Mutex::new(ArenaInner { slots, free }),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate a zeroed frame. Returns `None` on exhaustion.
    pub fn allocate_frame(&self) -> Option<PhysFrame> {
        let mut inner = self.inner.lock();
        let index = inner.free.pop()?;
        let slot = &mut inner.slots[index as usize];
        debug_assert!(!slot.allocated);
        slot.allocated = true;
        if let Some(data) = slot.data.as_mut() {
            data.fill(0);
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(frame_at(index))
    }

    /// Return a frame to the free list
    pub fn free_frame(&self, frame: PhysFrame) {
        let index = frame_index(frame);
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        assert!(slot.allocated, "double free of frame {:#x}", frame.start_address());
        slot.allocated = false;
        inner.free.push(index as u32);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of frames currently allocated
    pub fn allocated_frames(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Total frames managed by the arena
    pub fn frame_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Read bytes at a physical address. The range must not cross a frame
    /// boundary.
    pub fn read_bytes(&self, phys: PhysAddr, buf: &mut [u8]) {
        let (index, offset) = split_phys(phys, buf.len());
        let inner = self.inner.lock();
        match inner.slots[index].data.as_ref() {
            Some(data) => buf.copy_from_slice(&data[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
    }

    /// Write bytes at a physical address. The range must not cross a frame
    /// boundary.
    pub fn write_bytes(&self, phys: PhysAddr, bytes: &[u8]) {
        let (index, offset) = split_phys(phys, bytes.len());
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        let data = slot.data.get_or_insert_with(|| Box::new([0u8; FRAME_SIZE]));
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a 64-bit table entry from a frame
    pub fn read_u64(&self, frame: PhysFrame, index: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(frame.start_address() + (index * 8) as u64, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Write a 64-bit table entry into a frame
    pub fn write_u64(&self, frame: PhysFrame, index: usize, value: u64) {
        self.write_bytes(frame.start_address() + (index * 8) as u64, &value.to_le_bytes());
    }

    /// Copy the full contents of one frame into another
    pub fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        let src_index = frame_index(src);
        let dst_index = frame_index(dst);
        let mut inner = self.inner.lock();
        let bytes = match inner.slots[src_index].data.as_ref() {
            Some(data) => *data.clone(),
            None => [0u8; FRAME_SIZE],
        };
        let slot = &mut inner.slots[dst_index];
        let data = slot.data.get_or_insert_with(|| Box::new([0u8; FRAME_SIZE]));
        data.copy_from_slice(&bytes);
    }
}

fn frame_at(index: u32) -> PhysFrame {
    PhysFrame::from_start_address(PhysAddr::new(index as u64 * FRAME_SIZE as u64))
        .expect("frame index produces an aligned address")
}

fn frame_index(frame: PhysFrame<Size4KiB>) -> usize {
    (frame.start_address().as_u64() / FRAME_SIZE as u64) as usize
}

fn split_phys(phys: PhysAddr, len: usize) -> (usize, usize) {
    let offset = (phys.as_u64() % FRAME_SIZE as u64) as usize;
    assert!(offset + len <= FRAME_SIZE, "physical access crosses a frame boundary");
    ((phys.as_u64() / FRAME_SIZE as u64) as usize, offset)
}
