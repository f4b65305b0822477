//! Shared Memory Module
//!
//! Creates and owns the shared region backing file for the command ring
//! and resource heap, and drives the consumer side of the cursors. The
//! host writes the layout exactly once at attach; a device reset re-runs
//! that initialization with the cursors and fences back at zero.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;
use tracing::{debug, info};

use pvgpu_protocol::{
    ControlRegion, PVGPU_CONTROL_REGION_SIZE, PVGPU_FEATURES_MVP, PVGPU_STATUS_READY,
};

/// Shared memory region created by the backend at device attach.
pub struct SharedMemory {
    base_addr: *mut u8,
    size: usize,
    ring_size: usize,
    initialized: AtomicBool,
    _map: MmapMut,
}

// SAFETY: the mapping lives as long as the struct; cross-thread access is
// mediated by the control-region atomics.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create (or truncate) the backing file, map it, and write the
    /// control-region layout. The ring follows the control page, the heap
    /// takes the remainder.
    pub fn create<P: AsRef<Path>>(path: P, size: usize, ring_size: usize) -> Result<Self> {
        if !ring_size.is_power_of_two() {
            bail!("ring size must be a power of two, got 0x{ring_size:X}");
        }
        let min = PVGPU_CONTROL_REGION_SIZE + ring_size;
        if size <= min {
            bail!("shared region too small: 0x{size:X} <= 0x{min:X}");
        }

        info!(
            path = %path.as_ref().display(),
            size_mb = size / (1024 * 1024),
            "creating shared memory"
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("open {}", path.as_ref().display()))?;
        file.set_len(size as u64)?;

        // SAFETY: the file stays open for the lifetime of the map.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base_addr = map.as_mut_ptr();

        let shmem = Self {
            base_addr,
            size,
            ring_size,
            initialized: AtomicBool::new(false),
            _map: map,
        };
        shmem.initialize_control_region();
        Ok(shmem)
    }

    /// Write magic, version, features and segment geometry. Called once at
    /// create and again on a reset-register write.
    fn initialize_control_region(&self) {
        let ring_offset = PVGPU_CONTROL_REGION_SIZE;
        let heap_offset = ring_offset + self.ring_size;
        let heap_size = self.size - heap_offset;

        // SAFETY: exclusive access - the guest has not been told about the
        // region yet (attach) or has observed the reset register (reset).
        unsafe {
            let control = &mut *(self.base_addr as *mut ControlRegion);
            control.init(
                PVGPU_FEATURES_MVP,
                ring_offset as u32,
                self.ring_size as u32,
                heap_offset as u32,
                heap_size as u32,
            );
        }
        self.control_region().set_status(PVGPU_STATUS_READY);
        self.initialized.store(true, Ordering::Release);
        info!(
            ring_offset = format_args!("0x{ring_offset:X}"),
            ring_size = format_args!("0x{:X}", self.ring_size),
            heap_offset = format_args!("0x{heap_offset:X}"),
            heap_size = format_args!("0x{heap_size:X}"),
            "control region initialized"
        );
    }

    /// Reset-register semantics: clear all transport state and
    /// re-initialize the layout. Outstanding guest heap allocations are
    /// dropped by the kernel agent on its side of the reset.
    pub fn reset(&self) {
        info!("resetting transport state");
        self.initialize_control_region();
    }

    /// Get a reference to the control region
    pub fn control_region(&self) -> &ControlRegion {
        // SAFETY: control region is at offset 0 and properly aligned.
        unsafe { &*(self.base_addr as *const ControlRegion) }
    }

    /// Copy `out.len()` bytes from the ring starting at cursor position
    /// `cursor`, reassembling across the wrap.
    pub fn read_ring(&self, cursor: u64, out: &mut [u8]) {
        let control = self.control_region();
        let ring_offset = control.ring_offset() as usize;
        let ring_size = control.ring_size() as usize;
        debug_assert!(out.len() <= ring_size);

        let start = (cursor % ring_size as u64) as usize;
        let to_end = (ring_size - start).min(out.len());
        // SAFETY: the ring segment is inside the mapping; the producer
        // does not rewrite bytes between the cursors.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_addr.add(ring_offset + start),
                out.as_mut_ptr(),
                to_end,
            );
            if to_end < out.len() {
                std::ptr::copy_nonoverlapping(
                    self.base_addr.add(ring_offset),
                    out.as_mut_ptr().add(to_end),
                    out.len() - to_end,
                );
            }
        }
    }

    /// Copy bytes out of the heap segment at a region-global offset.
    /// Returns false if the cited range leaves the heap.
    pub fn read_heap(&self, offset: u32, out: &mut [u8]) -> bool {
        if !self.heap_range_ok(offset, out.len()) {
            return false;
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_addr.add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        true
    }

    /// Copy bytes into the heap segment (read-back maps).
    pub fn write_heap(&self, offset: u32, data: &[u8]) -> bool {
        if !self.heap_range_ok(offset, data.len()) {
            return false;
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base_addr.add(offset as usize),
                data.len(),
            );
        }
        true
    }

    fn heap_range_ok(&self, offset: u32, len: usize) -> bool {
        let control = self.control_region();
        let heap_start = control.heap_offset() as usize;
        let heap_end = heap_start + control.heap_size() as usize;
        let start = offset as usize;
        start >= heap_start && start.checked_add(len).is_some_and(|end| end <= heap_end)
    }

    /// Advance the consumer pointer after processing commands
    pub fn advance_consumer(&self, bytes: u64) {
        let control = self.control_region();
        let new_consumer = control.consumer_ptr() + bytes;
        control.set_consumer_ptr(new_consumer);
        debug!("consumer pointer advanced to {new_consumer}");
    }

    /// Update the host fence completed value
    pub fn complete_fence(&self, fence_value: u64) {
        self.control_region().set_host_fence_completed(fence_value);
        debug!("host fence completed: {fence_value}");
    }

    /// Get the total size of the mapped region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the region is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pvgpu_protocol::{PVGPU_MAGIC, PVGPU_VERSION};

    #[test]
    fn create_writes_spec_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmem");
        let shmem = SharedMemory::create(&path, 0x10000000, 0x1000000).unwrap();
        let control = shmem.control_region();

        assert_eq!(control.magic(), PVGPU_MAGIC);
        assert_eq!(control.version(), PVGPU_VERSION);
        assert_eq!(control.ring_offset(), 0x1000);
        assert_eq!(control.ring_size(), 0x1000000);
        assert_eq!(control.heap_offset(), 0x1001000);
        assert_eq!(control.heap_size(), 0xEFFF000);
        assert!(control.has_status_flag(PVGPU_STATUS_READY));
        assert!(shmem.is_initialized());
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmem");
        assert!(SharedMemory::create(&path, 0x200000, 0x30000).is_err());
    }

    #[test]
    fn reset_rewinds_cursors_and_fences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmem");
        let shmem = SharedMemory::create(&path, 0x200000, 0x10000).unwrap();
        let control = shmem.control_region();

        control.set_producer_ptr(4096);
        shmem.advance_consumer(4096);
        shmem.complete_fence(17);
        control.set_error(1, 2);

        shmem.reset();
        let control = shmem.control_region();
        assert_eq!(control.producer_ptr(), 0);
        assert_eq!(control.consumer_ptr(), 0);
        assert_eq!(control.host_fence_completed(), 0);
        assert_eq!(control.get_error_code(), 0);
        assert!(control.has_status_flag(PVGPU_STATUS_READY));
    }

    #[test]
    fn heap_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmem");
        let shmem = SharedMemory::create(&path, 0x200000, 0x10000).unwrap();
        let heap_offset = shmem.control_region().heap_offset();

        assert!(shmem.write_heap(heap_offset, &[1, 2, 3]));
        let mut out = [0u8; 3];
        assert!(shmem.read_heap(heap_offset, &mut out));
        assert_eq!(out, [1, 2, 3]);

        // Control region and ring are not heap.
        assert!(!shmem.write_heap(0, &[0]));
        assert!(!shmem.write_heap(0x1000, &[0]));
        // Past the end.
        let mut big = vec![0u8; 0x200000];
        assert!(!shmem.read_heap(heap_offset, &mut big));
    }

    #[test]
    fn ring_read_reassembles_across_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shmem");
        let shmem = SharedMemory::create(&path, 0x200000, 0x10000).unwrap();
        let control = shmem.control_region();
        let ring_size = control.ring_size() as u64;

        // Write a pattern split across the ring end by hand.
        let data: Vec<u8> = (0u8..32).collect();
        let cursor = ring_size - 16;
        unsafe {
            let ring = shmem.base_addr.add(control.ring_offset() as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), ring.add(cursor as usize), 16);
            std::ptr::copy_nonoverlapping(data.as_ptr().add(16), ring, 16);
        }

        let mut out = [0u8; 32];
        shmem.read_ring(cursor, &mut out);
        assert_eq!(&out[..], &data[..]);
    }
}
