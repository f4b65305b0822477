//! Guest-side view of the shared region.
//!
//! The host backend creates and initializes the backing file; the kernel
//! agent maps it read/write and validates the control region before
//! touching anything else. The user producer never maps the region itself -
//! it gets a [`UserView`] from the agent, which exposes exactly what
//! user mode is allowed to reach: control-region reads for the fence fast
//! path and heap reads/writes for bulk payloads.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapMut;
use thiserror::Error;
use tracing::info;

use pvgpu_protocol::{ControlRegion, PVGPU_CONTROL_REGION_SIZE};

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("failed to open shared memory backing: {0}")]
    Io(#[from] std::io::Error),
    #[error("shared region too small: {0} bytes")]
    TooSmall(usize),
    #[error("control region rejected: {0}")]
    Invalid(&'static str),
    #[error("offset out of range: 0x{0:X} + 0x{1:X}")]
    OutOfRange(usize, usize),
}

/// Shared memory region mapped from the virtual device BAR.
pub struct GuestMapping {
    base: *mut u8,
    size: usize,
    _map: MmapMut,
}

// SAFETY: the mapping stays valid for the lifetime of the struct; all
// cross-thread access goes through atomics in the control region or
// explicitly synchronized byte copies.
unsafe impl Send for GuestMapping {}
unsafe impl Sync for GuestMapping {}

impl GuestMapping {
    /// Map an existing shared region and validate its control region.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ShmemError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;
        if size < PVGPU_CONTROL_REGION_SIZE {
            return Err(ShmemError::TooSmall(size));
        }

        // SAFETY: the file stays open for the lifetime of the map.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        let mapping = Self {
            base,
            size,
            _map: map,
        };
        mapping.control().validate().map_err(ShmemError::Invalid)?;

        let control = mapping.control();
        if (control.ring_offset() as usize) + (control.ring_size() as usize) > size
            || (control.heap_offset() as usize) + (control.heap_size() as usize) > size
        {
            return Err(ShmemError::Invalid("segment extends past the region"));
        }

        info!(
            size,
            ring_size = control.ring_size(),
            heap_size = control.heap_size(),
            "guest mapping validated"
        );
        Ok(mapping)
    }

    pub fn control(&self) -> &ControlRegion {
        // SAFETY: validated at open; the control region is at offset 0 and
        // page-aligned by the mapping.
        unsafe { &*(self.base as *const ControlRegion) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Base pointer of the ring segment.
    pub(crate) fn ring_base(&self) -> *mut u8 {
        // SAFETY: ring bounds validated at open.
        unsafe { self.base.add(self.control().ring_offset() as usize) }
    }

    /// Copy bytes into the shared region at a region-global offset.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), ShmemError> {
        if offset.checked_add(bytes.len()).is_none_or(|end| end > self.size) {
            return Err(ShmemError::OutOfRange(offset, bytes.len()));
        }
        // SAFETY: bounds checked above; overlap with concurrent host reads
        // is excluded by the fence protocol (content is immutable between
        // submission and the fence that retires it).
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Copy bytes out of the shared region at a region-global offset.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmemError> {
        if offset.checked_add(out.len()).is_none_or(|end| end > self.size) {
            return Err(ShmemError::OutOfRange(offset, out.len()));
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Borrow a range of the region for reading.
    ///
    /// # Safety
    /// Caller must ensure the host is not concurrently writing the range.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> Result<&[u8], ShmemError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(ShmemError::OutOfRange(offset, len));
        }
        Ok(std::slice::from_raw_parts(self.base.add(offset), len))
    }
}

/// The producer-visible secondary view of the shared region.
///
/// User mode holds no privileges of its own: it can read the control
/// region (fence fast path, status checks) and read/write heap ranges its
/// escapes allocated. Everything else goes through the escape gateway.
#[derive(Clone)]
pub struct UserView {
    mapping: Arc<GuestMapping>,
}

impl UserView {
    pub(crate) fn new(mapping: Arc<GuestMapping>) -> Self {
        Self { mapping }
    }

    pub fn host_fence_completed(&self) -> u64 {
        self.mapping.control().host_fence_completed()
    }

    pub fn status(&self) -> u32 {
        self.mapping.control().get_status()
    }

    pub fn error_code(&self) -> u32 {
        self.mapping.control().get_error_code()
    }

    pub fn error_data(&self) -> u32 {
        self.mapping.control().get_error_data()
    }

    /// Write payload bytes into an allocated heap range.
    pub fn write_heap(&self, offset: u32, bytes: &[u8]) -> Result<(), ShmemError> {
        self.check_heap_range(offset, bytes.len())?;
        self.mapping.write_bytes(offset as usize, bytes)
    }

    /// Read payload bytes back out of a heap range (read-back maps).
    pub fn read_heap(&self, offset: u32, out: &mut [u8]) -> Result<(), ShmemError> {
        self.check_heap_range(offset, out.len())?;
        self.mapping.read_bytes(offset as usize, out)
    }

    fn check_heap_range(&self, offset: u32, len: usize) -> Result<(), ShmemError> {
        let control = self.mapping.control();
        let heap_start = control.heap_offset() as usize;
        let heap_end = heap_start + control.heap_size() as usize;
        let start = offset as usize;
        if start < heap_start || start.checked_add(len).is_none_or(|end| end > heap_end) {
            return Err(ShmemError::OutOfRange(start, len));
        }
        Ok(())
    }
}
