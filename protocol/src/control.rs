//! Control region at offset 0 of the shared region.
//!
//! The layout is part of the wire contract between three independent
//! implementations, so every hot field sits at a fixed byte offset pinned
//! by compile-time assertions. The cursors and fence counters each get
//! their own 64-byte cache line: the guest writes `producer_ptr` and
//! `guest_fence_request`, the host writes `consumer_ptr` and
//! `host_fence_completed`, and sharing a line between them collapses
//! throughput.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{PVGPU_ERROR_SUCCESS, PVGPU_STATUS_ERROR};
use crate::{PVGPU_CONTROL_REGION_SIZE, PVGPU_MAGIC, PVGPU_VERSION, PVGPU_VERSION_MAJOR};

/// Display geometry snapshot from the control region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub format: u32,
}

/// Control region mapped at the base of the shared region.
///
/// The cursors, fences and status word are accessed from two address
/// spaces with no compiler-visible ordering between them, so they are
/// modelled as atomics with explicit acquire/release at each hand-off.
/// Plain volatile access would not constrain reordering of the ordinary
/// payload stores around them.
#[repr(C)]
pub struct ControlRegion {
    // 0x000
    magic: u32,
    version: u32,
    features: u64,

    // Ring configuration - 0x010
    ring_offset: u32,
    ring_size: u32,
    heap_offset: u32,
    heap_size: u32,

    // Producer pointer - 0x020 (own cache line, guest -> host)
    producer_ptr: AtomicU64,
    _pad_producer: [u8; 56],

    // Consumer pointer - 0x060 (own cache line, host -> guest)
    consumer_ptr: AtomicU64,
    _pad_consumer: [u8; 56],

    // Guest fence request - 0x0A0 (own cache line, guest -> host)
    guest_fence_request: AtomicU64,
    _pad_guest_fence: [u8; 56],

    // Host fence completed - 0x0E0 (own cache line, host -> guest)
    host_fence_completed: AtomicU64,
    _pad_host_fence: [u8; 56],

    // Status and error - 0x120 (host -> guest)
    status: AtomicU32,
    error_code: AtomicU32,
    error_data: AtomicU32,
    _reserved1: u32,

    // Display configuration - 0x130 (bidirectional)
    display_width: AtomicU32,
    display_height: AtomicU32,
    display_refresh: AtomicU32,
    display_format: AtomicU32,

    // Reserved - 0x140 to 0xFFF, written zero at init, ignored by readers
    _reserved: [u8; 0xEC0],
}

// The offsets below are the protocol contract (spec'd per-field), not an
// artifact of natural layout.
const _: () = assert!(std::mem::size_of::<ControlRegion>() == PVGPU_CONTROL_REGION_SIZE);
const _: () = assert!(std::mem::offset_of!(ControlRegion, magic) == 0x00);
const _: () = assert!(std::mem::offset_of!(ControlRegion, version) == 0x04);
const _: () = assert!(std::mem::offset_of!(ControlRegion, features) == 0x08);
const _: () = assert!(std::mem::offset_of!(ControlRegion, ring_offset) == 0x10);
const _: () = assert!(std::mem::offset_of!(ControlRegion, ring_size) == 0x14);
const _: () = assert!(std::mem::offset_of!(ControlRegion, heap_offset) == 0x18);
const _: () = assert!(std::mem::offset_of!(ControlRegion, heap_size) == 0x1C);
const _: () = assert!(std::mem::offset_of!(ControlRegion, producer_ptr) == 0x20);
const _: () = assert!(std::mem::offset_of!(ControlRegion, consumer_ptr) == 0x60);
const _: () = assert!(std::mem::offset_of!(ControlRegion, guest_fence_request) == 0xA0);
const _: () = assert!(std::mem::offset_of!(ControlRegion, host_fence_completed) == 0xE0);
const _: () = assert!(std::mem::offset_of!(ControlRegion, status) == 0x120);
const _: () = assert!(std::mem::offset_of!(ControlRegion, error_code) == 0x124);
const _: () = assert!(std::mem::offset_of!(ControlRegion, error_data) == 0x128);
const _: () = assert!(std::mem::offset_of!(ControlRegion, display_width) == 0x130);

impl ControlRegion {
    /// Initialize the region layout. Called exactly once by the host at
    /// device attach (and again on a device-wide reset). Layout fields are
    /// never mutated afterwards.
    ///
    /// # Safety
    /// Caller must have exclusive access to the region; no other side may
    /// be reading it yet.
    pub unsafe fn init(
        &mut self,
        features: u64,
        ring_offset: u32,
        ring_size: u32,
        heap_offset: u32,
        heap_size: u32,
    ) {
        // Zero first so reserved bytes are zero as the contract requires.
        std::ptr::write_bytes(self as *mut ControlRegion as *mut u8, 0, PVGPU_CONTROL_REGION_SIZE);
        self.magic = PVGPU_MAGIC;
        self.version = PVGPU_VERSION;
        self.features = features;
        self.ring_offset = ring_offset;
        self.ring_size = ring_size;
        self.heap_offset = heap_offset;
        self.heap_size = heap_size;
    }

    /// Validate magic and major version. Readers that see a mismatch must
    /// refuse to proceed.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != PVGPU_MAGIC {
            return Err("invalid magic number");
        }
        if (self.version >> 16) != PVGPU_VERSION_MAJOR {
            return Err("incompatible protocol version");
        }
        if !self.ring_size.is_power_of_two() {
            return Err("ring size is not a power of two");
        }
        Ok(())
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn ring_offset(&self) -> u32 {
        self.ring_offset
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn heap_offset(&self) -> u32 {
        self.heap_offset
    }

    pub fn heap_size(&self) -> u32 {
        self.heap_size
    }

    // =========================================================================
    // Cursors and fences
    // =========================================================================

    pub fn producer_ptr(&self) -> u64 {
        self.producer_ptr.load(Ordering::Acquire)
    }

    /// Advance the producer cursor. Written only by the kernel agent, after
    /// the record bytes are globally visible.
    pub fn set_producer_ptr(&self, value: u64) {
        self.producer_ptr.store(value, Ordering::Release);
    }

    pub fn consumer_ptr(&self) -> u64 {
        self.consumer_ptr.load(Ordering::Acquire)
    }

    /// Advance the consumer cursor. Written only by the host, after any
    /// control-region writes the consumed command produced are visible.
    pub fn set_consumer_ptr(&self, value: u64) {
        self.consumer_ptr.store(value, Ordering::Release);
    }

    pub fn guest_fence_request(&self) -> u64 {
        self.guest_fence_request.load(Ordering::Acquire)
    }

    pub fn set_guest_fence_request(&self, value: u64) {
        self.guest_fence_request.store(value, Ordering::Release);
    }

    pub fn host_fence_completed(&self) -> u64 {
        self.host_fence_completed.load(Ordering::Acquire)
    }

    pub fn set_host_fence_completed(&self, value: u64) {
        self.host_fence_completed.store(value, Ordering::Release);
    }

    /// Check if there are pending commands in the ring.
    pub fn has_pending_commands(&self) -> bool {
        self.producer_ptr() > self.consumer_ptr()
    }

    /// Number of pending bytes in the ring.
    pub fn pending_bytes(&self) -> u64 {
        self.producer_ptr().saturating_sub(self.consumer_ptr())
    }

    // =========================================================================
    // Status and error reporting
    // =========================================================================

    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::Release);
    }

    pub fn get_status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status_flag(&self, flag: u32) {
        self.status.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear_status_flag(&self, flag: u32) {
        self.status.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn has_status_flag(&self, flag: u32) -> bool {
        (self.get_status() & flag) != 0
    }

    /// Record an error code and diagnostic data, and set the ERROR bit.
    pub fn set_error(&self, code: u32, data: u32) {
        self.error_code.store(code, Ordering::Release);
        self.error_data.store(data, Ordering::Release);
        self.set_status_flag(PVGPU_STATUS_ERROR);
    }

    pub fn get_error_code(&self) -> u32 {
        self.error_code.load(Ordering::Acquire)
    }

    pub fn get_error_data(&self) -> u32 {
        self.error_data.load(Ordering::Acquire)
    }

    pub fn clear_error(&self) {
        self.error_code.store(PVGPU_ERROR_SUCCESS, Ordering::Release);
        self.error_data.store(0, Ordering::Release);
        self.clear_status_flag(PVGPU_STATUS_ERROR);
    }

    // =========================================================================
    // Display geometry
    // =========================================================================

    pub fn display_mode(&self) -> DisplayMode {
        DisplayMode {
            width: self.display_width.load(Ordering::Acquire),
            height: self.display_height.load(Ordering::Acquire),
            refresh_rate: self.display_refresh.load(Ordering::Acquire),
            format: self.display_format.load(Ordering::Acquire),
        }
    }

    pub fn set_display_mode(&self, width: u32, height: u32, refresh_rate: u32) {
        self.display_width.store(width, Ordering::Release);
        self.display_height.store(height, Ordering::Release);
        self.display_refresh.store(refresh_rate, Ordering::Release);
    }

    pub fn set_display_format(&self, format: u32) {
        self.display_format.store(format, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::*;

    fn fresh_region() -> Box<ControlRegion> {
        // SAFETY: ControlRegion is valid for any byte pattern (atomics and
        // plain integers only) and init() overwrites everything.
        let mut region: Box<ControlRegion> = unsafe { Box::new_zeroed().assume_init() };
        unsafe {
            region.init(
                crate::PVGPU_FEATURES_MVP,
                0x1000,
                0x1000000,
                0x1001000,
                0xEFFF000,
            );
        }
        region
    }

    #[test]
    fn control_region_is_one_page() {
        assert_eq!(std::mem::size_of::<ControlRegion>(), 4096);
    }

    #[test]
    fn init_writes_layout_once() {
        let region = fresh_region();
        assert_eq!(region.magic(), PVGPU_MAGIC);
        assert_eq!(region.version() >> 16, 1);
        assert_eq!(region.ring_offset(), 0x1000);
        assert_eq!(region.ring_size(), 0x1000000);
        assert_eq!(region.heap_offset(), 0x1001000);
        assert_eq!(region.heap_size(), 0xEFF_F000);
        assert_eq!(region.producer_ptr(), 0);
        assert_eq!(region.consumer_ptr(), 0);
        assert!(region.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut region = fresh_region();
        region.magic = 0xDEADBEEF;
        assert!(region.validate().is_err());
    }

    #[test]
    fn validate_rejects_version_mismatch() {
        let mut region = fresh_region();
        region.version = 2 << 16;
        assert!(region.validate().is_err());
    }

    #[test]
    fn set_error_raises_error_flag() {
        let region = fresh_region();
        region.set_status(PVGPU_STATUS_READY);
        region.set_error(PVGPU_ERROR_SHADER_COMPILE, 42);
        assert_eq!(region.get_error_code(), PVGPU_ERROR_SHADER_COMPILE);
        assert_eq!(region.get_error_data(), 42);
        assert!(region.has_status_flag(PVGPU_STATUS_ERROR));
        assert!(region.has_status_flag(PVGPU_STATUS_READY));

        region.clear_error();
        assert_eq!(region.get_error_code(), PVGPU_ERROR_SUCCESS);
        assert!(!region.has_status_flag(PVGPU_STATUS_ERROR));
    }

    #[test]
    fn pending_bytes_tracks_cursors() {
        let region = fresh_region();
        assert!(!region.has_pending_commands());
        region.set_producer_ptr(128);
        assert_eq!(region.pending_bytes(), 128);
        region.set_consumer_ptr(64);
        assert_eq!(region.pending_bytes(), 64);
    }
}
