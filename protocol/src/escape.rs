//! Escape interface between the user-mode and kernel-mode halves.
//!
//! Each escape is a fixed-size `#[repr(C)]` request/response struct
//! beginning with [`EscapeHeader`]. The caller writes `code` and the input
//! fields; the gateway writes `status` and any output fields back into the
//! same buffer. How the buffer crosses the privilege boundary is the
//! platform's business, not this crate's.

use bytemuck::{Pod, Zeroable};

use crate::error::{PvgpuError, Result, PVGPU_ERROR_SUCCESS};

// =============================================================================
// Escape Codes
// =============================================================================

pub const PVGPU_ESC_GET_SHMEM_INFO: u32 = 0x0001;
pub const PVGPU_ESC_ALLOC_HEAP: u32 = 0x0002;
pub const PVGPU_ESC_FREE_HEAP: u32 = 0x0003;
pub const PVGPU_ESC_SUBMIT_COMMANDS: u32 = 0x0004;
pub const PVGPU_ESC_RING_DOORBELL: u32 = 0x0005;
pub const PVGPU_ESC_WAIT_FENCE: u32 = 0x0006;
pub const PVGPU_ESC_GET_CAPS: u32 = 0x0007;
pub const PVGPU_ESC_SET_DISPLAY_MODE: u32 = 0x0008;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscapeHeader {
    pub code: u32,
    /// Written by the gateway: `PVGPU_ERROR_SUCCESS` or a wire error code.
    pub status: u32,
}

pub const PVGPU_ESCAPE_HEADER_SIZE: usize = std::mem::size_of::<EscapeHeader>();

impl EscapeHeader {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            status: PVGPU_ERROR_SUCCESS,
        }
    }

    pub fn result(&self) -> Result<()> {
        PvgpuError::from_code(self.status)
    }
}

/// Returns the user-visible geometry of the shared region. Called once per
/// device at initialization.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscGetShmemInfo {
    pub header: EscapeHeader,
    // out
    pub shmem_size: u64,
    pub control_offset: u32,
    pub control_size: u32,
    pub ring_offset: u32,
    pub ring_size: u32,
    pub heap_offset: u32,
    pub heap_size: u32,
    pub features: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscAllocHeap {
    pub header: EscapeHeader,
    // in
    pub size: u32,
    pub alignment: u32,
    // out
    pub offset: u32,
    pub allocated_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscFreeHeap {
    pub header: EscapeHeader,
    pub offset: u32,
    pub size: u32,
}

/// Copy a staged batch into the ring atomically with respect to other
/// submissions, advance the producer and ring the doorbell. The batch bytes
/// are cited by heap offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscSubmitCommands {
    pub header: EscapeHeader,
    // in
    pub heap_offset: u32,
    pub size: u32,
    /// Highest fence value contained in the batch (0 = none); mirrored to
    /// `guest_fence_request` after the producer advances.
    pub fence: u64,
    // out
    pub producer_ptr: u64,
}

/// Best-effort doorbell without a submission; the usual path is
/// [`EscSubmitCommands`], which rings implicitly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscRingDoorbell {
    pub header: EscapeHeader,
}

/// Block until `host_fence_completed >= fence_value`, the timeout elapses,
/// or the device dies. `timeout_ms == 0` means poll only: one check and an
/// immediate return, never a wait.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscWaitFence {
    pub header: EscapeHeader,
    // in
    pub fence_value: u64,
    pub timeout_ms: u32,
    pub _reserved: u32,
    // out
    pub completed_fence: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscGetCaps {
    pub header: EscapeHeader,
    // out
    pub max_texture_size: u32,
    pub max_render_targets: u32,
    pub max_vertex_streams: u32,
    pub max_constant_buffers: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub display_refresh: u32,
    pub display_format: u32,
    pub features: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscSetDisplayMode {
    pub header: EscapeHeader,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub _reserved: u32,
}

// Adapter limits reported by GET_CAPS (D3D11 feature level 11_0).
pub const PVGPU_CAP_MAX_TEXTURE_SIZE: u32 = 16384;
pub const PVGPU_CAP_MAX_RENDER_TARGETS: u32 = 8;
pub const PVGPU_CAP_MAX_VERTEX_STREAMS: u32 = 16;
pub const PVGPU_CAP_MAX_CONSTANT_BUFFERS: u32 = 14;

const _: () = assert!(std::mem::size_of::<EscapeHeader>() == 8);
const _: () = assert!(std::mem::size_of::<EscGetShmemInfo>() == 48);
const _: () = assert!(std::mem::size_of::<EscAllocHeap>() == 24);
const _: () = assert!(std::mem::size_of::<EscFreeHeap>() == 16);
const _: () = assert!(std::mem::size_of::<EscSubmitCommands>() == 32);
const _: () = assert!(std::mem::size_of::<EscRingDoorbell>() == 8);
const _: () = assert!(std::mem::size_of::<EscWaitFence>() == 32);
const _: () = assert!(std::mem::size_of::<EscGetCaps>() == 48);
const _: () = assert!(std::mem::size_of::<EscSetDisplayMode>() == 24);

/// Peek at the escape code in a raw request buffer.
pub fn peek_code(buf: &[u8]) -> Result<u32> {
    if buf.len() < PVGPU_ESCAPE_HEADER_SIZE {
        return Err(PvgpuError::InvalidParameter);
    }
    let header: EscapeHeader = bytemuck::pod_read_unaligned(&buf[..PVGPU_ESCAPE_HEADER_SIZE]);
    Ok(header.code)
}

/// Write a status code into the header of a raw escape buffer.
pub fn write_status(buf: &mut [u8], status: u32) {
    if buf.len() >= PVGPU_ESCAPE_HEADER_SIZE {
        buf[4..8].copy_from_slice(&status.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_and_status_writeback() {
        let mut req = EscAllocHeap {
            header: EscapeHeader::new(PVGPU_ESC_ALLOC_HEAP),
            size: 4096,
            alignment: 16,
            offset: 0,
            allocated_size: 0,
        };
        let buf = bytemuck::bytes_of_mut(&mut req);
        assert_eq!(peek_code(buf).unwrap(), PVGPU_ESC_ALLOC_HEAP);

        write_status(buf, crate::error::PVGPU_ERROR_HEAP_EXHAUSTED);
        assert_eq!(req.header.result(), Err(PvgpuError::HeapExhausted));
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(peek_code(&[0u8; 4]), Err(PvgpuError::InvalidParameter));
    }
}
