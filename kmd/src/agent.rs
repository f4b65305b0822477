//! The kernel agent: owner of everything privileged on the guest side.
//!
//! One instance per device. It holds the shared-region mapping, the heap
//! allocator behind its own lock, the ring writer behind the submission
//! lock, the fence waiters and the doorbell. User mode reaches all of it
//! through [`KernelAgent::escape`], a request/response byte interface;
//! the typed wrappers below it are conveniences for in-process callers
//! and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytemuck::Pod;
use tracing::{debug, info, warn};

use pvgpu_protocol::escape::*;
use pvgpu_protocol::{
    PvgpuError, Result, PVGPU_CONTROL_REGION_SIZE, PVGPU_ERROR_SUCCESS,
    PVGPU_STATUS_DEVICE_LOST, PVGPU_STATUS_SHUTDOWN,
};

use crate::device::Doorbell;
use crate::fence::FenceWaiters;
use crate::heap::HeapAllocator;
use crate::ring::RingWriter;
use crate::shmem::{GuestMapping, UserView};

pub struct KernelAgent {
    mapping: Arc<GuestMapping>,
    ring: Mutex<RingWriter>,
    heap: Mutex<HeapAllocator>,
    waiters: Arc<FenceWaiters>,
    doorbell: Box<dyn Doorbell>,
    link_down: Arc<AtomicBool>,
}

impl KernelAgent {
    pub fn new(mapping: GuestMapping, doorbell: Box<dyn Doorbell>) -> Self {
        let mapping = Arc::new(mapping);
        let control = mapping.control();
        let heap = HeapAllocator::new(control.heap_offset(), control.heap_size());
        let link_down = Arc::new(AtomicBool::new(false));
        info!(
            heap_blocks = heap.block_count(),
            ring_size = control.ring_size(),
            "kernel agent initialized"
        );
        Self {
            ring: Mutex::new(RingWriter::new(Arc::clone(&mapping), Arc::clone(&link_down))),
            heap: Mutex::new(heap),
            waiters: Arc::new(FenceWaiters::new()),
            doorbell,
            mapping,
            link_down,
        }
    }

    /// The secondary mapping handed to the user producer.
    pub fn user_view(&self) -> UserView {
        UserView::new(Arc::clone(&self.mapping))
    }

    pub fn fence_waiters(&self) -> Arc<FenceWaiters> {
        Arc::clone(&self.waiters)
    }

    pub fn link_down_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.link_down)
    }

    /// Observe device loss or shutdown before touching anything shared.
    fn check_alive(&self) -> Result<()> {
        if self.link_down.load(Ordering::Acquire) {
            return Err(PvgpuError::BackendDisconnected);
        }
        let status = self.mapping.control().get_status();
        if status & PVGPU_STATUS_DEVICE_LOST != 0 {
            return Err(PvgpuError::DeviceLost);
        }
        if status & PVGPU_STATUS_SHUTDOWN != 0 {
            return Err(PvgpuError::BackendDisconnected);
        }
        Ok(())
    }

    // =========================================================================
    // Escape gateway
    // =========================================================================

    /// Dispatch one escape. The buffer holds a request struct beginning
    /// with [`EscapeHeader`]; status and output fields are written back in
    /// place. The returned `Result` mirrors the status word.
    pub fn escape(&self, buf: &mut [u8]) -> Result<()> {
        let code = peek_code(buf).inspect_err(|e| {
            write_status(buf, e.code());
        })?;

        let outcome = match code {
            PVGPU_ESC_GET_SHMEM_INFO => self.esc_in_place(buf, |req| self.esc_shmem_info(req)),
            PVGPU_ESC_ALLOC_HEAP => self.esc_in_place(buf, |req| self.esc_alloc_heap(req)),
            PVGPU_ESC_FREE_HEAP => self.esc_in_place(buf, |req| self.esc_free_heap(req)),
            PVGPU_ESC_SUBMIT_COMMANDS => self.esc_in_place(buf, |req| self.esc_submit(req)),
            PVGPU_ESC_RING_DOORBELL => self.esc_in_place(buf, |_: &mut EscRingDoorbell| {
                self.check_alive()?;
                self.doorbell.ring()
            }),
            PVGPU_ESC_WAIT_FENCE => self.esc_in_place(buf, |req| self.esc_wait_fence(req)),
            PVGPU_ESC_GET_CAPS => self.esc_in_place(buf, |req| self.esc_get_caps(req)),
            PVGPU_ESC_SET_DISPLAY_MODE => {
                self.esc_in_place(buf, |req| self.esc_set_display_mode(req))
            }
            other => {
                warn!(code = other, "unknown escape code");
                Err(PvgpuError::InvalidCommand)
            }
        };

        write_status(
            buf,
            match outcome {
                Ok(()) => PVGPU_ERROR_SUCCESS,
                Err(e) => e.code(),
            },
        );
        outcome
    }

    /// Decode the request struct, run the handler, write the struct back.
    /// Undersized buffers are a structural failure.
    fn esc_in_place<T: Pod>(
        &self,
        buf: &mut [u8],
        handler: impl FnOnce(&mut T) -> Result<()>,
    ) -> Result<()> {
        let size = std::mem::size_of::<T>();
        if buf.len() < size {
            return Err(PvgpuError::InvalidParameter);
        }
        let mut req: T = bytemuck::pod_read_unaligned(&buf[..size]);
        let outcome = handler(&mut req);
        buf[..size].copy_from_slice(bytemuck::bytes_of(&req));
        outcome
    }

    fn esc_shmem_info(&self, req: &mut EscGetShmemInfo) -> Result<()> {
        let control = self.mapping.control();
        req.shmem_size = self.mapping.size() as u64;
        req.control_offset = 0;
        req.control_size = PVGPU_CONTROL_REGION_SIZE as u32;
        req.ring_offset = control.ring_offset();
        req.ring_size = control.ring_size();
        req.heap_offset = control.heap_offset();
        req.heap_size = control.heap_size();
        req.features = control.features();
        Ok(())
    }

    fn esc_alloc_heap(&self, req: &mut EscAllocHeap) -> Result<()> {
        self.check_alive()?;
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let (offset, allocated_size) = heap.allocate(req.size, req.alignment)?;
        req.offset = offset;
        req.allocated_size = allocated_size;
        Ok(())
    }

    fn esc_free_heap(&self, req: &mut EscFreeHeap) -> Result<()> {
        self.check_alive()?;
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.free(req.offset, req.size)
    }

    /// Copy a staged batch from the heap into the ring, publish the
    /// producer, mirror the fence request and ring the doorbell. The ring
    /// lock makes the batch contiguous with respect to other submissions.
    fn esc_submit(&self, req: &mut EscSubmitCommands) -> Result<()> {
        self.check_alive()?;
        if req.size == 0 || req.size % 16 != 0 {
            return Err(PvgpuError::InvalidParameter);
        }

        let control = self.mapping.control();
        let heap_start = control.heap_offset() as u64;
        let heap_end = heap_start + control.heap_size() as u64;
        let start = req.heap_offset as u64;
        if start < heap_start || start + req.size as u64 > heap_end {
            return Err(PvgpuError::InvalidParameter);
        }

        let producer = {
            let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            // SAFETY: range checked against the heap segment above; the
            // producer owns these bytes until the submission's fence
            // retires.
            let batch =
                unsafe { self.mapping.slice(start as usize, req.size as usize) }
                    .map_err(|_| PvgpuError::InvalidParameter)?;
            ring.submit(batch)?
        };

        if req.fence != 0 {
            control.set_guest_fence_request(req.fence);
        }
        req.producer_ptr = producer;
        self.doorbell.ring()?;
        debug!(bytes = req.size, fence = req.fence, "commands submitted");
        Ok(())
    }

    fn esc_wait_fence(&self, req: &mut EscWaitFence) -> Result<()> {
        let completed = self.waiters.wait(
            self.mapping.control(),
            &self.link_down,
            req.fence_value,
            req.timeout_ms,
        );
        req.completed_fence = self.mapping.control().host_fence_completed();
        completed.map(|_| ())
    }

    fn esc_get_caps(&self, req: &mut EscGetCaps) -> Result<()> {
        let control = self.mapping.control();
        let mode = control.display_mode();
        req.max_texture_size = PVGPU_CAP_MAX_TEXTURE_SIZE;
        req.max_render_targets = PVGPU_CAP_MAX_RENDER_TARGETS;
        req.max_vertex_streams = PVGPU_CAP_MAX_VERTEX_STREAMS;
        req.max_constant_buffers = PVGPU_CAP_MAX_CONSTANT_BUFFERS;
        req.display_width = mode.width;
        req.display_height = mode.height;
        req.display_refresh = mode.refresh_rate;
        req.display_format = mode.format;
        req.features = control.features();
        Ok(())
    }

    fn esc_set_display_mode(&self, req: &mut EscSetDisplayMode) -> Result<()> {
        self.check_alive()?;
        if req.width == 0 || req.height == 0 || req.refresh_rate == 0 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.mapping
            .control()
            .set_display_mode(req.width, req.height, req.refresh_rate);
        Ok(())
    }

    // =========================================================================
    // Typed wrappers
    // =========================================================================

    pub fn get_shmem_info(&self) -> Result<EscGetShmemInfo> {
        let mut req = EscGetShmemInfo {
            header: EscapeHeader::new(PVGPU_ESC_GET_SHMEM_INFO),
            ..bytemuck::Zeroable::zeroed()
        };
        let mut buf = [0u8; std::mem::size_of::<EscGetShmemInfo>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)?;
        req = bytemuck::pod_read_unaligned(&buf);
        Ok(req)
    }

    pub fn alloc_heap(&self, size: u32, alignment: u32) -> Result<(u32, u32)> {
        let mut req = EscAllocHeap {
            header: EscapeHeader::new(PVGPU_ESC_ALLOC_HEAP),
            size,
            alignment,
            offset: 0,
            allocated_size: 0,
        };
        let mut buf = [0u8; std::mem::size_of::<EscAllocHeap>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)?;
        req = bytemuck::pod_read_unaligned(&buf);
        Ok((req.offset, req.allocated_size))
    }

    pub fn free_heap(&self, offset: u32, size: u32) -> Result<()> {
        let req = EscFreeHeap {
            header: EscapeHeader::new(PVGPU_ESC_FREE_HEAP),
            offset,
            size,
        };
        let mut buf = [0u8; std::mem::size_of::<EscFreeHeap>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)
    }

    pub fn submit_commands(&self, heap_offset: u32, size: u32, fence: u64) -> Result<u64> {
        let mut req = EscSubmitCommands {
            header: EscapeHeader::new(PVGPU_ESC_SUBMIT_COMMANDS),
            heap_offset,
            size,
            fence,
            producer_ptr: 0,
        };
        let mut buf = [0u8; std::mem::size_of::<EscSubmitCommands>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)?;
        req = bytemuck::pod_read_unaligned(&buf);
        Ok(req.producer_ptr)
    }

    pub fn ring_doorbell(&self) -> Result<()> {
        let mut buf = [0u8; std::mem::size_of::<EscRingDoorbell>()];
        buf.copy_from_slice(bytemuck::bytes_of(&EscRingDoorbell {
            header: EscapeHeader::new(PVGPU_ESC_RING_DOORBELL),
        }));
        self.escape(&mut buf)
    }

    pub fn wait_fence(&self, fence_value: u64, timeout_ms: u32) -> Result<u64> {
        let mut req = EscWaitFence {
            header: EscapeHeader::new(PVGPU_ESC_WAIT_FENCE),
            fence_value,
            timeout_ms,
            _reserved: 0,
            completed_fence: 0,
        };
        let mut buf = [0u8; std::mem::size_of::<EscWaitFence>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)?;
        req = bytemuck::pod_read_unaligned(&buf);
        Ok(req.completed_fence)
    }

    pub fn get_caps(&self) -> Result<EscGetCaps> {
        let mut req = EscGetCaps {
            header: EscapeHeader::new(PVGPU_ESC_GET_CAPS),
            ..bytemuck::Zeroable::zeroed()
        };
        let mut buf = [0u8; std::mem::size_of::<EscGetCaps>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)?;
        req = bytemuck::pod_read_unaligned(&buf);
        Ok(req)
    }

    pub fn set_display_mode(&self, width: u32, height: u32, refresh_rate: u32) -> Result<()> {
        let req = EscSetDisplayMode {
            header: EscapeHeader::new(PVGPU_ESC_SET_DISPLAY_MODE),
            width,
            height,
            refresh_rate,
            _reserved: 0,
        };
        let mut buf = [0u8; std::mem::size_of::<EscSetDisplayMode>()];
        buf.copy_from_slice(bytemuck::bytes_of(&req));
        self.escape(&mut buf)
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// React to a device-wide reset: outstanding heap allocations are
    /// freed and fence waiters woken so they re-observe the fresh state.
    pub fn handle_reset(&self) {
        info!("handling device reset: dropping heap allocations");
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_all();
        self.waiters.notify_all();
    }
}
