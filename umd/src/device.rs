//! The user producer's device object.
//!
//! One `Device` per logical adapter instance. Calls are serialized by an
//! internal lock; a multi-threaded client just contends on it, the
//! producer needs no parallelism against itself. Handles and fence
//! values are minted here and scoped to this device.
//!
//! Heap ranges backing in-flight commands stay allocated until a fence
//! ordered after them completes; the device tags each range with the next
//! fence value to be minted and retires it when a wait observes that
//! value done.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};

use pvgpu_kmd::{KernelAgent, UserView};
use pvgpu_protocol::escape::EscGetCaps;
use pvgpu_protocol::*;

use crate::staging::{StagingBuffer, STAGING_CAPACITY};

/// Opaque handle minted by the producer; 0 is reserved for none/unbind.
pub type ResourceId = u32;

/// An open write mapping: a heap range the caller fills before `unmap`.
#[derive(Debug, Clone, Copy)]
pub struct MappedWrite {
    pub heap_offset: u32,
    pub size: u32,
}

struct DeviceInner {
    staging: StagingBuffer,
    /// Persistent heap range the staging buffer spills into at flush.
    submit_area: (u32, u32),
    next_fence: u64,
    next_resource: u32,
    /// Highest fence value staged into the current batch.
    batch_fence: u64,
    /// Heap ranges waiting on a fence before they can be freed:
    /// (retiring fence value, offset, size).
    in_flight: Vec<(u64, u32, u32)>,
}

pub struct Device {
    agent: Arc<KernelAgent>,
    view: UserView,
    inner: Mutex<DeviceInner>,
    /// Sticky wire code of the first fatal error observed (0 = healthy);
    /// every later call short-circuits with the same kind without
    /// touching shared memory.
    fatal_code: AtomicU32,
}

impl Device {
    pub fn new(agent: Arc<KernelAgent>) -> Result<Self> {
        let view = agent.user_view();
        // One escape at init to learn the geometry; the info itself is
        // only needed to size the staging spill area sensibly.
        let info = agent.get_shmem_info()?;
        // The staging buffer can never outgrow its spill area, and a full
        // batch must always fit the ring, so on a small region all three
        // shrink together.
        let spill = (STAGING_CAPACITY as u32)
            .min(info.heap_size / 4)
            .min(info.ring_size / 2);
        let submit_area = agent.alloc_heap(spill, 16)?;

        debug!(
            heap_size = info.heap_size,
            spill_offset = submit_area.0,
            "producer device created"
        );
        Ok(Self {
            agent,
            view,
            inner: Mutex::new(DeviceInner {
                staging: StagingBuffer::new(spill as usize),
                submit_area,
                next_fence: 1,
                next_resource: 1,
                batch_fence: 0,
                in_flight: Vec::new(),
            }),
            fatal_code: AtomicU32::new(PVGPU_ERROR_SUCCESS),
        })
    }

    // =========================================================================
    // Error latching
    // =========================================================================

    fn guard(&self) -> Result<()> {
        PvgpuError::from_code(self.fatal_code.load(Ordering::Acquire))
    }

    /// Fatal errors taint the device: everything after returns the same
    /// kind without reaching shared memory.
    fn latch<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                let _ = self.fatal_code.compare_exchange(
                    PVGPU_ERROR_SUCCESS,
                    e.code(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
        result
    }

    // =========================================================================
    // Staging and submission
    // =========================================================================

    fn stage<T: Pod>(&self, inner: &mut DeviceInner, cmd: &T) -> Result<()> {
        let bytes = bytemuck::bytes_of(cmd);
        if !inner.staging.fits(bytes.len()) {
            self.flush_locked(inner)?;
            if !inner.staging.fits(bytes.len()) {
                return Err(PvgpuError::OutOfMemory);
            }
        }
        inner.staging.push(bytes);
        Ok(())
    }

    fn flush_locked(&self, inner: &mut DeviceInner) -> Result<()> {
        if inner.staging.is_empty() {
            return Ok(());
        }
        let bytes = inner.staging.bytes();
        let (spill_offset, spill_size) = inner.submit_area;
        debug_assert!(bytes.len() <= spill_size as usize);

        self.view
            .write_heap(spill_offset, bytes)
            .map_err(|_| PvgpuError::InvalidParameter)?;
        let result =
            self.agent
                .submit_commands(spill_offset, bytes.len() as u32, inner.batch_fence);
        self.latch(result)?;

        trace!(bytes = bytes.len(), fence = inner.batch_fence, "flushed");
        inner.staging.clear();
        inner.batch_fence = 0;
        Ok(())
    }

    /// Submit everything staged so far and ring the doorbell.
    pub fn flush(&self) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.flush_locked(&mut inner)
    }

    /// Stage a FENCE record and return its value.
    pub fn fence(&self) -> Result<u64> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.stage_fence(&mut inner)
    }

    fn stage_fence(&self, inner: &mut DeviceInner) -> Result<u64> {
        let value = inner.next_fence;
        inner.next_fence += 1;
        let cmd = CmdFence {
            header: CommandHeader::new(PVGPU_CMD_FENCE, std::mem::size_of::<CmdFence>(), 0),
            fence_value: value,
            _reserved: 0,
        };
        self.stage(inner, &cmd)?;
        inner.batch_fence = value;
        Ok(value)
    }

    /// Wait until the host completes `value`. Fast path reads the shared
    /// fence directly; only unsatisfied waits escape. A successful wait
    /// retires heap ranges whose fences are done. `timeout_ms == 0` polls
    /// once and never blocks.
    pub fn wait_fence(&self, value: u64, timeout_ms: u32) -> Result<u64> {
        self.guard()?;
        let completed = self.view.host_fence_completed();
        let completed = if completed >= value {
            completed
        } else {
            let result = self.agent.wait_fence(value, timeout_ms);
            self.latch(result)?
        };
        self.retire(completed);
        Ok(completed)
    }

    /// Fence the work staged so far, flush, and block until it completes.
    pub fn wait_idle(&self, timeout_ms: u32) -> Result<()> {
        let value = {
            self.guard()?;
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let value = self.stage_fence(&mut inner)?;
            self.flush_locked(&mut inner)?;
            value
        };
        self.wait_fence(value, timeout_ms)?;
        Ok(())
    }

    fn retire(&self, completed: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut retained = Vec::with_capacity(inner.in_flight.len());
        for (fence, offset, size) in inner.in_flight.drain(..) {
            if fence <= completed {
                let _ = self.agent.free_heap(offset, size);
            } else {
                retained.push((fence, offset, size));
            }
        }
        inner.in_flight = retained;
    }

    // =========================================================================
    // Heap payloads
    // =========================================================================

    pub fn heap_alloc(&self, size: u32, alignment: u32) -> Result<(u32, u32)> {
        self.guard()?;
        let result = self.agent.alloc_heap(size, alignment);
        self.latch(result)
    }

    pub fn heap_free(&self, offset: u32, size: u32) -> Result<()> {
        self.guard()?;
        let result = self.agent.free_heap(offset, size);
        self.latch(result)
    }

    /// Copy a bulk payload into a fresh heap range and schedule the range
    /// to be freed once the next-minted fence retires.
    fn stage_payload(&self, inner: &mut DeviceInner, data: &[u8]) -> Result<u32> {
        let (offset, size) = self.latch(self.agent.alloc_heap(data.len() as u32, 16))?;
        self.view
            .write_heap(offset, data)
            .map_err(|_| PvgpuError::InvalidParameter)?;
        inner.in_flight.push((inner.next_fence, offset, size));
        Ok(offset)
    }

    fn mint_resource(inner: &mut DeviceInner) -> ResourceId {
        let id = inner.next_resource;
        inner.next_resource += 1;
        id
    }

    // =========================================================================
    // Resource commands
    // =========================================================================

    pub fn create_buffer(
        &self,
        size: u32,
        bind_flags: u32,
        initial: Option<&[u8]>,
    ) -> Result<ResourceId> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = Self::mint_resource(&mut inner);
        let (heap_offset, data_size) = match initial {
            Some(data) => (self.stage_payload(&mut inner, data)?, data.len() as u32),
            None => (0, 0),
        };
        let cmd = CmdCreateResource {
            header: CommandHeader::new(
                PVGPU_CMD_CREATE_RESOURCE,
                std::mem::size_of::<CmdCreateResource>(),
                id,
            ),
            resource_type: ResourceType::Buffer as u32,
            width: size,
            bind_flags,
            heap_offset,
            data_size,
            ..Zeroable::zeroed()
        };
        self.stage(&mut inner, &cmd)?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_texture2d(
        &self,
        width: u32,
        height: u32,
        format: u32,
        mip_levels: u32,
        bind_flags: u32,
        initial: Option<&[u8]>,
    ) -> Result<ResourceId> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = Self::mint_resource(&mut inner);
        let (heap_offset, data_size) = match initial {
            Some(data) => (self.stage_payload(&mut inner, data)?, data.len() as u32),
            None => (0, 0),
        };
        let cmd = CmdCreateResource {
            header: CommandHeader::new(
                PVGPU_CMD_CREATE_RESOURCE,
                std::mem::size_of::<CmdCreateResource>(),
                id,
            ),
            resource_type: ResourceType::Texture2D as u32,
            format,
            width,
            height,
            depth: 1,
            mip_levels,
            sample_count: 1,
            bind_flags,
            heap_offset,
            data_size,
            ..Zeroable::zeroed()
        };
        self.stage(&mut inner, &cmd)?;
        Ok(id)
    }

    /// Create a view (RTV/DSV/SRV/UAV) over `parent`.
    pub fn create_view(
        &self,
        parent: ResourceId,
        kind: ResourceType,
        format: u32,
    ) -> Result<ResourceId> {
        if !kind.is_view() || parent == 0 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = Self::mint_resource(&mut inner);
        let cmd = CmdCreateResource {
            header: CommandHeader::new(
                PVGPU_CMD_CREATE_RESOURCE,
                std::mem::size_of::<CmdCreateResource>(),
                id,
            ),
            resource_type: kind as u32,
            format,
            parent_id: parent,
            ..Zeroable::zeroed()
        };
        self.stage(&mut inner, &cmd)?;
        Ok(id)
    }

    /// Create a pipeline state object (blend/rasterizer/depth-stencil/
    /// sampler) or input layout from a descriptor blob.
    pub fn create_state(&self, kind: ResourceType, descriptor: &[u8]) -> Result<ResourceId> {
        if !matches!(
            kind,
            ResourceType::BlendState
                | ResourceType::RasterizerState
                | ResourceType::DepthStencilState
                | ResourceType::SamplerState
                | ResourceType::InputLayout
        ) {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = Self::mint_resource(&mut inner);
        let (heap_offset, data_size) = if descriptor.is_empty() {
            (0, 0)
        } else {
            (
                self.stage_payload(&mut inner, descriptor)?,
                descriptor.len() as u32,
            )
        };
        let cmd = CmdCreateResource {
            header: CommandHeader::new(
                PVGPU_CMD_CREATE_RESOURCE,
                std::mem::size_of::<CmdCreateResource>(),
                id,
            ),
            resource_type: kind as u32,
            heap_offset,
            data_size,
            ..Zeroable::zeroed()
        };
        self.stage(&mut inner, &cmd)?;
        Ok(id)
    }

    pub fn open_resource(
        &self,
        shared_handle: u32,
        kind: ResourceType,
        format: u32,
        width: u32,
        height: u32,
    ) -> Result<ResourceId> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = Self::mint_resource(&mut inner);
        let cmd = CmdOpenResource {
            header: CommandHeader::new(
                PVGPU_CMD_OPEN_RESOURCE,
                std::mem::size_of::<CmdOpenResource>(),
                id,
            ),
            shared_handle,
            resource_type: kind as u32,
            format,
            width,
            height,
            bind_flags: 0,
            misc_flags: 0,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)?;
        Ok(id)
    }

    pub fn destroy_resource(&self, id: ResourceId) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDestroyResource {
            header: CommandHeader::new(
                PVGPU_CMD_DESTROY_RESOURCE,
                std::mem::size_of::<CmdDestroyResource>(),
                id,
            ),
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn create_shader(&self, stage: ShaderStage, bytecode: &[u8]) -> Result<ResourceId> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = Self::mint_resource(&mut inner);
        let bytecode_offset = self.stage_payload(&mut inner, bytecode)?;
        let cmd = CmdCreateShader {
            header: CommandHeader::new(
                PVGPU_CMD_CREATE_SHADER,
                std::mem::size_of::<CmdCreateShader>(),
                id,
            ),
            shader_type: stage as u32,
            bytecode_size: bytecode.len() as u32,
            bytecode_offset,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)?;
        Ok(id)
    }

    pub fn destroy_shader(&self, id: ResourceId) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDestroyShader {
            header: CommandHeader::new(
                PVGPU_CMD_DESTROY_SHADER,
                std::mem::size_of::<CmdDestroyShader>(),
                id,
            ),
        };
        self.stage(&mut inner, &cmd)
    }

    /// Full-resource update from a payload copied through the heap.
    pub fn update_resource(&self, id: ResourceId, subresource: u32, data: &[u8]) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let heap_offset = self.stage_payload(&mut inner, data)?;
        let cmd = CmdUpdateResource {
            header: CommandHeader::new(
                PVGPU_CMD_UPDATE_RESOURCE,
                std::mem::size_of::<CmdUpdateResource>(),
                id,
            ),
            subresource,
            heap_offset,
            data_size: data.len() as u32,
            ..Zeroable::zeroed()
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn copy_resource(&self, dst: ResourceId, src: ResourceId) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdCopyResource {
            header: CommandHeader::new(
                PVGPU_CMD_COPY_RESOURCE,
                std::mem::size_of::<CmdCopyResource>(),
                dst,
            ),
            dst_resource_id: dst,
            src_resource_id: src,
            _reserved: [0; 2],
        };
        self.stage(&mut inner, &cmd)
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// Read back `size` bytes of a resource. Submits a MAP command citing
    /// a heap range, fences behind it and waits; on return the bytes
    /// reflect every write ordered before the map.
    pub fn map_read(
        &self,
        id: ResourceId,
        subresource: u32,
        size: u32,
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        self.guard()?;
        let (offset, alloc_size) = self.latch(self.agent.alloc_heap(size, 16))?;

        let fence = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let cmd = CmdMapResource {
                header: CommandHeader::new(
                    PVGPU_CMD_MAP_RESOURCE,
                    std::mem::size_of::<CmdMapResource>(),
                    id,
                ),
                subresource,
                map_type: MapType::Read as u32,
                map_flags: 0,
                heap_offset: offset,
                data_size: size,
                _reserved: [0; 3],
            };
            self.stage(&mut inner, &cmd)?;
            let fence = self.stage_fence(&mut inner)?;
            self.flush_locked(&mut inner)?;
            fence
        };

        let wait = self.wait_fence(fence, timeout_ms);
        if wait.is_err() {
            let _ = self.agent.free_heap(offset, alloc_size);
        }
        wait?;

        let mut data = vec![0u8; size as usize];
        self.view
            .read_heap(offset, &mut data)
            .map_err(|_| PvgpuError::InvalidParameter)?;
        self.latch(self.agent.free_heap(offset, alloc_size))?;
        Ok(data)
    }

    /// Open a write mapping: the caller fills the returned heap range,
    /// then calls [`unmap`](Self::unmap) to push it into the resource.
    pub fn map_write(&self, id: ResourceId, subresource: u32, size: u32) -> Result<MappedWrite> {
        self.guard()?;
        let (offset, alloc_size) = self.latch(self.agent.alloc_heap(size, 16))?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdMapResource {
            header: CommandHeader::new(
                PVGPU_CMD_MAP_RESOURCE,
                std::mem::size_of::<CmdMapResource>(),
                id,
            ),
            subresource,
            map_type: MapType::WriteDiscard as u32,
            map_flags: 0,
            heap_offset: offset,
            data_size: size,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)?;
        Ok(MappedWrite {
            heap_offset: offset,
            size: alloc_size,
        })
    }

    /// Copy mapped bytes into the range opened by `map_write`.
    pub fn write_mapped(&self, mapping: &MappedWrite, data: &[u8]) -> Result<()> {
        self.guard()?;
        if data.len() > mapping.size as usize {
            return Err(PvgpuError::InvalidParameter);
        }
        self.view
            .write_heap(mapping.heap_offset, data)
            .map_err(|_| PvgpuError::InvalidParameter)
    }

    /// Close a write mapping; the heap range retires with the next fence.
    pub fn unmap(
        &self,
        id: ResourceId,
        subresource: u32,
        mapping: MappedWrite,
        written: u32,
    ) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdUnmapResource {
            header: CommandHeader::new(
                PVGPU_CMD_UNMAP_RESOURCE,
                std::mem::size_of::<CmdUnmapResource>(),
                id,
            ),
            subresource,
            heap_offset: mapping.heap_offset,
            data_size: written,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)?;
        let next_fence = inner.next_fence;
        inner
            .in_flight
            .push((next_fence, mapping.heap_offset, mapping.size));
        Ok(())
    }

    // =========================================================================
    // State commands
    // =========================================================================

    pub fn set_render_targets(&self, rtvs: &[ResourceId], dsv: ResourceId) -> Result<()> {
        if rtvs.len() > 8 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cmd = CmdSetRenderTarget {
            header: CommandHeader::new(
                PVGPU_CMD_SET_RENDER_TARGET,
                std::mem::size_of::<CmdSetRenderTarget>(),
                0,
            ),
            num_rtvs: rtvs.len() as u32,
            dsv_id: dsv,
            rtv_ids: [0; 8],
            _reserved: [0; 2],
        };
        cmd.rtv_ids[..rtvs.len()].copy_from_slice(rtvs);
        self.stage(&mut inner, &cmd)
    }

    pub fn set_viewports(&self, viewports: &[Viewport]) -> Result<()> {
        if viewports.len() > 16 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cmd = CmdSetViewport {
            header: CommandHeader::new(
                PVGPU_CMD_SET_VIEWPORT,
                std::mem::size_of::<CmdSetViewport>(),
                0,
            ),
            num_viewports: viewports.len() as u32,
            ..Zeroable::zeroed()
        };
        cmd.viewports[..viewports.len()].copy_from_slice(viewports);
        self.stage(&mut inner, &cmd)
    }

    pub fn set_scissors(&self, rects: &[ScissorRect]) -> Result<()> {
        if rects.len() > 16 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cmd = CmdSetScissor {
            header: CommandHeader::new(
                PVGPU_CMD_SET_SCISSOR,
                std::mem::size_of::<CmdSetScissor>(),
                0,
            ),
            num_rects: rects.len() as u32,
            ..Zeroable::zeroed()
        };
        cmd.rects[..rects.len()].copy_from_slice(rects);
        self.stage(&mut inner, &cmd)
    }

    pub fn set_blend_state(
        &self,
        state: ResourceId,
        blend_factor: [f32; 4],
        sample_mask: u32,
    ) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetBlendState {
            header: CommandHeader::new(
                PVGPU_CMD_SET_BLEND_STATE,
                std::mem::size_of::<CmdSetBlendState>(),
                state,
            ),
            state_id: state,
            blend_factor,
            sample_mask,
            _reserved: [0; 2],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_rasterizer_state(&self, state: ResourceId) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetRasterizerState {
            header: CommandHeader::new(
                PVGPU_CMD_SET_RASTERIZER_STATE,
                std::mem::size_of::<CmdSetRasterizerState>(),
                state,
            ),
            state_id: state,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_depth_stencil_state(&self, state: ResourceId, stencil_ref: u32) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetDepthStencil {
            header: CommandHeader::new(
                PVGPU_CMD_SET_DEPTH_STENCIL,
                std::mem::size_of::<CmdSetDepthStencil>(),
                state,
            ),
            state_id: state,
            stencil_ref,
            _reserved: [0; 2],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_shader(&self, stage: ShaderStage, shader: ResourceId) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetShader {
            header: CommandHeader::new(
                PVGPU_CMD_SET_SHADER,
                std::mem::size_of::<CmdSetShader>(),
                shader,
            ),
            stage: stage as u32,
            shader_id: shader,
            _reserved: [0; 2],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_samplers(
        &self,
        stage: ShaderStage,
        start_slot: u32,
        samplers: &[ResourceId],
    ) -> Result<()> {
        if samplers.len() > 16 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cmd = CmdSetSamplers {
            header: CommandHeader::new(
                PVGPU_CMD_SET_SAMPLER,
                std::mem::size_of::<CmdSetSamplers>(),
                0,
            ),
            stage: stage as u32,
            start_slot,
            num_samplers: samplers.len() as u32,
            sampler_ids: [0; 16],
            _reserved: 0,
        };
        cmd.sampler_ids[..samplers.len()].copy_from_slice(samplers);
        self.stage(&mut inner, &cmd)
    }

    pub fn set_constant_buffer(
        &self,
        stage: ShaderStage,
        slot: u32,
        buffer: ResourceId,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetConstantBuffer {
            header: CommandHeader::new(
                PVGPU_CMD_SET_CONSTANT_BUFFER,
                std::mem::size_of::<CmdSetConstantBuffer>(),
                buffer,
            ),
            stage: stage as u32,
            slot,
            buffer_id: buffer,
            offset,
            size,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_vertex_buffers(
        &self,
        start_slot: u32,
        bindings: &[VertexBufferBinding],
    ) -> Result<()> {
        if bindings.len() > 16 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cmd = CmdSetVertexBuffer {
            header: CommandHeader::new(
                PVGPU_CMD_SET_VERTEX_BUFFER,
                std::mem::size_of::<CmdSetVertexBuffer>(),
                0,
            ),
            start_slot,
            num_buffers: bindings.len() as u32,
            ..Zeroable::zeroed()
        };
        cmd.buffers[..bindings.len()].copy_from_slice(bindings);
        self.stage(&mut inner, &cmd)
    }

    pub fn set_index_buffer(&self, buffer: ResourceId, format: u32, offset: u32) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetIndexBuffer {
            header: CommandHeader::new(
                PVGPU_CMD_SET_INDEX_BUFFER,
                std::mem::size_of::<CmdSetIndexBuffer>(),
                buffer,
            ),
            buffer_id: buffer,
            format,
            offset,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_input_layout(&self, layout: ResourceId) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetInputLayout {
            header: CommandHeader::new(
                PVGPU_CMD_SET_INPUT_LAYOUT,
                std::mem::size_of::<CmdSetInputLayout>(),
                layout,
            ),
            layout_id: layout,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_primitive_topology(&self, topology: u32) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdSetPrimitiveTopology {
            header: CommandHeader::new(
                PVGPU_CMD_SET_PRIMITIVE_TOPOLOGY,
                std::mem::size_of::<CmdSetPrimitiveTopology>(),
                0,
            ),
            topology,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn set_shader_resources(
        &self,
        stage: ShaderStage,
        start_slot: u32,
        views: &[ResourceId],
    ) -> Result<()> {
        if views.len() > 128 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut cmd = CmdSetShaderResources {
            header: CommandHeader::new(
                PVGPU_CMD_SET_SHADER_RESOURCE,
                std::mem::size_of::<CmdSetShaderResources>(),
                0,
            ),
            stage: stage as u32,
            start_slot,
            num_views: views.len() as u32,
            ..Zeroable::zeroed()
        };
        cmd.view_ids[..views.len()].copy_from_slice(views);
        self.stage(&mut inner, &cmd)
    }

    // =========================================================================
    // Draw commands
    // =========================================================================

    pub fn draw(&self, vertex_count: u32, start_vertex: u32) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDraw {
            header: CommandHeader::new(PVGPU_CMD_DRAW, std::mem::size_of::<CmdDraw>(), 0),
            vertex_count,
            start_vertex,
            _reserved: [0; 2],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn draw_indexed(&self, index_count: u32, start_index: u32, base_vertex: i32) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDrawIndexed {
            header: CommandHeader::new(
                PVGPU_CMD_DRAW_INDEXED,
                std::mem::size_of::<CmdDrawIndexed>(),
                0,
            ),
            index_count,
            start_index,
            base_vertex,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn draw_instanced(
        &self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDrawInstanced {
            header: CommandHeader::new(
                PVGPU_CMD_DRAW_INSTANCED,
                std::mem::size_of::<CmdDrawInstanced>(),
                0,
            ),
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        };
        self.stage(&mut inner, &cmd)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed_instanced(
        &self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDrawIndexedInstanced {
            header: CommandHeader::new(
                PVGPU_CMD_DRAW_INDEXED_INSTANCED,
                std::mem::size_of::<CmdDrawIndexedInstanced>(),
                0,
            ),
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdDispatch {
            header: CommandHeader::new(PVGPU_CMD_DISPATCH, std::mem::size_of::<CmdDispatch>(), 0),
            thread_group_count_x: x,
            thread_group_count_y: y,
            thread_group_count_z: z,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn clear_render_target(&self, rtv: ResourceId, color: [f32; 4]) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdClearRenderTarget {
            header: CommandHeader::new(
                PVGPU_CMD_CLEAR_RENDER_TARGET,
                std::mem::size_of::<CmdClearRenderTarget>(),
                rtv,
            ),
            rtv_id: rtv,
            color,
            _reserved: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn clear_depth_stencil(
        &self,
        dsv: ResourceId,
        clear_flags: u32,
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdClearDepthStencil {
            header: CommandHeader::new(
                PVGPU_CMD_CLEAR_DEPTH_STENCIL,
                std::mem::size_of::<CmdClearDepthStencil>(),
                dsv,
            ),
            dsv_id: dsv,
            clear_flags,
            depth,
            stencil,
            _padding: [0; 3],
        };
        self.stage(&mut inner, &cmd)
    }

    // =========================================================================
    // Present / resize
    // =========================================================================

    /// Stage PRESENT plus its frame fence, flush, and return the fence
    /// value. Well-behaved clients overlap frames by waiting on frame
    /// N-1's value before presenting frame N.
    pub fn present(&self, backbuffer: ResourceId, sync_interval: u32) -> Result<u64> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdPresent {
            header: CommandHeader::new(PVGPU_CMD_PRESENT, std::mem::size_of::<CmdPresent>(), 0),
            backbuffer_id: backbuffer,
            sync_interval,
            flags: 0,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)?;
        let fence = self.stage_fence(&mut inner)?;
        self.flush_locked(&mut inner)?;
        Ok(fence)
    }

    /// Stage an explicit FLUSH marker; the API-level flush call maps to
    /// this followed by a submission.
    pub fn flush_marker(&self) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdFlush {
            header: CommandHeader::new(PVGPU_CMD_FLUSH, std::mem::size_of::<CmdFlush>(), 0),
        };
        self.stage(&mut inner, &cmd)
    }

    /// Stage a WAIT_FENCE command: later commands in the stream are
    /// ordered behind `value` on the host.
    pub fn gpu_wait_fence(&self, value: u64) -> Result<()> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdWaitFence {
            header: CommandHeader::new(
                PVGPU_CMD_WAIT_FENCE,
                std::mem::size_of::<CmdWaitFence>(),
                0,
            ),
            fence_value: value,
            _reserved: 0,
        };
        self.stage(&mut inner, &cmd)
    }

    pub fn resize_buffers(&self, width: u32, height: u32, format: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(PvgpuError::InvalidParameter);
        }
        self.guard()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cmd = CmdResizeBuffers {
            header: CommandHeader::new(
                PVGPU_CMD_RESIZE_BUFFERS,
                std::mem::size_of::<CmdResizeBuffers>(),
                0,
            ),
            swapchain_id: 0,
            width,
            height,
            format,
            buffer_count: 0,
            flags: 0,
            _reserved: [0; 2],
        };
        self.stage(&mut inner, &cmd)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn caps(&self) -> Result<EscGetCaps> {
        self.guard()?;
        let result = self.agent.get_caps();
        self.latch(result)
    }

    pub fn set_display_mode(&self, width: u32, height: u32, refresh_rate: u32) -> Result<()> {
        self.guard()?;
        let result = self.agent.set_display_mode(width, height, refresh_rate);
        self.latch(result)
    }

    pub fn host_fence_completed(&self) -> u64 {
        self.view.host_fence_completed()
    }

    pub fn device_status(&self) -> u32 {
        self.view.status()
    }

    pub fn last_error(&self) -> (u32, u32) {
        (self.view.error_code(), self.view.error_data())
    }

    pub fn is_disconnected(&self) -> bool {
        self.fatal_code.load(Ordering::Acquire) != PVGPU_ERROR_SUCCESS
    }
}
