//! Command Processor Module
//!
//! Drains the ring and dispatches records to the renderer. Framing is
//! validated before anything is decoded: an unknown type, an undersized,
//! oversized or misaligned record is corruption of the stream itself, so
//! consumption stops and the device goes to the lost state. Failures
//! inside a valid command (missing resource, bad parameter, unsupported
//! format, shader compile) are recorded in the control region and the
//! stream continues.

use tracing::{debug, error, trace, warn};

use pvgpu_protocol::*;

use crate::renderer::Renderer;
use crate::shmem::SharedMemory;

/// Stop draining after this many bytes and give the service loop a turn
/// at messages and presentation.
const DRAIN_BUDGET: u64 = 1024 * 1024;

/// What a drain pass observed.
#[derive(Debug, Default)]
pub struct DrainStats {
    pub bytes: u64,
    pub commands: u64,
    /// Corrupt framing; the device is lost and the ring must not be
    /// consumed further.
    pub fatal: bool,
}

/// Processes commands from the shared memory ring buffer.
pub struct CommandProcessor {
    renderer: Box<dyn Renderer>,
    current_fence: u64,
    pending_present: Option<(u32, u32)>,
    pending_resize: Option<(u32, u32, u32)>,
    scratch: Vec<u8>,
}

impl CommandProcessor {
    pub fn new(renderer: Box<dyn Renderer>) -> Self {
        Self {
            renderer,
            current_fence: 0,
            pending_present: None,
            pending_resize: None,
            scratch: Vec::new(),
        }
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    /// The highest fence value executed so far.
    pub fn current_fence(&self) -> u64 {
        self.current_fence
    }

    /// Present recorded since the last call: (backbuffer, sync interval).
    pub fn take_pending_present(&mut self) -> Option<(u32, u32)> {
        self.pending_present.take()
    }

    /// Resize recorded since the last call: (width, height, format).
    pub fn take_pending_resize(&mut self) -> Option<(u32, u32, u32)> {
        self.pending_resize.take()
    }

    /// Drain the ring until it is empty, the budget is spent, or framing
    /// corruption is found.
    pub fn drain(&mut self, shmem: &SharedMemory) -> DrainStats {
        let mut stats = DrainStats::default();
        let control = shmem.control_region();

        while stats.bytes < DRAIN_BUDGET {
            // Acquire on the producer pairs with the guest's release
            // publish of the record bytes.
            let producer = control.producer_ptr();
            let consumer = control.consumer_ptr();
            let pending = producer.saturating_sub(consumer);
            if pending == 0 {
                break;
            }

            let mut header_bytes = [0u8; PVGPU_CMD_HEADER_SIZE];
            shmem.read_ring(consumer, &mut header_bytes);
            let header: CommandHeader = bytemuck::pod_read_unaligned(&header_bytes);

            if let Err(diag) = validate_framing(&header, pending) {
                error!(
                    command_type = format_args!("0x{:04X}", header.command_type),
                    command_size = header.command_size,
                    pending,
                    "corrupt command framing"
                );
                control.set_error(PVGPU_ERROR_INVALID_COMMAND, diag);
                control.set_status_flag(PVGPU_STATUS_DEVICE_LOST);
                stats.fatal = true;
                return stats;
            }

            let size = header.command_size as usize;
            self.scratch.resize(size, 0);
            shmem.read_ring(consumer, &mut self.scratch);

            let record = std::mem::take(&mut self.scratch);
            match self.execute(&header, &record, shmem) {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        command_type = format_args!("0x{:04X}", header.command_type),
                        resource_id = header.resource_id,
                        error = %e,
                        "command failed"
                    );
                    control.set_error(e.code(), header.resource_id);
                }
            }
            self.scratch = record;

            // Release on the consumer: any control-region writes the
            // command produced are visible before the cursor moves.
            shmem.advance_consumer(size as u64);
            stats.bytes += size as u64;
            stats.commands += 1;
        }

        stats
    }

    fn execute(&mut self, header: &CommandHeader, record: &[u8], shmem: &SharedMemory) -> Result<()> {
        let id = header.resource_id;
        match header.command_type {
            PVGPU_CMD_CREATE_RESOURCE => {
                let cmd: CmdCreateResource = read_command(record)?;
                let initial = self.heap_payload(shmem, cmd.heap_offset, cmd.data_size)?;
                self.renderer.create_resource(&cmd, initial.as_deref())
            }
            PVGPU_CMD_DESTROY_RESOURCE => self.renderer.destroy_resource(id),
            PVGPU_CMD_MAP_RESOURCE => {
                let cmd: CmdMapResource = read_command(record)?;
                self.handle_map(&cmd, shmem)
            }
            PVGPU_CMD_UNMAP_RESOURCE => {
                let cmd: CmdUnmapResource = read_command(record)?;
                if cmd.data_size > 0 {
                    let data = self
                        .heap_payload(shmem, cmd.heap_offset, cmd.data_size)?
                        .unwrap_or_default();
                    self.renderer
                        .update_resource(id, cmd.subresource, &data)?;
                }
                Ok(())
            }
            PVGPU_CMD_UPDATE_RESOURCE => {
                let cmd: CmdUpdateResource = read_command(record)?;
                let data = self
                    .heap_payload(shmem, cmd.heap_offset, cmd.data_size)?
                    .ok_or(PvgpuError::InvalidParameter)?;
                self.renderer.update_resource(id, cmd.subresource, &data)
            }
            PVGPU_CMD_COPY_RESOURCE => {
                let cmd: CmdCopyResource = read_command(record)?;
                self.renderer
                    .copy_resource(cmd.dst_resource_id, cmd.src_resource_id)
            }
            PVGPU_CMD_OPEN_RESOURCE => {
                let cmd: CmdOpenResource = read_command(record)?;
                self.renderer.open_resource(&cmd)
            }
            PVGPU_CMD_CREATE_SHADER => {
                let cmd: CmdCreateShader = read_command(record)?;
                let bytecode = self
                    .heap_payload(shmem, cmd.bytecode_offset, cmd.bytecode_size)?
                    .unwrap_or_default();
                self.renderer.create_shader(id, cmd.shader_type, &bytecode)
            }
            PVGPU_CMD_DESTROY_SHADER => self.renderer.destroy_shader(id),

            PVGPU_CMD_SET_RENDER_TARGET => {
                let cmd: CmdSetRenderTarget = read_command(record)?;
                let count = (cmd.num_rtvs as usize).min(cmd.rtv_ids.len());
                self.renderer
                    .set_render_targets(&cmd.rtv_ids[..count], cmd.dsv_id)
            }
            PVGPU_CMD_SET_VIEWPORT => {
                let cmd: CmdSetViewport = read_command(record)?;
                let count = (cmd.num_viewports as usize).min(cmd.viewports.len());
                self.renderer.set_viewports(&cmd.viewports[..count])
            }
            PVGPU_CMD_SET_SCISSOR => {
                let cmd: CmdSetScissor = read_command(record)?;
                let count = (cmd.num_rects as usize).min(cmd.rects.len());
                self.renderer.set_scissors(&cmd.rects[..count])
            }
            PVGPU_CMD_SET_BLEND_STATE => {
                let cmd: CmdSetBlendState = read_command(record)?;
                self.renderer
                    .set_blend_state(cmd.state_id, cmd.blend_factor, cmd.sample_mask)
            }
            PVGPU_CMD_SET_RASTERIZER_STATE => {
                let cmd: CmdSetRasterizerState = read_command(record)?;
                self.renderer.set_rasterizer_state(cmd.state_id)
            }
            PVGPU_CMD_SET_DEPTH_STENCIL => {
                let cmd: CmdSetDepthStencil = read_command(record)?;
                self.renderer
                    .set_depth_stencil_state(cmd.state_id, cmd.stencil_ref)
            }
            PVGPU_CMD_SET_SHADER => {
                let cmd: CmdSetShader = read_command(record)?;
                self.renderer.set_shader(cmd.stage, cmd.shader_id)
            }
            PVGPU_CMD_SET_SAMPLER => {
                let cmd: CmdSetSamplers = read_command(record)?;
                let count = (cmd.num_samplers as usize).min(cmd.sampler_ids.len());
                self.renderer
                    .set_samplers(cmd.stage, cmd.start_slot, &cmd.sampler_ids[..count])
            }
            PVGPU_CMD_SET_CONSTANT_BUFFER => {
                let cmd: CmdSetConstantBuffer = read_command(record)?;
                self.renderer.set_constant_buffer(
                    cmd.stage,
                    cmd.slot,
                    cmd.buffer_id,
                    cmd.offset,
                    cmd.size,
                )
            }
            PVGPU_CMD_SET_VERTEX_BUFFER => {
                let cmd: CmdSetVertexBuffer = read_command(record)?;
                let count = (cmd.num_buffers as usize).min(cmd.buffers.len());
                self.renderer
                    .set_vertex_buffers(cmd.start_slot, &cmd.buffers[..count])
            }
            PVGPU_CMD_SET_INDEX_BUFFER => {
                let cmd: CmdSetIndexBuffer = read_command(record)?;
                self.renderer
                    .set_index_buffer(cmd.buffer_id, cmd.format, cmd.offset)
            }
            PVGPU_CMD_SET_INPUT_LAYOUT => {
                let cmd: CmdSetInputLayout = read_command(record)?;
                self.renderer.set_input_layout(cmd.layout_id)
            }
            PVGPU_CMD_SET_PRIMITIVE_TOPOLOGY => {
                let cmd: CmdSetPrimitiveTopology = read_command(record)?;
                self.renderer.set_primitive_topology(cmd.topology)
            }
            PVGPU_CMD_SET_SHADER_RESOURCE => {
                let cmd: CmdSetShaderResources = read_command(record)?;
                let count = (cmd.num_views as usize).min(cmd.view_ids.len());
                self.renderer
                    .set_shader_resources(cmd.stage, cmd.start_slot, &cmd.view_ids[..count])
            }

            PVGPU_CMD_DRAW => {
                let cmd: CmdDraw = read_command(record)?;
                self.renderer.draw(cmd.vertex_count, cmd.start_vertex)
            }
            PVGPU_CMD_DRAW_INDEXED => {
                let cmd: CmdDrawIndexed = read_command(record)?;
                self.renderer
                    .draw_indexed(cmd.index_count, cmd.start_index, cmd.base_vertex)
            }
            PVGPU_CMD_DRAW_INSTANCED => {
                let cmd: CmdDrawInstanced = read_command(record)?;
                self.renderer.draw_instanced(
                    cmd.vertex_count,
                    cmd.instance_count,
                    cmd.start_vertex,
                    cmd.start_instance,
                )
            }
            PVGPU_CMD_DRAW_INDEXED_INSTANCED => {
                let cmd: CmdDrawIndexedInstanced = read_command(record)?;
                self.renderer.draw_indexed_instanced(&cmd)
            }
            PVGPU_CMD_DISPATCH => {
                let cmd: CmdDispatch = read_command(record)?;
                self.renderer.dispatch(
                    cmd.thread_group_count_x,
                    cmd.thread_group_count_y,
                    cmd.thread_group_count_z,
                )
            }
            PVGPU_CMD_CLEAR_RENDER_TARGET => {
                let cmd: CmdClearRenderTarget = read_command(record)?;
                self.renderer.clear_render_target(cmd.rtv_id, cmd.color)
            }
            PVGPU_CMD_CLEAR_DEPTH_STENCIL => {
                let cmd: CmdClearDepthStencil = read_command(record)?;
                self.renderer.clear_depth_stencil(
                    cmd.dsv_id,
                    cmd.clear_flags,
                    cmd.depth,
                    cmd.stencil,
                )
            }

            PVGPU_CMD_FENCE => {
                let cmd: CmdFence = read_command(record)?;
                debug!(fence = cmd.fence_value, "fence");
                self.current_fence = self.current_fence.max(cmd.fence_value);
                Ok(())
            }
            PVGPU_CMD_PRESENT => {
                let cmd: CmdPresent = read_command(record)?;
                self.renderer
                    .present(cmd.backbuffer_id, cmd.sync_interval)?;
                self.pending_present = Some((cmd.backbuffer_id, cmd.sync_interval));
                Ok(())
            }
            PVGPU_CMD_FLUSH => {
                // Commands execute eagerly; nothing is batched host-side.
                trace!("flush");
                Ok(())
            }
            PVGPU_CMD_WAIT_FENCE => {
                let cmd: CmdWaitFence = read_command(record)?;
                // In-order execution makes every prior fence already
                // complete by the time this record is reached.
                trace!(fence = cmd.fence_value, "wait fence");
                Ok(())
            }
            PVGPU_CMD_RESIZE_BUFFERS => {
                let cmd: CmdResizeBuffers = read_command(record)?;
                self.renderer.resize(cmd.width, cmd.height)?;
                self.pending_resize = Some((cmd.width, cmd.height, cmd.format));
                Ok(())
            }

            // validate_framing() already rejected unknown types.
            other => {
                warn!(command_type = format_args!("0x{other:04X}"), "unreachable dispatch");
                Err(PvgpuError::InvalidCommand)
            }
        }
    }

    fn handle_map(&mut self, cmd: &CmdMapResource, shmem: &SharedMemory) -> Result<()> {
        let id = cmd.header.resource_id;
        let wants_read = matches!(
            cmd.map_type,
            t if t == MapType::Read as u32 || t == MapType::ReadWrite as u32
        );
        if wants_read {
            // Copy current contents into the heap range the guest cited;
            // the fence behind this command orders the producer's read.
            let data = self
                .renderer
                .read_resource(id, cmd.subresource, cmd.data_size)?;
            if !shmem.write_heap(cmd.heap_offset, &data) {
                return Err(PvgpuError::InvalidParameter);
            }
        }
        // Write maps transfer their bytes at unmap.
        Ok(())
    }

    /// Resolve an optional heap-cited payload. Offset 0 with size 0 means
    /// no payload; a range leaving the heap is a parameter error.
    fn heap_payload(
        &self,
        shmem: &SharedMemory,
        offset: u32,
        size: u32,
    ) -> Result<Option<Vec<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        let mut data = vec![0u8; size as usize];
        if !shmem.read_heap(offset, &mut data) {
            return Err(PvgpuError::InvalidParameter);
        }
        Ok(Some(data))
    }
}

/// Framing checks from the consumer protocol: a failure here poisons the
/// stream. Returns diagnostic data for `error_data`.
fn validate_framing(header: &CommandHeader, pending: u64) -> std::result::Result<(), u32> {
    if !is_known_command(header.command_type) {
        return Err(header.command_type);
    }
    let size = header.command_size as u64;
    if size < PVGPU_CMD_HEADER_SIZE as u64 || size % 16 != 0 || size > pending {
        return Err(header.command_size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn framing_accepts_exact_records() {
        let header = CommandHeader::new(PVGPU_CMD_DRAW, 32, 0);
        assert!(validate_framing(&header, 32).is_ok());
        assert!(validate_framing(&header, 64).is_ok());
    }

    #[test]
    fn framing_rejects_unknown_type() {
        let header = CommandHeader::new(0x7777, 32, 0);
        assert_eq!(validate_framing(&header, 64), Err(0x7777));
    }

    #[test]
    fn framing_rejects_bad_sizes() {
        // Shorter than the header.
        let mut header = CommandHeader::new(PVGPU_CMD_DRAW, 8, 0);
        assert!(validate_framing(&header, 64).is_err());
        // Misaligned.
        header.command_size = 24;
        assert!(validate_framing(&header, 64).is_err());
        // Larger than what the producer published.
        header.command_size = 128;
        assert!(validate_framing(&header, 64).is_err());
    }
}
