//! Renderer Module
//!
//! The seam between the transport and the actual graphics backend. The
//! host consumer validates command framing, decodes, and calls into a
//! [`Renderer`]; what the renderer does with each call is outside the
//! transport's contract. [`TrackingRenderer`] is the shipped
//! implementation: it owns the id-keyed resource table, enforces the
//! reference and format rules that produce the per-command error kinds,
//! and logs execution. A real D3D11/wgpu backend plugs in behind the same
//! trait.

use std::collections::HashMap;

use tracing::{debug, warn};

use pvgpu_protocol::*;

/// Resource ID type
pub type ResourceId = u32;

/// A tracked GPU object. Resource IDs form a dependency graph (a view
/// references its parent, bindings reference views and shaders); it is
/// kept as an index-keyed map with explicit lifetime rules rather than a
/// web of owning references.
pub enum Resource {
    Buffer {
        size: u32,
        bind_flags: u32,
        data: Vec<u8>,
    },
    Texture {
        kind: ResourceType,
        format: u32,
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        data: Vec<u8>,
    },
    View {
        kind: ResourceType,
        parent: ResourceId,
    },
    State {
        kind: ResourceType,
    },
    Shader {
        shader_type: u32,
        bytecode_len: usize,
    },
}

pub trait Renderer: Send {
    fn create_resource(&mut self, cmd: &CmdCreateResource, initial: Option<&[u8]>) -> Result<()>;
    fn open_resource(&mut self, cmd: &CmdOpenResource) -> Result<()>;
    fn destroy_resource(&mut self, id: ResourceId) -> Result<()>;
    fn update_resource(&mut self, id: ResourceId, subresource: u32, data: &[u8]) -> Result<()>;
    fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) -> Result<()>;
    /// Current contents for a read map; the consumer copies them into the
    /// heap range the guest cited.
    fn read_resource(&mut self, id: ResourceId, subresource: u32, size: u32) -> Result<Vec<u8>>;

    fn create_shader(&mut self, id: ResourceId, shader_type: u32, bytecode: &[u8]) -> Result<()>;
    fn destroy_shader(&mut self, id: ResourceId) -> Result<()>;

    fn set_render_targets(&mut self, rtvs: &[ResourceId], dsv: ResourceId) -> Result<()>;
    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()>;
    fn set_scissors(&mut self, rects: &[ScissorRect]) -> Result<()>;
    fn set_blend_state(&mut self, id: ResourceId, factor: [f32; 4], mask: u32) -> Result<()>;
    fn set_rasterizer_state(&mut self, id: ResourceId) -> Result<()>;
    fn set_depth_stencil_state(&mut self, id: ResourceId, stencil_ref: u32) -> Result<()>;
    fn set_shader(&mut self, stage: u32, id: ResourceId) -> Result<()>;
    fn set_samplers(&mut self, stage: u32, start_slot: u32, ids: &[ResourceId]) -> Result<()>;
    fn set_constant_buffer(
        &mut self,
        stage: u32,
        slot: u32,
        id: ResourceId,
        offset: u32,
        size: u32,
    ) -> Result<()>;
    fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        bindings: &[VertexBufferBinding],
    ) -> Result<()>;
    fn set_index_buffer(&mut self, id: ResourceId, format: u32, offset: u32) -> Result<()>;
    fn set_input_layout(&mut self, id: ResourceId) -> Result<()>;
    fn set_primitive_topology(&mut self, topology: u32) -> Result<()>;
    fn set_shader_resources(
        &mut self,
        stage: u32,
        start_slot: u32,
        ids: &[ResourceId],
    ) -> Result<()>;

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> Result<()>;
    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32)
        -> Result<()>;
    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()>;
    fn draw_indexed_instanced(&mut self, cmd: &CmdDrawIndexedInstanced) -> Result<()>;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()>;
    fn clear_render_target(&mut self, rtv: ResourceId, color: [f32; 4]) -> Result<()>;
    fn clear_depth_stencil(
        &mut self,
        dsv: ResourceId,
        flags: u32,
        depth: f32,
        stencil: u8,
    ) -> Result<()>;

    fn present(&mut self, backbuffer: ResourceId, sync_interval: u32) -> Result<()>;
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
}

/// Holds all tracked resources and pipeline state.
#[derive(Default)]
pub struct TrackingRenderer {
    resources: HashMap<ResourceId, Resource>,
    bound_rtvs: Vec<ResourceId>,
    bound_dsv: ResourceId,
    draw_count: u64,
    present_count: u64,
}

impl TrackingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id)
    }

    fn lookup(&self, id: ResourceId) -> Result<&Resource> {
        self.resources.get(&id).ok_or(PvgpuError::ResourceNotFound)
    }

    /// Bindings treat 0 as none/unbind; anything else must exist.
    fn check_binding(&self, id: ResourceId) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        self.lookup(id).map(|_| ())
    }

    fn check_bindings(&self, ids: &[ResourceId]) -> Result<()> {
        ids.iter().try_for_each(|&id| self.check_binding(id))
    }

    fn insert(&mut self, id: ResourceId, resource: Resource) -> Result<()> {
        if id == 0 || self.resources.contains_key(&id) {
            return Err(PvgpuError::InvalidParameter);
        }
        self.resources.insert(id, resource);
        Ok(())
    }
}

impl Renderer for TrackingRenderer {
    fn create_resource(&mut self, cmd: &CmdCreateResource, initial: Option<&[u8]>) -> Result<()> {
        let id = cmd.header.resource_id;
        let kind =
            ResourceType::from_u32(cmd.resource_type).ok_or(PvgpuError::InvalidParameter)?;
        debug!(id, ?kind, width = cmd.width, height = cmd.height, "create resource");

        let resource = match kind {
            ResourceType::Buffer => {
                if cmd.width == 0 {
                    return Err(PvgpuError::InvalidParameter);
                }
                let mut data = vec![0u8; cmd.width as usize];
                if let Some(initial) = initial {
                    let n = initial.len().min(data.len());
                    data[..n].copy_from_slice(&initial[..n]);
                }
                Resource::Buffer {
                    size: cmd.width,
                    bind_flags: cmd.bind_flags,
                    data,
                }
            }
            ResourceType::Texture1D | ResourceType::Texture2D | ResourceType::Texture3D => {
                if cmd.width == 0 {
                    return Err(PvgpuError::InvalidParameter);
                }
                if cmd.format == 0 {
                    return Err(PvgpuError::UnsupportedFormat);
                }
                Resource::Texture {
                    kind,
                    format: cmd.format,
                    width: cmd.width,
                    height: cmd.height.max(1),
                    depth: cmd.depth.max(1),
                    mip_levels: cmd.mip_levels.max(1),
                    data: initial.map(<[u8]>::to_vec).unwrap_or_default(),
                }
            }
            k if k.is_view() => {
                if cmd.parent_id == 0 {
                    return Err(PvgpuError::InvalidParameter);
                }
                self.lookup(cmd.parent_id)?;
                Resource::View {
                    kind,
                    parent: cmd.parent_id,
                }
            }
            ResourceType::BlendState
            | ResourceType::RasterizerState
            | ResourceType::DepthStencilState
            | ResourceType::SamplerState
            | ResourceType::InputLayout => Resource::State { kind },
            // Shaders arrive through CREATE_SHADER, not CREATE_RESOURCE.
            _ => return Err(PvgpuError::InvalidParameter),
        };
        self.insert(id, resource)
    }

    fn open_resource(&mut self, cmd: &CmdOpenResource) -> Result<()> {
        let id = cmd.header.resource_id;
        let kind =
            ResourceType::from_u32(cmd.resource_type).ok_or(PvgpuError::InvalidParameter)?;
        debug!(id, handle = cmd.shared_handle, "open shared resource");
        if cmd.format == 0 {
            return Err(PvgpuError::UnsupportedFormat);
        }
        self.insert(
            id,
            Resource::Texture {
                kind,
                format: cmd.format,
                width: cmd.width,
                height: cmd.height.max(1),
                depth: 1,
                mip_levels: 1,
                data: Vec::new(),
            },
        )
    }

    fn destroy_resource(&mut self, id: ResourceId) -> Result<()> {
        debug!(id, "destroy resource");
        if self.resources.remove(&id).is_none() {
            warn!(id, "destroy of unknown resource");
            return Err(PvgpuError::ResourceNotFound);
        }
        self.bound_rtvs.retain(|&rtv| rtv != id);
        if self.bound_dsv == id {
            self.bound_dsv = 0;
        }
        Ok(())
    }

    fn update_resource(&mut self, id: ResourceId, subresource: u32, data: &[u8]) -> Result<()> {
        debug!(id, subresource, bytes = data.len(), "update resource");
        match self.resources.get_mut(&id) {
            Some(Resource::Buffer { data: dst, .. }) => {
                if data.len() > dst.len() {
                    return Err(PvgpuError::InvalidParameter);
                }
                dst[..data.len()].copy_from_slice(data);
                Ok(())
            }
            Some(Resource::Texture { data: dst, .. }) => {
                *dst = data.to_vec();
                Ok(())
            }
            Some(_) => Err(PvgpuError::InvalidParameter),
            None => Err(PvgpuError::ResourceNotFound),
        }
    }

    fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) -> Result<()> {
        debug!(dst, src, "copy resource");
        let bytes = match self.lookup(src)? {
            Resource::Buffer { data, .. } | Resource::Texture { data, .. } => data.clone(),
            _ => return Err(PvgpuError::InvalidParameter),
        };
        match self.resources.get_mut(&dst) {
            Some(Resource::Buffer { data, .. }) => {
                let n = bytes.len().min(data.len());
                data[..n].copy_from_slice(&bytes[..n]);
                Ok(())
            }
            Some(Resource::Texture { data, .. }) => {
                *data = bytes;
                Ok(())
            }
            Some(_) => Err(PvgpuError::InvalidParameter),
            None => Err(PvgpuError::ResourceNotFound),
        }
    }

    fn read_resource(&mut self, id: ResourceId, subresource: u32, size: u32) -> Result<Vec<u8>> {
        debug!(id, subresource, size, "read resource");
        let data = match self.lookup(id)? {
            Resource::Buffer { data, .. } | Resource::Texture { data, .. } => data,
            _ => return Err(PvgpuError::InvalidParameter),
        };
        let mut out = vec![0u8; size as usize];
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
        Ok(out)
    }

    fn create_shader(&mut self, id: ResourceId, shader_type: u32, bytecode: &[u8]) -> Result<()> {
        debug!(id, shader_type, bytes = bytecode.len(), "create shader");
        if bytecode.is_empty() {
            return Err(PvgpuError::ShaderCompile);
        }
        self.insert(
            id,
            Resource::Shader {
                shader_type,
                bytecode_len: bytecode.len(),
            },
        )
    }

    fn destroy_shader(&mut self, id: ResourceId) -> Result<()> {
        debug!(id, "destroy shader");
        match self.resources.remove(&id) {
            Some(Resource::Shader { .. }) => Ok(()),
            Some(other) => {
                self.resources.insert(id, other);
                Err(PvgpuError::InvalidParameter)
            }
            None => Err(PvgpuError::ResourceNotFound),
        }
    }

    fn set_render_targets(&mut self, rtvs: &[ResourceId], dsv: ResourceId) -> Result<()> {
        self.check_bindings(rtvs)?;
        self.check_binding(dsv)?;
        self.bound_rtvs = rtvs.to_vec();
        self.bound_dsv = dsv;
        debug!(?rtvs, dsv, "set render targets");
        Ok(())
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()> {
        debug!(count = viewports.len(), "set viewports");
        Ok(())
    }

    fn set_scissors(&mut self, rects: &[ScissorRect]) -> Result<()> {
        debug!(count = rects.len(), "set scissors");
        Ok(())
    }

    fn set_blend_state(&mut self, id: ResourceId, _factor: [f32; 4], _mask: u32) -> Result<()> {
        self.check_binding(id)
    }

    fn set_rasterizer_state(&mut self, id: ResourceId) -> Result<()> {
        self.check_binding(id)
    }

    fn set_depth_stencil_state(&mut self, id: ResourceId, _stencil_ref: u32) -> Result<()> {
        self.check_binding(id)
    }

    fn set_shader(&mut self, stage: u32, id: ResourceId) -> Result<()> {
        debug!(stage, id, "set shader");
        self.check_binding(id)
    }

    fn set_samplers(&mut self, _stage: u32, _start_slot: u32, ids: &[ResourceId]) -> Result<()> {
        self.check_bindings(ids)
    }

    fn set_constant_buffer(
        &mut self,
        _stage: u32,
        _slot: u32,
        id: ResourceId,
        _offset: u32,
        _size: u32,
    ) -> Result<()> {
        self.check_binding(id)
    }

    fn set_vertex_buffers(
        &mut self,
        _start_slot: u32,
        bindings: &[VertexBufferBinding],
    ) -> Result<()> {
        bindings
            .iter()
            .try_for_each(|b| self.check_binding(b.buffer_id))
    }

    fn set_index_buffer(&mut self, id: ResourceId, _format: u32, _offset: u32) -> Result<()> {
        self.check_binding(id)
    }

    fn set_input_layout(&mut self, id: ResourceId) -> Result<()> {
        self.check_binding(id)
    }

    fn set_primitive_topology(&mut self, topology: u32) -> Result<()> {
        debug!(topology, "set primitive topology");
        Ok(())
    }

    fn set_shader_resources(
        &mut self,
        _stage: u32,
        _start_slot: u32,
        ids: &[ResourceId],
    ) -> Result<()> {
        self.check_bindings(ids)
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> Result<()> {
        debug!(vertex_count, start_vertex, "draw");
        self.draw_count += 1;
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
    ) -> Result<()> {
        debug!(index_count, start_index, base_vertex, "draw indexed");
        self.draw_count += 1;
        Ok(())
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        debug!(
            vertex_count,
            instance_count, start_vertex, start_instance, "draw instanced"
        );
        self.draw_count += 1;
        Ok(())
    }

    fn draw_indexed_instanced(&mut self, cmd: &CmdDrawIndexedInstanced) -> Result<()> {
        debug!(
            index_count = cmd.index_count,
            instance_count = cmd.instance_count,
            "draw indexed instanced"
        );
        self.draw_count += 1;
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        debug!(x, y, z, "dispatch");
        self.draw_count += 1;
        Ok(())
    }

    fn clear_render_target(&mut self, rtv: ResourceId, color: [f32; 4]) -> Result<()> {
        debug!(rtv, ?color, "clear render target");
        match self.lookup(rtv)? {
            Resource::View { .. } | Resource::Texture { .. } => Ok(()),
            _ => Err(PvgpuError::InvalidParameter),
        }
    }

    fn clear_depth_stencil(
        &mut self,
        dsv: ResourceId,
        flags: u32,
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        debug!(dsv, flags, depth, stencil, "clear depth stencil");
        match self.lookup(dsv)? {
            Resource::View { .. } | Resource::Texture { .. } => Ok(()),
            _ => Err(PvgpuError::InvalidParameter),
        }
    }

    fn present(&mut self, backbuffer: ResourceId, sync_interval: u32) -> Result<()> {
        debug!(backbuffer, sync_interval, "present");
        if backbuffer != 0 {
            self.lookup(backbuffer)?;
        }
        self.present_count += 1;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        debug!(width, height, "resize");
        if width == 0 || height == 0 {
            return Err(PvgpuError::InvalidParameter);
        }
        Ok(())
    }
}
