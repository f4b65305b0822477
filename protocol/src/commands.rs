//! Command records written into the ring.
//!
//! Every record begins with a 16-byte [`CommandHeader`]; `command_size`
//! includes the header and is a multiple of 16. Records carry their own
//! tail padding, so the ring never contains padding bytes between entries.
//! Bulk payloads (shader bytecode, texel data, mapped contents, semantic
//! name strings) never travel inline - they live in the resource heap and
//! are cited by offset.

use bytemuck::{Pod, Zeroable};

use crate::error::{PvgpuError, Result};

// =============================================================================
// Command Types
// =============================================================================

// Resource commands: 0x0001 - 0x00FF
pub const PVGPU_CMD_CREATE_RESOURCE: u32 = 0x0001;
pub const PVGPU_CMD_DESTROY_RESOURCE: u32 = 0x0002;
pub const PVGPU_CMD_MAP_RESOURCE: u32 = 0x0003;
pub const PVGPU_CMD_UNMAP_RESOURCE: u32 = 0x0004;
pub const PVGPU_CMD_UPDATE_RESOURCE: u32 = 0x0005;
pub const PVGPU_CMD_COPY_RESOURCE: u32 = 0x0006;
pub const PVGPU_CMD_OPEN_RESOURCE: u32 = 0x0007;

// Shader commands: 0x0030 - 0x003F
pub const PVGPU_CMD_CREATE_SHADER: u32 = 0x0030;
pub const PVGPU_CMD_DESTROY_SHADER: u32 = 0x0031;

// State commands: 0x0100 - 0x01FF
pub const PVGPU_CMD_SET_RENDER_TARGET: u32 = 0x0101;
pub const PVGPU_CMD_SET_VIEWPORT: u32 = 0x0102;
pub const PVGPU_CMD_SET_SCISSOR: u32 = 0x0103;
pub const PVGPU_CMD_SET_BLEND_STATE: u32 = 0x0104;
pub const PVGPU_CMD_SET_RASTERIZER_STATE: u32 = 0x0105;
pub const PVGPU_CMD_SET_DEPTH_STENCIL: u32 = 0x0106;
pub const PVGPU_CMD_SET_SHADER: u32 = 0x0107;
pub const PVGPU_CMD_SET_SAMPLER: u32 = 0x0108;
pub const PVGPU_CMD_SET_CONSTANT_BUFFER: u32 = 0x0109;
pub const PVGPU_CMD_SET_VERTEX_BUFFER: u32 = 0x010A;
pub const PVGPU_CMD_SET_INDEX_BUFFER: u32 = 0x010B;
pub const PVGPU_CMD_SET_INPUT_LAYOUT: u32 = 0x010C;
pub const PVGPU_CMD_SET_PRIMITIVE_TOPOLOGY: u32 = 0x010D;
pub const PVGPU_CMD_SET_SHADER_RESOURCE: u32 = 0x010E;

// Draw commands: 0x0200 - 0x02FF
pub const PVGPU_CMD_DRAW: u32 = 0x0201;
pub const PVGPU_CMD_DRAW_INDEXED: u32 = 0x0202;
pub const PVGPU_CMD_DRAW_INSTANCED: u32 = 0x0203;
pub const PVGPU_CMD_DRAW_INDEXED_INSTANCED: u32 = 0x0204;
pub const PVGPU_CMD_DISPATCH: u32 = 0x0205;
pub const PVGPU_CMD_CLEAR_RENDER_TARGET: u32 = 0x0206;
pub const PVGPU_CMD_CLEAR_DEPTH_STENCIL: u32 = 0x0207;

// Sync commands: 0x0300 - 0x03FF
pub const PVGPU_CMD_FENCE: u32 = 0x0301;
pub const PVGPU_CMD_PRESENT: u32 = 0x0302;
pub const PVGPU_CMD_FLUSH: u32 = 0x0303;
pub const PVGPU_CMD_WAIT_FENCE: u32 = 0x0304;
pub const PVGPU_CMD_RESIZE_BUFFERS: u32 = 0x0305;

/// Whether `ty` is a command type the host is required to understand.
/// Unknown types are a fatal protocol error on the consuming side.
pub fn is_known_command(ty: u32) -> bool {
    matches!(
        ty,
        PVGPU_CMD_CREATE_RESOURCE..=PVGPU_CMD_OPEN_RESOURCE
            | PVGPU_CMD_CREATE_SHADER
            | PVGPU_CMD_DESTROY_SHADER
            | PVGPU_CMD_SET_RENDER_TARGET..=PVGPU_CMD_SET_SHADER_RESOURCE
            | PVGPU_CMD_DRAW..=PVGPU_CMD_CLEAR_DEPTH_STENCIL
            | PVGPU_CMD_FENCE..=PVGPU_CMD_RESIZE_BUFFERS
    )
}

// =============================================================================
// Resource Types
// =============================================================================

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Texture1D = 1,
    Texture2D = 2,
    Texture3D = 3,
    Buffer = 4,
    VertexShader = 5,
    PixelShader = 6,
    GeometryShader = 7,
    HullShader = 8,
    DomainShader = 9,
    ComputeShader = 10,
    InputLayout = 11,
    BlendState = 12,
    RasterizerState = 13,
    DepthStencilState = 14,
    SamplerState = 15,
    RenderTargetView = 16,
    DepthStencilView = 17,
    ShaderResourceView = 18,
    UnorderedAccessView = 19,
}

impl ResourceType {
    pub fn from_u32(v: u32) -> Option<Self> {
        if (1..=19).contains(&v) {
            // SAFETY: repr(u32) with contiguous discriminants 1..=19.
            Some(unsafe { std::mem::transmute::<u32, ResourceType>(v) })
        } else {
            None
        }
    }

    /// View types carry a parent resource id in their create command.
    pub fn is_view(self) -> bool {
        matches!(
            self,
            ResourceType::RenderTargetView
                | ResourceType::DepthStencilView
                | ResourceType::ShaderResourceView
                | ResourceType::UnorderedAccessView
        )
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex = 0,
    Pixel = 1,
    Geometry = 2,
    Hull = 3,
    Domain = 4,
    Compute = 5,
}

/// Map access type
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
    WriteDiscard = 4,
    WriteNoOverwrite = 5,
}

// =============================================================================
// Command Header
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CommandHeader {
    pub command_type: u32,
    /// Total record size including this header; a multiple of 16.
    pub command_size: u32,
    pub resource_id: u32,
    pub flags: u32,
}

pub const PVGPU_CMD_HEADER_SIZE: usize = std::mem::size_of::<CommandHeader>();

// Command flags
pub const PVGPU_CMD_FLAG_SYNC: u32 = 1 << 0;
pub const PVGPU_CMD_FLAG_NO_FENCE: u32 = 1 << 1;

impl CommandHeader {
    pub fn new(command_type: u32, command_size: usize, resource_id: u32) -> Self {
        debug_assert!(command_size % 16 == 0);
        Self {
            command_type,
            command_size: command_size as u32,
            resource_id,
            flags: 0,
        }
    }
}

// =============================================================================
// Command Payloads
// =============================================================================

/// Creates every non-shader object kind: textures, buffers, input layouts,
/// pipeline state blocks and views, discriminated by `resource_type`.
/// Views reference their parent through `parent_id`; state and input-layout
/// descriptor blobs travel in the heap via `heap_offset`/`data_size`, as
/// does optional initial data for textures and buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdCreateResource {
    pub header: CommandHeader,
    pub resource_type: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub sample_quality: u32,
    pub bind_flags: u32,
    pub misc_flags: u32,
    pub heap_offset: u32,
    pub data_size: u32,
    pub parent_id: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDestroyResource {
    pub header: CommandHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdOpenResource {
    pub header: CommandHeader,
    pub shared_handle: u32,
    pub resource_type: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub bind_flags: u32,
    pub misc_flags: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdMapResource {
    pub header: CommandHeader,
    pub subresource: u32,
    /// [`MapType`] discriminant.
    pub map_type: u32,
    pub map_flags: u32,
    /// Heap range the host copies current contents into (read maps) or the
    /// producer fills (write maps).
    pub heap_offset: u32,
    pub data_size: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdUnmapResource {
    pub header: CommandHeader,
    pub subresource: u32,
    pub heap_offset: u32,
    /// Size of data to copy back into the resource (write maps).
    pub data_size: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdUpdateResource {
    pub header: CommandHeader,
    pub subresource: u32,
    pub heap_offset: u32,
    pub data_size: u32,
    // Box for partial updates (all zeros = full update)
    pub dst_x: u32,
    pub dst_y: u32,
    pub dst_z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u32,
    pub depth_pitch: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdCopyResource {
    pub header: CommandHeader,
    pub dst_resource_id: u32,
    pub src_resource_id: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdCreateShader {
    pub header: CommandHeader,
    pub shader_type: u32,
    pub bytecode_size: u32,
    pub bytecode_offset: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDestroyShader {
    pub header: CommandHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetRenderTarget {
    pub header: CommandHeader,
    pub num_rtvs: u32,
    pub dsv_id: u32,
    pub rtv_ids: [u32; 8],
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetViewport {
    pub header: CommandHeader,
    pub num_viewports: u32,
    pub viewports: [Viewport; 16],
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetScissor {
    pub header: CommandHeader,
    pub num_rects: u32,
    pub rects: [ScissorRect; 16],
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetBlendState {
    pub header: CommandHeader,
    pub state_id: u32,
    pub blend_factor: [f32; 4],
    pub sample_mask: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetRasterizerState {
    pub header: CommandHeader,
    pub state_id: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetDepthStencil {
    pub header: CommandHeader,
    pub state_id: u32,
    pub stencil_ref: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetShader {
    pub header: CommandHeader,
    /// [`ShaderStage`] discriminant.
    pub stage: u32,
    pub shader_id: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetSamplers {
    pub header: CommandHeader,
    pub stage: u32,
    pub start_slot: u32,
    pub num_samplers: u32,
    pub sampler_ids: [u32; 16],
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetConstantBuffer {
    pub header: CommandHeader,
    pub stage: u32,
    pub slot: u32,
    pub buffer_id: u32,
    pub offset: u32,
    pub size: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct VertexBufferBinding {
    pub buffer_id: u32,
    pub stride: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetVertexBuffer {
    pub header: CommandHeader,
    pub start_slot: u32,
    pub num_buffers: u32,
    pub buffers: [VertexBufferBinding; 16],
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetIndexBuffer {
    pub header: CommandHeader,
    pub buffer_id: u32,
    pub format: u32, // DXGI_FORMAT (16 = R16_UINT, 42 = R32_UINT)
    pub offset: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetInputLayout {
    pub header: CommandHeader,
    pub layout_id: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetPrimitiveTopology {
    pub header: CommandHeader,
    pub topology: u32, // D3D11_PRIMITIVE_TOPOLOGY
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdSetShaderResources {
    pub header: CommandHeader,
    pub stage: u32,
    pub start_slot: u32,
    pub num_views: u32,
    pub view_ids: [u32; 128],
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDraw {
    pub header: CommandHeader,
    pub vertex_count: u32,
    pub start_vertex: u32,
    pub _reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDrawIndexed {
    pub header: CommandHeader,
    pub index_count: u32,
    pub start_index: u32,
    pub base_vertex: i32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDrawInstanced {
    pub header: CommandHeader,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub start_vertex: u32,
    pub start_instance: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDrawIndexedInstanced {
    pub header: CommandHeader,
    pub index_count: u32,
    pub instance_count: u32,
    pub start_index: u32,
    pub base_vertex: i32,
    pub start_instance: u32,
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdDispatch {
    pub header: CommandHeader,
    pub thread_group_count_x: u32,
    pub thread_group_count_y: u32,
    pub thread_group_count_z: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdClearRenderTarget {
    pub header: CommandHeader,
    pub rtv_id: u32,
    pub color: [f32; 4],
    pub _reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdClearDepthStencil {
    pub header: CommandHeader,
    pub dsv_id: u32,
    pub clear_flags: u32, // D3D11_CLEAR_DEPTH = 1, D3D11_CLEAR_STENCIL = 2
    pub depth: f32,
    pub stencil: u8,
    pub _padding: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdFence {
    pub header: CommandHeader,
    pub fence_value: u64,
    pub _reserved: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdPresent {
    pub header: CommandHeader,
    pub backbuffer_id: u32,
    pub sync_interval: u32,
    pub flags: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdFlush {
    pub header: CommandHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdWaitFence {
    pub header: CommandHeader,
    pub fence_value: u64,
    pub _reserved: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CmdResizeBuffers {
    pub header: CommandHeader,
    pub swapchain_id: u32, // Swapchain to resize (0 = default)
    pub width: u32,        // New width in pixels
    pub height: u32,       // New height in pixels
    pub format: u32,       // New format (DXGI_FORMAT, 0 = keep current)
    pub buffer_count: u32, // New buffer count (0 = keep current)
    pub flags: u32,        // Resize flags
    pub _reserved: [u32; 2],
}

// Records carry their own tail padding to the 16-byte grid; an unaligned
// struct here would desynchronize the three implementations.
const fn aligned16<T>() -> bool {
    std::mem::size_of::<T>() % 16 == 0
}

const _: () = assert!(std::mem::size_of::<CommandHeader>() == 16);
const _: () = assert!(aligned16::<CmdCreateResource>());
const _: () = assert!(aligned16::<CmdDestroyResource>());
const _: () = assert!(aligned16::<CmdOpenResource>());
const _: () = assert!(aligned16::<CmdMapResource>());
const _: () = assert!(aligned16::<CmdUnmapResource>());
const _: () = assert!(aligned16::<CmdUpdateResource>());
const _: () = assert!(aligned16::<CmdCopyResource>());
const _: () = assert!(aligned16::<CmdCreateShader>());
const _: () = assert!(aligned16::<CmdDestroyShader>());
const _: () = assert!(aligned16::<CmdSetRenderTarget>());
const _: () = assert!(aligned16::<CmdSetViewport>());
const _: () = assert!(aligned16::<CmdSetScissor>());
const _: () = assert!(aligned16::<CmdSetBlendState>());
const _: () = assert!(aligned16::<CmdSetRasterizerState>());
const _: () = assert!(aligned16::<CmdSetDepthStencil>());
const _: () = assert!(aligned16::<CmdSetShader>());
const _: () = assert!(aligned16::<CmdSetSamplers>());
const _: () = assert!(aligned16::<CmdSetConstantBuffer>());
const _: () = assert!(aligned16::<CmdSetVertexBuffer>());
const _: () = assert!(aligned16::<CmdSetIndexBuffer>());
const _: () = assert!(aligned16::<CmdSetInputLayout>());
const _: () = assert!(aligned16::<CmdSetPrimitiveTopology>());
const _: () = assert!(aligned16::<CmdSetShaderResources>());
const _: () = assert!(aligned16::<CmdDraw>());
const _: () = assert!(aligned16::<CmdDrawIndexed>());
const _: () = assert!(aligned16::<CmdDrawInstanced>());
const _: () = assert!(aligned16::<CmdDrawIndexedInstanced>());
const _: () = assert!(aligned16::<CmdDispatch>());
const _: () = assert!(aligned16::<CmdClearRenderTarget>());
const _: () = assert!(aligned16::<CmdClearDepthStencil>());
const _: () = assert!(aligned16::<CmdFence>());
const _: () = assert!(aligned16::<CmdPresent>());
const _: () = assert!(aligned16::<CmdFlush>());
const _: () = assert!(aligned16::<CmdWaitFence>());
const _: () = assert!(aligned16::<CmdResizeBuffers>());

// =============================================================================
// Decode helpers
// =============================================================================

/// Read a command struct from record bytes. The bytes come out of the ring
/// reassembly buffer, which has no alignment guarantee, so this copies.
pub fn read_command<T: Pod>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return Err(PvgpuError::InvalidCommand);
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()]))
}

/// Read just the header from the front of a record.
pub fn read_header(bytes: &[u8]) -> Result<CommandHeader> {
    read_command::<CommandHeader>(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_roundtrip() {
        let cmd = CmdDraw {
            header: CommandHeader::new(PVGPU_CMD_DRAW, std::mem::size_of::<CmdDraw>(), 0),
            vertex_count: 3,
            start_vertex: 0,
            _reserved: [0; 2],
        };
        let bytes = bytemuck::bytes_of(&cmd);
        assert_eq!(bytes.len(), 32);

        let header = read_header(bytes).unwrap();
        assert_eq!(header.command_type, PVGPU_CMD_DRAW);
        assert_eq!(header.command_size, 32);

        let back: CmdDraw = read_command(bytes).unwrap();
        assert_eq!(back.vertex_count, 3);
        assert_eq!(back.start_vertex, 0);
    }

    #[test]
    fn decode_from_unaligned_bytes() {
        let cmd = CmdFence {
            header: CommandHeader::new(PVGPU_CMD_FENCE, std::mem::size_of::<CmdFence>(), 0),
            fence_value: 0xDEAD_BEEF_CAFE_F00D,
            _reserved: 0,
        };
        // Shift by one byte so any alignment assumption would trip.
        let mut buf = vec![0u8; 1 + std::mem::size_of::<CmdFence>()];
        buf[1..].copy_from_slice(bytemuck::bytes_of(&cmd));
        let back: CmdFence = read_command(&buf[1..]).unwrap();
        assert_eq!(back.fence_value, 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn short_buffer_is_invalid() {
        let bytes = [0u8; 8];
        assert!(matches!(
            read_header(&bytes),
            Err(PvgpuError::InvalidCommand)
        ));
    }

    #[test]
    fn known_command_covers_every_constant() {
        for ty in [
            PVGPU_CMD_CREATE_RESOURCE,
            PVGPU_CMD_DESTROY_RESOURCE,
            PVGPU_CMD_MAP_RESOURCE,
            PVGPU_CMD_UNMAP_RESOURCE,
            PVGPU_CMD_UPDATE_RESOURCE,
            PVGPU_CMD_COPY_RESOURCE,
            PVGPU_CMD_OPEN_RESOURCE,
            PVGPU_CMD_CREATE_SHADER,
            PVGPU_CMD_DESTROY_SHADER,
            PVGPU_CMD_SET_RENDER_TARGET,
            PVGPU_CMD_SET_VIEWPORT,
            PVGPU_CMD_SET_SCISSOR,
            PVGPU_CMD_SET_BLEND_STATE,
            PVGPU_CMD_SET_RASTERIZER_STATE,
            PVGPU_CMD_SET_DEPTH_STENCIL,
            PVGPU_CMD_SET_SHADER,
            PVGPU_CMD_SET_SAMPLER,
            PVGPU_CMD_SET_CONSTANT_BUFFER,
            PVGPU_CMD_SET_VERTEX_BUFFER,
            PVGPU_CMD_SET_INDEX_BUFFER,
            PVGPU_CMD_SET_INPUT_LAYOUT,
            PVGPU_CMD_SET_PRIMITIVE_TOPOLOGY,
            PVGPU_CMD_SET_SHADER_RESOURCE,
            PVGPU_CMD_DRAW,
            PVGPU_CMD_DRAW_INDEXED,
            PVGPU_CMD_DRAW_INSTANCED,
            PVGPU_CMD_DRAW_INDEXED_INSTANCED,
            PVGPU_CMD_DISPATCH,
            PVGPU_CMD_CLEAR_RENDER_TARGET,
            PVGPU_CMD_CLEAR_DEPTH_STENCIL,
            PVGPU_CMD_FENCE,
            PVGPU_CMD_PRESENT,
            PVGPU_CMD_FLUSH,
            PVGPU_CMD_WAIT_FENCE,
            PVGPU_CMD_RESIZE_BUFFERS,
        ] {
            assert!(is_known_command(ty), "0x{ty:04X} should be known");
        }
        assert!(!is_known_command(0));
        assert!(!is_known_command(0x0008));
        assert!(!is_known_command(0x0400));
        assert!(!is_known_command(0xFFFF_FFFF));
    }

    #[test]
    fn resource_type_from_u32() {
        assert_eq!(ResourceType::from_u32(2), Some(ResourceType::Texture2D));
        assert_eq!(
            ResourceType::from_u32(19),
            Some(ResourceType::UnorderedAccessView)
        );
        assert_eq!(ResourceType::from_u32(0), None);
        assert_eq!(ResourceType::from_u32(20), None);
        assert!(ResourceType::RenderTargetView.is_view());
        assert!(!ResourceType::Buffer.is_view());
    }
}
