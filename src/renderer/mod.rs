//! The closed set of render passes consuming the GPU substrate.
//!
//! Passes are plain structs — no open-ended inheritance. Each one builds
//! its pipeline data through exactly two operations
//! (`build_root_signature`, `build_pipeline`) and exposes them via
//! [`PassPipelines`]; recording goes through concrete `record` methods on
//! the pass, dispatched by the engine per [`PassKind`].

/// Compute separable blur over an HDR color target.
pub mod blur;
/// Equirectangular-to-cubemap compute conversion.
pub mod equirect;
/// G-buffer geometry pass.
pub mod geometry;
/// Deferred lighting full-screen pass.
pub mod lighting;
/// Cubemap skybox pass.
pub mod skybox;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::gpu::barrier::ResourceState;
use crate::gpu::command_list::CommandList;
use crate::gpu::device::{Format, PipelineHandle, RootSignatureHandle};
use crate::gpu::resource::Buffer;
use crate::gpu::upload::AllocError;

/// The closed set of pass kinds this engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// G-buffer fill.
    Geometry,
    /// Deferred lighting resolve.
    Lighting,
    /// Skybox background.
    Skybox,
    /// Separable blur.
    Blur,
    /// Equirect-to-cubemap conversion.
    EquirectToCubemap,
}

/// The two pipeline-data accessors every pass exposes.
pub trait PassPipelines {
    /// Which pass this is.
    fn kind(&self) -> PassKind;
    /// The pass's root signature.
    fn root_signature(&self) -> RootSignatureHandle;
    /// The pass's pipeline-state object.
    fn pipeline(&self) -> PipelineHandle;
}

/// Per-frame camera constants shared by the raster passes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraConstants {
    /// View-projection matrix, column major.
    pub view_proj: [[f32; 4]; 4],
    /// World-space eye position (w unused).
    pub eye: [f32; 4],
}

impl CameraConstants {
    /// Pack glam camera math into the GPU layout.
    #[must_use]
    pub fn pack(view_proj: Mat4, eye: Vec3) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            eye: [eye.x, eye.y, eye.z, 1.0],
        }
    }
}

/// An uploaded mesh: vertex and index buffers plus draw parameters.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Vertex data in the default heap.
    pub vertex_buffer: Buffer,
    /// Index data in the default heap.
    pub index_buffer: Buffer,
    /// Indices per draw.
    pub index_count: u32,
    /// Bytes per vertex.
    pub vertex_stride: u32,
    /// Index element format.
    pub index_format: Format,
}

impl Mesh {
    /// Upload vertex and 32-bit index data through `cmd`'s staging path.
    ///
    /// The buffers are left transitioning into their bind states within the
    /// recorded list, so the mesh is drawable by any list submitted at or
    /// after it.
    pub fn from_data<V: Pod>(
        cmd: &mut CommandList,
        vertices: &[V],
        indices: &[u32],
    ) -> Result<Self, AllocError> {
        let vertex_buffer =
            cmd.copy_buffer(vertices, ResourceState::VertexAndConstantBuffer)?;
        let index_buffer = cmd.copy_buffer(indices, ResourceState::IndexBuffer)?;
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            vertex_stride: std::mem::size_of::<V>() as u32,
            index_format: Format::R32Uint,
        })
    }
}

/// One draw: a mesh and its world transform.
#[derive(Debug, Clone, Copy)]
pub struct DrawItem<'a> {
    /// Geometry to draw.
    pub mesh: &'a Mesh,
    /// Object-to-world transform.
    pub world: Mat4,
}

/// Thread-group count covering `size` items at `group` per group.
#[must_use]
pub(crate) fn dispatch_groups(size: u32, group: u32) -> u32 {
    size.div_ceil(group).max(1)
}
