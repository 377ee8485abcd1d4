//! Cubemap skybox pass.
//!
//! Draws an inward-facing cube with a rotation-only view so the sky sits at
//! infinity; depth test reads the geometry pass's depth buffer without
//! writing it.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::gpu::barrier::ResourceState;
use crate::gpu::command_list::CommandList;
use crate::gpu::device::{
    CpuDescriptor, Device, DeviceError, Format, GraphicsPipelineDesc, PipelineHandle,
    RootParameter, RootSignatureDesc, RootSignatureHandle, ShaderBlob,
};
use crate::gpu::render_target::RenderTarget;
use crate::renderer::{Mesh, PassKind, PassPipelines};

const RP_CAMERA: u32 = 0;
const RP_CUBEMAP: u32 = 1;

/// Rotation-only camera constants for the sky.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SkyboxConstants {
    /// Projection x rotation-only view, column major.
    pub view_proj: [[f32; 4]; 4],
}

impl SkyboxConstants {
    /// Strip translation from `view` and pack with `proj`.
    #[must_use]
    pub fn pack(proj: Mat4, view: Mat4) -> Self {
        let mut rotation_only = view;
        rotation_only.w_axis = glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        Self {
            view_proj: (proj * rotation_only).to_cols_array_2d(),
        }
    }
}

/// Skybox background pass.
#[derive(Debug)]
pub struct SkyboxPass {
    root_signature: RootSignatureHandle,
    pipeline: PipelineHandle,
}

impl SkyboxPass {
    /// Build the pass's pipeline data.
    pub fn new(
        device: &Arc<dyn Device>,
        vertex_shader: ShaderBlob,
        pixel_shader: ShaderBlob,
        output_format: Format,
        depth_format: Format,
    ) -> Result<Self, DeviceError> {
        let root_signature = Self::build_root_signature(device)?;
        let pipeline = Self::build_pipeline(
            device,
            root_signature,
            vertex_shader,
            pixel_shader,
            output_format,
            depth_format,
        )?;
        Ok(Self {
            root_signature,
            pipeline,
        })
    }

    fn build_root_signature(device: &Arc<dyn Device>) -> Result<RootSignatureHandle, DeviceError> {
        device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::ConstantBuffer { register: 0 },
                RootParameter::ShaderResourceTable {
                    register: 0,
                    count: 1,
                },
            ],
            static_linear_sampler: true,
        })
    }

    fn build_pipeline(
        device: &Arc<dyn Device>,
        root_signature: RootSignatureHandle,
        vertex_shader: ShaderBlob,
        pixel_shader: ShaderBlob,
        output_format: Format,
        depth_format: Format,
    ) -> Result<PipelineHandle, DeviceError> {
        device.create_graphics_pipeline(&GraphicsPipelineDesc {
            root_signature,
            vertex_shader,
            pixel_shader: Some(pixel_shader),
            render_target_formats: vec![output_format],
            // Depth test at the far plane, no writes.
            depth_format: Some(depth_format),
            depth_write: false,
        })
    }

    /// Record the sky draw into `target`, testing against its depth
    /// attachment.
    pub fn record(
        &self,
        cmd: &mut CommandList,
        target: &RenderTarget,
        cube: &Mesh,
        cubemap_srv: CpuDescriptor,
        constants: &SkyboxConstants,
    ) -> Result<(), crate::gpu::upload::AllocError> {
        for attachment in target.color_attachments() {
            cmd.transition_barrier(&attachment.texture, ResourceState::RenderTarget);
        }
        if let Some(depth) = target.depth_attachment() {
            cmd.transition_barrier(&depth.texture, ResourceState::DepthRead);
        }

        cmd.set_render_target(target);
        cmd.set_graphics_root_signature(self.root_signature);
        cmd.set_pipeline_state(self.pipeline);
        cmd.set_graphics_dynamic_constant_buffer(RP_CAMERA, constants)?;
        cmd.set_descriptor_table(RP_CUBEMAP, cubemap_srv);
        cmd.set_vertex_buffer(0, &cube.vertex_buffer, cube.vertex_stride);
        cmd.set_index_buffer(&cube.index_buffer, cube.index_format);
        cmd.draw_indexed(cube.index_count, 1, 0, 0, 0);
        Ok(())
    }
}

impl PassPipelines for SkyboxPass {
    fn kind(&self) -> PassKind {
        PassKind::Skybox
    }

    fn root_signature(&self) -> RootSignatureHandle {
        self.root_signature
    }

    fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }
}
