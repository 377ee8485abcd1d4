//! Deferred lighting resolve.
//!
//! Reads the G-buffer as shader resources and writes one full-screen
//! triangle of lit color into the HDR target.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::gpu::barrier::ResourceState;
use crate::gpu::command_list::CommandList;
use crate::gpu::device::{
    CpuDescriptor, Device, DeviceError, Format, GraphicsPipelineDesc, PipelineHandle,
    RootParameter, RootSignatureDesc, RootSignatureHandle, ScissorRect, ShaderBlob, Viewport,
};
use crate::gpu::render_target::RenderTarget;
use crate::renderer::{PassKind, PassPipelines};

const RP_LIGHTS: u32 = 0;
const RP_GBUFFER: u32 = 1;

/// Directional light + ambient term consumed by the resolve shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightConstants {
    /// World-space direction towards the light (w unused).
    pub direction: [f32; 4],
    /// Linear light color (w = intensity).
    pub color: [f32; 4],
    /// Linear ambient color (w unused).
    pub ambient: [f32; 4],
    /// World-space eye position (w unused).
    pub eye: [f32; 4],
}

impl LightConstants {
    /// Pack glam light math into the GPU layout.
    #[must_use]
    pub fn pack(direction: Vec3, color: Vec3, intensity: f32, ambient: Vec3, eye: Vec3) -> Self {
        Self {
            direction: [direction.x, direction.y, direction.z, 0.0],
            color: [color.x, color.y, color.z, intensity],
            ambient: [ambient.x, ambient.y, ambient.z, 0.0],
            eye: [eye.x, eye.y, eye.z, 1.0],
        }
    }
}

/// Full-screen deferred lighting pass.
#[derive(Debug)]
pub struct LightingPass {
    root_signature: RootSignatureHandle,
    pipeline: PipelineHandle,
    gbuffer_srv_count: u32,
}

impl LightingPass {
    /// Build the pass's pipeline data.
    ///
    /// `gbuffer_srv_count` is the number of G-buffer textures (color
    /// attachments + depth) bound as one descriptor table.
    pub fn new(
        device: &Arc<dyn Device>,
        vertex_shader: ShaderBlob,
        pixel_shader: ShaderBlob,
        output_format: Format,
        depth_format: Format,
        gbuffer_srv_count: u32,
    ) -> Result<Self, DeviceError> {
        let root_signature = Self::build_root_signature(device, gbuffer_srv_count)?;
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
            gbuffer_srv_count,
        })
    }

    fn build_root_signature(
        device: &Arc<dyn Device>,
        srv_count: u32,
    ) -> Result<RootSignatureHandle, DeviceError> {
        device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::ConstantBuffer { register: 0 },
                RootParameter::ShaderResourceTable {
                    register: 0,
                    count: srv_count,
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
            // The lit target shares the scene depth buffer (read-only); the
            // full-screen triangle itself never tests.
            depth_format: Some(depth_format),
            depth_write: false,
        })
    }

    /// Record the resolve: G-buffer to shader-read, one triangle into the
    /// lit target.
    pub fn record(
        &self,
        cmd: &mut CommandList,
        gbuffer: &RenderTarget,
        target: &RenderTarget,
        gbuffer_srvs: CpuDescriptor,
        lights: &LightConstants,
    ) -> Result<(), crate::gpu::upload::AllocError> {
        for attachment in gbuffer.color_attachments() {
            cmd.transition_barrier(&attachment.texture, ResourceState::PixelShaderResource);
        }
        if let Some(depth) = gbuffer.depth_attachment() {
            cmd.transition_barrier(&depth.texture, ResourceState::DepthRead);
        }
        for attachment in target.color_attachments() {
            cmd.transition_barrier(&attachment.texture, ResourceState::RenderTarget);
        }

        cmd.set_render_target(target);
        if let Some((width, height)) = target.size() {
            cmd.set_viewport(&Viewport::full(width, height));
            cmd.set_scissor(&ScissorRect::full(width, height));
        }

        cmd.set_graphics_root_signature(self.root_signature);
        cmd.set_pipeline_state(self.pipeline);
        cmd.set_graphics_dynamic_constant_buffer(RP_LIGHTS, lights)?;
        cmd.set_descriptor_table(RP_GBUFFER, gbuffer_srvs);
        cmd.draw(3, 1, 0, 0);
        Ok(())
    }

    /// Number of SRVs the G-buffer table binds.
    #[must_use]
    pub fn gbuffer_srv_count(&self) -> u32 {
        self.gbuffer_srv_count
    }
}

impl PassPipelines for LightingPass {
    fn kind(&self) -> PassKind {
        PassKind::Lighting
    }

    fn root_signature(&self) -> RootSignatureHandle {
        self.root_signature
    }

    fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }
}
