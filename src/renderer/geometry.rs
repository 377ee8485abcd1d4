//! G-buffer geometry pass.
//!
//! Transitions the G-buffer attachments into write states, clears them, and
//! draws every opaque item with per-object constants carved from the
//! command list's upload allocator.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::gpu::barrier::ResourceState;
use crate::gpu::command_list::CommandList;
use crate::gpu::device::{
    Device, DeviceError, Format, GraphicsPipelineDesc, PipelineHandle, RootParameter,
    RootSignatureDesc, RootSignatureHandle, ScissorRect, ShaderBlob, Viewport,
};
use crate::gpu::render_target::RenderTarget;
use crate::renderer::{CameraConstants, DrawItem, PassKind, PassPipelines};

/// Root-parameter indices for the geometry pipeline.
const RP_CAMERA: u32 = 0;
const RP_OBJECT: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ObjectConstants {
    world: [[f32; 4]; 4],
}

/// G-buffer fill pass.
#[derive(Debug)]
pub struct GeometryPass {
    root_signature: RootSignatureHandle,
    pipeline: PipelineHandle,
}

impl GeometryPass {
    /// Build the pass's pipeline data for the given attachment formats.
    pub fn new(
        device: &Arc<dyn Device>,
        vertex_shader: ShaderBlob,
        pixel_shader: ShaderBlob,
        color_formats: Vec<Format>,
        depth_format: Format,
    ) -> Result<Self, DeviceError> {
        let root_signature = Self::build_root_signature(device)?;
        let pipeline = Self::build_pipeline(
            device,
            root_signature,
            vertex_shader,
            pixel_shader,
            color_formats,
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
                RootParameter::ConstantBuffer { register: 1 },
            ],
            static_linear_sampler: false,
        })
    }

    fn build_pipeline(
        device: &Arc<dyn Device>,
        root_signature: RootSignatureHandle,
        vertex_shader: ShaderBlob,
        pixel_shader: ShaderBlob,
        color_formats: Vec<Format>,
        depth_format: Format,
    ) -> Result<PipelineHandle, DeviceError> {
        device.create_graphics_pipeline(&GraphicsPipelineDesc {
            root_signature,
            vertex_shader,
            pixel_shader: Some(pixel_shader),
            render_target_formats: color_formats,
            depth_format: Some(depth_format),
            depth_write: true,
        })
    }

    /// Record the pass: clear and fill the G-buffer.
    pub fn record(
        &self,
        cmd: &mut CommandList,
        gbuffer: &RenderTarget,
        camera: &CameraConstants,
        items: &[DrawItem<'_>],
    ) -> Result<(), crate::gpu::upload::AllocError> {
        for attachment in gbuffer.color_attachments() {
            let clear = match attachment.texture.clear_value() {
                Some(crate::gpu::device::ClearValue::Color { value, .. }) => value,
                _ => [0.0; 4],
            };
            cmd.clear_texture(&attachment.texture, attachment.view.handle(0), clear);
        }
        if let Some(depth) = gbuffer.depth_attachment() {
            cmd.clear_depth_stencil_texture(&depth.texture, depth.view.handle(0), 1.0, 0);
        }

        cmd.set_render_target(gbuffer);
        if let Some((width, height)) = gbuffer.size() {
            cmd.set_viewport(&Viewport::full(width, height));
            cmd.set_scissor(&ScissorRect::full(width, height));
        }

        cmd.set_graphics_root_signature(self.root_signature);
        cmd.set_pipeline_state(self.pipeline);
        cmd.set_graphics_dynamic_constant_buffer(RP_CAMERA, camera)?;

        for item in items {
            cmd.set_graphics_dynamic_constant_buffer(
                RP_OBJECT,
                &ObjectConstants {
                    world: item.world.to_cols_array_2d(),
                },
            )?;
            cmd.set_vertex_buffer(0, &item.mesh.vertex_buffer, item.mesh.vertex_stride);
            cmd.set_index_buffer(&item.mesh.index_buffer, item.mesh.index_format);
            cmd.draw_indexed(item.mesh.index_count, 1, 0, 0, 0);
        }

        // Hand the attachments to the lighting pass read-ready.
        for attachment in gbuffer.color_attachments() {
            cmd.transition_barrier(&attachment.texture, ResourceState::PixelShaderResource);
        }
        Ok(())
    }
}

impl PassPipelines for GeometryPass {
    fn kind(&self) -> PassKind {
        PassKind::Geometry
    }

    fn root_signature(&self) -> RootSignatureHandle {
        self.root_signature
    }

    fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::command_list::CommandList;
    use crate::gpu::descriptor::DescriptorAllocator;
    use crate::gpu::device::{ClearValue, DescriptorHeapKind, QueueKind, ResourceDesc};
    use crate::gpu::null::NullDevice;
    use crate::gpu::render_target::{Attachment, AttachmentPoint, RenderTarget};
    use crate::gpu::resource::Texture;
    use crate::gpu::state_tracker::GlobalStateTable;
    use crate::renderer::Mesh;
    use glam::{Mat4, Vec3};
    use std::sync::Mutex;

    fn blob() -> ShaderBlob {
        ShaderBlob::new(vec![0_u8; 16])
    }

    #[test]
    fn records_clears_draws_and_readback_transitions() {
        let device: Arc<dyn Device> = NullDevice::new();
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));
        let rtv_alloc =
            DescriptorAllocator::new(device.clone(), DescriptorHeapKind::RenderTarget, 64, 2);
        let dsv_alloc =
            DescriptorAllocator::new(device.clone(), DescriptorHeapKind::DepthStencil, 64, 2);

        let mut gbuffer = RenderTarget::new();
        let albedo = Texture::new(
            &device,
            &globals,
            ResourceDesc {
                allow_render_target: true,
                ..ResourceDesc::texture_2d(Format::Rgba16Float, 32, 32)
            },
            ResourceState::Common,
            Some(ClearValue::Color {
                format: Format::Rgba16Float,
                value: [0.1, 0.2, 0.3, 1.0],
            }),
        )
        .unwrap();
        let depth = Texture::new(
            &device,
            &globals,
            ResourceDesc {
                allow_depth_stencil: true,
                ..ResourceDesc::texture_2d(Format::D32Float, 32, 32)
            },
            ResourceState::Common,
            Some(ClearValue::DepthStencil {
                format: Format::D32Float,
                depth: 1.0,
                stencil: 0,
            }),
        )
        .unwrap();
        let _ = gbuffer.attach(
            AttachmentPoint::Color(0),
            Attachment {
                texture: albedo,
                view: rtv_alloc.allocate(1).unwrap(),
            },
        );
        let _ = gbuffer.attach(
            AttachmentPoint::DepthStencil,
            Attachment {
                texture: depth,
                view: dsv_alloc.allocate(1).unwrap(),
            },
        );

        let pass = GeometryPass::new(
            &device,
            blob(),
            blob(),
            vec![Format::Rgba16Float],
            Format::D32Float,
        )
        .unwrap();

        let mut cmd =
            CommandList::new(device.clone(), globals.clone(), QueueKind::Direct, 4096).unwrap();
        let mesh = {
            let vertices = [[0.0_f32; 8]; 3];
            Mesh::from_data(&mut cmd, &vertices, &[0, 1, 2]).unwrap()
        };

        let camera = CameraConstants::pack(Mat4::IDENTITY, Vec3::ZERO);
        let items = [DrawItem {
            mesh: &mesh,
            world: Mat4::IDENTITY,
        }];
        pass.record(&mut cmd, &gbuffer, &camera, &items).unwrap();

        let recorder = cmd.null_recorder();
        assert_eq!(recorder.clear_count(), 2);
        assert_eq!(recorder.draw_count(), 1);
        // Mesh staging: one copy per buffer.
        assert_eq!(recorder.copy_count(), 2);
    }
}
