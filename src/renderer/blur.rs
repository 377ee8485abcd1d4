//! Separable Gaussian blur, compute-dispatched.
//!
//! Ping-pongs between the color surface and a scratch surface: horizontal
//! into scratch, vertical back into color, `iterations` times. Both
//! surfaces alternate between unordered-access (write leg) and
//! shader-resource (read leg) states; every leg is one dispatch over
//! 8x8 thread groups.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::gpu::barrier::ResourceState;
use crate::gpu::command_list::CommandList;
use crate::gpu::descriptor::DescriptorAllocation;
use crate::gpu::device::{
    ComputePipelineDesc, Device, DeviceError, PipelineHandle, RootParameter, RootSignatureDesc,
    RootSignatureHandle, ShaderBlob,
};
use crate::gpu::resource::Texture;
use crate::renderer::{dispatch_groups, PassKind, PassPipelines};

const RP_PARAMS: u32 = 0;
const RP_SOURCE: u32 = 1;
const RP_DEST: u32 = 2;

const GROUP_SIZE: u32 = 8;

/// Blur kernel parameters — must match the compute shader's root constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlurParams {
    texel_size: [f32; 2],
    horizontal: u32,
    radius: u32,
}

/// A blur-capable surface: the texture plus its SRV and UAV single-slot
/// views.
#[derive(Debug)]
pub struct BlurSurface {
    /// The color texture.
    pub texture: Texture,
    /// Shader-resource view (read leg).
    pub srv: DescriptorAllocation,
    /// Unordered-access view (write leg).
    pub uav: DescriptorAllocation,
}

/// Compute separable blur pass.
#[derive(Debug)]
pub struct BlurPass {
    root_signature: RootSignatureHandle,
    pipeline: PipelineHandle,
    radius: u32,
}

impl BlurPass {
    /// Build the pass's pipeline data with the given kernel radius.
    pub fn new(
        device: &Arc<dyn Device>,
        compute_shader: ShaderBlob,
        radius: u32,
    ) -> Result<Self, DeviceError> {
        let root_signature = Self::build_root_signature(device)?;
        let pipeline = Self::build_pipeline(device, root_signature, compute_shader)?;
        Ok(Self {
            root_signature,
            pipeline,
            radius,
        })
    }

    fn build_root_signature(device: &Arc<dyn Device>) -> Result<RootSignatureHandle, DeviceError> {
        device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::Constants {
                    register: 0,
                    count: (std::mem::size_of::<BlurParams>() / 4) as u32,
                },
                RootParameter::ShaderResourceTable {
                    register: 0,
                    count: 1,
                },
                RootParameter::UnorderedAccessTable {
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
        compute_shader: ShaderBlob,
    ) -> Result<PipelineHandle, DeviceError> {
        device.create_compute_pipeline(&ComputePipelineDesc {
            root_signature,
            compute_shader,
        })
    }

    /// Record `iterations` horizontal+vertical blur round trips over
    /// `color`, using `scratch` as the ping-pong partner. Leaves `color`
    /// shader-readable.
    pub fn record(
        &self,
        cmd: &mut CommandList,
        color: &BlurSurface,
        scratch: &BlurSurface,
        iterations: u32,
    ) {
        debug_assert_eq!(color.texture.width(), scratch.texture.width());
        debug_assert_eq!(color.texture.height(), scratch.texture.height());

        let width = color.texture.width();
        let height = color.texture.height();
        let texel_size = [1.0 / width as f32, 1.0 / height as f32];

        cmd.set_compute_root_signature(self.root_signature);
        cmd.set_pipeline_state(self.pipeline);

        for _ in 0..iterations {
            self.leg(cmd, color, scratch, texel_size, true, width, height);
            self.leg(cmd, scratch, color, texel_size, false, width, height);
        }

        cmd.transition_barrier(&color.texture, ResourceState::PixelShaderResource);
    }

    #[allow(clippy::too_many_arguments)]
    fn leg(
        &self,
        cmd: &mut CommandList,
        source: &BlurSurface,
        dest: &BlurSurface,
        texel_size: [f32; 2],
        horizontal: bool,
        width: u32,
        height: u32,
    ) {
        cmd.transition_barrier(&source.texture, ResourceState::NonPixelShaderResource);
        cmd.transition_barrier(&dest.texture, ResourceState::UnorderedAccess);
        cmd.set_compute_32bit_constants(
            RP_PARAMS,
            &BlurParams {
                texel_size,
                horizontal: u32::from(horizontal),
                radius: self.radius,
            },
        );
        cmd.set_descriptor_table(RP_SOURCE, source.srv.handle(0));
        cmd.set_descriptor_table(RP_DEST, dest.uav.handle(0));
        cmd.dispatch(
            dispatch_groups(width, GROUP_SIZE),
            dispatch_groups(height, GROUP_SIZE),
            1,
        );
    }
}

impl PassPipelines for BlurPass {
    fn kind(&self) -> PassKind {
        PassKind::Blur
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
    use crate::gpu::device::{DescriptorHeapKind, Format, QueueKind, ResourceDesc};
    use crate::gpu::null::NullDevice;
    use crate::gpu::state_tracker::GlobalStateTable;
    use std::sync::{Arc, Mutex};

    fn surface(
        device: &Arc<dyn Device>,
        globals: &Arc<Mutex<GlobalStateTable>>,
        srv_heap: &DescriptorAllocator,
    ) -> BlurSurface {
        let texture = Texture::new(
            device,
            globals,
            ResourceDesc {
                allow_unordered_access: true,
                ..ResourceDesc::texture_2d(Format::Rgba16Float, 64, 64)
            },
            ResourceState::Common,
            None,
        )
        .unwrap();
        BlurSurface {
            texture,
            srv: srv_heap.allocate(1).unwrap(),
            uav: srv_heap.allocate(1).unwrap(),
        }
    }

    #[test]
    fn two_iterations_dispatch_four_legs() {
        let device: Arc<dyn Device> = NullDevice::new();
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));
        let heap = DescriptorAllocator::new(device.clone(), DescriptorHeapKind::Resource, 64, 2);

        let color = surface(&device, &globals, &heap);
        let scratch = surface(&device, &globals, &heap);
        let pass = BlurPass::new(&device, ShaderBlob::new(vec![1_u8; 8]), 4).unwrap();

        let mut cmd =
            CommandList::new(device.clone(), globals.clone(), QueueKind::Direct, 4096).unwrap();
        pass.record(&mut cmd, &color, &scratch, 2);

        assert_eq!(cmd.null_recorder().dispatch_count(), 4);
    }
}
