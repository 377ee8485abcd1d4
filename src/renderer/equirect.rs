//! Equirectangular-to-cubemap conversion.
//!
//! One compute dispatch per mip level writes all six faces of the target
//! cubemap through a 2D-array UAV, sampling the source panorama. The
//! cubemap ends shader-readable for skybox and IBL use.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::gpu::barrier::ResourceState;
use crate::gpu::command_list::CommandList;
use crate::gpu::descriptor::DescriptorAllocation;
use crate::gpu::device::{
    ComputePipelineDesc, CpuDescriptor, Device, DeviceError, PipelineHandle, RootParameter,
    RootSignatureDesc, RootSignatureHandle, ShaderBlob,
};
use crate::gpu::resource::Texture;
use crate::renderer::{dispatch_groups, PassKind, PassPipelines};

const RP_PARAMS: u32 = 0;
const RP_PANORAMA: u32 = 1;
const RP_FACES: u32 = 2;

const GROUP_SIZE: u32 = 16;
const CUBE_FACES: u32 = 6;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ConvertParams {
    cubemap_size: u32,
    mip: u32,
}

/// Equirect-to-cubemap compute pass.
#[derive(Debug)]
pub struct EquirectToCubemapPass {
    root_signature: RootSignatureHandle,
    pipeline: PipelineHandle,
}

impl EquirectToCubemapPass {
    /// Build the pass's pipeline data.
    pub fn new(device: &Arc<dyn Device>, compute_shader: ShaderBlob) -> Result<Self, DeviceError> {
        let root_signature = Self::build_root_signature(device)?;
        let pipeline = Self::build_pipeline(device, root_signature, compute_shader)?;
        Ok(Self {
            root_signature,
            pipeline,
        })
    }

    fn build_root_signature(device: &Arc<dyn Device>) -> Result<RootSignatureHandle, DeviceError> {
        device.create_root_signature(&RootSignatureDesc {
            parameters: vec![
                RootParameter::Constants {
                    register: 0,
                    count: (std::mem::size_of::<ConvertParams>() / 4) as u32,
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

    /// Record the conversion of `panorama` into every mip of `cubemap`.
    ///
    /// `face_uavs` holds one 2D-array UAV slot per mip level, in mip order.
    pub fn record(
        &self,
        cmd: &mut CommandList,
        panorama: &Texture,
        panorama_srv: CpuDescriptor,
        cubemap: &Texture,
        face_uavs: &DescriptorAllocation,
    ) {
        debug_assert_eq!(cubemap.layers(), CUBE_FACES as u16);
        debug_assert_eq!(u32::from(cubemap.mip_levels()), face_uavs.count());

        cmd.transition_barrier(panorama, ResourceState::NonPixelShaderResource);
        cmd.transition_barrier(cubemap, ResourceState::UnorderedAccess);

        cmd.set_compute_root_signature(self.root_signature);
        cmd.set_pipeline_state(self.pipeline);
        cmd.set_descriptor_table(RP_PANORAMA, panorama_srv);

        for mip in 0..u32::from(cubemap.mip_levels()) {
            let size = (cubemap.width() >> mip).max(1);
            cmd.set_compute_32bit_constants(
                RP_PARAMS,
                &ConvertParams {
                    cubemap_size: size,
                    mip,
                },
            );
            cmd.set_descriptor_table(RP_FACES, face_uavs.handle(mip));
            cmd.dispatch(
                dispatch_groups(size, GROUP_SIZE),
                dispatch_groups(size, GROUP_SIZE),
                CUBE_FACES,
            );
        }

        cmd.transition_barrier(cubemap, ResourceState::PixelShaderResource);
    }
}

impl PassPipelines for EquirectToCubemapPass {
    fn kind(&self) -> PassKind {
        PassKind::EquirectToCubemap
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
    use std::sync::Mutex;

    #[test]
    fn one_dispatch_per_mip_level() {
        let device: Arc<dyn Device> = NullDevice::new();
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));
        let heap = DescriptorAllocator::new(device.clone(), DescriptorHeapKind::Resource, 64, 2);

        let panorama = Texture::new(
            &device,
            &globals,
            ResourceDesc::texture_2d(Format::Rgba32Float, 512, 256),
            ResourceState::Common,
            None,
        )
        .unwrap();
        let cubemap = Texture::new(
            &device,
            &globals,
            ResourceDesc {
                allow_unordered_access: true,
                ..ResourceDesc::cubemap(Format::Rgba16Float, 128, 5)
            },
            ResourceState::Common,
            None,
        )
        .unwrap();

        let srv = heap.allocate(1).unwrap();
        let uavs = heap.allocate(u32::from(cubemap.mip_levels())).unwrap();
        let pass =
            EquirectToCubemapPass::new(&device, ShaderBlob::new(vec![2_u8; 8])).unwrap();

        let mut cmd =
            CommandList::new(device.clone(), globals.clone(), QueueKind::Compute, 4096).unwrap();
        pass.record(&mut cmd, &panorama, srv.handle(0), &cubemap, &uavs);

        assert_eq!(cmd.null_recorder().dispatch_count(), 5);
    }
}
