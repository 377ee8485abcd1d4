//! The main rendering engine and frame loop.
//!
//! [`RenderEngine`] owns the [`RenderContext`], the render targets, and the
//! closed set of passes, and drives them in order each frame:
//! geometry → lighting → skybox → blur. Equirect-to-cubemap conversion runs
//! on demand when sky content is supplied.

use std::sync::Arc;

use crate::error::EngineError;
use crate::gpu::barrier::ResourceState;
use crate::gpu::descriptor::DescriptorAllocation;
use crate::gpu::device::{
    ClearValue, DescriptorHeapKind, Device, Format, ResourceDesc, ShaderBlob,
};
use crate::gpu::render_context::RenderContext;
use crate::gpu::render_target::{Attachment, AttachmentPoint, RenderTarget};
use crate::gpu::resource::Texture;
use crate::options::EngineOptions;
use crate::renderer::blur::{BlurPass, BlurSurface};
use crate::renderer::equirect::EquirectToCubemapPass;
use crate::renderer::geometry::GeometryPass;
use crate::renderer::lighting::{LightConstants, LightingPass};
use crate::renderer::skybox::{SkyboxConstants, SkyboxPass};
use crate::renderer::{
    CameraConstants, DrawItem, Mesh, PassKind, PassPipelines,
};

const GBUFFER_ALBEDO_FORMAT: Format = Format::Rgba8Unorm;
const GBUFFER_NORMAL_FORMAT: Format = Format::Rgba16Float;
const DEPTH_FORMAT: Format = Format::D32Float;
const HDR_FORMAT: Format = Format::Rgba16Float;

const BLUR_RADIUS: u32 = 4;

/// Compiled shader byte-code for every pass, supplied by the hosting
/// application (the engine does not compile shaders).
#[derive(Debug, Clone)]
pub struct EngineShaders {
    /// Geometry pass vertex shader.
    pub geometry_vs: ShaderBlob,
    /// Geometry pass pixel shader.
    pub geometry_ps: ShaderBlob,
    /// Lighting resolve vertex shader.
    pub lighting_vs: ShaderBlob,
    /// Lighting resolve pixel shader.
    pub lighting_ps: ShaderBlob,
    /// Skybox vertex shader.
    pub skybox_vs: ShaderBlob,
    /// Skybox pixel shader.
    pub skybox_ps: ShaderBlob,
    /// Separable blur compute shader.
    pub blur_cs: ShaderBlob,
    /// Equirect-to-cubemap compute shader.
    pub equirect_cs: ShaderBlob,
}

impl EngineShaders {
    fn validate(&self) -> Result<(), EngineError> {
        let stages: [(&ShaderBlob, &'static str); 8] = [
            (&self.geometry_vs, "geometry vertex"),
            (&self.geometry_ps, "geometry pixel"),
            (&self.lighting_vs, "lighting vertex"),
            (&self.lighting_ps, "lighting pixel"),
            (&self.skybox_vs, "skybox vertex"),
            (&self.skybox_ps, "skybox pixel"),
            (&self.blur_cs, "blur compute"),
            (&self.equirect_cs, "equirect compute"),
        ];
        for (blob, stage) in stages {
            if blob.is_empty() {
                return Err(EngineError::MissingShader(stage));
            }
        }
        Ok(())
    }
}

/// Everything one frame needs from the hosting application.
#[derive(Debug)]
pub struct FrameInputs<'a> {
    /// Camera constants for the raster passes.
    pub camera: CameraConstants,
    /// Lighting environment.
    pub lights: LightConstants,
    /// Opaque draw list.
    pub items: &'a [DrawItem<'a>],
    /// Skybox camera constants; `None` skips the sky (or when no sky
    /// content is loaded).
    pub sky: Option<SkyboxConstants>,
    /// Blur round trips over the lit target (0 disables).
    pub blur_iterations: u32,
}

struct Sky {
    cube: Mesh,
    cubemap: Texture,
    srv: DescriptorAllocation,
}

struct Targets {
    gbuffer: RenderTarget,
    lit: RenderTarget,
    /// SRV table over albedo/normal/depth, bound by the lighting pass.
    gbuffer_srvs: DescriptorAllocation,
    blur_color: BlurSurface,
    blur_scratch: BlurSurface,
}

/// The engine: context + passes + targets + frame loop.
pub struct RenderEngine {
    context: RenderContext,
    geometry: GeometryPass,
    lighting: LightingPass,
    skybox: SkyboxPass,
    blur: BlurPass,
    equirect: EquirectToCubemapPass,
    targets: Targets,
    sky: Option<Sky>,
    width: u32,
    height: u32,
}

impl RenderEngine {
    /// Stand up the engine at the given render resolution.
    pub fn new(
        device: Arc<dyn Device>,
        options: EngineOptions,
        shaders: &EngineShaders,
        width: u32,
        height: u32,
    ) -> Result<Self, EngineError> {
        shaders.validate()?;
        let context = RenderContext::new(device.clone(), options)?;

        let geometry = GeometryPass::new(
            &device,
            shaders.geometry_vs.clone(),
            shaders.geometry_ps.clone(),
            vec![GBUFFER_ALBEDO_FORMAT, GBUFFER_NORMAL_FORMAT],
            DEPTH_FORMAT,
        )?;
        let lighting = LightingPass::new(
            &device,
            shaders.lighting_vs.clone(),
            shaders.lighting_ps.clone(),
            HDR_FORMAT,
            DEPTH_FORMAT,
            3,
        )?;
        let skybox = SkyboxPass::new(
            &device,
            shaders.skybox_vs.clone(),
            shaders.skybox_ps.clone(),
            HDR_FORMAT,
            DEPTH_FORMAT,
        )?;
        let blur = BlurPass::new(&device, shaders.blur_cs.clone(), BLUR_RADIUS)?;
        let equirect = EquirectToCubemapPass::new(&device, shaders.equirect_cs.clone())?;

        let targets = Self::create_targets(&context, width, height)?;

        let engine = Self {
            context,
            geometry,
            lighting,
            skybox,
            blur,
            equirect,
            targets,
            sky: None,
            width,
            height,
        };
        engine.log_pipelines();
        Ok(engine)
    }

    fn log_pipelines(&self) {
        let passes: [&dyn PassPipelines; 5] = [
            &self.geometry,
            &self.lighting,
            &self.skybox,
            &self.blur,
            &self.equirect,
        ];
        for pass in passes {
            log::debug!(
                "pass {:?}: root signature {:?}, pipeline {:?}",
                pass.kind(),
                pass.root_signature(),
                pass.pipeline()
            );
        }
    }

    /// Pass kinds in frame order (the sky and blur stages are optional per
    /// frame).
    #[must_use]
    pub fn pass_order(&self) -> [PassKind; 4] {
        [
            PassKind::Geometry,
            PassKind::Lighting,
            PassKind::Skybox,
            PassKind::Blur,
        ]
    }

    /// The GPU substrate.
    #[must_use]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// Current render width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Current render height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The lit, post-processed HDR color texture of the last frame.
    #[must_use]
    pub fn output(&self) -> &Texture {
        &self.targets.blur_color.texture
    }

    /// Upload a mesh through the direct queue and wait for the copy to
    /// retire.
    pub fn create_mesh<V: bytemuck::Pod>(
        &self,
        vertices: &[V],
        indices: &[u32],
    ) -> Result<Mesh, EngineError> {
        let queue = self.context.direct_queue();
        let mut cmd = queue.command_list()?;
        let mesh = Mesh::from_data(&mut cmd, vertices, indices)?;
        let fence = queue.execute_command_lists(vec![cmd])?;
        queue.wait_for_fence_value(fence)?;
        Ok(mesh)
    }

    /// Convert an equirectangular panorama into a fresh cubemap and adopt
    /// it (with `cube` as the sky geometry) for subsequent frames.
    ///
    /// Runs synchronously on the direct queue: an upload-and-wait helper.
    pub fn set_sky(
        &mut self,
        cube: Mesh,
        panorama: &Texture,
        cubemap_size: u32,
        mip_levels: u16,
    ) -> Result<(), EngineError> {
        let device = self.context.device().clone();
        let cubemap = self.context.create_texture(
            ResourceDesc {
                allow_unordered_access: true,
                ..ResourceDesc::cubemap(HDR_FORMAT, cubemap_size, mip_levels)
            },
            ResourceState::Common,
            None,
            "sky cubemap",
        )?;

        let panorama_srv = self
            .context
            .allocate_descriptors(DescriptorHeapKind::Resource, 1)?;
        device.create_shader_resource_view(panorama.handle(), panorama_srv.handle(0));

        let face_uavs = self
            .context
            .allocate_descriptors(DescriptorHeapKind::Resource, u32::from(mip_levels))?;
        for mip in 0..u32::from(mip_levels) {
            device.create_unordered_access_view(cubemap.handle(), mip, face_uavs.handle(mip));
        }

        let cubemap_srv = self
            .context
            .allocate_descriptors(DescriptorHeapKind::Resource, 1)?;
        device.create_shader_resource_view(cubemap.handle(), cubemap_srv.handle(0));

        let queue = self.context.direct_queue();
        let mut cmd = queue.command_list()?;
        self.equirect
            .record(&mut cmd, panorama, panorama_srv.handle(0), &cubemap, &face_uavs);
        let fence = queue.execute_command_lists(vec![cmd])?;
        queue.wait_for_fence_value(fence)?;

        self.context.free_descriptors(&panorama_srv);
        self.context.free_descriptors(&face_uavs);
        if let Some(previous) = self.sky.take() {
            self.context.free_descriptors(&previous.srv);
        }
        self.sky = Some(Sky {
            cube,
            cubemap,
            srv: cubemap_srv,
        });
        Ok(())
    }

    /// Record and submit one frame, then close it out (frame counter +
    /// stale-descriptor release). Returns the frame's fence value.
    pub fn render(&mut self, frame: &FrameInputs<'_>) -> Result<u64, EngineError> {
        let queue = self.context.direct_queue();
        let mut cmd = queue.command_list()?;

        self.geometry
            .record(&mut cmd, &self.targets.gbuffer, &frame.camera, frame.items)?;
        self.lighting.record(
            &mut cmd,
            &self.targets.gbuffer,
            &self.targets.lit,
            self.targets.gbuffer_srvs.handle(0),
            &frame.lights,
        )?;

        if let (Some(sky), Some(constants)) = (self.sky.as_ref(), frame.sky.as_ref()) {
            cmd.transition_barrier(&sky.cubemap, ResourceState::PixelShaderResource);
            self.skybox
                .record(&mut cmd, &self.targets.lit, &sky.cube, sky.srv.handle(0), constants)?;
        }

        if frame.blur_iterations > 0 {
            self.blur.record(
                &mut cmd,
                &self.targets.blur_color,
                &self.targets.blur_scratch,
                frame.blur_iterations,
            );
        }

        let fence = queue.execute_command_lists(vec![cmd])?;
        let finished = self.context.end_frame();
        log::trace!("frame {finished} submitted with fence {fence}");
        Ok(fence)
    }

    /// Recreate every resolution-dependent resource.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        if width == 0 || height == 0 || (width, height) == (self.width, self.height) {
            return Ok(());
        }
        // Every in-flight list may reference the old targets.
        self.context.flush_all()?;
        self.release_targets();
        self.targets = Self::create_targets(&self.context, width, height)?;
        self.width = width;
        self.height = height;
        log::info!("render targets resized to {width}x{height}");
        Ok(())
    }

    fn create_targets(
        context: &RenderContext,
        width: u32,
        height: u32,
    ) -> Result<Targets, EngineError> {
        let device = context.device().clone();

        let albedo = context.create_texture(
            ResourceDesc {
                allow_render_target: true,
                ..ResourceDesc::texture_2d(GBUFFER_ALBEDO_FORMAT, width, height)
            },
            ResourceState::Common,
            Some(ClearValue::Color {
                format: GBUFFER_ALBEDO_FORMAT,
                value: [0.0, 0.0, 0.0, 1.0],
            }),
            "gbuffer albedo",
        )?;
        let normal = context.create_texture(
            ResourceDesc {
                allow_render_target: true,
                ..ResourceDesc::texture_2d(GBUFFER_NORMAL_FORMAT, width, height)
            },
            ResourceState::Common,
            Some(ClearValue::Color {
                format: GBUFFER_NORMAL_FORMAT,
                value: [0.0, 0.0, 0.0, 0.0],
            }),
            "gbuffer normal",
        )?;
        let depth = context.create_texture(
            ResourceDesc {
                allow_depth_stencil: true,
                ..ResourceDesc::texture_2d(DEPTH_FORMAT, width, height)
            },
            ResourceState::Common,
            Some(ClearValue::DepthStencil {
                format: DEPTH_FORMAT,
                depth: 1.0,
                stencil: 0,
            }),
            "scene depth",
        )?;
        let lit_color = context.create_texture(
            ResourceDesc {
                allow_render_target: true,
                allow_unordered_access: true,
                ..ResourceDesc::texture_2d(HDR_FORMAT, width, height)
            },
            ResourceState::Common,
            Some(ClearValue::Color {
                format: HDR_FORMAT,
                value: [0.0, 0.0, 0.0, 1.0],
            }),
            "lit color",
        )?;
        let scratch_color = context.create_texture(
            ResourceDesc {
                allow_unordered_access: true,
                ..ResourceDesc::texture_2d(HDR_FORMAT, width, height)
            },
            ResourceState::Common,
            None,
            "blur scratch",
        )?;

        let view =
            |kind: DescriptorHeapKind| context.allocate_descriptors(kind, 1);

        let mut gbuffer = RenderTarget::new();
        let albedo_rtv = view(DescriptorHeapKind::RenderTarget)?;
        device.create_render_target_view(albedo.handle(), albedo_rtv.handle(0));
        let _ = gbuffer.attach(
            AttachmentPoint::Color(0),
            Attachment {
                texture: albedo.clone(),
                view: albedo_rtv,
            },
        );
        let normal_rtv = view(DescriptorHeapKind::RenderTarget)?;
        device.create_render_target_view(normal.handle(), normal_rtv.handle(0));
        let _ = gbuffer.attach(
            AttachmentPoint::Color(1),
            Attachment {
                texture: normal.clone(),
                view: normal_rtv,
            },
        );
        let dsv = view(DescriptorHeapKind::DepthStencil)?;
        device.create_depth_stencil_view(depth.handle(), dsv.handle(0));
        let _ = gbuffer.attach(
            AttachmentPoint::DepthStencil,
            Attachment {
                texture: depth.clone(),
                view: dsv,
            },
        );

        let mut lit = RenderTarget::new();
        let lit_rtv = view(DescriptorHeapKind::RenderTarget)?;
        device.create_render_target_view(lit_color.handle(), lit_rtv.handle(0));
        let _ = lit.attach(
            AttachmentPoint::Color(0),
            Attachment {
                texture: lit_color.clone(),
                view: lit_rtv,
            },
        );
        // The sky tests against the geometry depth without writing it.
        let lit_dsv = view(DescriptorHeapKind::DepthStencil)?;
        device.create_depth_stencil_view(depth.handle(), lit_dsv.handle(0));
        let _ = lit.attach(
            AttachmentPoint::DepthStencil,
            Attachment {
                texture: depth.clone(),
                view: lit_dsv,
            },
        );

        // Lighting reads albedo, normal, and depth through one table.
        let gbuffer_srvs = context.allocate_descriptors(DescriptorHeapKind::Resource, 3)?;
        device.create_shader_resource_view(albedo.handle(), gbuffer_srvs.handle(0));
        device.create_shader_resource_view(normal.handle(), gbuffer_srvs.handle(1));
        device.create_shader_resource_view(depth.handle(), gbuffer_srvs.handle(2));

        let blur_view = |texture: &Texture, mip_uav: bool| -> Result<DescriptorAllocation, EngineError> {
            let allocation = context.allocate_descriptors(DescriptorHeapKind::Resource, 1)?;
            if mip_uav {
                device.create_unordered_access_view(texture.handle(), 0, allocation.handle(0));
            } else {
                device.create_shader_resource_view(texture.handle(), allocation.handle(0));
            }
            Ok(allocation)
        };
        let blur_color = BlurSurface {
            srv: blur_view(&lit_color, false)?,
            uav: blur_view(&lit_color, true)?,
            texture: lit_color,
        };
        let blur_scratch = BlurSurface {
            srv: blur_view(&scratch_color, false)?,
            uav: blur_view(&scratch_color, true)?,
            texture: scratch_color,
        };

        Ok(Targets {
            gbuffer,
            lit,
            gbuffer_srvs,
            blur_color,
            blur_scratch,
        })
    }

    fn release_targets(&mut self) {
        for attachment in self
            .targets
            .gbuffer
            .drain()
            .into_iter()
            .chain(self.targets.lit.drain())
        {
            self.context.free_descriptors(&attachment.view);
        }
        self.context.free_descriptors(&self.targets.gbuffer_srvs);
        self.context.free_descriptors(&self.targets.blur_color.srv);
        self.context.free_descriptors(&self.targets.blur_color.uav);
        self.context.free_descriptors(&self.targets.blur_scratch.srv);
        self.context.free_descriptors(&self.targets.blur_scratch.uav);
    }

    /// Flush every queue and release transient views. Call before dropping
    /// the device at shutdown.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.context.flush_all()?;
        if let Some(sky) = self.sky.take() {
            self.context.free_descriptors(&sky.srv);
        }
        self.release_targets();
        Ok(())
    }
}

impl std::fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderEngine")
            .field("size", &(self.width, self.height))
            .field("frame", &self.context.frame())
            .field("sky", &self.sky.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;
    use glam::{Mat4, Vec3};

    fn shaders() -> EngineShaders {
        let blob = |tag: u8| ShaderBlob::new(vec![tag; 32]);
        EngineShaders {
            geometry_vs: blob(1),
            geometry_ps: blob(2),
            lighting_vs: blob(3),
            lighting_ps: blob(4),
            skybox_vs: blob(5),
            skybox_ps: blob(6),
            blur_cs: blob(7),
            equirect_cs: blob(8),
        }
    }

    fn frame_inputs<'a>(items: &'a [DrawItem<'a>]) -> FrameInputs<'a> {
        FrameInputs {
            camera: CameraConstants::pack(Mat4::IDENTITY, Vec3::new(0.0, 2.0, -5.0)),
            lights: LightConstants::pack(
                Vec3::new(0.3, -1.0, 0.2).normalize(),
                Vec3::ONE,
                3.0,
                Vec3::splat(0.05),
                Vec3::new(0.0, 2.0, -5.0),
            ),
            items,
            sky: Some(SkyboxConstants::pack(Mat4::IDENTITY, Mat4::IDENTITY)),
            blur_iterations: 2,
        }
    }

    #[test]
    fn missing_shader_is_rejected() {
        let mut s = shaders();
        s.blur_cs = ShaderBlob::new(Vec::new());
        let err =
            RenderEngine::new(NullDevice::new(), EngineOptions::default(), &s, 64, 64).unwrap_err();
        assert!(matches!(err, EngineError::MissingShader("blur compute")));
    }

    #[test]
    fn renders_frames_and_recycles_lists() {
        let mut engine = RenderEngine::new(
            NullDevice::new(),
            EngineOptions::default(),
            &shaders(),
            128,
            128,
        )
        .unwrap();

        let mesh = engine
            .create_mesh(&[[0.0_f32; 8]; 4], &[0, 1, 2, 2, 1, 3])
            .unwrap();
        let items = [DrawItem {
            mesh: &mesh,
            world: Mat4::from_translation(Vec3::X),
        }];

        let inputs = frame_inputs(&items);
        let f1 = engine.render(&inputs).unwrap();
        let f2 = engine.render(&inputs).unwrap();
        assert!(f2 > f1);
        assert_eq!(engine.context().frame(), 2);

        engine.context().flush_all().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn sky_conversion_then_sky_frame() {
        let mut engine = RenderEngine::new(
            NullDevice::new(),
            EngineOptions::default(),
            &shaders(),
            64,
            64,
        )
        .unwrap();

        let cube = engine
            .create_mesh(&[[0.0_f32; 3]; 8], &[0; 36])
            .unwrap();
        let panorama = engine
            .context()
            .create_texture(
                ResourceDesc::texture_2d(Format::Rgba32Float, 256, 128),
                ResourceState::Common,
                None,
                "panorama",
            )
            .unwrap();
        engine.set_sky(cube, &panorama, 128, 5).unwrap();

        let inputs = frame_inputs(&[]);
        let _ = engine.render(&inputs).unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn resize_recreates_targets() {
        let mut engine = RenderEngine::new(
            NullDevice::new(),
            EngineOptions::default(),
            &shaders(),
            64,
            64,
        )
        .unwrap();
        engine.resize(256, 256).unwrap();
        assert_eq!((engine.width(), engine.height()), (256, 256));

        let inputs = frame_inputs(&[]);
        let _ = engine.render(&inputs).unwrap();
        engine.shutdown().unwrap();
    }
}
