//! The device boundary: object-safe traits and plain data types describing
//! the explicit graphics API this engine records against.
//!
//! The concrete device (D3D12-class, Vulkan-class, or the in-crate headless
//! backend in [`crate::gpu::null`]) is an external collaborator. The core
//! only requires what these traits expose: descriptor-increment queries,
//! resource/heap/fence/command-object creation, format-support queries, and
//! a submission surface.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use crate::gpu::barrier::{BarrierRecord, ResourceState};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque identity of a committed GPU allocation, minted by the device.
///
/// Doubles as the resource's key in the global state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

/// Opaque identity of a compiled pipeline-state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

/// Opaque identity of a root signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureHandle(pub u64);

/// Opaque identity of a descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub u64);

/// A CPU-side descriptor-heap slot address.
///
/// Plain pointer arithmetic: slot `i` of an allocation lives at
/// `base.ptr + i * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptor {
    /// Raw heap-start-relative address of the slot.
    pub ptr: usize,
}

impl CpuDescriptor {
    /// The null descriptor, used by empty allocations.
    pub const NULL: Self = Self { ptr: 0 };

    /// Address of the descriptor `slots` entries past `self`.
    #[must_use]
    pub fn offset(self, slots: u32, stride: u32) -> Self {
        Self {
            ptr: self.ptr + slots as usize * stride as usize,
        }
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Descriptor-heap categories the allocator is parameterized over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant-buffer, shader-resource (1D/2D/Cube), and unordered-access
    /// (2D/2D-array) views.
    Resource,
    /// Sampler descriptors.
    Sampler,
    /// Render-target views.
    RenderTarget,
    /// Depth-stencil views.
    DepthStencil,
}

impl DescriptorHeapKind {
    /// All heap kinds, in allocator-array order.
    pub const ALL: [Self; 4] = [
        Self::Resource,
        Self::Sampler,
        Self::RenderTarget,
        Self::DepthStencil,
    ];

    /// Stable index into per-kind allocator arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Resource => 0,
            Self::Sampler => 1,
            Self::RenderTarget => 2,
            Self::DepthStencil => 3,
        }
    }
}

/// GPU execution channel categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics + compute + copy.
    Direct,
    /// Compute + copy.
    Compute,
    /// Copy only.
    Copy,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Compute => write!(f, "compute"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

/// Texel and buffer-element formats used by the engine's passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Structureless data (buffers).
    #[default]
    Unknown,
    /// 8-bit RGBA, unsigned normalized.
    Rgba8Unorm,
    /// 16-bit float RGBA (HDR color targets).
    Rgba16Float,
    /// 32-bit float RGBA.
    Rgba32Float,
    /// Two-channel 16-bit float.
    Rg16Float,
    /// Single-channel 32-bit float.
    R32Float,
    /// 16-bit unsigned index.
    R16Uint,
    /// 32-bit unsigned index.
    R32Uint,
    /// 32-bit float depth.
    D32Float,
    /// 24-bit depth + 8-bit stencil.
    D24UnormS8Uint,
}

impl Format {
    /// Whether this is a depth or depth-stencil format.
    #[must_use]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

/// Capability bits reported by the device for a given format.
///
/// Re-queried whenever a resource wrapper swaps its backing handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatSupport {
    /// Usable as a render-target view.
    pub render_target: bool,
    /// Usable as a depth-stencil view.
    pub depth_stencil: bool,
    /// Usable as an unordered-access view.
    pub unordered_access: bool,
    /// Sampleable from shaders.
    pub shader_sample: bool,
}

// ---------------------------------------------------------------------------
// Resource descriptions
// ---------------------------------------------------------------------------

/// Dimensionality of a GPU resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    /// Linear memory.
    Buffer,
    /// 2D texture (array layers cover cubemaps).
    Texture2d,
    /// 3D texture.
    Texture3d,
}

/// Description of a committed GPU allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Buffer or texture dimensionality.
    pub dimension: ResourceDimension,
    /// Texel format (`Unknown` for buffers).
    pub format: Format,
    /// Width in texels, or byte size for buffers.
    pub width: u64,
    /// Height in texels (1 for buffers).
    pub height: u32,
    /// Depth or array-layer count (6 for cubemaps).
    pub depth_or_layers: u16,
    /// Mip-level count.
    pub mip_levels: u16,
    /// Usable as a render target.
    pub allow_render_target: bool,
    /// Usable as a depth-stencil target.
    pub allow_depth_stencil: bool,
    /// Usable as an unordered-access view.
    pub allow_unordered_access: bool,
}

impl ResourceDesc {
    /// Description of a plain buffer of `size` bytes.
    #[must_use]
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            format: Format::Unknown,
            width: size,
            height: 1,
            depth_or_layers: 1,
            mip_levels: 1,
            allow_render_target: false,
            allow_depth_stencil: false,
            allow_unordered_access: false,
        }
    }

    /// Description of a single-mip 2D texture.
    #[must_use]
    pub fn texture_2d(format: Format, width: u32, height: u32) -> Self {
        Self {
            dimension: ResourceDimension::Texture2d,
            format,
            width: u64::from(width),
            height,
            depth_or_layers: 1,
            mip_levels: 1,
            allow_render_target: false,
            allow_depth_stencil: false,
            allow_unordered_access: false,
        }
    }

    /// Description of a six-layer cubemap with the given mip chain.
    #[must_use]
    pub fn cubemap(format: Format, size: u32, mip_levels: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture2d,
            format,
            width: u64::from(size),
            height: size,
            depth_or_layers: 6,
            mip_levels,
            allow_render_target: false,
            allow_depth_stencil: false,
            allow_unordered_access: false,
        }
    }

    /// Total subresource count (mips x layers); 1 for buffers.
    #[must_use]
    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer => 1,
            _ => u32::from(self.mip_levels) * u32::from(self.depth_or_layers),
        }
    }
}

/// Optimized clear value baked into a render-target or depth allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Color clear for render targets.
    Color {
        /// Target format the clear value applies to.
        format: Format,
        /// RGBA clear color.
        value: [f32; 4],
    },
    /// Depth-stencil clear.
    DepthStencil {
        /// Target format the clear value applies to.
        format: Format,
        /// Depth clear value.
        depth: f32,
        /// Stencil clear value.
        stencil: u8,
    },
}

/// Handle + GPU virtual address returned by committed-resource creation.
#[derive(Debug, Clone, Copy)]
pub struct ResourceInfo {
    /// Opaque identity of the allocation.
    pub handle: ResourceHandle,
    /// GPU virtual address (0 for textures).
    pub gpu_address: u64,
}

/// A persistent CPU mapping into upload-heap memory.
///
/// The pointer stays valid until the owning resource is destroyed through
/// [`Device::destroy_resource`]; the device guarantees stability across
/// command-list submissions.
#[derive(Debug, Clone, Copy)]
pub struct MappedPtr(pub NonNull<u8>);

// Safety: the device guarantees the mapping is valid and unaliased for the
// lifetime of the owning page; pages are written from one recording thread.
unsafe impl Send for MappedPtr {}

/// An upload-heap page as handed out by the device: the backing resource,
/// its GPU base address, and its persistent CPU mapping.
#[derive(Debug)]
pub struct UploadPageInfo {
    /// Backing resource handle (copy source for buffer uploads).
    pub resource: ResourceHandle,
    /// GPU virtual address of byte 0.
    pub gpu_base: u64,
    /// CPU write pointer to byte 0.
    pub cpu_base: MappedPtr,
    /// Page size in bytes.
    pub size: usize,
}

/// A descriptor heap as handed out by the device.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapInfo {
    /// Opaque heap identity.
    pub handle: HeapHandle,
    /// CPU address of slot 0.
    pub base: CpuDescriptor,
    /// Slot capacity.
    pub capacity: u32,
}

// ---------------------------------------------------------------------------
// Pipeline descriptions (content is domain data; the core treats it opaquely)
// ---------------------------------------------------------------------------

/// Compiled shader byte-code. The engine never inspects the contents.
#[derive(Clone)]
pub struct ShaderBlob {
    bytes: Arc<[u8]>,
}

impl ShaderBlob {
    /// Wrap compiled byte-code.
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The raw byte-code.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the blob holds no byte-code.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ShaderBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderBlob")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One binding slot in a root signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootParameter {
    /// An inline constant-buffer view bound by GPU virtual address.
    ConstantBuffer {
        /// Shader register.
        register: u32,
    },
    /// Inline 32-bit constants.
    Constants {
        /// Shader register.
        register: u32,
        /// Number of 32-bit values.
        count: u32,
    },
    /// A shader-resource-view descriptor table.
    ShaderResourceTable {
        /// First shader register of the range.
        register: u32,
        /// Descriptor count in the range.
        count: u32,
    },
    /// An unordered-access-view descriptor table.
    UnorderedAccessTable {
        /// First shader register of the range.
        register: u32,
        /// Descriptor count in the range.
        count: u32,
    },
}

/// Root signature layout: the ordered set of binding slots.
#[derive(Debug, Clone, Default)]
pub struct RootSignatureDesc {
    /// Binding slots, in root-parameter-index order.
    pub parameters: Vec<RootParameter>,
    /// Whether a static linear-clamp sampler is baked in.
    pub static_linear_sampler: bool,
}

/// Graphics pipeline-state description.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    /// Root signature the pipeline binds against.
    pub root_signature: RootSignatureHandle,
    /// Compiled vertex shader.
    pub vertex_shader: ShaderBlob,
    /// Compiled pixel shader (depth-only passes omit it).
    pub pixel_shader: Option<ShaderBlob>,
    /// Formats of the bound render targets, in attachment order.
    pub render_target_formats: Vec<Format>,
    /// Format of the depth-stencil target, if any.
    pub depth_format: Option<Format>,
    /// Whether depth writes are enabled.
    pub depth_write: bool,
}

/// Compute pipeline-state description.
#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    /// Root signature the pipeline binds against.
    pub root_signature: RootSignatureHandle,
    /// Compiled compute shader.
    pub compute_shader: ShaderBlob,
}

// ---------------------------------------------------------------------------
// Geometry state
// ---------------------------------------------------------------------------

/// A viewport rectangle in render-target coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width in pixels.
    pub width: f32,
    /// Height in pixels.
    pub height: f32,
    /// Near depth bound.
    pub min_depth: f32,
    /// Far depth bound.
    pub max_depth: f32,
}

impl Viewport {
    /// Full-target viewport with the default depth range.
    #[must_use]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// A scissor rectangle in render-target coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Right edge (exclusive).
    pub right: i32,
    /// Bottom edge (exclusive).
    pub bottom: i32,
}

impl ScissorRect {
    /// Full-target scissor.
    #[must_use]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal device-layer failures. None of these are retried; they indicate
/// device corruption or exhaustion the engine cannot locally repair.
#[derive(Debug)]
pub enum DeviceError {
    /// Committed allocation failed.
    OutOfMemory,
    /// Device-object creation (heap, fence, recorder, pipeline) failed.
    Creation(String),
    /// Command-list submission was rejected.
    Submit(String),
    /// The device stopped responding; includes fence-timeout escalation.
    DeviceLost(String),
    /// A handle did not identify a live device object.
    InvalidHandle,
    /// A command object was used outside its legal state machine.
    InvalidState(&'static str),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "committed allocation failed"),
            Self::Creation(msg) => {
                write!(f, "device object creation failed: {msg}")
            }
            Self::Submit(msg) => write!(f, "submission rejected: {msg}"),
            Self::DeviceLost(msg) => write!(f, "device lost: {msg}"),
            Self::InvalidHandle => write!(f, "stale or foreign handle"),
            Self::InvalidState(msg) => {
                write!(f, "command object in invalid state: {msg}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A GPU/CPU synchronization counter on one queue's execution timeline.
///
/// A value is *reached* once the GPU has completed all work submitted up to
/// the corresponding [`SubmitQueue::signal`].
pub trait Fence: Send + Sync {
    /// Highest value the GPU timeline has retired.
    fn completed_value(&self) -> u64;

    /// Block until `value` is reached, or fail with
    /// [`DeviceError::DeviceLost`] once `timeout` elapses.
    fn wait(&self, value: u64, timeout: Duration) -> Result<(), DeviceError>;
}

/// An ordered GPU execution channel.
pub trait SubmitQueue: Send + Sync {
    /// Execute closed command recorders as one batch, in slice order.
    fn execute(
        &self,
        lists: &mut [&mut dyn CommandRecorder],
    ) -> Result<(), DeviceError>;

    /// Enqueue a timeline signal: the queue's fence reaches `value` once all
    /// previously executed work retires.
    fn signal(&self, value: u64) -> Result<(), DeviceError>;

    /// The fence tied to this queue's timeline.
    fn fence(&self) -> Arc<dyn Fence>;
}

/// A raw recorded batch of GPU operations (the device-side command list).
///
/// State machine: open (recording) → closed (executable) → reset → open.
/// Every mutator other than [`CommandRecorder::reset`] requires the open
/// state; violations surface as [`DeviceError::InvalidState`] at submission.
pub trait CommandRecorder: Send {
    /// Which queue kind this recorder can be submitted to.
    fn kind(&self) -> QueueKind;

    /// Downcast hook for backend-specific access.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Whether the recorder is closed and executable.
    fn is_closed(&self) -> bool;

    /// Close recording; the batch becomes executable.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Recycle the recorder for a new batch. Only legal once the GPU has
    /// retired the previous batch; the caller proves that via fences.
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// Record resource transition barriers.
    fn resource_barriers(&mut self, barriers: &[BarrierRecord]);

    /// Clear a render-target view.
    fn clear_render_target(&mut self, view: CpuDescriptor, color: [f32; 4]);

    /// Clear a depth-stencil view.
    fn clear_depth_stencil(&mut self, view: CpuDescriptor, depth: f32, stencil: u8);

    /// Bind color render-target views and an optional depth-stencil view.
    fn set_render_targets(
        &mut self,
        colors: &[CpuDescriptor],
        depth: Option<CpuDescriptor>,
    );

    /// Set the rasterizer viewport.
    fn set_viewport(&mut self, viewport: &Viewport);

    /// Set the scissor rectangle.
    fn set_scissor(&mut self, rect: &ScissorRect);

    /// Bind a pipeline-state object.
    fn set_pipeline(&mut self, pipeline: PipelineHandle);

    /// Bind the graphics root signature.
    fn set_graphics_root_signature(&mut self, signature: RootSignatureHandle);

    /// Bind the compute root signature.
    fn set_compute_root_signature(&mut self, signature: RootSignatureHandle);

    /// Bind an inline constant-buffer view by GPU virtual address.
    fn set_graphics_root_constant_buffer(&mut self, index: u32, gpu_address: u64);

    /// Set inline graphics 32-bit root constants.
    fn set_graphics_constants(&mut self, index: u32, constants: &[u32]);

    /// Set inline compute 32-bit root constants.
    fn set_compute_constants(&mut self, index: u32, constants: &[u32]);

    /// Bind a descriptor table by its base descriptor.
    fn set_descriptor_table(&mut self, index: u32, base: CpuDescriptor);

    /// Bind a vertex buffer to an input slot.
    fn set_vertex_buffer(&mut self, slot: u32, gpu_address: u64, size: u32, stride: u32);

    /// Bind the index buffer.
    fn set_index_buffer(&mut self, gpu_address: u64, size: u32, format: Format);

    /// Non-indexed draw.
    fn draw(&mut self, vertices: u32, instances: u32, first_vertex: u32, first_instance: u32);

    /// Indexed draw.
    fn draw_indexed(
        &mut self,
        indices: u32,
        instances: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    );

    /// Compute dispatch.
    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32);

    /// Copy a byte range between buffer resources.
    fn copy_buffer_region(
        &mut self,
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        size: u64,
    );
}

/// The device handle: creation surface plus capability queries.
///
/// Implementations must be thread-safe; the engine shares one device across
/// its recording thread and every queue's reclamation thread.
pub trait Device: Send + Sync {
    /// Per-slot stride of descriptors in heaps of `kind`.
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    /// Capability bits for `format`.
    fn format_support(&self, format: Format) -> FormatSupport;

    /// Create a descriptor heap with `capacity` slots.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeapInfo, DeviceError>;

    /// Destroy a descriptor heap.
    fn destroy_descriptor_heap(&self, handle: HeapHandle);

    /// Eagerly allocate committed default-heap memory.
    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear: Option<&ClearValue>,
    ) -> Result<ResourceInfo, DeviceError>;

    /// Allocate a persistently mapped upload-heap page.
    fn create_upload_page(&self, size: usize) -> Result<UploadPageInfo, DeviceError>;

    /// Release a committed allocation or upload page.
    fn destroy_resource(&self, handle: ResourceHandle);

    /// Write a shader-resource view for `resource` into a descriptor slot.
    fn create_shader_resource_view(&self, resource: ResourceHandle, slot: CpuDescriptor);

    /// Write an unordered-access view for one mip of `resource` into a
    /// descriptor slot (2D-array views cover every layer).
    fn create_unordered_access_view(&self, resource: ResourceHandle, mip: u32, slot: CpuDescriptor);

    /// Write a render-target view for `resource` into a descriptor slot.
    fn create_render_target_view(&self, resource: ResourceHandle, slot: CpuDescriptor);

    /// Write a depth-stencil view for `resource` into a descriptor slot.
    fn create_depth_stencil_view(&self, resource: ResourceHandle, slot: CpuDescriptor);

    /// Attach a debug name to a resource.
    fn set_debug_name(&self, handle: ResourceHandle, name: &str);

    /// Create a fence starting at `initial`.
    fn create_fence(&self, initial: u64) -> Result<Arc<dyn Fence>, DeviceError>;

    /// Create an execution queue of the given kind.
    fn create_queue(&self, kind: QueueKind) -> Result<Arc<dyn SubmitQueue>, DeviceError>;

    /// Create a command recorder compatible with queues of `kind`.
    fn create_recorder(&self, kind: QueueKind) -> Result<Box<dyn CommandRecorder>, DeviceError>;

    /// Compile a root signature.
    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureHandle, DeviceError>;

    /// Compile a graphics pipeline-state object.
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<PipelineHandle, DeviceError>;

    /// Compile a compute pipeline-state object.
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<PipelineHandle, DeviceError>;
}
