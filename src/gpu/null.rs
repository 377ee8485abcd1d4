//! Headless device backend.
//!
//! Implements the [`crate::gpu::device`] traits without any GPU: fences are
//! software timelines, recorders validate their state machine and keep an
//! inspectable log of recorded barriers, and upload pages are plain host
//! memory. Backs the test suite and headless CI runs.
//!
//! Fences normally retire as soon as the queue signals them. Construct the
//! device with [`NullDevice::new_manual`] to hold completion back until
//! [`NullDevice::retire_all`] is called — this is how the tests observe the
//! in-flight window of the command-queue machinery.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::gpu::barrier::{BarrierRecord, ResourceState};
use crate::gpu::device::{
    ClearValue, CommandRecorder, ComputePipelineDesc, CpuDescriptor, DescriptorHeapInfo,
    DescriptorHeapKind, Device, DeviceError, Fence, Format, FormatSupport, GraphicsPipelineDesc,
    HeapHandle, MappedPtr, PipelineHandle, QueueKind, ResourceDesc, ResourceDimension,
    ResourceHandle, ResourceInfo, RootSignatureDesc, RootSignatureHandle, ScissorRect,
    SubmitQueue, UploadPageInfo, Viewport,
};

/// Software fence: a monotone counter with condvar-based waiting.
#[derive(Debug, Default)]
pub struct NullFence {
    completed: Mutex<u64>,
    retired: Condvar,
}

impl NullFence {
    fn new(initial: u64) -> Self {
        Self {
            completed: Mutex::new(initial),
            retired: Condvar::new(),
        }
    }

    /// Advance the timeline to `value` (monotone; lower values are ignored).
    pub fn complete(&self, value: u64) {
        let mut completed = self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if value > *completed {
            *completed = value;
            self.retired.notify_all();
        }
    }
}

impl Fence for NullFence {
    fn completed_value(&self) -> u64 {
        *self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, value: u64, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut completed = self
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *completed < value {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeviceError::DeviceLost(format!(
                    "fence wait for value {value} timed out at {}",
                    *completed
                )));
            }
            let (guard, _) = self
                .retired
                .wait_timeout(completed, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            completed = guard;
        }
        Ok(())
    }
}

/// Command recorder that validates its open/closed state machine and logs
/// everything it records.
#[derive(Debug)]
pub struct NullRecorder {
    kind: QueueKind,
    closed: bool,
    barriers: Vec<BarrierRecord>,
    draws: u32,
    dispatches: u32,
    copies: u32,
    clears: u32,
}

impl NullRecorder {
    /// Open recorder for the given queue kind.
    #[must_use]
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            closed: false,
            barriers: Vec::new(),
            draws: 0,
            dispatches: 0,
            copies: 0,
            clears: 0,
        }
    }

    /// Every barrier recorded since the last reset, in emission order.
    #[must_use]
    pub fn barriers(&self) -> &[BarrierRecord] {
        &self.barriers
    }

    /// Draw calls recorded since the last reset.
    #[must_use]
    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    /// Dispatches recorded since the last reset.
    #[must_use]
    pub fn dispatch_count(&self) -> u32 {
        self.dispatches
    }

    /// Buffer copies recorded since the last reset.
    #[must_use]
    pub fn copy_count(&self) -> u32 {
        self.copies
    }

    /// Target clears recorded since the last reset.
    #[must_use]
    pub fn clear_count(&self) -> u32 {
        self.clears
    }

    fn record(&mut self) {
        debug_assert!(!self.closed, "recording into a closed command list");
    }
}

impl CommandRecorder for NullRecorder {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::InvalidState("close on a closed command list"));
        }
        self.closed = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.closed = false;
        self.barriers.clear();
        self.draws = 0;
        self.dispatches = 0;
        self.copies = 0;
        self.clears = 0;
        Ok(())
    }

    fn resource_barriers(&mut self, barriers: &[BarrierRecord]) {
        self.record();
        self.barriers.extend_from_slice(barriers);
    }

    fn clear_render_target(&mut self, _view: CpuDescriptor, _color: [f32; 4]) {
        self.record();
        self.clears += 1;
    }

    fn clear_depth_stencil(&mut self, _view: CpuDescriptor, _depth: f32, _stencil: u8) {
        self.record();
        self.clears += 1;
    }

    fn set_render_targets(&mut self, _colors: &[CpuDescriptor], _depth: Option<CpuDescriptor>) {
        self.record();
    }

    fn set_viewport(&mut self, _viewport: &Viewport) {
        self.record();
    }

    fn set_scissor(&mut self, _rect: &ScissorRect) {
        self.record();
    }

    fn set_pipeline(&mut self, _pipeline: PipelineHandle) {
        self.record();
    }

    fn set_graphics_root_signature(&mut self, _signature: RootSignatureHandle) {
        self.record();
    }

    fn set_compute_root_signature(&mut self, _signature: RootSignatureHandle) {
        self.record();
    }

    fn set_graphics_root_constant_buffer(&mut self, _index: u32, _gpu_address: u64) {
        self.record();
    }

    fn set_graphics_constants(&mut self, _index: u32, _constants: &[u32]) {
        self.record();
    }

    fn set_compute_constants(&mut self, _index: u32, _constants: &[u32]) {
        self.record();
    }

    fn set_descriptor_table(&mut self, _index: u32, _base: CpuDescriptor) {
        self.record();
    }

    fn set_vertex_buffer(&mut self, _slot: u32, _gpu_address: u64, _size: u32, _stride: u32) {
        self.record();
    }

    fn set_index_buffer(&mut self, _gpu_address: u64, _size: u32, _format: Format) {
        self.record();
    }

    fn draw(&mut self, _vertices: u32, _instances: u32, _first_vertex: u32, _first_instance: u32) {
        self.record();
        self.draws += 1;
    }

    fn draw_indexed(
        &mut self,
        _indices: u32,
        _instances: u32,
        _first_index: u32,
        _base_vertex: i32,
        _first_instance: u32,
    ) {
        self.record();
        self.draws += 1;
    }

    fn dispatch(&mut self, _groups_x: u32, _groups_y: u32, _groups_z: u32) {
        self.record();
        self.dispatches += 1;
    }

    fn copy_buffer_region(
        &mut self,
        _dst: ResourceHandle,
        _dst_offset: u64,
        _src: ResourceHandle,
        _src_offset: u64,
        _size: u64,
    ) {
        self.record();
        self.copies += 1;
    }
}

struct NullQueue {
    kind: QueueKind,
    fence: Arc<NullFence>,
    auto_retire: bool,
}

impl SubmitQueue for NullQueue {
    fn execute(&self, lists: &mut [&mut dyn CommandRecorder]) -> Result<(), DeviceError> {
        for list in lists.iter() {
            if list.kind() != self.kind {
                return Err(DeviceError::Submit(format!(
                    "{} list submitted to {} queue",
                    list.kind(),
                    self.kind
                )));
            }
            if !list.is_closed() {
                return Err(DeviceError::InvalidState(
                    "executed an open command list",
                ));
            }
        }
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<(), DeviceError> {
        if self.auto_retire {
            // No real GPU: signalled work retires instantly.
            self.fence.complete(value);
        }
        Ok(())
    }

    fn fence(&self) -> Arc<dyn Fence> {
        self.fence.clone()
    }
}

enum NullResource {
    Committed { byte_size: u64 },
    Upload { storage: Box<[u8]> },
}

#[derive(Default)]
struct DeviceState {
    resources: FxHashMap<u64, NullResource>,
    heaps: FxHashMap<u64, u32>,
    next_heap_base: usize,
}

/// Headless [`Device`] implementation.
pub struct NullDevice {
    auto_retire: bool,
    next_id: AtomicU64,
    next_va: AtomicU64,
    state: Mutex<DeviceState>,
    fences: Mutex<Vec<Arc<NullFence>>>,
}

impl NullDevice {
    /// Device whose queues retire work as soon as it is signalled.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_retire_mode(true))
    }

    /// Device whose fences only advance via [`Self::retire_all`], so tests
    /// can observe the in-flight window.
    #[must_use]
    pub fn new_manual() -> Arc<Self> {
        Arc::new(Self::with_retire_mode(false))
    }

    fn with_retire_mode(auto_retire: bool) -> Self {
        Self {
            auto_retire,
            next_id: AtomicU64::new(1),
            // Leave VA 0 unused so address 0 stays "no address".
            next_va: AtomicU64::new(0x1_0000),
            state: Mutex::new(DeviceState {
                next_heap_base: 0x10_0000,
                ..Default::default()
            }),
            fences: Mutex::new(Vec::new()),
        }
    }

    /// Advance every fence created on this device to `value`.
    pub fn retire_all(&self, value: u64) {
        let fences = self.fences.lock().unwrap_or_else(PoisonError::into_inner);
        for fence in fences.iter() {
            fence.complete(value);
        }
    }

    /// Number of live resources (committed + upload pages).
    #[must_use]
    pub fn live_resources(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .len()
    }

    fn mint_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn mint_va(&self, size: u64) -> u64 {
        // 64 KiB placement granularity, like real committed heaps.
        let aligned = size.div_ceil(0x1_0000) * 0x1_0000;
        self.next_va.fetch_add(aligned, Ordering::Relaxed)
    }

    fn track_fence(&self, fence: &Arc<NullFence>) {
        self.fences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fence.clone());
    }

    fn check_view_target(&self, resource: ResourceHandle, slot: CpuDescriptor, what: &str) {
        debug_assert_ne!(slot, CpuDescriptor::NULL, "{what} written to null slot");
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.resources.contains_key(&resource.0) {
            log::error!("{what} created for unknown resource {resource:?}");
        }
    }
}

fn texel_size(format: Format) -> u64 {
    match format {
        Format::Unknown => 1,
        Format::R16Uint => 2,
        Format::Rgba8Unorm | Format::R32Float | Format::R32Uint | Format::Rg16Float => 4,
        Format::D32Float | Format::D24UnormS8Uint => 4,
        Format::Rgba16Float => 8,
        Format::Rgba32Float => 16,
    }
}

impl Device for NullDevice {
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::Resource | DescriptorHeapKind::RenderTarget => 32,
            DescriptorHeapKind::Sampler => 16,
            DescriptorHeapKind::DepthStencil => 8,
        }
    }

    fn format_support(&self, format: Format) -> FormatSupport {
        match format {
            Format::Unknown => FormatSupport::default(),
            Format::D32Float | Format::D24UnormS8Uint => FormatSupport {
                render_target: false,
                depth_stencil: true,
                unordered_access: false,
                shader_sample: true,
            },
            Format::R16Uint | Format::R32Uint => FormatSupport {
                render_target: false,
                depth_stencil: false,
                unordered_access: true,
                shader_sample: true,
            },
            _ => FormatSupport {
                render_target: true,
                depth_stencil: false,
                unordered_access: true,
                shader_sample: true,
            },
        }
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeapInfo, DeviceError> {
        if capacity == 0 {
            return Err(DeviceError::Creation(
                "zero-capacity descriptor heap".into(),
            ));
        }
        let id = self.mint_id();
        let stride = self.descriptor_increment(kind) as usize;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let base = state.next_heap_base;
        state.next_heap_base = base + capacity as usize * stride;
        let _ = state.heaps.insert(id, capacity);
        Ok(DescriptorHeapInfo {
            handle: HeapHandle(id),
            base: CpuDescriptor { ptr: base },
            capacity,
        })
    }

    fn destroy_descriptor_heap(&self, handle: HeapHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.heaps.remove(&handle.0).is_none() {
            log::warn!("destroy of unknown descriptor heap {handle:?}");
        }
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
        _clear: Option<&ClearValue>,
    ) -> Result<ResourceInfo, DeviceError> {
        let byte_size = match desc.dimension {
            ResourceDimension::Buffer => desc.width,
            ResourceDimension::Texture2d | ResourceDimension::Texture3d => {
                desc.width
                    * u64::from(desc.height)
                    * u64::from(desc.depth_or_layers)
                    * texel_size(desc.format)
            }
        };
        if byte_size == 0 {
            return Err(DeviceError::Creation("zero-sized resource".into()));
        }
        let id = self.mint_id();
        let gpu_address = match desc.dimension {
            ResourceDimension::Buffer => self.mint_va(byte_size),
            _ => 0,
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = state
            .resources
            .insert(id, NullResource::Committed { byte_size });
        Ok(ResourceInfo {
            handle: ResourceHandle(id),
            gpu_address,
        })
    }

    fn create_upload_page(&self, size: usize) -> Result<UploadPageInfo, DeviceError> {
        if size == 0 {
            return Err(DeviceError::Creation("zero-sized upload page".into()));
        }
        let id = self.mint_id();
        let gpu_base = self.mint_va(size as u64);
        let mut storage = vec![0_u8; size].into_boxed_slice();
        let Some(cpu_base) = NonNull::new(storage.as_mut_ptr()) else {
            return Err(DeviceError::OutOfMemory);
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // The box's heap storage is stable; the pointer stays valid until
        // destroy_resource drops it.
        let _ = state.resources.insert(id, NullResource::Upload { storage });
        Ok(UploadPageInfo {
            resource: ResourceHandle(id),
            gpu_base,
            cpu_base: MappedPtr(cpu_base),
            size,
        })
    }

    fn destroy_resource(&self, handle: ResourceHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.resources.remove(&handle.0).is_none() {
            log::warn!("destroy of unknown resource {handle:?}");
        }
    }

    fn create_shader_resource_view(&self, resource: ResourceHandle, slot: CpuDescriptor) {
        self.check_view_target(resource, slot, "SRV");
    }

    fn create_unordered_access_view(
        &self,
        resource: ResourceHandle,
        _mip: u32,
        slot: CpuDescriptor,
    ) {
        self.check_view_target(resource, slot, "UAV");
    }

    fn create_render_target_view(&self, resource: ResourceHandle, slot: CpuDescriptor) {
        self.check_view_target(resource, slot, "RTV");
    }

    fn create_depth_stencil_view(&self, resource: ResourceHandle, slot: CpuDescriptor) {
        self.check_view_target(resource, slot, "DSV");
    }

    fn set_debug_name(&self, handle: ResourceHandle, name: &str) {
        log::trace!("resource {handle:?} named {name:?}");
    }

    fn create_fence(&self, initial: u64) -> Result<Arc<dyn Fence>, DeviceError> {
        let fence = Arc::new(NullFence::new(initial));
        self.track_fence(&fence);
        Ok(fence)
    }

    fn create_queue(&self, kind: QueueKind) -> Result<Arc<dyn SubmitQueue>, DeviceError> {
        let fence = Arc::new(NullFence::new(0));
        self.track_fence(&fence);
        Ok(Arc::new(NullQueue {
            kind,
            fence,
            auto_retire: self.auto_retire,
        }))
    }

    fn create_recorder(&self, kind: QueueKind) -> Result<Box<dyn CommandRecorder>, DeviceError> {
        Ok(Box::new(NullRecorder::new(kind)))
    }

    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureHandle, DeviceError> {
        if desc.parameters.is_empty() {
            return Err(DeviceError::Creation("empty root signature".into()));
        }
        Ok(RootSignatureHandle(self.mint_id()))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> Result<PipelineHandle, DeviceError> {
        if desc.vertex_shader.is_empty() {
            return Err(DeviceError::Creation("empty vertex shader".into()));
        }
        Ok(PipelineHandle(self.mint_id()))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<PipelineHandle, DeviceError> {
        if desc.compute_shader.is_empty() {
            return Err(DeviceError::Creation("empty compute shader".into()));
        }
        Ok(PipelineHandle(self.mint_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_wait_times_out_as_device_lost() {
        let fence = NullFence::new(0);
        let err = fence.wait(1, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceLost(_)));
    }

    #[test]
    fn fence_completion_is_monotone() {
        let fence = NullFence::new(0);
        fence.complete(5);
        fence.complete(3);
        assert_eq!(fence.completed_value(), 5);
        fence.wait(5, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn auto_queue_retires_on_signal() {
        let device = NullDevice::new();
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        queue.signal(3).unwrap();
        assert_eq!(queue.fence().completed_value(), 3);
    }

    #[test]
    fn manual_queue_holds_completion_until_retired() {
        let device = NullDevice::new_manual();
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        queue.signal(1).unwrap();
        assert_eq!(queue.fence().completed_value(), 0);
        device.retire_all(1);
        assert_eq!(queue.fence().completed_value(), 1);
    }

    #[test]
    fn recorder_rejects_double_close_and_open_execution() {
        let device = NullDevice::new();
        let queue = device.create_queue(QueueKind::Direct).unwrap();
        let mut recorder = device.create_recorder(QueueKind::Direct).unwrap();

        let err = queue.execute(&mut [recorder.as_mut()]).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidState(_)));

        recorder.close().unwrap();
        queue.execute(&mut [recorder.as_mut()]).unwrap();
        assert!(matches!(
            recorder.close(),
            Err(DeviceError::InvalidState(_))
        ));

        recorder.reset().unwrap();
        assert!(!recorder.is_closed());
    }

    #[test]
    fn queue_rejects_mismatched_list_kind() {
        let device = NullDevice::new();
        let queue = device.create_queue(QueueKind::Copy).unwrap();
        let mut recorder = device.create_recorder(QueueKind::Direct).unwrap();
        recorder.close().unwrap();
        let err = queue.execute(&mut [recorder.as_mut()]).unwrap_err();
        assert!(matches!(err, DeviceError::Submit(_)));
    }

    #[test]
    fn descriptor_heaps_hand_out_disjoint_ranges() {
        let device = NullDevice::new();
        let a = device
            .create_descriptor_heap(DescriptorHeapKind::Resource, 16)
            .unwrap();
        let b = device
            .create_descriptor_heap(DescriptorHeapKind::Resource, 16)
            .unwrap();
        let stride = device.descriptor_increment(DescriptorHeapKind::Resource) as usize;
        assert!(a.base.ptr + 16 * stride <= b.base.ptr);
    }

    #[test]
    fn upload_pages_are_writable_host_memory() {
        let device = NullDevice::new();
        let page = device.create_upload_page(256).unwrap();
        // Safety: the device guarantees the mapping stays valid until the
        // page is destroyed below.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(page.cpu_base.0.as_ptr(), page.size);
            slice[0] = 0xAB;
            slice[255] = 0xCD;
            assert_eq!(slice[0], 0xAB);
        }
        assert_eq!(device.live_resources(), 1);
        device.destroy_resource(page.resource);
        assert_eq!(device.live_resources(), 0);
    }
}
