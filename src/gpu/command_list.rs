//! The command-list recording facade.
//!
//! A [`CommandList`] wraps one device recorder together with a private
//! [`ResourceStateTracker`], an [`UploadBuffer`] for dynamic constants, and
//! a retention list keeping every referenced resource alive until the GPU
//! has provably finished with the recorded batch. Barriers never reach the
//! recorder directly: they go through the tracker so redundant transitions
//! are elided and unknown before-states defer to submission time.

use std::sync::{Arc, Mutex};

use crate::gpu::barrier::{ResourceState, TransitionBarrier};
use crate::gpu::device::{
    CommandRecorder, CpuDescriptor, Device, DeviceError, Format, PipelineHandle, QueueKind,
    RootSignatureHandle, ScissorRect, Viewport,
};
use crate::gpu::render_target::RenderTarget;
use crate::gpu::resource::{Buffer, Resource, Texture};
use crate::gpu::state_tracker::{GlobalStateTable, ResourceStateTracker};
use crate::gpu::upload::{AllocError, UploadBuffer};

/// Records GPU work for one submission.
///
/// Lifecycle: checked out of a [`crate::gpu::command_queue::CommandQueue`],
/// recorded, submitted (which closes it), and recycled by the queue's
/// reclamation worker once its fence value retires.
pub struct CommandList {
    kind: QueueKind,
    device: Arc<dyn Device>,
    globals: Arc<Mutex<GlobalStateTable>>,
    recorder: Box<dyn CommandRecorder>,
    tracker: ResourceStateTracker,
    upload: UploadBuffer,
    /// Clones keeping referenced resources alive until post-fence reset.
    retained: Vec<Resource>,
}

impl CommandList {
    /// Create a list recording for queues of `kind`.
    pub fn new(
        device: Arc<dyn Device>,
        globals: Arc<Mutex<GlobalStateTable>>,
        kind: QueueKind,
        upload_page_size: usize,
    ) -> Result<Self, DeviceError> {
        let recorder = device.create_recorder(kind)?;
        let upload = UploadBuffer::new(device.clone(), upload_page_size);
        Ok(Self {
            kind,
            device,
            globals,
            recorder,
            tracker: ResourceStateTracker::new(),
            upload,
            retained: Vec::new(),
        })
    }

    /// Queue kind this list submits to.
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    // -- barriers -----------------------------------------------------------

    /// Request a whole-resource transition into `after`.
    ///
    /// Recorded into the tracker, not the raw list, so duplicates are
    /// deduplicated and unknown before-states defer to submission.
    pub fn transition_barrier(&mut self, resource: &Resource, after: ResourceState) {
        self.tracker
            .transition(TransitionBarrier::whole(resource.handle(), after));
        self.retain(resource);
    }

    /// Request a single-subresource transition into `after`.
    pub fn transition_subresource(
        &mut self,
        resource: &Resource,
        subresource: u32,
        after: ResourceState,
    ) {
        self.tracker.transition(TransitionBarrier {
            resource: resource.handle(),
            subresource,
            after,
        });
        self.retain(resource);
    }

    /// Emit all locally resolved barriers into the recorder.
    pub fn flush_resource_barriers(&mut self) {
        self.tracker.flush_barriers(self.recorder.as_mut());
    }

    // -- clears and targets -------------------------------------------------

    /// Transition `texture` to render-target state and clear it through
    /// `view`.
    pub fn clear_texture(&mut self, texture: &Texture, view: CpuDescriptor, color: [f32; 4]) {
        self.transition_barrier(texture, ResourceState::RenderTarget);
        self.flush_resource_barriers();
        self.recorder.clear_render_target(view, color);
    }

    /// Transition `texture` to depth-write state and clear depth/stencil
    /// through `view`.
    pub fn clear_depth_stencil_texture(
        &mut self,
        texture: &Texture,
        view: CpuDescriptor,
        depth: f32,
        stencil: u8,
    ) {
        self.transition_barrier(texture, ResourceState::DepthWrite);
        self.flush_resource_barriers();
        self.recorder.clear_depth_stencil(view, depth, stencil);
    }

    /// Bind a render-target bundle's color and depth views.
    ///
    /// The caller transitions the attachments; binding retains them.
    pub fn set_render_target(&mut self, target: &RenderTarget) {
        for attachment in target.color_attachments() {
            self.retain(&attachment.texture);
        }
        if let Some(depth) = target.depth_attachment() {
            self.retain(&depth.texture);
        }
        self.recorder
            .set_render_targets(&target.color_views(), target.depth_view());
    }

    /// Set the rasterizer viewport.
    pub fn set_viewport(&mut self, viewport: &Viewport) {
        self.recorder.set_viewport(viewport);
    }

    /// Set the scissor rectangle.
    pub fn set_scissor(&mut self, rect: &ScissorRect) {
        self.recorder.set_scissor(rect);
    }

    // -- pipeline binding ---------------------------------------------------

    /// Bind a pipeline-state object.
    pub fn set_pipeline_state(&mut self, pipeline: PipelineHandle) {
        self.recorder.set_pipeline(pipeline);
    }

    /// Bind the graphics root signature.
    pub fn set_graphics_root_signature(&mut self, signature: RootSignatureHandle) {
        self.recorder.set_graphics_root_signature(signature);
    }

    /// Bind the compute root signature.
    pub fn set_compute_root_signature(&mut self, signature: RootSignatureHandle) {
        self.recorder.set_compute_root_signature(signature);
    }

    /// Upload one Pod value to transient memory and bind it as an inline
    /// constant buffer at `root_index`.
    pub fn set_graphics_dynamic_constant_buffer<T: bytemuck::Pod>(
        &mut self,
        root_index: u32,
        value: &T,
    ) -> Result<(), AllocError> {
        let gpu_address = self.upload.copy_data(value)?;
        self.recorder
            .set_graphics_root_constant_buffer(root_index, gpu_address);
        Ok(())
    }

    /// Set inline graphics 32-bit root constants from a Pod value.
    pub fn set_graphics_32bit_constants<T: bytemuck::Pod>(&mut self, root_index: u32, value: &T) {
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(value));
        self.recorder.set_graphics_constants(root_index, words);
    }

    /// Set inline compute 32-bit root constants from a Pod value.
    pub fn set_compute_32bit_constants<T: bytemuck::Pod>(&mut self, root_index: u32, value: &T) {
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(value));
        self.recorder.set_compute_constants(root_index, words);
    }

    /// Bind a descriptor table at `root_index`.
    pub fn set_descriptor_table(&mut self, root_index: u32, base: CpuDescriptor) {
        self.recorder.set_descriptor_table(root_index, base);
    }

    // -- geometry -----------------------------------------------------------

    /// Transition and bind a vertex buffer.
    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: &Buffer, stride: u32) {
        self.transition_barrier(buffer, ResourceState::VertexAndConstantBuffer);
        self.recorder
            .set_vertex_buffer(slot, buffer.gpu_address(), buffer.size() as u32, stride);
    }

    /// Transition and bind the index buffer.
    pub fn set_index_buffer(&mut self, buffer: &Buffer, format: Format) {
        self.transition_barrier(buffer, ResourceState::IndexBuffer);
        self.recorder
            .set_index_buffer(buffer.gpu_address(), buffer.size() as u32, format);
    }

    /// Non-indexed draw. Flushes outstanding barriers first.
    pub fn draw(&mut self, vertices: u32, instances: u32, first_vertex: u32, first_instance: u32) {
        self.flush_resource_barriers();
        self.recorder
            .draw(vertices, instances, first_vertex, first_instance);
    }

    /// Indexed draw. Flushes outstanding barriers first.
    pub fn draw_indexed(
        &mut self,
        indices: u32,
        instances: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.flush_resource_barriers();
        self.recorder
            .draw_indexed(indices, instances, first_index, base_vertex, first_instance);
    }

    /// Compute dispatch. Flushes outstanding barriers first.
    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.flush_resource_barriers();
        self.recorder.dispatch(groups_x, groups_y, groups_z);
    }

    // -- uploads ------------------------------------------------------------

    /// Create a default-heap buffer and record a staged copy of `data` into
    /// it, leaving it transitioning to `final_state` within this list.
    ///
    /// Data larger than one upload page is copied in page-sized chunks.
    pub fn copy_buffer<T: bytemuck::Pod>(
        &mut self,
        data: &[T],
        final_state: ResourceState,
    ) -> Result<Buffer, AllocError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Buffer::new(
            &self.device,
            &self.globals,
            bytes.len() as u64,
            ResourceState::CopyDest,
        )
        .map_err(AllocError::Device)?;

        // Seed local knowledge of the destination's state. The request
        // resolves against the just-registered global CopyDest entry and
        // emits nothing; everything recorded below happens with the
        // destination already in copy-dest state.
        self.tracker.transition(TransitionBarrier::whole(
            buffer.handle(),
            ResourceState::CopyDest,
        ));

        let chunk_size = self.upload.page_size();
        let mut written = 0_usize;
        while written < bytes.len() {
            let take = chunk_size.min(bytes.len() - written);
            let staging = self.upload.allocate(take, 4)?;
            staging.cpu.copy_from_slice(&bytes[written..written + take]);
            self.recorder.copy_buffer_region(
                buffer.handle(),
                written as u64,
                staging.resource,
                staging.offset,
                take as u64,
            );
            written += take;
        }

        self.transition_barrier(&buffer, final_state);
        Ok(buffer)
    }

    // -- submission plumbing ------------------------------------------------

    /// Close this list against an auxiliary pending-barrier list.
    ///
    /// Flushes locally resolved barriers into the own recorder, resolves
    /// pending barriers into `pending`'s recorder against global truth,
    /// publishes final states, and closes the own recorder. Returns whether
    /// `pending` received any barriers — if so the caller must execute it
    /// immediately before this list.
    ///
    /// `global` is only reachable through the context mutex's guard; the
    /// queue holds that lock across every close in a submission batch.
    pub(crate) fn close_into(
        &mut self,
        pending: &mut Self,
        global: &mut GlobalStateTable,
    ) -> Result<bool, DeviceError> {
        self.tracker.flush_barriers(self.recorder.as_mut());
        let emitted = self
            .tracker
            .flush_pending_barriers(global, pending.recorder.as_mut());
        self.tracker.commit_final_states(global);
        self.recorder.close()?;
        Ok(emitted > 0)
    }

    /// Close the raw recorder (used for pending-barrier lists).
    pub(crate) fn close_recorder(&mut self) -> Result<(), DeviceError> {
        self.recorder.close()
    }

    pub(crate) fn recorder_mut(&mut self) -> &mut dyn CommandRecorder {
        self.recorder.as_mut()
    }

    /// Stamp upload pages with the fence value covering this submission.
    pub(crate) fn on_submitted(&mut self, fence_value: u64) {
        self.upload.mark_submitted(fence_value);
    }

    /// Recycle after the GPU has retired `completed_fence`: reset the
    /// recorder, forget tracked states, release retained references, and
    /// rewind covered upload pages.
    pub(crate) fn reset_after(&mut self, completed_fence: u64) -> Result<(), DeviceError> {
        self.recorder.reset()?;
        self.tracker.reset();
        self.retained.clear();
        self.upload.reset(completed_fence);
        Ok(())
    }

    fn retain(&mut self, resource: &Resource) {
        self.retained.push(resource.clone());
    }

    #[cfg(test)]
    pub(crate) fn retained_count(&self) -> usize {
        self.retained.len()
    }

    #[cfg(test)]
    pub(crate) fn null_recorder(&self) -> &crate::gpu::null::NullRecorder {
        self.recorder
            .as_any()
            .downcast_ref()
            .expect("command list is not backed by the null device")
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("kind", &self.kind)
            .field("closed", &self.recorder.is_closed())
            .field("retained", &self.retained.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;

    fn fixture() -> (Arc<dyn Device>, Arc<Mutex<GlobalStateTable>>) {
        let device: Arc<dyn Device> = NullDevice::new();
        (device, Arc::new(Mutex::new(GlobalStateTable::new())))
    }

    fn list(device: &Arc<dyn Device>, globals: &Arc<Mutex<GlobalStateTable>>) -> CommandList {
        CommandList::new(device.clone(), globals.clone(), QueueKind::Direct, 4096).unwrap()
    }

    #[test]
    fn transitions_retain_their_resources() {
        let (device, globals) = fixture();
        let mut cmd = list(&device, &globals);
        let texture = Texture::new(
            &device,
            &globals,
            crate::gpu::device::ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4),
            ResourceState::Common,
            None,
        )
        .unwrap();

        cmd.transition_barrier(&texture, ResourceState::RenderTarget);
        assert_eq!(cmd.retained_count(), 1);

        // Dropping the caller's wrapper keeps the allocation alive through
        // the retained clone.
        drop(texture);
        assert_eq!(globals.lock().unwrap().len(), 1);
        cmd.reset_after(0).unwrap();
        assert!(globals.lock().unwrap().is_empty());
    }

    #[test]
    fn copy_buffer_stages_chunks_and_transitions_in_list_order() {
        let (device, globals) = fixture();
        let mut cmd = CommandList::new(
            device.clone(),
            globals.clone(),
            QueueKind::Direct,
            256,
        )
        .unwrap();

        // 600 bytes across 256-byte pages: three chunked copies.
        let data = vec![7_u8; 600];
        let buffer = cmd
            .copy_buffer(&data, ResourceState::VertexAndConstantBuffer)
            .unwrap();
        assert_eq!(buffer.size(), 600);
        assert_eq!(cmd.null_recorder().copy_count(), 3);

        // The final transition is still local (flushed at close), and the
        // copy-dest seed resolves to nothing against global state.
        let mut pending = list(&device, &globals);
        let mut global = globals.lock().unwrap();
        let used_pending = cmd.close_into(&mut pending, &mut global).unwrap();
        drop(global);
        assert!(!used_pending);

        let own_barriers = cmd.null_recorder().barriers().to_vec();
        assert_eq!(own_barriers.len(), 1);
        assert_eq!(own_barriers[0].before, ResourceState::CopyDest);
        assert_eq!(own_barriers[0].after, ResourceState::VertexAndConstantBuffer);
    }

    #[test]
    fn dynamic_constants_allocate_upload_memory() {
        let (device, globals) = fixture();
        let mut cmd = list(&device, &globals);

        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct ObjectConstants {
            world: [[f32; 4]; 4],
        }

        cmd.set_graphics_dynamic_constant_buffer(0, &ObjectConstants {
            world: [[1.0, 0.0, 0.0, 0.0]; 4],
        })
        .unwrap();
        assert!(cmd.null_recorder().barriers().is_empty());
    }
}
