//! Ownership root of the GPU substrate.
//!
//! A [`RenderContext`] owns the device handle, one [`CommandQueue`] per
//! queue kind, one [`DescriptorAllocator`] per heap kind, the
//! [`GlobalStateTable`], and the frame counter. Everything the original
//! design kept in process-wide statics lives here with an explicit
//! lifecycle: created with the context, torn down when it drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::gpu::barrier::ResourceState;
use crate::gpu::command_queue::CommandQueue;
use crate::gpu::descriptor::{DescriptorAllocation, DescriptorAllocator};
use crate::gpu::device::{
    ClearValue, DescriptorHeapKind, Device, DeviceError, QueueKind, ResourceDesc,
};
use crate::gpu::resource::{Buffer, Texture};
use crate::gpu::state_tracker::GlobalStateTable;
use crate::options::EngineOptions;

/// Device, queues, descriptor allocators, and global resource state.
pub struct RenderContext {
    device: Arc<dyn Device>,
    globals: Arc<Mutex<GlobalStateTable>>,
    direct_queue: CommandQueue,
    compute_queue: CommandQueue,
    copy_queue: CommandQueue,
    descriptor_allocators: [DescriptorAllocator; 4],
    frame: AtomicU64,
    options: EngineOptions,
}

impl RenderContext {
    /// Stand up the full substrate over `device`.
    pub fn new(device: Arc<dyn Device>, options: EngineOptions) -> Result<Self, EngineError> {
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));
        let timeout = options.gpu.fence_timeout();
        let page = options.gpu.upload_page_size;

        let direct_queue =
            CommandQueue::new(device.clone(), globals.clone(), QueueKind::Direct, page, timeout)?;
        let compute_queue =
            CommandQueue::new(device.clone(), globals.clone(), QueueKind::Compute, page, timeout)?;
        let copy_queue =
            CommandQueue::new(device.clone(), globals.clone(), QueueKind::Copy, page, timeout)?;

        let latency = options.frame.effective_frame_latency();
        let page_size = options.gpu.descriptor_page_size;
        let descriptor_allocators = DescriptorHeapKind::ALL
            .map(|kind| DescriptorAllocator::new(device.clone(), kind, page_size, latency));

        log::info!(
            "render context up: {page_size}-slot descriptor pages, {page}-byte upload pages, \
             {latency}-frame descriptor latency"
        );

        Ok(Self {
            device,
            globals,
            direct_queue,
            compute_queue,
            copy_queue,
            descriptor_allocators,
            frame: AtomicU64::new(0),
            options,
        })
    }

    /// The device handle.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The shared global state table.
    #[must_use]
    pub fn global_states(&self) -> &Arc<Mutex<GlobalStateTable>> {
        &self.globals
    }

    /// The engine options this context was built with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The queue of the given kind.
    #[must_use]
    pub fn queue(&self, kind: QueueKind) -> &CommandQueue {
        match kind {
            QueueKind::Direct => &self.direct_queue,
            QueueKind::Compute => &self.compute_queue,
            QueueKind::Copy => &self.copy_queue,
        }
    }

    /// The graphics queue.
    #[must_use]
    pub fn direct_queue(&self) -> &CommandQueue {
        &self.direct_queue
    }

    /// The async-compute queue.
    #[must_use]
    pub fn compute_queue(&self) -> &CommandQueue {
        &self.compute_queue
    }

    /// The copy queue.
    #[must_use]
    pub fn copy_queue(&self) -> &CommandQueue {
        &self.copy_queue
    }

    /// Allocate `count` descriptor slots from the `kind` allocator.
    pub fn allocate_descriptors(
        &self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> Result<DescriptorAllocation, DeviceError> {
        self.descriptor_allocators[kind.index()].allocate(count)
    }

    /// Queue a descriptor span for release at the current frame.
    pub fn free_descriptors(&self, allocation: &DescriptorAllocation) {
        self.descriptor_allocators[allocation.kind().index()]
            .free(allocation, self.frame.load(Ordering::Relaxed));
    }

    /// Create a committed texture tracked by this context.
    pub fn create_texture(
        &self,
        desc: ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
        name: &str,
    ) -> Result<Texture, DeviceError> {
        let texture = Texture::new(&self.device, &self.globals, desc, initial_state, clear_value)?;
        if self.options.debug.label_resources {
            texture.set_name(name);
        }
        Ok(texture)
    }

    /// Create a committed buffer tracked by this context.
    pub fn create_buffer(
        &self,
        size: u64,
        initial_state: ResourceState,
        name: &str,
    ) -> Result<Buffer, DeviceError> {
        let buffer = Buffer::new(&self.device, &self.globals, size, initial_state)?;
        if self.options.debug.label_resources {
            buffer.set_name(name);
        }
        Ok(buffer)
    }

    /// Frame counter value.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Close out the current frame: advance the counter and release stale
    /// descriptors that are provably GPU-idle. Returns the new frame
    /// number.
    pub fn end_frame(&self) -> u64 {
        let finished = self.frame.fetch_add(1, Ordering::Relaxed) + 1;
        for allocator in &self.descriptor_allocators {
            allocator.release_stale(finished);
        }
        finished
    }

    /// Flush every queue: initialization and shutdown boundary.
    pub fn flush_all(&self) -> Result<(), DeviceError> {
        self.direct_queue.flush()?;
        self.compute_queue.flush()?;
        self.copy_queue.flush()
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("frame", &self.frame())
            .field("direct", &self.direct_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::Format;
    use crate::gpu::null::NullDevice;

    fn context() -> RenderContext {
        RenderContext::new(NullDevice::new(), EngineOptions::default()).unwrap()
    }

    #[test]
    fn context_stands_up_and_flushes() {
        let ctx = context();
        ctx.flush_all().unwrap();
        assert_eq!(ctx.frame(), 0);
    }

    #[test]
    fn resources_register_in_the_context_table() {
        let ctx = context();
        let texture = ctx
            .create_texture(
                ResourceDesc::texture_2d(Format::Rgba8Unorm, 8, 8),
                ResourceState::Common,
                None,
                "gbuffer albedo",
            )
            .unwrap();
        assert_eq!(ctx.global_states().lock().unwrap().len(), 1);
        assert_eq!(texture.name(), "gbuffer albedo");
        drop(texture);
        assert!(ctx.global_states().lock().unwrap().is_empty());
    }

    #[test]
    fn end_frame_drives_stale_descriptor_release() {
        let ctx = context();
        let a = ctx
            .allocate_descriptors(DescriptorHeapKind::RenderTarget, 4)
            .unwrap();
        let base = a.handle(0);
        ctx.free_descriptors(&a);

        // Inside the latency window the span stays parked.
        let _ = ctx.end_frame();
        let b = ctx
            .allocate_descriptors(DescriptorHeapKind::RenderTarget, 4)
            .unwrap();
        assert_ne!(b.handle(0), base);

        // Default latency is 3 frames.
        let _ = ctx.end_frame();
        let _ = ctx.end_frame();
        let c = ctx
            .allocate_descriptors(DescriptorHeapKind::RenderTarget, 4)
            .unwrap();
        assert_eq!(c.handle(0), base);
    }
}
