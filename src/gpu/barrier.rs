//! Resource states and transition barriers.
//!
//! Before any GPU operation reads or writes a resource in a given state, a
//! transition barrier must move it there from its actual last-known state.
//! [`crate::gpu::state_tracker::ResourceStateTracker`] computes the
//! before-states; this module only defines the vocabulary.

use crate::gpu::device::ResourceHandle;

/// Sentinel subresource index meaning "every subresource at once".
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

/// GPU residency state of a resource (or one of its subresources).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Cross-queue neutral state; required for presentation and copy-queue
    /// handoff.
    #[default]
    Common,
    /// Bound as a vertex buffer or inline constant buffer.
    VertexAndConstantBuffer,
    /// Bound as an index buffer.
    IndexBuffer,
    /// Bound for render-target writes.
    RenderTarget,
    /// Bound for unordered (read/write) shader access.
    UnorderedAccess,
    /// Bound for depth writes.
    DepthWrite,
    /// Bound for depth reads.
    DepthRead,
    /// Sampled from a non-pixel shader stage.
    NonPixelShaderResource,
    /// Sampled from the pixel shader stage.
    PixelShaderResource,
    /// Destination of a copy operation.
    CopyDest,
    /// Source of a copy operation.
    CopySource,
    /// Readable by anything: the upload-heap required state.
    GenericRead,
}

/// A transition request as issued by a pass: "move this resource (or one
/// subresource) into `after`". The before-state is the tracker's problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    /// The resource being transitioned.
    pub resource: ResourceHandle,
    /// Target subresource, or [`ALL_SUBRESOURCES`].
    pub subresource: u32,
    /// Requested usage state.
    pub after: ResourceState,
}

impl TransitionBarrier {
    /// Whole-resource transition request.
    #[must_use]
    pub fn whole(resource: ResourceHandle, after: ResourceState) -> Self {
        Self {
            resource,
            subresource: ALL_SUBRESOURCES,
            after,
        }
    }
}

/// A fully resolved barrier, ready for the device recorder: both the
/// before- and after-states are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierRecord {
    /// The resource being transitioned.
    pub resource: ResourceHandle,
    /// Target subresource, or [`ALL_SUBRESOURCES`].
    pub subresource: u32,
    /// State the resource is actually in.
    pub before: ResourceState,
    /// State the resource is moving to.
    pub after: ResourceState,
}
