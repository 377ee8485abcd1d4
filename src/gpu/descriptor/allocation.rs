//! A contiguous span of descriptor-heap slots.

use crate::gpu::device::{CpuDescriptor, DescriptorHeapKind};

/// A live range of descriptor slots handed out by a
/// [`crate::gpu::descriptor::DescriptorAllocator`].
///
/// Holds a plain index back-reference to its owning page — releasing goes
/// through the allocator (`free`), which routes on that index; the
/// allocation itself owns nothing. A live allocation's slots are never
/// concurrently reused; after `free` they return to the page's free list
/// only once the frame-delay has passed.
#[derive(Debug, Clone)]
pub struct DescriptorAllocation {
    base: CpuDescriptor,
    offset: u32,
    count: u32,
    stride: u32,
    kind: DescriptorHeapKind,
    page_index: u32,
}

impl DescriptorAllocation {
    /// The empty allocation.
    #[must_use]
    pub fn null(kind: DescriptorHeapKind) -> Self {
        Self {
            base: CpuDescriptor::NULL,
            offset: 0,
            count: 0,
            stride: 0,
            kind,
            page_index: u32::MAX,
        }
    }

    pub(crate) fn new(
        base: CpuDescriptor,
        offset: u32,
        count: u32,
        stride: u32,
        kind: DescriptorHeapKind,
        page_index: u32,
    ) -> Self {
        Self {
            base,
            offset,
            count,
            stride,
            kind,
            page_index,
        }
    }

    /// Whether this allocation holds no slots.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.count == 0
    }

    /// CPU address of slot `index`.
    ///
    /// `index` must be below [`Self::count`]; out-of-range access is a
    /// caller bug (checked in debug builds).
    #[must_use]
    pub fn handle(&self, index: u32) -> CpuDescriptor {
        debug_assert!(index < self.count, "descriptor index out of range");
        self.base.offset(index, self.stride)
    }

    /// Number of slots in the span.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Per-slot stride in bytes.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Heap kind the span was allocated from.
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn page_index(&self) -> u32 {
        self.page_index
    }
}
