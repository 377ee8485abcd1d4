//! One descriptor heap managed as a best-fit free list.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::gpu::descriptor::DescriptorAllocation;
use crate::gpu::device::{DescriptorHeapInfo, DescriptorHeapKind, Device, DeviceError};

/// A freed span awaiting its frame-delay before re-entering the free list.
#[derive(Debug, Clone, Copy)]
struct StaleEntry {
    offset: u32,
    count: u32,
    frame: u64,
}

/// Free-list state. The offset-indexed and size-indexed views are always
/// mutually consistent: every `(offset, size)` block appears in both.
#[derive(Debug, Default)]
struct PageInner {
    /// offset -> size, for coalescing adjacent blocks.
    free_by_offset: BTreeMap<u32, u32>,
    /// size -> offsets, for best-fit lookup.
    free_by_size: BTreeMap<u32, BTreeSet<u32>>,
    free_handles: u32,
    stale: VecDeque<StaleEntry>,
}

impl PageInner {
    fn insert_block(&mut self, offset: u32, size: u32) {
        let _ = self.free_by_offset.insert(offset, size);
        let _ = self.free_by_size.entry(size).or_default().insert(offset);
    }

    fn remove_size_index(&mut self, size: u32, offset: u32) {
        if let Some(offsets) = self.free_by_size.get_mut(&size) {
            let _ = offsets.remove(&offset);
            if offsets.is_empty() {
                let _ = self.free_by_size.remove(&size);
            }
        }
    }

    /// Return a span to the free list, merging with adjacent free blocks.
    fn merge_free_block(&mut self, mut offset: u32, mut size: u32) {
        let prev = self
            .free_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == offset {
                let _ = self.free_by_offset.remove(&prev_offset);
                self.remove_size_index(prev_size, prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }

        let next = self
            .free_by_offset
            .range(offset..)
            .next()
            .map(|(&o, &s)| (o, s));
        if let Some((next_offset, next_size)) = next {
            if offset + size == next_offset {
                let _ = self.free_by_offset.remove(&next_offset);
                self.remove_size_index(next_size, next_offset);
                size += next_size;
            }
        }

        self.insert_block(offset, size);
    }
}

/// One descriptor heap plus its free-list bookkeeping.
///
/// `free` never returns slots immediately: it queues a stale record, and
/// [`Self::release_stale`] merges records back only once enough frames have
/// passed that no in-flight GPU work can still reference the slots.
pub struct DescriptorAllocatorPage {
    device: Arc<dyn Device>,
    kind: DescriptorHeapKind,
    heap: DescriptorHeapInfo,
    stride: u32,
    inner: Mutex<PageInner>,
}

impl DescriptorAllocatorPage {
    /// Create a page backed by a fresh descriptor heap of `capacity` slots.
    pub fn new(
        device: Arc<dyn Device>,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<Self, DeviceError> {
        let heap = device.create_descriptor_heap(kind, capacity)?;
        let stride = device.descriptor_increment(kind);
        let mut inner = PageInner {
            free_handles: capacity,
            ..Default::default()
        };
        inner.insert_block(0, capacity);
        Ok(Self {
            device,
            kind,
            heap,
            stride,
            inner: Mutex::new(inner),
        })
    }

    /// Slot capacity of the backing heap.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    /// Currently free (immediately allocatable) slots.
    #[must_use]
    pub fn free_handles(&self) -> u32 {
        self.lock().free_handles
    }

    /// Whether a single free block can satisfy `count` slots.
    #[must_use]
    pub fn has_space(&self, count: u32) -> bool {
        self.lock().free_by_size.range(count..).next().is_some()
    }

    /// Best-fit allocate `count` slots. `None` when no single block fits.
    #[must_use]
    pub fn allocate(&self, count: u32, page_index: u32) -> Option<DescriptorAllocation> {
        let mut inner = self.lock();

        let (block_size, offset) = {
            let (&size, offsets) = inner.free_by_size.range(count..).next()?;
            (size, *offsets.iter().next()?)
        };

        inner.remove_size_index(block_size, offset);
        let _ = inner.free_by_offset.remove(&offset);

        // Split: the remainder re-enters both views (no coalescing needed,
        // it came out of a single free block).
        let remainder = block_size - count;
        if remainder > 0 {
            inner.insert_block(offset + count, remainder);
        }
        inner.free_handles -= count;

        Some(DescriptorAllocation::new(
            self.heap.base.offset(offset, self.stride),
            offset,
            count,
            self.stride,
            self.kind,
            page_index,
        ))
    }

    /// Queue a span for release; it stays unavailable until
    /// [`Self::release_stale`] observes a late-enough frame.
    pub fn free(&self, offset: u32, count: u32, frame: u64) {
        if count == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.stale.push_back(StaleEntry {
            offset,
            count,
            frame,
        });
    }

    /// Merge every stale span recorded at least `latency` frames before
    /// `current_frame` back into the free list. Returns released slots.
    pub fn release_stale(&self, current_frame: u64, latency: u64) -> u32 {
        let mut inner = self.lock();
        let mut released = 0;
        while let Some(front) = inner.stale.front().copied() {
            if front.frame + latency > current_frame {
                break;
            }
            let _ = inner.stale.pop_front();
            inner.free_handles += front.count;
            inner.merge_free_block(front.offset, front.count);
            released += front.count;
        }
        released
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DescriptorAllocatorPage {
    fn drop(&mut self) {
        self.device.destroy_descriptor_heap(self.heap.handle);
    }
}

impl std::fmt::Debug for DescriptorAllocatorPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocatorPage")
            .field("kind", &self.kind)
            .field("capacity", &self.heap.capacity)
            .field("free_handles", &self.free_handles())
            .finish()
    }
}
