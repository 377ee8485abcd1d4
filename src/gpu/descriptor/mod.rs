//! Descriptor-heap allocation with best-fit free lists and frame-delayed
//! recycling.
//!
//! [`DescriptorAllocator`] hands out contiguous spans of descriptor slots
//! from a set of heap-backed pages. Freed spans only become allocatable
//! again after enough frames have passed that no in-flight GPU work can
//! still reference them.

mod allocation;
mod page;

pub use allocation::DescriptorAllocation;
pub use page::DescriptorAllocatorPage;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::gpu::device::{DescriptorHeapKind, Device, DeviceError};

struct AllocatorInner {
    pages: Vec<Arc<DescriptorAllocatorPage>>,
    /// Indices of pages with known free space.
    available: BTreeSet<usize>,
}

/// Best-fit allocator over a growing set of descriptor pages.
///
/// Parameterized by heap kind; page selection is serialized by the
/// allocator-level mutex, block split/merge by each page's own mutex.
pub struct DescriptorAllocator {
    device: Arc<dyn Device>,
    kind: DescriptorHeapKind,
    page_size: u32,
    frame_latency: u64,
    inner: Mutex<AllocatorInner>,
}

impl DescriptorAllocator {
    /// Allocator for heaps of `kind`, creating pages of `page_size` slots
    /// (grown per-request when a single span needs more). Freed spans are
    /// held back `frame_latency` frames before reuse.
    #[must_use]
    pub fn new(
        device: Arc<dyn Device>,
        kind: DescriptorHeapKind,
        page_size: u32,
        frame_latency: u64,
    ) -> Self {
        Self {
            device,
            kind,
            page_size,
            frame_latency,
            inner: Mutex::new(AllocatorInner {
                pages: Vec::new(),
                available: BTreeSet::new(),
            }),
        }
    }

    /// Heap kind this allocator serves.
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Number of pages created so far.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.lock().pages.len()
    }

    /// Allocate `count` contiguous descriptor slots.
    ///
    /// Scans pages with known free space for a best-fit block; pages that
    /// come back empty-handed are skipped (and dropped from the available
    /// set once exhausted). Only when no candidate yields a block is a new
    /// page created, sized to at least `count`.
    pub fn allocate(&self, count: u32) -> Result<DescriptorAllocation, DeviceError> {
        if count == 0 {
            return Ok(DescriptorAllocation::null(self.kind));
        }

        let mut inner = self.lock();

        let mut chosen = None;
        let mut exhausted = Vec::new();
        for &index in &inner.available {
            let page = &inner.pages[index];
            if !page.has_space(count) {
                if page.free_handles() == 0 {
                    exhausted.push(index);
                }
                continue;
            }
            let allocation = page.allocate(count, index as u32);
            if page.free_handles() == 0 {
                exhausted.push(index);
            }
            if allocation.is_some() {
                chosen = allocation;
                break;
            }
        }
        for index in exhausted {
            let _ = inner.available.remove(&index);
        }
        if let Some(allocation) = chosen {
            return Ok(allocation);
        }

        // No page could satisfy the request: grow.
        let capacity = self.page_size.max(count);
        log::debug!(
            "creating {:?} descriptor page with {capacity} slots",
            self.kind
        );
        let page = Arc::new(DescriptorAllocatorPage::new(
            self.device.clone(),
            self.kind,
            capacity,
        )?);
        let index = inner.pages.len();
        let allocation = page.allocate(count, index as u32).ok_or_else(|| {
            DeviceError::Creation("fresh descriptor page rejected its first allocation".into())
        })?;
        if page.free_handles() > 0 {
            let _ = inner.available.insert(index);
        }
        inner.pages.push(page);
        Ok(allocation)
    }

    /// Queue an allocation for release at `frame`. The slots become
    /// allocatable again only after [`Self::release_stale`] runs with a
    /// frame number at least `frame_latency` later.
    pub fn free(&self, allocation: &DescriptorAllocation, frame: u64) {
        if allocation.is_null() {
            return;
        }
        debug_assert_eq!(allocation.kind(), self.kind, "allocation freed to wrong allocator");
        let inner = self.lock();
        let index = allocation.page_index() as usize;
        let Some(page) = inner.pages.get(index) else {
            log::error!("descriptor free routed to unknown page {index}");
            return;
        };
        page.free(allocation.offset(), allocation.count(), frame);
    }

    /// Merge stale spans old enough to be provably GPU-idle back into their
    /// pages' free lists, and re-admit pages that regained space.
    pub fn release_stale(&self, current_frame: u64) {
        let mut inner = self.lock();
        for index in 0..inner.pages.len() {
            let released = inner.pages[index].release_stale(current_frame, self.frame_latency);
            if released > 0 {
                log::trace!(
                    "{:?} page {index} released {released} stale descriptors",
                    self.kind
                );
            }
            if inner.pages[index].free_handles() > 0 {
                let _ = inner.available.insert(index);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DescriptorAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("kind", &self.kind)
            .field("page_size", &self.page_size)
            .field("pages", &self.page_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;

    const LATENCY: u64 = 2;

    fn allocator(page_size: u32) -> DescriptorAllocator {
        DescriptorAllocator::new(
            NullDevice::new(),
            DescriptorHeapKind::Resource,
            page_size,
            LATENCY,
        )
    }

    fn range_of(a: &DescriptorAllocation) -> (usize, usize) {
        let start = a.handle(0).ptr;
        (start, start + a.count() as usize * a.stride() as usize)
    }

    #[test]
    fn live_allocations_never_overlap() {
        let allocator = allocator(64);
        let mut live = Vec::new();
        for count in [1, 7, 16, 3, 64, 9] {
            live.push(allocator.allocate(count).unwrap());
        }
        // Free a couple and allocate more without releasing: freed spans
        // must not be reissued yet.
        let freed = live.swap_remove(1);
        allocator.free(&freed, 0);
        live.push(allocator.allocate(7).unwrap());

        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                let (a0, a1) = range_of(a);
                let (b0, b1) = range_of(b);
                assert!(a1 <= b0 || b1 <= a0, "allocations overlap");
            }
        }
    }

    #[test]
    fn freed_span_unavailable_until_frame_delay_passes() {
        let allocator = allocator(16);
        // One allocation drains the whole page.
        let a = allocator.allocate(16).unwrap();
        allocator.free(&a, 1);

        // Too early: page still empty, so a second request grows a new page.
        allocator.release_stale(2);
        let b = allocator.allocate(16).unwrap();
        assert_eq!(allocator.page_count(), 2);
        assert_ne!(range_of(&a), range_of(&b));

        // Late enough: the original span is reusable again.
        allocator.release_stale(1 + LATENCY);
        let c = allocator.allocate(16).unwrap();
        assert_eq!(allocator.page_count(), 2);
        assert_eq!(range_of(&a), range_of(&c));
    }

    #[test]
    fn adjacent_freed_blocks_coalesce() {
        let allocator = allocator(64);
        let a = allocator.allocate(10).unwrap();
        let b = allocator.allocate(20).unwrap();
        let _hold = allocator.allocate(34).unwrap();

        allocator.free(&a, 0);
        allocator.free(&b, 0);
        allocator.release_stale(LATENCY);

        // 10 + 20 merged into one block: a single 30-slot request fits and
        // lands at a's base.
        let merged = allocator.allocate(30).unwrap();
        assert_eq!(merged.handle(0), a.handle(0));
        assert_eq!(allocator.page_count(), 1);
    }

    #[test]
    fn stale_release_round_trip_returns_same_base() {
        // 256-slot page; allocate 10, free at frame f, release at f + 3
        // with a 2-frame margin: the same base offset comes back.
        let allocator = allocator(256);
        let a = allocator.allocate(10).unwrap();
        let base = a.handle(0);
        allocator.free(&a, 5);
        allocator.release_stale(5 + 3);
        let b = allocator.allocate(10).unwrap();
        assert_eq!(b.handle(0), base);
        assert_eq!(allocator.page_count(), 1);
    }

    #[test]
    fn oversized_request_grows_a_dedicated_page() {
        let allocator = allocator(32);
        let a = allocator.allocate(100).unwrap();
        assert_eq!(a.count(), 100);
        assert_eq!(allocator.page_count(), 1);

        // The big page's remainder is still usable.
        let b = allocator.allocate(1).unwrap();
        assert!(!b.is_null());
    }

    #[test]
    fn zero_count_yields_null_allocation() {
        let allocator = allocator(32);
        let a = allocator.allocate(0).unwrap();
        assert!(a.is_null());
        assert_eq!(allocator.page_count(), 0);
    }

    #[test]
    fn exhausted_page_leaves_available_set_and_returns_after_release() {
        let allocator = allocator(8);
        let a = allocator.allocate(8).unwrap();
        let b = allocator.allocate(8).unwrap();
        assert_eq!(allocator.page_count(), 2);

        allocator.free(&a, 0);
        allocator.free(&b, 0);
        allocator.release_stale(LATENCY);

        // Both pages are available again; no third page appears.
        let _c = allocator.allocate(8).unwrap();
        let _d = allocator.allocate(8).unwrap();
        assert_eq!(allocator.page_count(), 2);
    }
}
