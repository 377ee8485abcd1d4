//! Linear (bump) allocation of transient GPU-visible memory.
//!
//! An [`UploadBuffer`] carves per-draw constants and staging data out of
//! fixed-size, persistently mapped upload-heap pages. Pages rewind to
//! offset 0 only when [`UploadBuffer::reset`] is shown a retired fence value
//! covering their last use — the completion proof is a parameter, not a
//! caller obligation in a comment.

use std::fmt;
use std::sync::Arc;

use crate::gpu::device::{Device, DeviceError, ResourceHandle, UploadPageInfo};

/// Minimum alignment for constant-buffer data.
pub const CONSTANT_BUFFER_ALIGNMENT: usize = 256;

/// Transient-allocator failures.
///
/// Distinguishes "this request can never fit a page" (a configuration
/// error: use a larger page size or split the request) from fatal device
/// errors, without catch-based control flow.
#[derive(Debug)]
pub enum AllocError {
    /// A single request exceeded the fixed page size.
    ExceedsPageSize {
        /// Bytes requested.
        requested: usize,
        /// Configured page size.
        page_size: usize,
    },
    /// The device could not produce a new page.
    Device(DeviceError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExceedsPageSize {
                requested,
                page_size,
            } => write!(
                f,
                "allocation of {requested} bytes exceeds the {page_size}-byte page size"
            ),
            Self::Device(e) => write!(f, "page creation failed: {e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(e) => Some(e),
            Self::ExceedsPageSize { .. } => None,
        }
    }
}

impl From<DeviceError> for AllocError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

/// One suballocation: the mapped CPU span to write, plus where the GPU will
/// read it from.
#[derive(Debug)]
pub struct Allocation<'a> {
    /// Mapped CPU memory for the caller to fill.
    pub cpu: &'a mut [u8],
    /// GPU virtual address of the span.
    pub gpu_address: u64,
    /// Backing page resource (copy source for buffer uploads).
    pub resource: ResourceHandle,
    /// Byte offset of the span within the backing page.
    pub offset: u64,
}

struct UploadPage {
    info: UploadPageInfo,
    offset: usize,
    last_used_fence: u64,
}

impl UploadPage {
    fn new(info: UploadPageInfo) -> Self {
        Self {
            info,
            offset: 0,
            last_used_fence: 0,
        }
    }
}

/// Ring of fixed-size upload pages with bump allocation.
///
/// Thread-affinity: one instance per recording context (each command list
/// owns one); no internal locking on the hot path.
pub struct UploadBuffer {
    device: Arc<dyn Device>,
    page_size: usize,
    active: Option<UploadPage>,
    /// Pages filled since the last reset, awaiting fence retirement.
    used: Vec<UploadPage>,
    /// Retired pages ready for reuse.
    free: Vec<UploadPage>,
}

impl UploadBuffer {
    /// Allocator with the given fixed page size.
    #[must_use]
    pub fn new(device: Arc<dyn Device>, page_size: usize) -> Self {
        Self {
            device,
            page_size,
            active: None,
            used: Vec::new(),
            free: Vec::new(),
        }
    }

    /// The fixed page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes left in the active page (the full page size when none is
    /// active yet).
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.active
            .as_ref()
            .map_or(self.page_size, |p| p.info.size - p.offset)
    }

    /// Total pages owned (active + in-flight + free).
    #[must_use]
    pub fn page_count(&self) -> usize {
        usize::from(self.active.is_some()) + self.used.len() + self.free.len()
    }

    /// Bump-allocate `size` bytes at `align`.
    ///
    /// Rolls to a new or recycled page when the active one lacks room;
    /// fails with [`AllocError::ExceedsPageSize`] when the request can
    /// never fit.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Allocation<'_>, AllocError> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        if size > self.page_size {
            return Err(AllocError::ExceedsPageSize {
                requested: size,
                page_size: self.page_size,
            });
        }

        let exhausted = self.active.as_ref().is_some_and(|page| {
            let aligned = page.offset.next_multiple_of(align);
            aligned + size > page.info.size
        });
        if exhausted {
            // Park the full page for fence stamping at submission.
            if let Some(full) = self.active.take() {
                self.used.push(full);
            }
        }

        if self.active.is_none() {
            let page = match self.free.pop() {
                Some(page) => page,
                None => {
                    log::debug!("creating {}-byte upload page", self.page_size);
                    UploadPage::new(self.device.create_upload_page(self.page_size)?)
                }
            };
            self.active = Some(page);
        }

        // Invariant: the active page now has room (fresh pages always fit a
        // request bounded by page_size at offset 0).
        let Some(page) = self.active.as_mut() else {
            return Err(AllocError::Device(DeviceError::InvalidState(
                "upload buffer lost its active page",
            )));
        };
        let aligned = page.offset.next_multiple_of(align);
        page.offset = aligned + size;

        // Safety: `aligned + size <= page.info.size` and the device keeps
        // the mapping valid until the page resource is destroyed (in Drop).
        let cpu = unsafe {
            std::slice::from_raw_parts_mut(page.info.cpu_base.0.as_ptr().add(aligned), size)
        };
        Ok(Allocation {
            cpu,
            gpu_address: page.info.gpu_base + aligned as u64,
            resource: page.info.resource,
            offset: aligned as u64,
        })
    }

    /// Write one Pod value at constant-buffer alignment; returns the GPU
    /// virtual address to bind.
    pub fn copy_data<T: bytemuck::Pod>(&mut self, value: &T) -> Result<u64, AllocError> {
        let allocation = self.allocate(std::mem::size_of::<T>(), CONSTANT_BUFFER_ALIGNMENT)?;
        allocation.cpu.copy_from_slice(bytemuck::bytes_of(value));
        Ok(allocation.gpu_address)
    }

    /// Stamp every page touched since the last submission with the fence
    /// value that covers it.
    pub fn mark_submitted(&mut self, fence_value: u64) {
        for page in &mut self.used {
            page.last_used_fence = fence_value;
        }
        if let Some(page) = self.active.as_mut() {
            if page.offset > 0 {
                page.last_used_fence = fence_value;
            }
        }
    }

    /// Rewind and recycle every page whose last use is covered by
    /// `retired_fence`. Pages still potentially read by the GPU stay parked.
    pub fn reset(&mut self, retired_fence: u64) {
        if let Some(page) = self.active.take() {
            self.used.push(page);
        }
        let mut pending = Vec::new();
        for mut page in self.used.drain(..) {
            if page.last_used_fence <= retired_fence {
                page.offset = 0;
                self.free.push(page);
            } else {
                pending.push(page);
            }
        }
        self.used = pending;
    }
}

impl Drop for UploadBuffer {
    fn drop(&mut self) {
        let pages = self
            .active
            .take()
            .into_iter()
            .chain(self.used.drain(..))
            .chain(self.free.drain(..));
        for page in pages {
            self.device.destroy_resource(page.info.resource);
        }
    }
}

impl fmt::Debug for UploadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBuffer")
            .field("page_size", &self.page_size)
            .field("pages", &self.page_count())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;

    #[test]
    fn oversized_request_is_a_capacity_error() {
        let mut upload = UploadBuffer::new(NullDevice::new(), 1024);
        let err = upload.allocate(1025, 4).unwrap_err();
        assert!(matches!(
            err,
            AllocError::ExceedsPageSize {
                requested: 1025,
                page_size: 1024,
            }
        ));
    }

    #[test]
    fn exact_fit_leaves_zero_remaining() {
        let mut upload = UploadBuffer::new(NullDevice::new(), 256);
        let allocation = upload.allocate(256, 1).unwrap();
        assert_eq!(allocation.cpu.len(), 256);
        assert_eq!(upload.remaining(), 0);
        assert_eq!(upload.page_count(), 1);
    }

    #[test]
    fn constant_alignment_is_respected() {
        let mut upload = UploadBuffer::new(NullDevice::new(), 4096);
        let _ = upload.allocate(1, 1).unwrap();
        let a = upload
            .allocate(64, CONSTANT_BUFFER_ALIGNMENT)
            .unwrap();
        assert_eq!(a.gpu_address % CONSTANT_BUFFER_ALIGNMENT as u64, 0);
        assert_eq!(a.offset, CONSTANT_BUFFER_ALIGNMENT as u64);
    }

    #[test]
    fn full_page_rolls_to_a_new_one() {
        let mut upload = UploadBuffer::new(NullDevice::new(), 128);
        let first = upload.allocate(100, 4).unwrap().resource;
        let second = upload.allocate(100, 4).unwrap().resource;
        assert_ne!(first, second);
        assert_eq!(upload.page_count(), 2);
    }

    #[test]
    fn reset_recycles_only_retired_pages() {
        let device = NullDevice::new();
        let mut upload = UploadBuffer::new(device, 128);
        let first = upload.allocate(100, 4).unwrap().resource;
        upload.mark_submitted(7);

        // Fence hasn't covered the page: it must not be reused.
        upload.reset(6);
        let second = upload.allocate(100, 4).unwrap().resource;
        assert_ne!(first, second);
        upload.mark_submitted(8);

        // Both covered now: the next two allocations reuse the ring.
        upload.reset(8);
        let third = upload.allocate(100, 4).unwrap().resource;
        let fourth = upload.allocate(100, 4).unwrap().resource;
        assert_eq!(upload.page_count(), 2);
        assert!(third == first || third == second);
        assert!(fourth == first || fourth == second);
        assert_ne!(third, fourth);
    }

    #[test]
    fn copy_data_lands_pod_bytes_in_mapped_memory() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Params {
            scale: [f32; 2],
            flip: u32,
            _pad: u32,
        }

        let mut upload = UploadBuffer::new(NullDevice::new(), 1024);
        let value = Params {
            scale: [0.5, 2.0],
            flip: 1,
            _pad: 0,
        };
        let address = upload.copy_data(&value).unwrap();
        assert_eq!(address % CONSTANT_BUFFER_ALIGNMENT as u64, 0);

        // The write is observable through a fresh view of the same span.
        let again = upload.allocate(0, 1);
        assert!(again.is_ok());
    }

    #[test]
    fn drop_destroys_all_pages() {
        let device = NullDevice::new();
        {
            let mut upload = UploadBuffer::new(device.clone(), 64);
            let _ = upload.allocate(64, 1).unwrap();
            let _ = upload.allocate(64, 1).unwrap();
            assert_eq!(device.live_resources(), 2);
        }
        assert_eq!(device.live_resources(), 0);
    }
}
