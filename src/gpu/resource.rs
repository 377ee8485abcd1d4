//! GPU resource wrappers.
//!
//! A [`Resource`] owns (or wraps) one committed GPU allocation and carries
//! the identity the state tracker and descriptor system key on. Cloning
//! shares the underlying handle; the last clone to drop unregisters the
//! resource from the global state table and releases the allocation.
//! [`Buffer`] and [`Texture`] are composition wrappers adding typed
//! helpers, not subclasses.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::gpu::barrier::ResourceState;
use crate::gpu::device::{
    ClearValue, Device, DeviceError, Format, FormatSupport, ResourceDesc, ResourceDimension,
    ResourceHandle, ResourceInfo,
};
use crate::gpu::state_tracker::GlobalStateTable;

struct Backing {
    handle: ResourceHandle,
    gpu_address: u64,
    format_support: FormatSupport,
    /// Whether this wrapper owns the allocation (constructed rather than
    /// wrapped) and must destroy it on drop.
    owned: bool,
}

struct ResourceInner {
    device: Arc<dyn Device>,
    globals: Arc<Mutex<GlobalStateTable>>,
    backing: Mutex<Backing>,
    desc: ResourceDesc,
    clear_value: Option<ClearValue>,
    name: Mutex<String>,
}

impl Drop for ResourceInner {
    fn drop(&mut self) {
        let backing = self.backing.lock().unwrap_or_else(PoisonError::into_inner);
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(backing.handle);
        if backing.owned {
            self.device.destroy_resource(backing.handle);
        }
    }
}

/// A wrapper owning a GPU memory allocation and its metadata.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    /// Eagerly allocate committed default-heap memory per `desc`.
    ///
    /// The resource registers its initial state in the global table;
    /// allocation failure is fatal for this call and never retried.
    pub fn new(
        device: &Arc<dyn Device>,
        globals: &Arc<Mutex<GlobalStateTable>>,
        desc: ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> Result<Self, DeviceError> {
        let info = device.create_committed_resource(&desc, initial_state, clear_value.as_ref())?;
        Ok(Self::wrap(
            device, globals, info, desc, initial_state, clear_value, true,
        ))
    }

    /// Wrap an existing allocation (swap-chain buffers and the like)
    /// without allocating. The wrapper tracks state but does not destroy
    /// the allocation on drop.
    pub fn from_handle(
        device: &Arc<dyn Device>,
        globals: &Arc<Mutex<GlobalStateTable>>,
        info: ResourceInfo,
        desc: ResourceDesc,
        initial_state: ResourceState,
    ) -> Self {
        Self::wrap(device, globals, info, desc, initial_state, None, false)
    }

    fn wrap(
        device: &Arc<dyn Device>,
        globals: &Arc<Mutex<GlobalStateTable>>,
        info: ResourceInfo,
        desc: ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
        owned: bool,
    ) -> Self {
        globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(info.handle, initial_state);
        let format_support = device.format_support(desc.format);
        Self {
            inner: Arc::new(ResourceInner {
                device: device.clone(),
                globals: globals.clone(),
                backing: Mutex::new(Backing {
                    handle: info.handle,
                    gpu_address: info.gpu_address,
                    format_support,
                    owned,
                }),
                desc,
                clear_value,
                name: Mutex::new(String::new()),
            }),
        }
    }

    /// Swap the backing allocation, re-registering global state and
    /// revalidating format support.
    pub fn replace_handle(&self, info: ResourceInfo, state: ResourceState, owned: bool) {
        let mut backing = self.backing();
        {
            let mut globals = self
                .inner
                .globals
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            globals.unregister(backing.handle);
            globals.register(info.handle, state);
        }
        if backing.owned {
            self.inner.device.destroy_resource(backing.handle);
        }
        backing.handle = info.handle;
        backing.gpu_address = info.gpu_address;
        backing.owned = owned;
        backing.format_support = self.inner.device.format_support(self.inner.desc.format);
    }

    /// Identity of the backing allocation.
    #[must_use]
    pub fn handle(&self) -> ResourceHandle {
        self.backing().handle
    }

    /// GPU virtual address (0 for textures).
    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.backing().gpu_address
    }

    /// The creation description.
    #[must_use]
    pub fn desc(&self) -> &ResourceDesc {
        &self.inner.desc
    }

    /// The optimized clear value, if one was baked in.
    #[must_use]
    pub fn clear_value(&self) -> Option<ClearValue> {
        self.inner.clear_value
    }

    /// Capability bits for the resource's format.
    #[must_use]
    pub fn format_support(&self) -> FormatSupport {
        self.backing().format_support
    }

    /// Attach a debug name, forwarded to the device.
    pub fn set_name(&self, name: &str) {
        self.inner.device.set_debug_name(self.handle(), name);
        let mut stored = self
            .inner
            .name
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stored.clear();
        stored.push_str(name);
    }

    /// The debug name, if one was set.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner
            .name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn backing(&self) -> MutexGuard<'_, Backing> {
        self.inner
            .backing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("handle", &self.handle())
            .field("dimension", &self.inner.desc.dimension)
            .field("format", &self.inner.desc.format)
            .field("name", &self.name())
            .finish()
    }
}

/// A buffer view over a [`Resource`].
#[derive(Debug, Clone)]
pub struct Buffer {
    resource: Resource,
}

impl Buffer {
    /// Allocate a committed buffer of `size` bytes.
    pub fn new(
        device: &Arc<dyn Device>,
        globals: &Arc<Mutex<GlobalStateTable>>,
        size: u64,
        initial_state: ResourceState,
    ) -> Result<Self, DeviceError> {
        let resource = Resource::new(
            device,
            globals,
            ResourceDesc::buffer(size),
            initial_state,
            None,
        )?;
        Ok(Self { resource })
    }

    /// View an existing resource as a buffer.
    ///
    /// Fails with [`DeviceError::InvalidHandle`] when the resource is not
    /// buffer-dimensioned.
    pub fn from_resource(resource: Resource) -> Result<Self, DeviceError> {
        if resource.desc().dimension != ResourceDimension::Buffer {
            return Err(DeviceError::InvalidHandle);
        }
        Ok(Self { resource })
    }

    /// Byte size of the buffer.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.resource.desc().width
    }

    /// The shared resource identity.
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl std::ops::Deref for Buffer {
    type Target = Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

/// A texture view over a [`Resource`].
#[derive(Debug, Clone)]
pub struct Texture {
    resource: Resource,
}

impl Texture {
    /// Allocate a committed texture per `desc`.
    pub fn new(
        device: &Arc<dyn Device>,
        globals: &Arc<Mutex<GlobalStateTable>>,
        desc: ResourceDesc,
        initial_state: ResourceState,
        clear_value: Option<ClearValue>,
    ) -> Result<Self, DeviceError> {
        debug_assert!(
            desc.dimension != ResourceDimension::Buffer,
            "texture created with buffer dimension"
        );
        let resource = Resource::new(device, globals, desc, initial_state, clear_value)?;
        Ok(Self { resource })
    }

    /// View an existing resource as a texture.
    pub fn from_resource(resource: Resource) -> Result<Self, DeviceError> {
        if resource.desc().dimension == ResourceDimension::Buffer {
            return Err(DeviceError::InvalidHandle);
        }
        Ok(Self { resource })
    }

    /// Width in texels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.resource.desc().width as u32
    }

    /// Height in texels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.resource.desc().height
    }

    /// Texel format.
    #[must_use]
    pub fn format(&self) -> Format {
        self.resource.desc().format
    }

    /// Mip-level count.
    #[must_use]
    pub fn mip_levels(&self) -> u16 {
        self.resource.desc().mip_levels
    }

    /// Array-layer count (6 for cubemaps).
    #[must_use]
    pub fn layers(&self) -> u16 {
        self.resource.desc().depth_or_layers
    }

    /// The shared resource identity.
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

impl std::ops::Deref for Texture {
    type Target = Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::barrier::ALL_SUBRESOURCES;
    use crate::gpu::null::NullDevice;

    fn fixture() -> (Arc<dyn Device>, Arc<Mutex<GlobalStateTable>>) {
        let device: Arc<dyn Device> = NullDevice::new();
        (device, Arc::new(Mutex::new(GlobalStateTable::new())))
    }

    #[test]
    fn clones_share_one_handle_and_one_registration() {
        let (device, globals) = fixture();
        let a = Resource::new(
            &device,
            &globals,
            ResourceDesc::buffer(64),
            ResourceState::Common,
            None,
        )
        .unwrap();
        let b = a.clone();
        assert_eq!(a.handle(), b.handle());
        assert_eq!(globals.lock().unwrap().len(), 1);
    }

    #[test]
    fn last_drop_unregisters_and_destroys() {
        let device = NullDevice::new();
        let dyn_device: Arc<dyn Device> = device.clone();
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));
        let a = Resource::new(
            &dyn_device,
            &globals,
            ResourceDesc::buffer(64),
            ResourceState::Common,
            None,
        )
        .unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(globals.lock().unwrap().len(), 1);
        assert_eq!(device.live_resources(), 1);
        drop(b);
        assert!(globals.lock().unwrap().is_empty());
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn wrapped_handles_are_not_destroyed() {
        let device = NullDevice::new();
        let dyn_device: Arc<dyn Device> = device.clone();
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));

        let desc = ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4);
        let info = device
            .create_committed_resource(&desc, ResourceState::Common, None)
            .unwrap();
        {
            let wrapped =
                Resource::from_handle(&dyn_device, &globals, info, desc, ResourceState::Common);
            assert_eq!(wrapped.handle(), info.handle);
        }
        // Unregistered from tracking, but the external owner keeps the
        // allocation alive.
        assert!(globals.lock().unwrap().is_empty());
        assert_eq!(device.live_resources(), 1);
    }

    #[test]
    fn replace_handle_moves_registration_and_revalidates_support() {
        let device = NullDevice::new();
        let dyn_device: Arc<dyn Device> = device.clone();
        let globals = Arc::new(Mutex::new(GlobalStateTable::new()));

        let texture = Texture::new(
            &dyn_device,
            &globals,
            ResourceDesc::texture_2d(Format::Rgba16Float, 8, 8),
            ResourceState::Common,
            None,
        )
        .unwrap();
        let old = texture.handle();

        let replacement = device
            .create_committed_resource(
                &ResourceDesc::texture_2d(Format::Rgba16Float, 16, 16),
                ResourceState::RenderTarget,
                None,
            )
            .unwrap();
        texture.replace_handle(replacement, ResourceState::RenderTarget, true);

        assert_ne!(texture.handle(), old);
        let globals = globals.lock().unwrap();
        assert_eq!(globals.state_of(old, ALL_SUBRESOURCES), None);
        assert_eq!(
            globals.state_of(texture.handle(), ALL_SUBRESOURCES),
            Some(ResourceState::RenderTarget)
        );
        assert!(texture.format_support().render_target);
    }

    #[test]
    fn buffer_view_rejects_textures() {
        let (device, globals) = fixture();
        let texture = Resource::new(
            &device,
            &globals,
            ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4),
            ResourceState::Common,
            None,
        )
        .unwrap();
        assert!(matches!(
            Buffer::from_resource(texture),
            Err(DeviceError::InvalidHandle)
        ));
    }
}
