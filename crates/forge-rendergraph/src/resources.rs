use std::collections::HashMap;

use forge_backend::{BackendDriver, BufferDescriptor, BufferHandle, Result as BackendResult, TextureDescriptor, TextureHandle};

/// What a virtual resource is backed by once realized.
#[derive(Debug, Clone, Copy)]
pub enum ResourceKind {
    Texture(TextureDescriptor),
    /// A texture the graph did not create: a backbuffer or a resource
    /// supplied by the application. Bypasses realize/destroy entirely.
    ImportedTexture(TextureHandle, TextureDescriptor),
    Buffer(BufferDescriptor),
}

/// A handle into the graph's resource table. Each write bumps `version`;
/// a handle captured before a write remains valid for reads at that
/// earlier version but cannot be used to write again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle {
    pub(crate) index: u32,
    pub(crate) version: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PhysicalHandle {
    Texture(TextureHandle),
    Buffer(BufferHandle),
}

pub(crate) struct VirtualResource {
    pub name: String,
    pub kind: ResourceKind,
    pub usage: forge_backend::Usage,
    pub version: u32,
    pub ref_count: u32,
    pub writer_pass: Option<u32>,
    pub reader_passes: Vec<u32>,
    pub physical: Option<PhysicalHandle>,
}

impl VirtualResource {
    pub fn is_imported(&self) -> bool {
        matches!(self.kind, ResourceKind::ImportedTexture(..))
    }
}

/// A first-fit pool of physical allocations released by passes whose
/// resources have gone out of lifetime, available for reuse by later
/// resources with a matching descriptor. Anything left at the end of a
/// frame is destroyed in [`ResourcePool::drain`].
#[derive(Default)]
pub(crate) struct ResourcePool {
    textures: HashMap<TextureDescriptor, Vec<TextureHandle>>,
    buffers: HashMap<BufferDescriptor, Vec<BufferHandle>>,
}

impl ResourcePool {
    pub fn acquire_texture(
        &mut self,
        driver: &mut dyn BackendDriver,
        desc: &TextureDescriptor,
    ) -> BackendResult<TextureHandle> {
        if let Some(handle) = self.textures.get_mut(desc).and_then(Vec::pop) {
            return Ok(handle);
        }
        driver.create_texture(desc)
    }

    pub fn acquire_buffer(
        &mut self,
        driver: &mut dyn BackendDriver,
        desc: &BufferDescriptor,
    ) -> BackendResult<BufferHandle> {
        if let Some(handle) = self.buffers.get_mut(desc).and_then(Vec::pop) {
            return Ok(handle);
        }
        driver.create_buffer(desc)
    }

    pub fn release_texture(&mut self, desc: TextureDescriptor, handle: TextureHandle) {
        self.textures.entry(desc).or_default().push(handle);
    }

    pub fn release_buffer(&mut self, desc: BufferDescriptor, handle: BufferHandle) {
        self.buffers.entry(desc).or_default().push(handle);
    }

    /// Destroys every handle still held in the pool. Call once execution
    /// of a frame's passes has finished.
    pub fn drain(&mut self, driver: &mut dyn BackendDriver) {
        for handles in self.textures.values_mut() {
            for handle in handles.drain(..) {
                driver.destroy_texture(handle);
            }
        }
        for handles in self.buffers.values_mut() {
            for handle in handles.drain(..) {
                driver.destroy_buffer(handle);
            }
        }
    }
}

/// Read-only view over realized resources, handed to each pass's execute
/// closure.
pub struct GraphResources<'g> {
    pub(crate) resources: &'g [VirtualResource],
}

/// Backend descriptor for a realized resource, as returned by
/// [`GraphResources::get_render_pass_info`].
#[derive(Debug, Clone, Copy)]
pub enum ResourceInfo {
    Texture(TextureDescriptor),
    Buffer(BufferDescriptor),
}

impl<'g> GraphResources<'g> {
    pub fn get_render_pass_info(&self, handle: ResourceHandle) -> ResourceInfo {
        match &self.resources[handle.index as usize].kind {
            ResourceKind::Texture(desc) | ResourceKind::ImportedTexture(_, desc) => ResourceInfo::Texture(*desc),
            ResourceKind::Buffer(desc) => ResourceInfo::Buffer(*desc),
        }
    }

    /// The physical texture handle backing `handle`. Panics if the
    /// resource was never realized (it was culled, or the handle names a
    /// buffer) — a programmer error, since `handle`'s existence on the
    /// surviving pass implies it was realized.
    pub fn texture(&self, handle: ResourceHandle) -> TextureHandle {
        let resource = &self.resources[handle.index as usize];
        match resource.physical {
            Some(PhysicalHandle::Texture(t)) => t,
            _ => match &resource.kind {
                ResourceKind::ImportedTexture(t, _) => *t,
                _ => panic!("resource \"{}\" was never realized as a texture", resource.name),
            },
        }
    }

    pub fn buffer(&self, handle: ResourceHandle) -> BufferHandle {
        let resource = &self.resources[handle.index as usize];
        match resource.physical {
            Some(PhysicalHandle::Buffer(b)) => b,
            _ => panic!("resource \"{}\" was never realized as a buffer", resource.name),
        }
    }
}
