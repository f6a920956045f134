//! The backend driver contract: the one seam the render graph and command
//! bucket reach through to an actual GPU API. Only the contract surface is
//! specified here; a real Vulkan/Metal-backed implementation is an external
//! collaborator, not part of this crate graph.

use thiserror::Error;

pub type DeviceSize = u64;
pub type QueueFamily = u32;
pub type MemoryType = u32;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is out of device memory")]
    OutOfDeviceMemory,
    #[error("device was lost")]
    DeviceLost,
    #[error("backend error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Bitmask of how a texture or buffer will be used; mirrors the usage bits
/// a real Vulkan/Metal descriptor would carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Usage(u32);

impl Usage {
    pub const NONE: Usage = Usage(0);
    pub const SAMPLED: Usage = Usage(1 << 0);
    pub const RENDER_TARGET: Usage = Usage(1 << 1);
    pub const DEPTH_STENCIL: Usage = Usage(1 << 2);
    pub const STORAGE: Usage = Usage(1 << 3);
    pub const TRANSFER_SRC: Usage = Usage(1 << 4);
    pub const TRANSFER_DST: Usage = Usage(1 << 5);
    pub const VERTEX: Usage = Usage(1 << 6);
    pub const UNIFORM: Usage = Usage(1 << 7);

    pub fn contains(self, other: Usage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Usage {
    type Output = Usage;
    fn bitor(self, rhs: Usage) -> Usage {
        Usage(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Usage {
    fn bitor_assign(&mut self, rhs: Usage) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Bgra8Unorm,
    Rgba8Unorm,
    Depth32Float,
    Depth24PlusStencil8,
    R32Uint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub samples: u32,
    pub format: Format,
    pub usage: Usage,
}

impl TextureDescriptor {
    pub fn new_2d(width: u32, height: u32, format: Format, usage: Usage) -> TextureDescriptor {
        TextureDescriptor {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            samples: 1,
            format,
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: DeviceSize,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil(f32, u32),
}

#[derive(Debug, Clone, Copy)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthAttachment {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

#[derive(Debug, Clone, Default)]
pub struct RenderTargetDescriptor {
    pub width: u32,
    pub height: u32,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_attachment: Option<DepthAttachment>,
}

/// The argument bundle for a single draw call, the payload a command
/// packet's dispatch function ultimately forwards to the driver.
#[derive(Debug, Clone, Copy)]
pub struct DrawCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// The GPU-facing contract the render graph realizes resources through and
/// the command bucket dispatches packets through.
pub trait BackendDriver {
    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureHandle>;
    fn destroy_texture(&mut self, handle: TextureHandle);
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> Result<BufferHandle>;
    fn destroy_buffer(&mut self, handle: BufferHandle);
    fn begin_render_pass(&mut self, desc: &RenderTargetDescriptor) -> Result<()>;
    fn end_render_pass(&mut self);
    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32);
    fn map_buffer(&mut self, handle: BufferHandle, offset: DeviceSize, data: &[u8]) -> Result<()>;
    fn draw(&mut self, command: &DrawCommand);
}

/// A no-op driver that records every call it receives, for exercising the
/// render graph and command bucket without a real GPU.
#[derive(Debug, Default)]
pub struct NullDriver {
    next_texture: u32,
    next_buffer: u32,
    pub calls: Vec<String>,
    pub draws: Vec<DrawCommand>,
}

impl NullDriver {
    pub fn new() -> NullDriver {
        NullDriver::default()
    }
}

impl BackendDriver for NullDriver {
    fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureHandle> {
        let handle = TextureHandle(self.next_texture);
        self.next_texture += 1;
        log::trace!("null driver: create_texture {}x{} {:?} -> {handle:?}", desc.width, desc.height, desc.format);
        self.calls.push(format!(
            "create_texture({}x{}, {:?})",
            desc.width, desc.height, desc.format
        ));
        Ok(handle)
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.calls.push(format!("destroy_texture({})", handle.0));
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> Result<BufferHandle> {
        let handle = BufferHandle(self.next_buffer);
        self.next_buffer += 1;
        log::trace!("null driver: create_buffer {} bytes -> {handle:?}", desc.size);
        self.calls.push(format!("create_buffer({})", desc.size));
        Ok(handle)
    }

    fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.calls.push(format!("destroy_buffer({})", handle.0));
    }

    fn begin_render_pass(&mut self, desc: &RenderTargetDescriptor) -> Result<()> {
        self.calls.push(format!(
            "begin_render_pass({}x{}, {} color)",
            desc.width,
            desc.height,
            desc.color_attachments.len()
        ));
        Ok(())
    }

    fn end_render_pass(&mut self) {
        self.calls.push("end_render_pass".to_string());
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.calls.push(format!("dispatch_compute({x}, {y}, {z})"));
    }

    fn map_buffer(&mut self, handle: BufferHandle, offset: DeviceSize, data: &[u8]) -> Result<()> {
        self.calls
            .push(format!("map_buffer({}, {offset}, {} bytes)", handle.0, data.len()));
        Ok(())
    }

    fn draw(&mut self, command: &DrawCommand) {
        self.draws.push(*command);
        self.calls.push("draw".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_driver_allocates_increasing_handles() {
        let mut driver = NullDriver::new();
        let a = driver
            .create_texture(&TextureDescriptor::new_2d(100, 100, Format::Bgra8Unorm, Usage::SAMPLED))
            .unwrap();
        let b = driver
            .create_texture(&TextureDescriptor::new_2d(50, 50, Format::Bgra8Unorm, Usage::SAMPLED))
            .unwrap();
        assert_ne!(a, b);
    }
}
