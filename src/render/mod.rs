//! Renderers and allocators, as far as the backends need them.
//!
//! Backends only copy buffers between GPUs and allocate scanout buffers, so the contracts here are
//! narrow. [`gbm`] implements them with smithay's GBM allocator and GLES renderer.

use smithay::backend::allocator::format::FormatSet;
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;

use crate::backend::SessionDevice;
use crate::buffer::{Buffer, BufferCaps};

pub mod gbm;
pub mod mgpu;
pub mod upload;

pub trait Allocator {
    fn drm_fd(&self) -> Option<DrmDeviceFd>;

    /// Transports of the buffers this allocator creates.
    fn buffer_caps(&self) -> BufferCaps;

    /// Allocates a buffer using one of `modifiers`.
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> anyhow::Result<Buffer>;
}

pub trait Renderer {
    fn drm_fd(&self) -> Option<DrmDeviceFd>;

    /// Formats the renderer can render into.
    fn render_formats(&self) -> FormatSet;

    /// Formats the renderer can sample from.
    fn texture_formats(&self) -> FormatSet;

    /// Transports of the buffers this renderer can import.
    fn buffer_caps(&self) -> BufferCaps;

    /// Copies `src` into `dst`, which have the same size. Returns once the copy has completed.
    fn blit(&mut self, src: &Buffer, dst: &Buffer) -> anyhow::Result<()>;
}

/// Creates the renderer and allocator of a GPU.
pub trait GpuFactory {
    fn create(
        &self,
        device: &SessionDevice,
    ) -> anyhow::Result<(Box<dyn Renderer>, Box<dyn Allocator>)>;
}
