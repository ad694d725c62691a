//! GBM allocator and GLES renderer.

use anyhow::{anyhow, Context};
use smithay::backend::allocator::dmabuf::AsDmabuf;
use smithay::backend::allocator::format::FormatSet;
use smithay::backend::allocator::gbm::{GbmAllocator, GbmBufferFlags, GbmDevice};
use smithay::backend::allocator::{Allocator as _, Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use smithay::backend::egl::{EGLContext, EGLDisplay};
use smithay::backend::renderer::gles::GlesRenderer;
use smithay::backend::renderer::{Bind, Blit, TextureFilter};
use smithay::utils::{DeviceFd, Physical, Rectangle, Size};

use super::{Allocator, GpuFactory, Renderer};
use crate::backend::SessionDevice;
use crate::buffer::{Buffer, BufferCaps};

/// Sets GPUs up with a GBM allocator and a GLES renderer.
pub struct GbmGpuFactory;

impl GpuFactory for GbmGpuFactory {
    fn create(
        &self,
        device: &SessionDevice,
    ) -> anyhow::Result<(Box<dyn Renderer>, Box<dyn Allocator>)> {
        let _span = tracy_client::span!("GbmGpuFactory::create");

        let fd = device
            .dup_fd()
            .context("error duplicating the device descriptor")?;
        let device_fd = DrmDeviceFd::new(DeviceFd::from(fd));

        let gbm = {
            let _span = tracy_client::span!("GbmDevice::new");
            GbmDevice::new(device_fd.clone()).context("error creating the GBM device")?
        };

        let display =
            unsafe { EGLDisplay::new(gbm.clone()) }.context("error creating the EGL display")?;
        let context = EGLContext::new(&display).context("error creating the EGL context")?;
        let renderer =
            unsafe { GlesRenderer::new(context) }.context("error creating the renderer")?;

        let gbm_flags = GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT;
        let allocator = GbmAllocator::new(gbm, gbm_flags);

        Ok((
            Box::new(GlesBlitter {
                renderer,
                fd: device_fd.clone(),
            }),
            Box::new(GbmBufferAllocator {
                allocator,
                fd: device_fd,
            }),
        ))
    }
}

pub struct GbmBufferAllocator {
    allocator: GbmAllocator<DrmDeviceFd>,
    fd: DrmDeviceFd,
}

impl Allocator for GbmBufferAllocator {
    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        Some(self.fd.clone())
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> anyhow::Result<Buffer> {
        let _span = tracy_client::span!("GbmBufferAllocator::create_buffer");

        let buffer = self
            .allocator
            .create_buffer(width, height, format, modifiers)
            .context("error allocating the buffer")?;
        let dmabuf = buffer.export().context("error exporting the buffer")?;
        Ok(Buffer::from_dmabuf(dmabuf))
    }
}

pub struct GlesBlitter {
    renderer: GlesRenderer,
    fd: DrmDeviceFd,
}

impl Renderer for GlesBlitter {
    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        Some(self.fd.clone())
    }

    fn render_formats(&self) -> FormatSet {
        self.renderer.egl_context().dmabuf_render_formats().clone()
    }

    fn texture_formats(&self) -> FormatSet {
        self.renderer.egl_context().dmabuf_texture_formats().clone()
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }

    fn blit(&mut self, src: &Buffer, dst: &Buffer) -> anyhow::Result<()> {
        let _span = tracy_client::span!("GlesBlitter::blit");

        let mut src_dmabuf = src
            .dmabuf()
            .context("the source buffer is not a dmabuf")?
            .clone();
        let mut dst_dmabuf = dst
            .dmabuf()
            .context("the destination buffer is not a dmabuf")?
            .clone();

        let (width, height) = src.size();
        let rect =
            Rectangle::<i32, Physical>::from_size(Size::from((width as i32, height as i32)));

        let src_fb = self
            .renderer
            .bind(&mut src_dmabuf)
            .context("error binding the source buffer")?;
        let mut dst_fb = self
            .renderer
            .bind(&mut dst_dmabuf)
            .context("error binding the destination buffer")?;
        let sync = self
            .renderer
            .blit(&src_fb, &mut dst_fb, rect, rect, TextureFilter::Nearest)
            .context("error blitting")?;

        sync.wait()
            .map_err(|_| anyhow!("interrupted while waiting for the copy"))
    }
}
