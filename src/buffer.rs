//! Client buffers and the synchronization primitives attached to them.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::{Buffer as _, Fourcc, Modifier};

use crate::utils::Signal;

bitflags! {
    /// Buffer transports a backend or allocator can handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferCaps: u32 {
        const DATA_PTR = 1 << 0;
        const DMABUF = 1 << 1;
        const SHM = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Pixels of a shared-memory buffer.
#[derive(Clone)]
pub struct ShmPixels {
    pub data: Arc<[u8]>,
    pub stride: u32,
    pub bytes_per_pixel: u32,
}

impl fmt::Debug for ShmPixels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmPixels")
            .field("len", &self.data.len())
            .field("stride", &self.stride)
            .field("bytes_per_pixel", &self.bytes_per_pixel)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum BufferSource {
    Dmabuf(Dmabuf),
    Shm(ShmPixels),
}

/// A buffer handed to the backend for scanout.
///
/// Every buffer gets a process-unique [`BufferId`]. Dropping the buffer emits the `release`
/// signal, which caches keyed by the ID (like the framebuffer cache) use to drop their entries.
pub struct Buffer {
    id: BufferId,
    width: u32,
    height: u32,
    format: Fourcc,
    modifier: Modifier,
    source: BufferSource,
    release: Signal<BufferId>,
}

impl Buffer {
    pub fn from_dmabuf(dmabuf: Dmabuf) -> Self {
        let format = dmabuf.format();
        let size = dmabuf.size();
        Self {
            id: BufferId::next(),
            width: size.w as u32,
            height: size.h as u32,
            format: format.code,
            modifier: format.modifier,
            source: BufferSource::Dmabuf(dmabuf),
            release: Signal::new(),
        }
    }

    pub fn from_shm(width: u32, height: u32, format: Fourcc, pixels: ShmPixels) -> Self {
        Self {
            id: BufferId::next(),
            width,
            height,
            format,
            modifier: Modifier::Linear,
            source: BufferSource::Shm(pixels),
            release: Signal::new(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn source(&self) -> &BufferSource {
        &self.source
    }

    pub fn dmabuf(&self) -> Option<&Dmabuf> {
        match &self.source {
            BufferSource::Dmabuf(dmabuf) => Some(dmabuf),
            BufferSource::Shm(_) => None,
        }
    }

    pub fn caps(&self) -> BufferCaps {
        match self.source {
            BufferSource::Dmabuf(_) => BufferCaps::DMABUF,
            BufferSource::Shm(_) => BufferCaps::SHM | BufferCaps::DATA_PTR,
        }
    }

    /// Rectangle covering the whole buffer.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    /// Signal emitted once when the buffer is dropped.
    pub fn release(&self) -> &Signal<BufferId> {
        &self.release
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release.emit(&self.id);
        self.release.clear();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &(self.width, self.height))
            .field("format", &self.format)
            .field("modifier", &self.modifier)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let rect = Rect::new(x1, y1, x2 - x1, y2 - y1);
        (!rect.is_empty()).then_some(rect)
    }
}

/// Clips damage rectangles to `bounds`, dropping the ones that fall outside.
pub fn clip_damage(damage: &[Rect], bounds: Rect) -> Vec<Rect> {
    damage
        .iter()
        .filter_map(|rect| rect.intersect(&bounds))
        .collect()
}

/// A timeline synchronization object, such as a DRM syncobj.
pub trait Timeline {
    /// Exports the fence for `point` as a sync_file.
    fn export_sync_file(&self, point: u64) -> io::Result<OwnedFd>;

    /// Attaches the fence of `sync_file` to `point`.
    fn import_sync_file(&self, point: u64, sync_file: BorrowedFd<'_>) -> io::Result<()>;
}

/// A point on a [`Timeline`].
#[derive(Clone)]
pub struct SyncPoint {
    pub timeline: Rc<dyn Timeline>,
    pub point: u64,
}

impl SyncPoint {
    pub fn new(timeline: Rc<dyn Timeline>, point: u64) -> Self {
        Self { timeline, point }
    }

    pub fn export_sync_file(&self) -> io::Result<OwnedFd> {
        self.timeline.export_sync_file(self.point)
    }

    pub fn import_sync_file(&self, sync_file: BorrowedFd<'_>) -> io::Result<()> {
        self.timeline.import_sync_file(self.point, sync_file)
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("point", &self.point)
            .finish_non_exhaustive()
    }
}
