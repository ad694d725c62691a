//! Kernel objects owned by the DRM backend: property blobs and framebuffers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::rc::Rc;

use super::device::KmsDevice;
use crate::buffer::{Buffer, BufferId};
use crate::utils::Subscription;

struct BlobInner {
    device: Rc<dyn KmsDevice>,
    id: u32,
    /// Left behind by a previous DRM master. Never destroyed by us.
    inherited: bool,
}

impl Drop for BlobInner {
    fn drop(&mut self) {
        if self.inherited {
            return;
        }
        if let Err(err) = self.device.destroy_blob(self.id) {
            debug!("error destroying property blob {}: {err:?}", self.id);
        }
    }
}

/// Shared handle to a kernel property blob. The last handle destroys the blob.
#[derive(Clone)]
pub struct PropertyBlob {
    inner: Rc<BlobInner>,
}

impl PropertyBlob {
    pub fn create(device: &Rc<dyn KmsDevice>, data: &[u8]) -> io::Result<Self> {
        let id = device.create_blob(data)?;
        Ok(Self {
            inner: Rc::new(BlobInner {
                device: device.clone(),
                id,
                inherited: false,
            }),
        })
    }

    /// Wraps a blob found on the device at startup.
    pub fn inherited(device: &Rc<dyn KmsDevice>, id: u32) -> Self {
        Self {
            inner: Rc::new(BlobInner {
                device: device.clone(),
                id,
                inherited: true,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn is_inherited(&self) -> bool {
        self.inner.inherited
    }
}

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBlob")
            .field("id", &self.inner.id)
            .field("inherited", &self.inner.inherited)
            .finish()
    }
}

/// Kernel framebuffer, removed when dropped.
pub struct Framebuffer {
    device: Rc<dyn KmsDevice>,
    id: u32,
}

impl Framebuffer {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_framebuffer(self.id) {
            debug!("error destroying framebuffer {}: {err:?}", self.id);
        }
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Framebuffer").field(&self.id).finish()
    }
}

struct FbEntry {
    fb: Rc<Framebuffer>,
    _release: Subscription,
}

type FbMap = RefCell<HashMap<BufferId, FbEntry>>;

/// Framebuffers of one device, at most one per buffer.
///
/// Entries are dropped when their buffer is released. Planes scanning out a buffer hold their own
/// reference to its framebuffer, so it stays alive until the plane moves on.
pub struct FbCache {
    device: Rc<dyn KmsDevice>,
    entries: Rc<FbMap>,
}

impl FbCache {
    pub fn new(device: Rc<dyn KmsDevice>) -> Self {
        Self {
            device,
            entries: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn get_or_create(&self, buffer: &Buffer) -> io::Result<Rc<Framebuffer>> {
        if let Some(entry) = self.entries.borrow().get(&buffer.id()) {
            return Ok(entry.fb.clone());
        }

        let id = self.device.add_framebuffer(buffer)?;
        let fb = Rc::new(Framebuffer {
            device: self.device.clone(),
            id,
        });

        let weak = Rc::downgrade(&self.entries);
        let release = buffer.release().connect(move |buffer_id| {
            if let Some(entries) = weak.upgrade() {
                let removed = entries.borrow_mut().remove(buffer_id);
                drop(removed);
            }
        });

        self.entries.borrow_mut().insert(
            buffer.id(),
            FbEntry {
                fb: fb.clone(),
                _release: release,
            },
        );
        Ok(fb)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        drop(entries);
    }
}
