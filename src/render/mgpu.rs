//! Multi-GPU registry.
//!
//! Secondary GPUs scan out buffers rendered on the primary one. The registry owns a renderer and
//! an allocator for every secondary GPU, and hands out [`Blitter`]s that copy buffers into memory
//! local to their GPU.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use anyhow::{bail, Context};
use smithay::backend::allocator::Fourcc;

use super::{Allocator, GpuFactory, Renderer};
use crate::backend::SessionDevice;
use crate::buffer::Buffer;

/// Most copies kept per size and format. Planes hold at most a current and a queued one.
const POOL_SIZE: usize = 3;

struct Gpu {
    renderer: RefCell<Box<dyn Renderer>>,
    allocator: RefCell<Box<dyn Allocator>>,
}

pub struct MgpuRegistry {
    entries: Vec<(SessionDevice, Rc<Gpu>)>,
}

impl MgpuRegistry {
    /// Creates a renderer and an allocator for every device.
    ///
    /// Fails if any of them cannot be created, dropping the ones already created.
    pub fn new(factory: &dyn GpuFactory, devices: &[SessionDevice]) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("MgpuRegistry::new");

        let mut entries = Vec::with_capacity(devices.len());
        for device in devices {
            let (renderer, allocator) = match factory.create(device) {
                Ok(pair) => pair,
                Err(err) => {
                    debug!(
                        "unwinding {} GPUs after a failure on {:?}",
                        entries.len(),
                        device.path()
                    );
                    return Err(err)
                        .with_context(|| format!("error setting up {:?}", device.path()));
                }
            };

            debug!("set up renderer for {:?}", device.path());
            let gpu = Gpu {
                renderer: RefCell::new(renderer),
                allocator: RefCell::new(allocator),
            };
            entries.push((device.clone(), Rc::new(gpu)));
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn blitter_for(&self, device: &SessionDevice) -> Option<Blitter> {
        self.entries
            .iter()
            .find(|(d, _)| d.ptr_eq(device))
            .map(|(_, gpu)| Blitter {
                gpu: gpu.clone(),
                pools: RefCell::new(HashMap::new()),
            })
    }
}

impl fmt::Debug for MgpuRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(d, _)| d.path()))
            .finish()
    }
}

type PoolKey = ((u32, u32), Fourcc);

/// Copies buffers into memory of one GPU.
///
/// One blitter serves every plane of a backend, so copies are pooled per size and format.
pub struct Blitter {
    gpu: Rc<Gpu>,
    pools: RefCell<HashMap<PoolKey, Vec<Rc<Buffer>>>>,
}

impl Blitter {
    /// Copies `src` into a buffer allocated on this GPU.
    ///
    /// Copies are recycled once nothing else references them.
    pub fn copy(&self, src: &Buffer) -> anyhow::Result<Rc<Buffer>> {
        let _span = tracy_client::span!("Blitter::copy");

        let dst = self.acquire(src)?;
        self.gpu
            .renderer
            .borrow_mut()
            .blit(src, &dst)
            .context("error copying the buffer")?;
        Ok(dst)
    }

    fn acquire(&self, src: &Buffer) -> anyhow::Result<Rc<Buffer>> {
        let mut pools = self.pools.borrow_mut();
        let key = (src.size(), src.format());

        if !pools.contains_key(&key) {
            // Pools that nothing scans out belong to an old mode or cursor size.
            pools.retain(|_, pool| pool.iter().any(|b| Rc::strong_count(b) > 1));
        }
        let pool = pools.entry(key).or_default();

        if let Some(free) = pool.iter().find(|b| Rc::strong_count(b) == 1) {
            return Ok(free.clone());
        }
        if pool.len() >= POOL_SIZE {
            bail!("all {POOL_SIZE} copies are in use");
        }

        let format = src.format();
        let modifiers = self
            .gpu
            .renderer
            .borrow()
            .render_formats()
            .iter()
            .filter(|f| f.code == format)
            .map(|f| f.modifier)
            .collect::<Vec<_>>();
        if modifiers.is_empty() {
            bail!("the renderer cannot render to {format:?}");
        }

        let (width, height) = src.size();
        let buffer = self
            .gpu
            .allocator
            .borrow_mut()
            .create_buffer(width, height, format, &modifiers)
            .context("error allocating a copy")?;
        let buffer = Rc::new(buffer);
        pool.push(buffer.clone());
        Ok(buffer)
    }
}
