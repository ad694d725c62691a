//! Off-thread repacking of shared-memory pixels.
//!
//! Uploading a shared-memory buffer needs the damaged areas as tightly packed rows. Copying them
//! out of a large client buffer is slow enough to stall the event loop, so it happens on a worker
//! thread. There is at most one request in flight; the result comes back as an event loop source.

use std::cell::Cell;
use std::rc::Rc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, ensure, Context};
use smithay::reexports::calloop::channel::{self, Event};
use smithay::reexports::calloop::LoopHandle;

use crate::buffer::{clip_damage, Buffer, BufferId, BufferSource, Rect, ShmPixels};

#[derive(Debug)]
pub struct UploadRequest {
    pub buffer: BufferId,
    pub width: u32,
    pub height: u32,
    pub pixels: ShmPixels,
    pub damage: Vec<Rect>,
}

impl UploadRequest {
    /// Builds a request for the damaged part of `buffer`, or `None` if it isn't a shm buffer.
    pub fn new(buffer: &Buffer, damage: &[Rect]) -> Option<Self> {
        let BufferSource::Shm(pixels) = buffer.source() else {
            return None;
        };
        let (width, height) = buffer.size();
        Some(Self {
            buffer: buffer.id(),
            width,
            height,
            pixels: pixels.clone(),
            damage: clip_damage(damage, buffer.bounds()),
        })
    }
}

/// Pixels of one damaged rectangle, rows back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedRegion {
    pub rect: Rect,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Upload {
    pub buffer: BufferId,
    pub regions: Vec<PackedRegion>,
}

fn repack(request: &UploadRequest) -> anyhow::Result<Upload> {
    let _span = tracy_client::span!("upload::repack");

    let ShmPixels {
        data,
        stride,
        bytes_per_pixel,
    } = &request.pixels;
    let stride = *stride as usize;
    let bpp = *bytes_per_pixel as usize;

    ensure!(bpp > 0, "zero bytes per pixel");
    ensure!(
        stride >= request.width as usize * bpp,
        "stride {stride} is too small for width {}",
        request.width
    );
    ensure!(
        data.len() >= stride * request.height as usize,
        "{} bytes is too small for {} rows of stride {stride}",
        data.len(),
        request.height
    );

    let bounds = Rect::new(0, 0, request.width as i32, request.height as i32);
    let regions = clip_damage(&request.damage, bounds)
        .into_iter()
        .map(|rect| {
            let row_len = rect.width as usize * bpp;
            let mut packed = Vec::with_capacity(row_len * rect.height as usize);
            for y in rect.y..rect.y + rect.height {
                let start = y as usize * stride + rect.x as usize * bpp;
                packed.extend_from_slice(&data[start..start + row_len]);
            }
            PackedRegion { rect, data: packed }
        })
        .collect();

    Ok(Upload {
        buffer: request.buffer,
        regions,
    })
}

pub struct UploadWorker {
    requests: async_channel::Sender<UploadRequest>,
    busy: Rc<Cell<bool>>,
    remove_source: Option<Box<dyn FnOnce()>>,
    thread: Option<JoinHandle<()>>,
}

impl UploadWorker {
    /// Starts the worker. `on_done` runs on the event loop once per finished request.
    pub fn new<D: 'static>(
        handle: &LoopHandle<'static, D>,
        mut on_done: impl FnMut(anyhow::Result<Upload>, &mut D) + 'static,
    ) -> anyhow::Result<Self> {
        let (requests_tx, requests_rx) = async_channel::bounded::<UploadRequest>(1);
        let (done_tx, done_rx) = channel::sync_channel::<anyhow::Result<Upload>>(1);

        let busy = Rc::new(Cell::new(false));
        let token = handle
            .insert_source(done_rx, {
                let busy = busy.clone();
                move |event, _, data| match event {
                    Event::Msg(result) => {
                        busy.set(false);
                        on_done(result, data);
                    }
                    Event::Closed => (),
                }
            })
            .map_err(|err| anyhow!("error inserting upload completion source: {}", err.error))?;

        let spawned = thread::Builder::new()
            .name("Upload Worker".to_owned())
            .spawn(move || {
                while let Ok(request) = requests_rx.recv_blocking() {
                    let result = repack(&request);
                    if let Err(err) = &result {
                        warn!("error repacking buffer {:?}: {err:?}", request.buffer);
                    }
                    if done_tx.send(result).is_err() {
                        break;
                    }
                }
                debug!("upload worker exiting");
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                handle.remove(token);
                return Err(err).context("error spawning the upload thread");
            }
        };

        let handle = handle.clone();
        Ok(Self {
            requests: requests_tx,
            busy,
            remove_source: Some(Box::new(move || handle.remove(token))),
            thread: Some(thread),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Queues `request`. Fails while the previous request has not completed.
    pub fn submit(&self, request: UploadRequest) -> anyhow::Result<()> {
        ensure!(!self.busy.get(), "an upload is already in flight");
        self.requests
            .try_send(request)
            .map_err(|_| anyhow!("the upload worker is gone"))?;
        self.busy.set(true);
        Ok(())
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        // The thread exits once requests close and the completion receiver is gone.
        self.requests.close();
        if let Some(remove) = self.remove_source.take() {
            remove();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("upload worker panicked");
            }
        }
    }
}
