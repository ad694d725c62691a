//! Output implementation for DRM connectors.

use std::rc::{Rc, Weak};

use super::atomic::{self, OutputCommit};
use super::types::{Connector, Crtc};
use super::DrmInner;
use crate::buffer::Buffer;
use crate::output::{Output, OutputImpl, OutputState};

pub struct DrmOutput {
    inner: Weak<DrmInner>,
    connector: u32,
}

impl DrmOutput {
    pub fn new(inner: Weak<DrmInner>, connector: u32) -> Self {
        Self { inner, connector }
    }

    fn run(&self, output: &Output, state: &OutputState, test_only: bool) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let commit = OutputCommit {
            connector: self.connector,
            output,
            state,
        };
        atomic::commit(&inner, &[commit], test_only)
    }

    /// Runs `f` on the connector and the CRTC it uses, or would use if enabled now.
    fn with_crtc<R>(&self, f: impl FnOnce(&mut Connector, Option<&Crtc>) -> R) -> Option<R> {
        let inner = self.inner.upgrade()?;
        let mut connectors = inner.connectors.borrow_mut();
        let crtcs = inner.crtcs.borrow();

        let connector = connectors.iter_mut().find(|c| c.id == self.connector)?;
        let crtc = match connector.crtc {
            Some(idx) => Some(&crtcs[idx]),
            None => crtcs
                .iter()
                .find(|c| c.is_free() && connector.possible_crtcs.contains(&c.id)),
        };
        Some(f(connector, crtc))
    }
}

impl OutputImpl for DrmOutput {
    fn test(&self, output: &Output, state: &OutputState) -> bool {
        self.run(output, state, true)
    }

    fn commit(&self, output: &Output, state: &OutputState) -> bool {
        self.run(output, state, false)
    }

    fn gamma_size(&self, _output: &Output) -> usize {
        self.with_crtc(|_, crtc| crtc.map_or(0, Crtc::gamma_size))
            .unwrap_or(0)
    }

    fn set_cursor(&self, _output: &Output, buffer: Option<Rc<Buffer>>, hotspot: (i32, i32)) -> bool {
        self.with_crtc(|connector, crtc| {
            if !crtc.is_some_and(|c| c.cursor.is_some()) {
                return false;
            }
            let cursor = &mut connector.cursor;
            cursor.buffer = buffer;
            cursor.hotspot = hotspot;
            cursor.dirty = true;
            true
        })
        .unwrap_or(false)
    }

    fn move_cursor(&self, _output: &Output, x: i32, y: i32) -> bool {
        self.with_crtc(|connector, crtc| {
            if !crtc.is_some_and(|c| c.cursor.is_some()) {
                return false;
            }
            let cursor = &mut connector.cursor;
            if (cursor.x, cursor.y) != (x, y) {
                cursor.x = x;
                cursor.y = y;
                cursor.dirty = true;
            }
            true
        })
        .unwrap_or(false)
    }
}
