//! Backend with synthetic outputs and no hardware.
//!
//! Commits always succeed and are presented right away, which makes this backend useful for tests
//! and for running a compositor without a display.

use std::cell::{Cell, RefCell};

use super::{Backend, BackendEvents, BackendId};
use crate::backend::drm::helpers::{calculate_mode_cvt, refresh_interval};
use crate::buffer::BufferCaps;
use crate::output::{Output, OutputImpl, OutputInfo, OutputState, PresentEvent, PresentFlags};
use crate::utils::get_monotonic_time;

const DEFAULT_SIZE: (u16, u16) = (1920, 1080);
const DEFAULT_REFRESH: f64 = 60.;

pub struct HeadlessBackend {
    id: BackendId,
    events: BackendEvents,
    outputs: RefCell<Vec<Output>>,
    started: Cell<bool>,
    destroyed: Cell<bool>,
}

impl HeadlessBackend {
    pub fn new(output_count: usize) -> Self {
        let id = BackendId::next();
        let outputs = (1..=output_count)
            .map(|idx| make_output(id, &format!("HEADLESS-{idx}"), DEFAULT_SIZE))
            .collect();

        Self {
            id,
            events: BackendEvents::new(),
            outputs: RefCell::new(outputs),
            started: Cell::new(false),
            destroyed: Cell::new(false),
        }
    }

    /// Adds an output with a custom size. Announced right away if the backend is started.
    pub fn add_output(&self, width: u16, height: u16) -> Output {
        let name = format!("HEADLESS-{}", self.outputs.borrow().len() + 1);
        let output = make_output(self.id, &name, (width, height));
        self.outputs.borrow_mut().push(output.clone());

        if self.started.get() {
            self.events.new_output.emit(&output);
        }
        output
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.outputs.borrow().clone()
    }
}

fn make_output(backend: BackendId, name: &str, (width, height): (u16, u16)) -> Output {
    let mode = calculate_mode_cvt(width, height, DEFAULT_REFRESH);
    let info = OutputInfo {
        name: name.to_owned(),
        description: format!("Headless output {name}"),
        modes: vec![mode],
        preferred_mode: Some(mode),
        ..Default::default()
    };
    Output::new(info, backend, Box::new(HeadlessOutput))
}

struct HeadlessOutput;

impl OutputImpl for HeadlessOutput {
    fn test(&self, _output: &Output, _state: &OutputState) -> bool {
        true
    }

    fn commit(&self, output: &Output, state: &OutputState) -> bool {
        let commit_seq = output.apply_committed(state);

        if output.is_enabled() {
            let refresh = output.current_mode().map(refresh_interval);
            output.present(PresentEvent {
                commit_seq,
                presented: true,
                when: Some(get_monotonic_time()),
                seq: commit_seq,
                refresh,
                flags: PresentFlags::empty(),
            });
        }

        true
    }
}

impl Backend for HeadlessBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &str {
        "headless"
    }

    fn start(&self) -> anyhow::Result<()> {
        if self.started.replace(true) {
            return Ok(());
        }

        debug!("starting headless backend with {} outputs", self.outputs.borrow().len());
        for output in self.outputs() {
            self.events.new_output.emit(&output);
        }
        Ok(())
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }

        self.events.destroy.emit(&());
        let outputs = std::mem::take(&mut *self.outputs.borrow_mut());
        for output in outputs {
            output.destroy();
        }
        self.events.clear();
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DATA_PTR | BufferCaps::DMABUF | BufferCaps::SHM
    }

    fn events(&self) -> &BackendEvents {
        &self.events
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
