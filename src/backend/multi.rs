//! Aggregation of several backends behind one [`Backend`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Context;
use smithay::backend::drm::DrmDeviceFd;

use super::{Backend, BackendEvents, BackendId, OutputCommit};
use crate::buffer::BufferCaps;
use crate::utils::Subscription;

struct SubBackend {
    backend: Rc<dyn Backend>,
    _subscriptions: Vec<Subscription>,
}

struct Inner {
    id: BackendId,
    events: BackendEvents,
    backends: RefCell<Vec<SubBackend>>,
    destroying: Cell<bool>,
}

/// Ordered set of sub-backends acting as one.
///
/// New outputs and input devices of every sub-backend are re-emitted on the multi-backend, and a
/// sub-backend is removed as soon as it is destroyed.
pub struct MultiBackend {
    inner: Rc<Inner>,
}

impl MultiBackend {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                id: BackendId::next(),
                events: BackendEvents::new(),
                backends: RefCell::new(Vec::new()),
                destroying: Cell::new(false),
            }),
        }
    }

    /// Adds a sub-backend. Adding one that is already present does nothing.
    pub fn add(&self, backend: Rc<dyn Backend>) {
        let id = backend.id();
        if self.contains(id) {
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let events = backend.events();

        let new_output = {
            let weak = weak.clone();
            events.new_output.connect(move |output| {
                if let Some(inner) = weak.upgrade() {
                    inner.events.new_output.emit(output);
                }
            })
        };
        let new_input = {
            let weak = weak.clone();
            events.new_input.connect(move |device| {
                if let Some(inner) = weak.upgrade() {
                    inner.events.new_input.emit(device);
                }
            })
        };
        let destroy = events.destroy.connect(move |()| {
            if let Some(inner) = weak.upgrade() {
                remove(&inner, id);
            }
        });

        debug!("adding the {} backend", backend.name());
        self.inner.backends.borrow_mut().push(SubBackend {
            backend,
            _subscriptions: vec![new_output, new_input, destroy],
        });
    }

    /// Removes a sub-backend without destroying it.
    pub fn remove(&self, backend: &dyn Backend) {
        remove(&self.inner, backend.id());
    }

    pub fn contains(&self, id: BackendId) -> bool {
        self.inner
            .backends
            .borrow()
            .iter()
            .any(|sub| sub.backend.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.backends.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.backends.borrow().len()
    }

    /// Snapshot of the sub-backends, in insertion order.
    pub fn backends(&self) -> Vec<Rc<dyn Backend>> {
        self.inner
            .backends
            .borrow()
            .iter()
            .map(|sub| sub.backend.clone())
            .collect()
    }
}

fn remove(inner: &Inner, id: BackendId) {
    let removed = {
        let mut backends = inner.backends.borrow_mut();
        backends
            .iter()
            .position(|sub| sub.backend.id() == id)
            .map(|idx| backends.remove(idx))
    };
    // Dropped outside of the borrow: dropping the subscriptions may run arbitrary code.
    drop(removed);
}

impl Backend for MultiBackend {
    fn id(&self) -> BackendId {
        self.inner.id
    }

    fn name(&self) -> &str {
        "multi"
    }

    fn start(&self) -> anyhow::Result<()> {
        for backend in self.backends() {
            backend
                .start()
                .with_context(|| format!("error starting the {} backend", backend.name()))?;
        }
        Ok(())
    }

    fn destroy(&self) {
        if self.inner.destroying.replace(true) {
            return;
        }

        self.inner.events.destroy.emit(&());

        // Destroying one sub-backend may destroy others, so always take the current head.
        loop {
            let head = self
                .inner
                .backends
                .borrow()
                .first()
                .map(|sub| sub.backend.clone());
            let Some(head) = head else { break };

            head.destroy();
            remove(&self.inner, head.id());
        }

        self.inner.events.clear();
    }

    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        self.backends()
            .iter()
            .find_map(|backend| backend.drm_fd())
    }

    fn buffer_caps(&self) -> BufferCaps {
        let mut caps = None;
        for backend in self.backends() {
            let sub = backend.buffer_caps();
            if sub.is_empty() {
                continue;
            }
            caps = Some(caps.map_or(sub, |caps: BufferCaps| caps & sub));
        }
        caps.unwrap_or_else(BufferCaps::empty)
    }

    fn events(&self) -> &BackendEvents {
        &self.inner.events
    }

    fn test(&self, states: &[OutputCommit<'_>]) -> bool {
        let backends = self.backends();
        all_claimed(&backends, states)
            && backends.iter().all(|backend| {
                let subset = states_for(states, backend.id());
                subset.is_empty() || backend.test(&subset)
            })
    }

    fn commit(&self, states: &[OutputCommit<'_>]) -> bool {
        let backends = self.backends();
        all_claimed(&backends, states)
            && backends.iter().all(|backend| {
                let subset = states_for(states, backend.id());
                subset.is_empty() || backend.commit(&subset)
            })
    }
}

/// Checks that every state belongs to one of `backends`.
fn all_claimed(backends: &[Rc<dyn Backend>], states: &[OutputCommit<'_>]) -> bool {
    match states
        .iter()
        .find(|c| !backends.iter().any(|b| b.id() == c.output.backend()))
    {
        Some(unclaimed) => {
            debug!("{}: the output belongs to no sub-backend", unclaimed.output.name());
            false
        }
        None => true,
    }
}

fn states_for<'a>(states: &[OutputCommit<'a>], id: BackendId) -> Vec<OutputCommit<'a>> {
    states
        .iter()
        .filter(|c| c.output.backend() == id)
        .map(|c| OutputCommit {
            output: c.output,
            state: c.state,
        })
        .collect()
}
