//! Observer registry used for backend, output and device notifications.
//!
//! A [`Signal`] holds a list of listeners. Connecting returns a [`Subscription`] which detaches the
//! listener when dropped, so listener lifetimes follow whoever owns the subscription.
//!
//! Emission works on a snapshot of the listener list. Listeners may connect or disconnect (including
//! themselves) while a signal is being emitted: newly connected listeners are not called for the
//! current emission, and disconnected ones are skipped if they have not run yet.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

type Listener<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Inner<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

pub struct Signal<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Adds a listener, returning the handle that keeps it connected.
    #[must_use = "the listener is disconnected when the subscription is dropped"]
    pub fn connect(&self, listener: impl FnMut(&T) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .listeners
            .push((id, Rc::new(RefCell::new(listener)) as Listener<T>));

        let weak = Rc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || disconnect(&weak, id))),
        }
    }

    pub fn emit(&self, value: &T) {
        let snapshot = self.inner.borrow().listeners.clone();

        for (id, listener) in snapshot {
            let connected = self
                .inner
                .borrow()
                .listeners
                .iter()
                .any(|(other, _)| *other == id);
            if !connected {
                continue;
            }

            // A listener that re-emits the same signal does not get called recursively.
            let Ok(mut listener) = listener.try_borrow_mut() else {
                continue;
            };
            (&mut *listener)(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    /// Removes every listener. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        let listeners = std::mem::take(&mut self.inner.borrow_mut().listeners);
        drop(listeners);
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.inner.borrow().listeners.len())
            .finish()
    }
}

fn disconnect<T>(inner: &Weak<RefCell<Inner<T>>>, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    // Take the listener out first so that its captures are dropped without the borrow held.
    let removed = {
        let mut inner = inner.borrow_mut();
        inner
            .listeners
            .iter()
            .position(|(other, _)| *other == id)
            .map(|idx| inner.listeners.remove(idx))
    };
    drop(removed);
}

/// Keeps a listener connected to a [`Signal`].
pub struct Subscription {
    detach: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Keeps the listener connected for as long as the signal lives.
    pub fn forget(mut self) {
        self.detach = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.detach.is_some())
            .finish()
    }
}
