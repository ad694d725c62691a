pub mod signal;

pub use signal::{Signal, Subscription};

use std::cell::RefCell;
use std::time::Duration;

/// How long blocking waits on the event loop may take before giving up.
pub const BLOCKING_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid timespec and CLOCK_MONOTONIC is always available.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Runs a cleanup closure unless disarmed.
///
/// Used to unwind partially-constructed objects: every registration pushes its undo step and the
/// guard is disarmed once construction succeeds.
pub struct Unwind {
    steps: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Unwind {
    pub fn new() -> Self {
        Self {
            steps: RefCell::new(Vec::new()),
        }
    }

    pub fn push(&self, step: impl FnOnce() + 'static) {
        self.steps.borrow_mut().push(Box::new(step));
    }

    pub fn disarm(self) {
        self.steps.borrow_mut().clear();
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        let steps = std::mem::take(&mut *self.steps.borrow_mut());
        for step in steps.into_iter().rev() {
            step();
        }
    }
}
