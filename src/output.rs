//! Outputs exposed by backends and the state committed to them.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
pub use smithay::reexports::drm::control::Mode;

use crate::backend::BackendId;
use crate::buffer::{Buffer, Rect, SyncPoint};
use crate::utils::Signal;

bitflags! {
    /// Which fields of an [`OutputState`] carry a requested change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateFields: u32 {
        const BUFFER = 1 << 0;
        const DAMAGE = 1 << 1;
        const MODE = 1 << 2;
        const ENABLED = 1 << 3;
        const ADAPTIVE_SYNC = 1 << 4;
        const GAMMA_LUT = 1 << 5;
        const WAIT_TIMELINE = 1 << 6;
        const SIGNAL_TIMELINE = 1 << 7;
        const CONTENT_TYPE = 1 << 8;
    }
}

/// Kind of content shown on an output, forwarded to the sink when supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    None,
    Graphics,
    Photo,
    Video,
    Game,
}

impl ContentType {
    /// Name of the matching value of the connector `content type` property.
    pub fn kernel_name(self) -> &'static str {
        match self {
            ContentType::None => "No Data",
            ContentType::Graphics => "Graphics",
            ContentType::Photo => "Photo",
            ContentType::Video => "Cinema",
            ContentType::Game => "Game",
        }
    }
}

/// A set of changes to apply to an output atomically.
#[derive(Debug, Clone, Default)]
pub struct OutputState {
    pub committed: StateFields,
    pub enabled: bool,
    pub mode: Option<Mode>,
    pub buffer: Option<Rc<Buffer>>,
    pub damage: Vec<Rect>,
    pub adaptive_sync: bool,
    /// Gamma ramp laid out as all red values, then green, then blue. `None` resets the ramp.
    pub gamma_lut: Option<Vec<u16>>,
    pub wait_timeline: Option<SyncPoint>,
    pub signal_timeline: Option<SyncPoint>,
    pub content_type: ContentType,
    /// Wait for the commit to complete instead of returning once it is queued.
    pub blocking: bool,
}

impl OutputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.committed |= StateFields::ENABLED;
        self.enabled = enabled;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.committed |= StateFields::MODE;
        self.mode = Some(mode);
    }

    pub fn set_buffer(&mut self, buffer: Rc<Buffer>) {
        self.committed |= StateFields::BUFFER;
        self.buffer = Some(buffer);
    }

    pub fn set_damage(&mut self, damage: Vec<Rect>) {
        self.committed |= StateFields::DAMAGE;
        self.damage = damage;
    }

    pub fn set_adaptive_sync(&mut self, enabled: bool) {
        self.committed |= StateFields::ADAPTIVE_SYNC;
        self.adaptive_sync = enabled;
    }

    pub fn set_gamma_lut(&mut self, lut: Option<Vec<u16>>) {
        self.committed |= StateFields::GAMMA_LUT;
        self.gamma_lut = lut;
    }

    pub fn set_wait_timeline(&mut self, point: SyncPoint) {
        self.committed |= StateFields::WAIT_TIMELINE;
        self.wait_timeline = Some(point);
    }

    pub fn set_signal_timeline(&mut self, point: SyncPoint) {
        self.committed |= StateFields::SIGNAL_TIMELINE;
        self.signal_timeline = Some(point);
    }

    pub fn set_content_type(&mut self, content_type: ContentType) {
        self.committed |= StateFields::CONTENT_TYPE;
        self.content_type = content_type;
    }

    pub fn has(&self, fields: StateFields) -> bool {
        self.committed.intersects(fields)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresentFlags: u32 {
        const VSYNC = 1 << 0;
        const HW_CLOCK = 1 << 1;
        const HW_COMPLETION = 1 << 2;
        const ZERO_COPY = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentEvent {
    /// Sequence number of the commit this event refers to.
    pub commit_seq: u64,
    /// Whether the frame reached the screen. `false` when the commit was discarded.
    pub presented: bool,
    /// Time of presentation on the monotonic clock.
    pub when: Option<Duration>,
    /// Hardware vblank counter.
    pub seq: u64,
    pub refresh: Option<Duration>,
    pub flags: PresentFlags,
}

/// Static description of an output.
#[derive(Debug, Clone, Default)]
pub struct OutputInfo {
    pub name: String,
    pub description: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    /// Physical size in millimeters.
    pub physical_size: (u32, u32),
    pub modes: Vec<Mode>,
    pub preferred_mode: Option<Mode>,
    pub non_desktop: bool,
    pub adaptive_sync_supported: bool,
}

/// Backend-side implementation of an output.
pub trait OutputImpl {
    fn test(&self, output: &Output, state: &OutputState) -> bool;

    /// Applies `state`. On success the implementation records it with
    /// [`Output::apply_committed`].
    fn commit(&self, output: &Output, state: &OutputState) -> bool;

    /// Number of entries per color channel of the gamma ramp, 0 if unsupported.
    fn gamma_size(&self, _output: &Output) -> usize {
        0
    }

    fn set_cursor(&self, _output: &Output, _buffer: Option<Rc<Buffer>>, _hotspot: (i32, i32)) -> bool {
        false
    }

    fn move_cursor(&self, _output: &Output, _x: i32, _y: i32) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
struct CurrentState {
    enabled: bool,
    mode: Option<Mode>,
    adaptive_sync: bool,
    content_type: ContentType,
}

pub struct OutputEvents {
    pub present: Signal<PresentEvent>,
    pub destroy: Signal<()>,
}

struct Inner {
    info: OutputInfo,
    backend: BackendId,
    imp: Box<dyn OutputImpl>,
    current: RefCell<CurrentState>,
    commit_seq: Cell<u64>,
    destroyed: Cell<bool>,
    events: OutputEvents,
}

/// Shared handle to an output.
#[derive(Clone)]
pub struct Output {
    inner: Rc<Inner>,
}

impl Output {
    pub fn new(info: OutputInfo, backend: BackendId, imp: Box<dyn OutputImpl>) -> Self {
        Self {
            inner: Rc::new(Inner {
                info,
                backend,
                imp,
                current: RefCell::new(CurrentState::default()),
                commit_seq: Cell::new(0),
                destroyed: Cell::new(false),
                events: OutputEvents {
                    present: Signal::new(),
                    destroy: Signal::new(),
                },
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn info(&self) -> &OutputInfo {
        &self.inner.info
    }

    pub fn backend(&self) -> BackendId {
        self.inner.backend
    }

    pub fn events(&self) -> &OutputEvents {
        &self.inner.events
    }

    pub fn ptr_eq(&self, other: &Output) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.current.borrow().enabled
    }

    pub fn current_mode(&self) -> Option<Mode> {
        self.inner.current.borrow().mode
    }

    pub fn adaptive_sync(&self) -> bool {
        self.inner.current.borrow().adaptive_sync
    }

    pub fn content_type(&self) -> ContentType {
        self.inner.current.borrow().content_type
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Sequence number of the last successful commit.
    pub fn commit_seq(&self) -> u64 {
        self.inner.commit_seq.get()
    }

    pub fn gamma_size(&self) -> usize {
        self.inner.imp.gamma_size(self)
    }

    pub fn test(&self, state: &OutputState) -> bool {
        if !self.check_state(state) {
            return false;
        }
        self.inner.imp.test(self, state)
    }

    pub fn commit(&self, state: &OutputState) -> bool {
        let _span = tracy_client::span!("Output::commit");

        if !self.check_state(state) {
            return false;
        }
        self.inner.imp.commit(self, state)
    }

    pub fn set_cursor(&self, buffer: Option<Rc<Buffer>>, hotspot: (i32, i32)) -> bool {
        !self.is_destroyed() && self.inner.imp.set_cursor(self, buffer, hotspot)
    }

    pub fn move_cursor(&self, x: i32, y: i32) -> bool {
        !self.is_destroyed() && self.inner.imp.move_cursor(self, x, y)
    }

    /// Mode the output would use if `state` were committed.
    pub fn pending_mode(&self, state: &OutputState) -> Option<Mode> {
        if state.has(StateFields::MODE) {
            state.mode
        } else {
            self.current_mode()
        }
    }

    /// Whether the output would be enabled if `state` were committed.
    pub fn pending_enabled(&self, state: &OutputState) -> bool {
        if state.has(StateFields::ENABLED) {
            state.enabled
        } else {
            self.is_enabled()
        }
    }

    pub(crate) fn check_state(&self, state: &OutputState) -> bool {
        if self.is_destroyed() {
            debug!("{}: rejecting state for a destroyed output", self.name());
            return false;
        }

        let enabled = self.pending_enabled(state);
        if enabled && self.pending_mode(state).is_none() {
            debug!("{}: cannot enable an output without a mode", self.name());
            return false;
        }
        if !enabled && state.has(StateFields::BUFFER) {
            debug!("{}: cannot attach a buffer to a disabled output", self.name());
            return false;
        }
        if state.has(StateFields::DAMAGE) && !state.has(StateFields::BUFFER) {
            debug!("{}: damage without a buffer", self.name());
            return false;
        }

        true
    }

    /// Records a successfully committed state. Returns the new commit sequence number.
    pub(crate) fn apply_committed(&self, state: &OutputState) -> u64 {
        {
            let mut current = self.inner.current.borrow_mut();
            if state.has(StateFields::ENABLED) {
                current.enabled = state.enabled;
            }
            if state.has(StateFields::MODE) {
                current.mode = state.mode;
            }
            if state.has(StateFields::ADAPTIVE_SYNC) {
                current.adaptive_sync = state.adaptive_sync;
            }
            if state.has(StateFields::CONTENT_TYPE) {
                current.content_type = state.content_type;
            }
            if !current.enabled {
                current.adaptive_sync = false;
            }
        }

        let seq = self.inner.commit_seq.get() + 1;
        self.inner.commit_seq.set(seq);
        seq
    }

    pub(crate) fn present(&self, event: PresentEvent) {
        self.inner.events.present.emit(&event);
    }

    /// Marks the output gone and notifies listeners. Further commits fail.
    pub(crate) fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        debug!("{}: output destroyed", self.name());
        self.inner.events.destroy.emit(&());
        self.inner.events.present.clear();
        self.inner.events.destroy.clear();
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.inner.info.name)
            .field("current", &self.inner.current.borrow())
            .finish_non_exhaustive()
    }
}
