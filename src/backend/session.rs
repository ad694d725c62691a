//! Privileged device access through the seat session.

use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, bail, ensure, Context};
use libc::dev_t;
use smithay::backend::drm::{DrmNode, NodeType};
use smithay::backend::session::libseat::LibSeatSession;
use smithay::backend::session::{Event as SessionEvent, Session};
use smithay::backend::udev::{self, UdevBackend, UdevEvent};
use smithay::reexports::calloop::{EventLoop, LoopHandle};
use smithay::reexports::udev::{Device as UdevDevice, DeviceType};
use smithay::reexports::rustix::fs::OFlags;

use crate::config::Config;
use crate::utils::{Signal, BLOCKING_WAIT_TIMEOUT};

/// What changed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    /// Connectors may have been plugged or unplugged.
    Hotplug,
    /// A lease on the device was created or revoked.
    Lease,
}

pub struct DeviceEvents {
    pub change: Signal<DeviceChange>,
    pub remove: Signal<()>,
}

struct DeviceInner {
    fd: RefCell<Option<OwnedFd>>,
    dev_id: dev_t,
    path: PathBuf,
    events: DeviceEvents,
}

/// A device opened through a [`DeviceSession`]. Must be closed through the same session.
#[derive(Clone)]
pub struct SessionDevice {
    inner: Rc<DeviceInner>,
}

impl SessionDevice {
    pub fn new(fd: OwnedFd, dev_id: dev_t, path: PathBuf) -> Self {
        Self {
            inner: Rc::new(DeviceInner {
                fd: RefCell::new(Some(fd)),
                dev_id,
                path,
                events: DeviceEvents {
                    change: Signal::new(),
                    remove: Signal::new(),
                },
            }),
        }
    }

    pub fn dev_id(&self) -> dev_t {
        self.inner.dev_id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn events(&self) -> &DeviceEvents {
        &self.inner.events
    }

    pub fn is_open(&self) -> bool {
        self.inner.fd.borrow().is_some()
    }

    /// Duplicates the device descriptor.
    pub fn dup_fd(&self) -> io::Result<OwnedFd> {
        match &*self.inner.fd.borrow() {
            Some(fd) => fd.as_fd().try_clone_to_owned(),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    pub fn with_fd<R>(&self, f: impl FnOnce(Option<BorrowedFd<'_>>) -> R) -> R {
        f(self.inner.fd.borrow().as_ref().map(|fd| fd.as_fd()))
    }

    pub(crate) fn take_fd(&self) -> Option<OwnedFd> {
        self.inner.fd.borrow_mut().take()
    }

    pub fn ptr_eq(&self, other: &SessionDevice) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SessionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDevice")
            .field("path", &self.inner.path)
            .field("dev_id", &self.inner.dev_id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Privileged session the backends get their devices from.
pub trait DeviceSession {
    fn seat(&self) -> String;

    fn is_active(&self) -> bool;

    /// Emitted with the new activity state whenever the session is paused or resumed.
    fn active_changed(&self) -> &Signal<bool>;

    fn open(&self, path: &Path) -> anyhow::Result<SessionDevice>;

    fn close(&self, device: &SessionDevice);

    /// Opens up to `max` KMS-capable GPUs, the primary one first.
    fn find_gpus(&self, max: usize) -> anyhow::Result<Vec<SessionDevice>>;
}

/// [`DeviceSession`] backed by libseat and udev.
pub struct SeatSession {
    session: RefCell<LibSeatSession>,
    seat: String,
    active_changed: Signal<bool>,
    devices: RefCell<Vec<SessionDevice>>,
    gpu_added: Cell<bool>,
    explicit_gpus: Vec<PathBuf>,
    ignored_gpus: Vec<PathBuf>,
    render_device: Option<PathBuf>,
    remove_sources: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl SeatSession {
    /// Opens the session and waits for it to become active.
    pub fn new<D: 'static>(
        config: &Config,
        event_loop: &mut EventLoop<'static, D>,
        data: &mut D,
    ) -> anyhow::Result<Rc<Self>> {
        let _span = tracy_client::span!("SeatSession::new");

        let (session, notifier) = LibSeatSession::new().context(
            "error creating a session; this might mean that another program is already \
             running on this TTY",
        )?;
        let seat = session.seat();
        let udev = UdevBackend::new(&seat).context("error creating a udev backend")?;

        let this = Rc::new(Self {
            session: RefCell::new(session),
            seat,
            active_changed: Signal::new(),
            devices: RefCell::new(Vec::new()),
            gpu_added: Cell::new(false),
            explicit_gpus: config.debug.drm_devices.clone(),
            ignored_gpus: config.debug.ignored_drm_devices.clone(),
            render_device: config.debug.render_drm_device.clone(),
            remove_sources: RefCell::new(None),
        });

        let handle = event_loop.handle();
        this.register_sources(&handle, notifier, udev)?;

        let deadline = Instant::now() + BLOCKING_WAIT_TIMEOUT;
        while !this.is_active() {
            let now = Instant::now();
            ensure!(
                now < deadline,
                "timed out waiting for the session to become active"
            );
            event_loop
                .dispatch(Some(deadline - now), data)
                .context("error dispatching the event loop")?;
        }

        info!("session active on seat {}", this.seat);
        Ok(this)
    }

    fn register_sources<D: 'static>(
        self: &Rc<Self>,
        handle: &LoopHandle<'static, D>,
        notifier: smithay::backend::session::libseat::LibSeatSessionNotifier,
        udev: UdevBackend,
    ) -> anyhow::Result<()> {
        let weak = Rc::downgrade(self);
        let notifier_token = handle
            .insert_source(notifier, move |event, _, _| {
                if let Some(this) = weak.upgrade() {
                    this.on_session_event(event);
                }
            })
            .map_err(|err| anyhow!("error inserting the session notifier: {}", err.error))?;

        let weak = Rc::downgrade(self);
        let udev_token = handle
            .insert_source(udev, move |event, _, _| {
                if let Some(this) = weak.upgrade() {
                    this.on_udev_event(event);
                }
            })
            .map_err(|err| {
                handle.remove(notifier_token);
                anyhow!("error inserting the udev source: {}", err.error)
            })?;

        let handle = handle.clone();
        *self.remove_sources.borrow_mut() = Some(Box::new(move || {
            handle.remove(notifier_token);
            handle.remove(udev_token);
        }));
        Ok(())
    }

    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::PauseSession => {
                debug!("pausing session");
                self.active_changed.emit(&false);
            }
            SessionEvent::ActivateSession => {
                debug!("resuming session");
                self.active_changed.emit(&true);
            }
        }
    }

    fn on_udev_event(&self, event: UdevEvent) {
        match event {
            UdevEvent::Added { device_id, path } => {
                if is_card(&path) {
                    debug!("GPU added: {device_id} {path:?}");
                    self.gpu_added.set(true);
                }
            }
            UdevEvent::Changed { device_id } => {
                if let Some(device) = self.device(device_id) {
                    let change = change_kind(device_id);
                    trace!("device changed: {device_id} {change:?}");
                    device.events().change.emit(&change);
                }
            }
            UdevEvent::Removed { device_id } => {
                if let Some(device) = self.device(device_id) {
                    debug!("device removed: {device_id}");
                    device.events().remove.emit(&());
                }
            }
        }
    }

    /// The underlying libseat session, for consumers such as libinput.
    pub fn libseat(&self) -> LibSeatSession {
        self.session.borrow().clone()
    }

    fn device(&self, dev_id: dev_t) -> Option<SessionDevice> {
        self.devices
            .borrow()
            .iter()
            .find(|device| device.dev_id() == dev_id)
            .cloned()
    }

    /// Like [`DeviceSession::find_gpus`], but waits for a GPU to show up if there is none yet.
    pub fn wait_for_gpus<D: 'static>(
        &self,
        max: usize,
        event_loop: &mut EventLoop<'static, D>,
        data: &mut D,
    ) -> anyhow::Result<Vec<SessionDevice>> {
        let gpus = self.find_gpus(max)?;
        if !gpus.is_empty() {
            return Ok(gpus);
        }

        info!("no GPU found, waiting for one to appear");
        self.gpu_added.set(false);
        let deadline = Instant::now() + BLOCKING_WAIT_TIMEOUT;
        while !self.gpu_added.get() {
            let now = Instant::now();
            if now >= deadline {
                bail!("timed out waiting for a GPU");
            }
            event_loop
                .dispatch(Some(deadline - now), data)
                .context("error dispatching the event loop")?;
        }

        self.find_gpus(max)
    }

    /// Candidate GPU paths in preference order.
    fn gpu_paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.explicit_gpus.is_empty() {
            return Ok(self.explicit_gpus.clone());
        }

        let mut paths = Vec::new();
        if let Some(path) = self.render_device.as_deref().and_then(primary_path_for_render) {
            debug!("preferring {path:?} from the configured render device");
            paths.push(path);
        }
        match udev::primary_gpu(&self.seat) {
            Ok(Some(path)) => paths.push(path),
            Ok(None) => debug!("no primary GPU reported by udev"),
            Err(err) => warn!("error getting the primary GPU: {err:?}"),
        }
        paths.extend(udev::all_gpus(&self.seat).context("error enumerating GPUs")?);

        let mut seen = Vec::new();
        paths.retain(|path| {
            if seen.contains(path) || self.ignored_gpus.contains(path) {
                return false;
            }
            seen.push(path.clone());
            true
        });
        Ok(paths)
    }
}

impl DeviceSession for SeatSession {
    fn seat(&self) -> String {
        self.seat.clone()
    }

    fn is_active(&self) -> bool {
        self.session.borrow().is_active()
    }

    fn active_changed(&self) -> &Signal<bool> {
        &self.active_changed
    }

    fn open(&self, path: &Path) -> anyhow::Result<SessionDevice> {
        let _span = tracy_client::span!("SeatSession::open");

        let metadata = std::fs::metadata(path).with_context(|| format!("error stating {path:?}"))?;
        let dev_id = metadata.rdev() as dev_t;
        if let Some(device) = self.device(dev_id) {
            return Ok(device);
        }

        let open_flags = OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK;
        let fd = self
            .session
            .borrow_mut()
            .open(path, open_flags)
            .with_context(|| format!("error opening {path:?}"))?;

        let device = SessionDevice::new(fd, dev_id, path.to_owned());
        self.devices.borrow_mut().push(device.clone());
        Ok(device)
    }

    fn close(&self, device: &SessionDevice) {
        self.devices.borrow_mut().retain(|d| !d.ptr_eq(device));

        let Some(fd) = device.take_fd() else {
            return;
        };
        if let Err(err) = self.session.borrow_mut().close(fd) {
            warn!("error closing {:?}: {err:?}", device.path());
        }
    }

    fn find_gpus(&self, max: usize) -> anyhow::Result<Vec<SessionDevice>> {
        let explicit = !self.explicit_gpus.is_empty();
        let mut gpus = Vec::new();

        for path in self.gpu_paths()? {
            if gpus.len() == max {
                break;
            }

            match self.open(&path) {
                Ok(device) => {
                    debug!("opened GPU {path:?}");
                    gpus.push(device);
                }
                // An explicitly listed device must be usable.
                Err(err) if explicit => {
                    for gpu in &gpus {
                        self.close(gpu);
                    }
                    return Err(err);
                }
                Err(err) => warn!("skipping GPU {path:?}: {err:?}"),
            }
        }

        Ok(gpus)
    }
}

impl Drop for SeatSession {
    fn drop(&mut self) {
        if let Some(remove) = self.remove_sources.get_mut().take() {
            remove();
        }
    }
}

/// Reads the kind of a DRM change uevent from the udev properties of the device.
fn change_kind(dev_id: dev_t) -> DeviceChange {
    match UdevDevice::from_devnum(DeviceType::Character, dev_id) {
        Ok(device) => classify_change(device.property_value("LEASE")),
        Err(err) => {
            debug!("error looking up udev device {dev_id}: {err:?}");
            DeviceChange::Hotplug
        }
    }
}

/// The kernel sets `LEASE=1` on change events caused by lease creation or revocation.
fn classify_change(lease: Option<&OsStr>) -> DeviceChange {
    match lease {
        Some(value) if value == "1" => DeviceChange::Lease,
        _ => DeviceChange::Hotplug,
    }
}

fn is_card(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("card"))
}

/// Finds the primary node belonging to a render node path.
fn primary_path_for_render(path: &Path) -> Option<PathBuf> {
    let node = match DrmNode::from_path(path) {
        Ok(node) => node,
        Err(err) => {
            warn!("error opening {path:?} as DRM node: {err:?}");
            return None;
        }
    };

    let primary = if node.ty() == NodeType::Primary {
        node
    } else {
        match node.node_with_type(NodeType::Primary) {
            Some(Ok(primary)) => primary,
            Some(Err(err)) => {
                warn!("error opening primary node for render node {path:?}: {err:?}");
                return None;
            }
            None => {
                warn!("no primary node for render node {path:?}");
                return None;
            }
        }
    };

    primary.dev_path()
}
