//! Backends: sources of outputs and input devices.
//!
//! Every backend implements [`Backend`]. Several backends are combined through
//! [`multi::MultiBackend`], and [`autocreate`] picks a set according to the configuration.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context};
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::calloop::EventLoop;

use crate::buffer::BufferCaps;
use crate::config::{BackendKind, Config};
use crate::output::{Output, OutputState};
use crate::render::gbm::GbmGpuFactory;
use crate::render::mgpu::MgpuRegistry;
use crate::utils::Signal;

pub mod drm;
pub mod headless;
pub mod libinput;
pub mod multi;
pub mod session;

pub use self::drm::DrmBackend;
pub use self::headless::HeadlessBackend;
pub use self::libinput::LibinputBackend;
pub use self::multi::MultiBackend;
pub use self::session::{DeviceSession, SeatSession, SessionDevice};

/// Most GPUs opened by [`autocreate`].
const MAX_GPUS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(u64);

impl BackendId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Notifications every backend emits.
pub struct BackendEvents {
    pub new_output: Signal<Output>,
    pub new_input: Signal<InputDevice>,
    /// Emitted once, at the start of [`Backend::destroy`].
    pub destroy: Signal<()>,
}

impl BackendEvents {
    pub fn new() -> Self {
        Self {
            new_output: Signal::new(),
            new_input: Signal::new(),
            destroy: Signal::new(),
        }
    }

    pub(crate) fn clear(&self) {
        self.new_output.clear();
        self.new_input.clear();
        self.destroy.clear();
    }
}

/// Per-output state in a multi-output test or commit.
pub struct OutputCommit<'a> {
    pub output: &'a Output,
    pub state: &'a OutputState,
}

pub trait Backend {
    fn id(&self) -> BackendId;

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Activates the backend. New outputs and input devices are announced from here on.
    fn start(&self) -> anyhow::Result<()>;

    /// Tears the backend down. Emits `destroy` before anything else happens. Idempotent.
    fn destroy(&self);

    /// DRM device of the primary GPU, if the backend has one.
    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        None
    }

    fn buffer_caps(&self) -> BufferCaps;

    fn events(&self) -> &BackendEvents;

    /// Checks whether the states could be committed together.
    fn test(&self, states: &[OutputCommit<'_>]) -> bool {
        states.iter().all(|c| c.output.test(c.state))
    }

    /// Commits the states. Backends that can apply them atomically do so.
    fn commit(&self, states: &[OutputCommit<'_>]) -> bool {
        states.iter().all(|c| c.output.commit(c.state))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputCapabilities {
    pub keyboard: bool,
    pub pointer: bool,
    pub touch: bool,
    pub tablet_tool: bool,
    pub tablet_pad: bool,
    pub switch: bool,
    pub gesture: bool,
}

struct InputDeviceInner {
    name: String,
    sysname: String,
    vendor: u32,
    product: u32,
    capabilities: InputCapabilities,
    destroy: Signal<()>,
}

/// Shared handle to an input device.
#[derive(Clone)]
pub struct InputDevice {
    inner: Rc<InputDeviceInner>,
}

impl InputDevice {
    pub fn new(
        name: String,
        sysname: String,
        vendor: u32,
        product: u32,
        capabilities: InputCapabilities,
    ) -> Self {
        Self {
            inner: Rc::new(InputDeviceInner {
                name,
                sysname,
                vendor,
                product,
                capabilities,
                destroy: Signal::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sysname(&self) -> &str {
        &self.inner.sysname
    }

    pub fn vendor(&self) -> u32 {
        self.inner.vendor
    }

    pub fn product(&self) -> u32 {
        self.inner.product
    }

    pub fn capabilities(&self) -> InputCapabilities {
        self.inner.capabilities
    }

    pub fn destroy_signal(&self) -> &Signal<()> {
        &self.inner.destroy
    }

    pub(crate) fn destroy(&self) {
        self.inner.destroy.emit(&());
        self.inner.destroy.clear();
    }
}

impl fmt::Debug for InputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDevice")
            .field("name", &self.inner.name)
            .field("sysname", &self.inner.sysname)
            .finish_non_exhaustive()
    }
}

/// Creates the backends selected by `config`.
///
/// With an explicit backend list every named backend is created in order. Otherwise the backend
/// runs on a seat: a session, libinput, and one DRM backend per GPU. The first GPU is the primary
/// one; the others scan out buffers copied over through the multi-GPU registry.
///
/// `KILN_*` variables from the process environment override `config`.
pub fn autocreate<D: 'static>(
    config: &Config,
    event_loop: &mut EventLoop<'static, D>,
    data: &mut D,
) -> anyhow::Result<Rc<MultiBackend>> {
    autocreate_with_env(config, |name| std::env::var(name).ok(), event_loop, data)
}

fn autocreate_with_env<D: 'static>(
    config: &Config,
    var: impl Fn(&str) -> Option<String>,
    event_loop: &mut EventLoop<'static, D>,
    data: &mut D,
) -> anyhow::Result<Rc<MultiBackend>> {
    let _span = tracy_client::span!("backend::autocreate");

    let mut config = config.clone();
    config.apply_env(var);
    let config = &config;

    let multi = Rc::new(MultiBackend::new());
    let session: RefCell<Option<Rc<SeatSession>>> = RefCell::new(None);
    let get_session = |event_loop: &mut EventLoop<'static, D>, data: &mut D| {
        if let Some(session) = &*session.borrow() {
            return Ok::<_, anyhow::Error>(session.clone());
        }
        let new = SeatSession::new(config, event_loop, data).context("error creating a session")?;
        *session.borrow_mut() = Some(new.clone());
        Ok(new)
    };

    let kinds = if config.backends.is_empty() {
        debug!("no backends configured, running on a seat");
        vec![BackendKind::Libinput, BackendKind::Drm]
    } else {
        config.backends.clone()
    };

    for kind in kinds {
        match kind {
            BackendKind::Headless => {
                let count = config.headless_outputs.unwrap_or(1);
                let backend = HeadlessBackend::new(count as usize);
                multi.add(Rc::new(backend));
            }
            BackendKind::Libinput => {
                let session = get_session(event_loop, data)?;
                let backend = LibinputBackend::new(
                    &session,
                    &event_loop.handle(),
                    config.debug.libinput_allow_no_devices,
                )
                .context("error creating the libinput backend")?;
                multi.add(Rc::new(backend));
            }
            BackendKind::Drm => {
                let session = get_session(event_loop, data)?;
                attach_drm_backends(config, &multi, session, event_loop, data)?;
            }
            BackendKind::Wayland | BackendKind::X11 => {
                bail!("the {kind} backend is not available in this build");
            }
        }
    }

    Ok(multi)
}

fn attach_drm_backends<D: 'static>(
    config: &Config,
    multi: &MultiBackend,
    session: Rc<SeatSession>,
    event_loop: &mut EventLoop<'static, D>,
    data: &mut D,
) -> anyhow::Result<()> {
    let gpus = session
        .wait_for_gpus(MAX_GPUS, event_loop, data)
        .context("error finding GPUs")?;
    let Some((primary_gpu, secondary_gpus)) = gpus.split_first() else {
        bail!("found no GPUs");
    };

    let options = drm::DrmOptions {
        disable_cursor_plane: config.debug.disable_cursor_plane,
    };
    let handle = event_loop.handle();
    let session: Rc<dyn DeviceSession> = session;

    let primary = DrmBackend::new(
        session.clone(),
        primary_gpu.clone(),
        None,
        &handle,
        options.clone(),
    )
    .with_context(|| format!("error creating a DRM backend for {:?}", primary_gpu.path()))?;
    info!("using {:?} as the primary GPU", primary_gpu.path());
    multi.add(Rc::new(primary.clone()));

    if secondary_gpus.is_empty() {
        return Ok(());
    }

    let registry = match MgpuRegistry::new(&GbmGpuFactory, secondary_gpus) {
        Ok(registry) => Rc::new(registry),
        Err(err) => {
            warn!("error creating the multi-GPU registry, ignoring secondary GPUs: {err:?}");
            return Ok(());
        }
    };

    for gpu in secondary_gpus {
        let Some(blitter) = registry.blitter_for(gpu) else {
            warn!("no renderer for secondary GPU {:?}", gpu.path());
            session.close(gpu);
            continue;
        };

        match DrmBackend::new(
            session.clone(),
            gpu.clone(),
            Some((&primary, blitter)),
            &handle,
            options.clone(),
        ) {
            Ok(backend) => multi.add(Rc::new(backend)),
            Err(err) => warn!("error creating a DRM backend for {:?}: {err:?}", gpu.path()),
        }
    }

    Ok(())
}
