//! DRM/KMS backend: outputs on the connectors of one GPU.
//!
//! The backend owns the CRTC and plane tables of its device and a growable connector table. State
//! reaches the hardware only through atomic commits (see [`atomic`]). Hotplug rescans add and
//! remove outputs without touching the hardware, so a CRTC left powered by an unplugged connector
//! stays on until the next commit claims it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Context};
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::calloop::generic::Generic;
use smithay::reexports::calloop::{Interest, LoopHandle, Mode as CalloopMode, PostAction};
use smithay::utils::DeviceFd;

use self::device::{DrmCard, KmsDevice, ObjectKind};
use self::helpers::{parse_edid, preferred_mode, refresh_interval};
use self::lease::{DrmLease, LeaseInner};
use self::objects::{FbCache, PropertyBlob};
use self::outputs::DrmOutput;
use self::tile::{TileInfo, TileRegistry};
use self::types::{
    Connector, ConnectorProps, CrtcProps, Crtc, PageFlip, Plane, PlaneProps, PlaneType,
    PropertySet, RestoreState,
};
use super::session::DeviceChange;
use super::{Backend, BackendEvents, BackendId, DeviceSession, SessionDevice};
use crate::buffer::BufferCaps;
use crate::output::{Output, OutputInfo, OutputState, PresentEvent, PresentFlags};
use crate::render::mgpu::Blitter;
use crate::utils::{Subscription, Unwind};

pub mod atomic;
pub mod device;
pub mod helpers;
pub mod lease;
pub mod objects;
mod outputs;
pub mod syncobj;
pub mod tile;
pub mod types;

#[cfg(test)]
mod stub;
#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Default)]
pub struct DrmOptions {
    /// Never use cursor planes.
    pub disable_cursor_plane: bool,
}

/// Tiles of the monitor an output belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGroup {
    pub tile: TileInfo,
    /// Every tile of the group is connected.
    pub complete: bool,
    /// Size of the whole monitor in pixels.
    pub size: (u32, u32),
}

pub struct DrmInner {
    id: BackendId,
    /// Device path, used in logs.
    name: String,
    this: Weak<DrmInner>,
    device: Rc<dyn KmsDevice>,
    events: BackendEvents,
    options: DrmOptions,

    crtcs: RefCell<Vec<Crtc>>,
    planes: RefCell<Vec<Plane>>,
    connectors: RefCell<Vec<Connector>>,
    /// Pending page flips by CRTC ID.
    flips: RefCell<HashMap<u32, PageFlip>>,
    fb_cache: FbCache,
    tiles: RefCell<TileRegistry>,
    leases: RefCell<Vec<Weak<LeaseInner>>>,

    /// Copies buffers to this GPU when it is not the one rendering them.
    blitter: Option<Blitter>,
    parent: Option<Weak<DrmInner>>,

    started: Cell<bool>,
    destroyed: Cell<bool>,
    session: Option<(Rc<dyn DeviceSession>, SessionDevice)>,
    subscriptions: RefCell<Vec<Subscription>>,
    remove_source: RefCell<Option<Box<dyn FnOnce()>>>,
}

#[derive(Clone)]
pub struct DrmBackend {
    inner: Rc<DrmInner>,
}

impl DrmBackend {
    /// Creates a backend on a GPU opened through `session`.
    ///
    /// Secondary GPUs pass the backend of the primary GPU along with a blitter copying buffers
    /// into their memory. On failure the device is closed through the session.
    pub fn new<D: 'static>(
        session: Rc<dyn DeviceSession>,
        device: SessionDevice,
        parent: Option<(&DrmBackend, Blitter)>,
        handle: &LoopHandle<'static, D>,
        options: DrmOptions,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("DrmBackend::new");

        let name = device.path().display().to_string();

        let unwind = Unwind::new();
        {
            let session = session.clone();
            let device = device.clone();
            unwind.push(move || session.close(&device));
        }

        let fd = device
            .dup_fd()
            .context("error duplicating the device descriptor")?;
        let fd = DrmDeviceFd::new(DeviceFd::from(fd));
        let card: Rc<dyn KmsDevice> = Rc::new(DrmCard::new(fd.clone()));

        let (parent, blitter) = match parent {
            Some((parent, blitter)) => {
                info!("{name}: scanning out buffers rendered on {}", parent.inner.name);
                (Some(Rc::downgrade(&parent.inner)), Some(blitter))
            }
            None => (None, None),
        };

        let inner = DrmInner::create(
            name,
            card,
            options,
            blitter,
            parent,
            Some((session.clone(), device.clone())),
        )?;
        // From here on, dropping the backend closes the device.
        unwind.disarm();

        let weak = Rc::downgrade(&inner);
        let source = Generic::new(fd, Interest::READ, CalloopMode::Level);
        let token = handle
            .insert_source(source, move |_, _, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch();
                }
                Ok(PostAction::Continue)
            })
            .map_err(|err| anyhow!("error inserting the DRM source: {}", err.error))?;
        let handle = handle.clone();
        *inner.remove_source.borrow_mut() = Some(Box::new(move || handle.remove(token)));

        let mut subscriptions = Vec::new();

        let weak = Rc::downgrade(&inner);
        subscriptions.push(device.events().change.connect(move |change| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match change {
                DeviceChange::Hotplug => inner.rescan_connectors(),
                DeviceChange::Lease => lease::rescan(&inner),
            }
        }));

        let weak = Rc::downgrade(&inner);
        subscriptions.push(device.events().remove.connect(move |()| {
            if let Some(inner) = weak.upgrade() {
                info!("{}: device removed", inner.name);
                inner.destroy();
            }
        }));

        let weak = Rc::downgrade(&inner);
        subscriptions.push(session.active_changed().connect(move |active| {
            if let (true, Some(inner)) = (*active, weak.upgrade()) {
                inner.session_activated();
            }
        }));

        *inner.subscriptions.borrow_mut() = subscriptions;

        Ok(Self { inner })
    }

    /// Creates a backend on an already opened device. Nothing dispatches its events.
    pub fn with_device(
        name: &str,
        device: Rc<dyn KmsDevice>,
        options: DrmOptions,
    ) -> anyhow::Result<Self> {
        let inner = DrmInner::create(name.to_owned(), device, options, None, None, None)?;
        Ok(Self { inner })
    }

    /// Outputs of the connected connectors.
    pub fn outputs(&self) -> Vec<Output> {
        self.inner
            .connectors
            .borrow()
            .iter()
            .filter_map(|c| c.output.clone())
            .collect()
    }

    /// Reads and handles pending page-flip events.
    pub fn dispatch(&self) {
        self.inner.dispatch();
    }

    pub fn tile_group(&self, output: &Output) -> Option<TileGroup> {
        let connector = self.inner.connector_for(output)?;
        let tiles = self.inner.tiles.borrow();
        let group = tiles.group_of(connector)?;
        let (_, tile) = group.iter().find(|(c, _)| *c == connector)?;
        Some(TileGroup {
            tile: *tile,
            complete: tiles.is_complete(tile.group_id),
            size: tiles.total_size(tile.group_id)?,
        })
    }

    /// Connectors that can be leased: connected, not used for the desktop, and not leased yet.
    pub fn leasable_connectors(&self) -> Vec<(u32, String)> {
        self.inner
            .connectors
            .borrow()
            .iter()
            .filter(|c| c.connected && c.non_desktop && c.lease.is_none())
            .map(|c| (c.id, c.name.clone()))
            .collect()
    }

    /// Leases `connectors` together with a CRTC and a primary plane for each of them.
    pub fn create_lease(&self, connectors: &[u32]) -> anyhow::Result<DrmLease> {
        lease::create(&self.inner, connectors)
    }
}

impl DrmInner {
    fn create(
        name: String,
        device: Rc<dyn KmsDevice>,
        options: DrmOptions,
        blitter: Option<Blitter>,
        parent: Option<Weak<DrmInner>>,
        session: Option<(Rc<dyn DeviceSession>, SessionDevice)>,
    ) -> anyhow::Result<Rc<Self>> {
        match device.driver() {
            Ok(driver) => info!("{name}: driver {} ({})", driver.name, driver.description),
            Err(err) => warn!("{name}: error getting the driver version: {err:?}"),
        }

        let (crtcs, planes) = read_resources(&device, &options)
            .with_context(|| format!("error reading the resources of {name}"))?;
        debug!("{name}: {} CRTCs, {} planes", crtcs.len(), planes.len());

        let inner = Rc::new_cyclic(|this| Self {
            id: BackendId::next(),
            name,
            this: this.clone(),
            fb_cache: FbCache::new(device.clone()),
            device,
            events: BackendEvents::new(),
            options,
            crtcs: RefCell::new(crtcs),
            planes: RefCell::new(planes),
            connectors: RefCell::new(Vec::new()),
            flips: RefCell::new(HashMap::new()),
            tiles: RefCell::new(TileRegistry::new()),
            leases: RefCell::new(Vec::new()),
            blitter,
            parent,
            started: Cell::new(false),
            destroyed: Cell::new(false),
            session,
            subscriptions: RefCell::new(Vec::new()),
            remove_source: RefCell::new(None),
        });

        inner.rescan_connectors();
        Ok(inner)
    }

    fn connector_for(&self, output: &Output) -> Option<u32> {
        self.connectors
            .borrow()
            .iter()
            .find(|c| c.output.as_ref().is_some_and(|o| o.ptr_eq(output)))
            .map(|c| c.id)
    }

    fn dispatch(&self) {
        let _span = tracy_client::span!("DrmInner::dispatch");

        let events = match self.device.read_events() {
            Ok(events) => events,
            Err(err) => {
                warn!("{}: error reading DRM events: {err:?}", self.name);
                return;
            }
        };

        let mut flags = PresentFlags::VSYNC | PresentFlags::HW_CLOCK | PresentFlags::HW_COMPLETION;
        if self.blitter.is_none() {
            flags |= PresentFlags::ZERO_COPY;
        }

        let mut presented = Vec::new();
        {
            let mut flips = self.flips.borrow_mut();
            let crtcs = self.crtcs.borrow();
            let mut planes = self.planes.borrow_mut();

            for event in events {
                let Some(flip) = flips.remove(&event.crtc) else {
                    debug!("{}: page flip on CRTC {} without a commit", self.name, event.crtc);
                    continue;
                };

                if let Some(crtc) = crtcs.iter().find(|c| c.id == event.crtc) {
                    planes[crtc.primary].flip_done();
                    if let Some(cursor) = crtc.cursor {
                        planes[cursor].flip_done();
                    }
                }

                // The refresh interval is meaningless with adaptive sync.
                let refresh = flip
                    .output
                    .current_mode()
                    .filter(|_| !flip.output.adaptive_sync())
                    .map(refresh_interval);
                let present = PresentEvent {
                    commit_seq: flip.commit_seq,
                    presented: true,
                    when: Some(event.time),
                    seq: u64::from(event.sequence),
                    refresh,
                    flags,
                };
                presented.push((flip.output, present));
            }
        }

        for (output, event) in presented {
            if self.destroyed.get() {
                break;
            }
            if !output.is_destroyed() {
                output.present(event);
            }
        }
    }

    /// Drops pending page flips, telling their outputs the frames never made it.
    fn discard_flips(&self) {
        let flips = mem::take(&mut *self.flips.borrow_mut());
        for flip in flips.into_values() {
            trace!("{}: discarding page flip of {}", self.name, flip.output.name());
            if flip.output.is_destroyed() {
                continue;
            }
            flip.output.present(PresentEvent {
                commit_seq: flip.commit_seq,
                presented: false,
                when: None,
                seq: 0,
                refresh: None,
                flags: PresentFlags::empty(),
            });
        }
    }

    /// Syncs the connector table with the device. Never commits.
    fn rescan_connectors(&self) {
        let _span = tracy_client::span!("DrmInner::rescan_connectors");

        if self.destroyed.get() {
            return;
        }

        let resources = match self.device.resources() {
            Ok(res) => res,
            Err(err) => {
                warn!("{}: error getting resources: {err:?}", self.name);
                return;
            }
        };

        let mut added = Vec::new();
        let mut removed = Vec::new();
        {
            let mut connectors = self.connectors.borrow_mut();
            let mut crtcs = self.crtcs.borrow_mut();
            let mut tiles = self.tiles.borrow_mut();

            let mut idx = 0;
            while idx < connectors.len() {
                if resources.connectors.contains(&connectors[idx].id) {
                    idx += 1;
                    continue;
                }
                let mut connector = connectors.remove(idx);
                debug!("{}: connector {} is gone", self.name, connector.name);
                tiles.remove(connector.id);
                removed.extend(detach(&mut connector, &mut crtcs));
            }

            for &id in &resources.connectors {
                let connector = match self.scan_connector(id, &connectors, &mut crtcs) {
                    Ok(Some(connector)) => {
                        connectors.push(connector);
                        connectors.last_mut()
                    }
                    Ok(None) => connectors.iter_mut().find(|c| c.id == id),
                    Err(err) => {
                        warn!("{}: error scanning connector {id}: {err:?}", self.name);
                        continue;
                    }
                };
                let Some(connector) = connector else {
                    continue;
                };

                self.refresh_connector(connector, &mut tiles);

                let wanted = connector.connected && !connector.non_desktop && connector.lease.is_none();
                match (&connector.output, wanted) {
                    (None, true) => {
                        debug!("{}: {} connected", self.name, connector.name);
                        let output = Output::new(
                            connector.info.clone(),
                            self.id,
                            Box::new(DrmOutput::new(self.this.clone(), connector.id)),
                        );
                        connector.output = Some(output.clone());
                        added.push(output);
                    }
                    (Some(_), false) => {
                        debug!("{}: {} disconnected", self.name, connector.name);
                        removed.extend(detach(connector, &mut crtcs));
                    }
                    _ => (),
                }
            }
        }

        for output in removed {
            output.destroy();
        }
        if self.started.get() {
            for output in added {
                if self.destroyed.get() {
                    break;
                }
                self.events.new_output.emit(&output);
            }
        }
    }

    /// Reads a connector that is not in the table yet. Returns `None` for known connectors.
    fn scan_connector(
        &self,
        id: u32,
        connectors: &[Connector],
        crtcs: &mut [Crtc],
    ) -> anyhow::Result<Option<Connector>> {
        if connectors.iter().any(|c| c.id == id) {
            return Ok(None);
        }

        let info = self.device.connector(id).context("error getting connector info")?;
        let set = PropertySet::read(&*self.device, id, ObjectKind::Connector)?;
        let props = ConnectorProps::from_set(&set)?;

        // Keep driving the CRTC the connector was left on, if it is still lit. An inactive one
        // is claimed again by the next enabling modeset.
        let crtc = info.crtc.and_then(|crtc_id| {
            let idx = crtcs.iter().position(|c| c.id == crtc_id)?;
            let crtc = &mut crtcs[idx];
            if !crtc.is_free() || !crtc.active {
                return None;
            }
            crtc.connector = Some(id);
            Some(idx)
        });

        trace!("{}: new connector {} ({id})", self.name, info.name);
        Ok(Some(Connector {
            id,
            name: info.name.clone(),
            props,
            possible_crtcs: info.possible_crtcs,
            connected: false,
            vrr_capable: false,
            non_desktop: false,
            tile: None,
            crtc,
            info: OutputInfo {
                name: info.name,
                ..Default::default()
            },
            output: None,
            cursor: Default::default(),
            restore: RestoreState::default(),
            lease: None,
        }))
    }

    /// Updates the connection status and the description of a connector.
    fn refresh_connector(&self, connector: &mut Connector, tiles: &mut TileRegistry) {
        let info = match self.device.connector(connector.id) {
            Ok(info) => info,
            Err(err) => {
                warn!("{}: error getting {} info: {err:?}", self.name, connector.name);
                return;
            }
        };
        let set = match PropertySet::read(&*self.device, connector.id, ObjectKind::Connector) {
            Ok(set) => set,
            Err(err) => {
                warn!("{}: {err:?}", self.name);
                return;
            }
        };

        let was_connected = connector.connected;
        connector.connected = info.connected;
        connector.possible_crtcs = info.possible_crtcs;
        connector.vrr_capable = set.value("vrr_capable").is_some_and(|v| v != 0);
        connector.non_desktop = set.value("non-desktop").is_some_and(|v| v != 0);

        connector.tile = set
            .value("TILE")
            .filter(|&blob| blob != 0)
            .and_then(|blob| match self.device.get_blob(blob) {
                Ok(data) => TileInfo::parse_blob(&data)
                    .map_err(|err| debug!("{}: {}: {err:?}", self.name, connector.name))
                    .ok(),
                Err(err) => {
                    debug!("{}: {}: error reading TILE: {err:?}", self.name, connector.name);
                    None
                }
            });
        match connector.tile {
            Some(tile) if connector.connected => tiles.add(connector.id, tile),
            _ => tiles.remove(connector.id),
        }

        // An existing output keeps the description it was created with.
        if connector.output.is_some() || (was_connected && connector.connected) {
            return;
        }

        let edid = set
            .value("EDID")
            .filter(|&blob| blob != 0)
            .and_then(|blob| self.device.get_blob(blob).ok())
            .and_then(|data| match parse_edid(&data) {
                Ok(edid) => Some(edid),
                Err(err) => {
                    debug!("{}: {}: {err:?}", self.name, connector.name);
                    None
                }
            })
            .unwrap_or_default();

        let make = edid.make.as_deref().unwrap_or("Unknown");
        let model = edid.model.as_deref().unwrap_or("Unknown");
        connector.info = OutputInfo {
            name: connector.name.clone(),
            description: format!("{make} {model} ({})", connector.name),
            make: edid.make,
            model: edid.model,
            serial: edid.serial,
            physical_size: info.physical_size,
            preferred_mode: preferred_mode(&info.modes),
            modes: info.modes,
            non_desktop: connector.non_desktop,
            adaptive_sync_supported: connector.vrr_capable,
        };
    }

    /// Re-applies the last committed state of every output after a VT switch.
    fn session_activated(&self) {
        let _span = tracy_client::span!("DrmInner::session_activated");

        if self.destroyed.get() {
            return;
        }

        info!("{}: session activated, restoring outputs", self.name);
        // Flips queued before the switch never complete.
        self.discard_flips();
        atomic::reset(self);
        self.rescan_connectors();
        self.restore();
    }

    fn restore(&self) {
        let restore = self
            .connectors
            .borrow()
            .iter()
            .filter(|c| c.restore.enabled && c.lease.is_none())
            .filter_map(|c| Some((c.id, c.output.clone()?, c.restore.clone())))
            .collect::<Vec<_>>();

        for (connector, output, saved) in restore {
            if output.is_destroyed() {
                continue;
            }

            let mut state = OutputState::new();
            state.set_enabled(true);
            if let Some(mode) = saved.mode {
                state.set_mode(mode);
            }
            if let Some(buffer) = saved.buffer {
                state.set_buffer(buffer);
            }
            if saved.adaptive_sync {
                state.set_adaptive_sync(true);
            }
            if saved.gamma_lut.is_some() {
                state.set_gamma_lut(saved.gamma_lut);
            }

            let commit = atomic::OutputCommit {
                connector,
                output: &output,
                state: &state,
            };
            if !atomic::commit(self, &[commit], false) {
                warn!("{}: error restoring {}", self.name, output.name());
            }
        }
    }

    fn commit_many(&self, states: &[super::OutputCommit<'_>], test_only: bool) -> bool {
        let mut commits = Vec::with_capacity(states.len());
        for s in states {
            if !s.output.check_state(s.state) {
                return false;
            }
            let Some(connector) = self.connector_for(s.output) else {
                debug!("{}: {} does not belong to this device", self.name, s.output.name());
                return false;
            };
            commits.push(atomic::OutputCommit {
                connector,
                output: s.output,
                state: s.state,
            });
        }
        atomic::commit(self, &commits, test_only)
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }

        let _span = tracy_client::span!("DrmInner::destroy");
        debug!("{}: destroying", self.name);

        self.events.destroy.emit(&());
        self.subscriptions.borrow_mut().clear();

        let leases = mem::take(&mut *self.leases.borrow_mut());
        for lease in leases.iter().filter_map(Weak::upgrade) {
            lease.terminate();
        }

        self.discard_flips();

        let outputs = {
            let mut connectors = self.connectors.borrow_mut();
            let mut crtcs = self.crtcs.borrow_mut();
            let mut outputs = Vec::new();
            for connector in connectors.iter_mut() {
                outputs.extend(detach(connector, &mut crtcs));
            }
            connectors.clear();
            outputs
        };
        for output in outputs {
            output.destroy();
        }

        for plane in self.planes.borrow_mut().iter_mut() {
            plane.clear();
        }
        for crtc in self.crtcs.borrow_mut().iter_mut() {
            crtc.mode = None;
            crtc.gamma = None;
        }
        self.fb_cache.clear();

        if let Some(remove) = self.remove_source.borrow_mut().take() {
            remove();
        }
        if let Some((session, device)) = &self.session {
            session.close(device);
        }

        self.events.clear();
    }
}

impl Drop for DrmInner {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Unbinds a connector from its CRTC, leaving the hardware state alone, and takes its output.
fn detach(connector: &mut Connector, crtcs: &mut [Crtc]) -> Option<Output> {
    if let Some(idx) = connector.crtc.take() {
        crtcs[idx].connector = None;
    }
    connector.cursor = Default::default();
    connector.restore = RestoreState::default();
    connector.output.take()
}

/// Builds the CRTC and plane tables.
fn read_resources(device: &Rc<dyn KmsDevice>, options: &DrmOptions) -> anyhow::Result<(Vec<Crtc>, Vec<Plane>)> {
    let _span = tracy_client::span!("drm::read_resources");

    device
        .enable_atomic()
        .context("the device does not support atomic mode-setting")?;
    let resources = device.resources().context("error getting resources")?;

    let mut planes = Vec::new();
    for &id in &resources.planes {
        let info = device.plane(id).context("error getting plane info")?;
        let set = PropertySet::read(&**device, id, ObjectKind::Plane)?;
        let Some(ty) = set.value("type").and_then(PlaneType::from_value) else {
            debug!("plane {id} has no known type");
            continue;
        };
        if ty == PlaneType::Overlay {
            continue;
        }

        let props =
            PlaneProps::from_set(&set).with_context(|| format!("error reading plane {id}"))?;
        planes.push(Plane {
            id,
            ty,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            props,
            current: None,
            queued: None,
        });
    }

    let mut claimed = Vec::new();
    let mut pick_plane = |crtc: u32, ty: PlaneType| {
        let idx = planes.iter().enumerate().position(|(idx, p)| {
            p.ty == ty && p.possible_crtcs.contains(&crtc) && !claimed.contains(&idx)
        })?;
        claimed.push(idx);
        Some(idx)
    };

    let mut crtcs = Vec::new();
    for &id in &resources.crtcs {
        let info = device.crtc(id).context("error getting CRTC info")?;
        let set = PropertySet::read(&**device, id, ObjectKind::Crtc)?;
        let props = CrtcProps::from_set(&set).with_context(|| format!("error reading CRTC {id}"))?;

        let Some(primary) = pick_plane(id, PlaneType::Primary) else {
            bail!("CRTC {id} has no primary plane");
        };
        let cursor = if options.disable_cursor_plane {
            None
        } else {
            pick_plane(id, PlaneType::Cursor)
        };

        // Blobs set by the previous DRM master stay theirs.
        let inherited = |name: &str| {
            set.value(name)
                .filter(|&blob| blob != 0)
                .map(|blob| PropertyBlob::inherited(device, blob as u32))
        };

        crtcs.push(Crtc {
            id,
            gamma_lut_size: set.value("GAMMA_LUT_SIZE").unwrap_or(0),
            legacy_gamma_size: info.gamma_size,
            primary,
            cursor,
            mode: inherited("MODE_ID"),
            gamma: inherited("GAMMA_LUT"),
            active: set.value("ACTIVE").is_some_and(|v| v != 0),
            vrr_enabled: set.value("VRR_ENABLED").is_some_and(|v| v != 0),
            connector: None,
            lease: None,
            props,
        });
    }

    Ok((crtcs, planes))
}

impl Backend for DrmBackend {
    fn id(&self) -> BackendId {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start(&self) -> anyhow::Result<()> {
        if self.inner.destroyed.get() || self.inner.started.replace(true) {
            return Ok(());
        }

        let outputs = self.outputs();
        debug!("{}: starting with {} outputs", self.inner.name, outputs.len());
        for output in outputs {
            if self.inner.destroyed.get() {
                break;
            }
            self.inner.events.new_output.emit(&output);
        }
        Ok(())
    }

    fn destroy(&self) {
        self.inner.destroy();
    }

    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        match self.inner.parent.as_ref().and_then(Weak::upgrade) {
            Some(parent) => parent.device.drm_fd(),
            None => self.inner.device.drm_fd(),
        }
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }

    fn events(&self) -> &BackendEvents {
        &self.inner.events
    }

    fn test(&self, states: &[super::OutputCommit<'_>]) -> bool {
        self.inner.commit_many(states, true)
    }

    fn commit(&self, states: &[super::OutputCommit<'_>]) -> bool {
        self.inner.commit_many(states, false)
    }
}
