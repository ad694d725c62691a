//! In-memory KMS device recording every operation.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::time::Duration;

use smithay::backend::allocator::Fourcc;
use smithay::backend::drm::DrmDeviceFd;

use super::device::{
    AtomicRequest, CommitFlags, ConnectorInfo, CrtcInfo, DriverInfo, FlipEvent, KmsDevice,
    ObjectKind, PlaneInfo, PropertyInfo, PropertyKind, Resources,
};
use super::helpers::calculate_mode_cvt;
use crate::buffer::Buffer;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateBlob(u32),
    DestroyBlob(u32),
    Commit {
        flags: CommitFlags,
        request: AtomicRequest,
    },
    SetGamma(u32),
    AddFb(u32),
    DestroyFb(u32),
    CreateLease(Vec<u32>),
    RevokeLease(u32),
}

#[derive(Debug, Clone)]
pub struct StubConnector {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub non_desktop: bool,
    pub vrr_capable: bool,
    pub tile: Option<String>,
}

impl StubConnector {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            connected: true,
            non_desktop: false,
            vrr_capable: false,
            tile: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StubConfig {
    pub crtcs: u32,
    pub cursor_planes: bool,
    /// Atomic gamma with this many entries per channel.
    pub gamma_lut_size: Option<u64>,
    pub legacy_gamma_size: u32,
    pub vrr: bool,
    pub connectors: Vec<StubConnector>,
}

impl Default for StubConfig {
    /// One CRTC, one connector, one primary plane, no gamma.
    fn default() -> Self {
        Self {
            crtcs: 1,
            cursor_planes: false,
            gamma_lut_size: None,
            legacy_gamma_size: 0,
            vrr: false,
            connectors: vec![StubConnector::new(CONNECTOR_BASE, "DP-1")],
        }
    }
}

pub const CRTC_BASE: u32 = 10;
pub const PLANE_BASE: u32 = 20;
pub const CONNECTOR_BASE: u32 = 40;

const PROPERTY_NAMES: &[&str] = &[
    "MODE_ID",
    "ACTIVE",
    "GAMMA_LUT",
    "GAMMA_LUT_SIZE",
    "VRR_ENABLED",
    "OUT_FENCE_PTR",
    "FB_ID",
    "CRTC_ID",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "IN_FENCE_FD",
    "FB_DAMAGE_CLIPS",
    "type",
    "link-status",
    "content type",
    "max bpc",
    "vrr_capable",
    "non-desktop",
    "EDID",
    "TILE",
];

/// Property IDs are shared by every object, like kernel properties of one name.
pub fn prop(name: &str) -> u32 {
    let idx = PROPERTY_NAMES
        .iter()
        .position(|n| *n == name)
        .unwrap_or_else(|| panic!("unknown property {name}"));
    1000 + idx as u32
}

pub fn crtc_id(idx: u32) -> u32 {
    CRTC_BASE + idx
}

pub fn primary_id(crtc: u32) -> u32 {
    PLANE_BASE + 2 * crtc
}

pub fn cursor_id(crtc: u32) -> u32 {
    PLANE_BASE + 2 * crtc + 1
}

pub struct StubDevice {
    pub config: RefCell<StubConfig>,
    pub ops: RefCell<Vec<Op>>,
    pub reject_commits: Cell<bool>,
    pub reject_tests: Cell<bool>,
    /// Current property values by object and property.
    pub values: RefCell<HashMap<(u32, u32), u64>>,
    blobs: RefCell<BTreeMap<u32, Vec<u8>>>,
    /// Contents of every client blob ever created, destroyed or not.
    blob_history: RefCell<HashMap<u32, Vec<u8>>>,
    lessees: RefCell<BTreeSet<u32>>,
    events: RefCell<Vec<FlipEvent>>,
    next_id: Cell<u32>,
    sequence: Cell<u32>,
}

impl StubDevice {
    pub fn new(config: StubConfig) -> Self {
        let device = Self {
            config: RefCell::new(config),
            ops: RefCell::new(Vec::new()),
            reject_commits: Cell::new(false),
            reject_tests: Cell::new(false),
            values: RefCell::new(HashMap::new()),
            blobs: RefCell::new(BTreeMap::new()),
            blob_history: RefCell::new(HashMap::new()),
            lessees: RefCell::new(BTreeSet::new()),
            events: RefCell::new(Vec::new()),
            next_id: Cell::new(100),
            sequence: Cell::new(0),
        };
        device.sync_connector_blobs();
        device
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Blobs the device owns, as opposed to blobs created by the client.
    fn sync_connector_blobs(&self) {
        let connectors = self.config.borrow().connectors.clone();
        for connector in connectors {
            let key = (connector.id, prop("TILE"));
            let value = match connector.tile {
                Some(tile) => {
                    let id = self.next_id();
                    self.blobs.borrow_mut().insert(id, tile.into_bytes());
                    u64::from(id)
                }
                None => 0,
            };
            self.values.borrow_mut().insert(key, value);
        }
    }

    pub fn value(&self, object: u32, property: &str) -> u64 {
        self.values
            .borrow()
            .get(&(object, prop(property)))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_connected(&self, connector: u32, connected: bool) {
        let mut config = self.config.borrow_mut();
        if let Some(c) = config.connectors.iter_mut().find(|c| c.id == connector) {
            c.connected = connected;
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.borrow().clone()
    }

    pub fn commits(&self) -> Vec<(CommitFlags, AtomicRequest)> {
        self.ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                Op::Commit { flags, request } => Some((*flags, request.clone())),
                _ => None,
            })
            .collect()
    }

    /// Client-created blobs that were not destroyed.
    pub fn live_blobs(&self) -> Vec<u32> {
        let mut live = Vec::new();
        for op in self.ops.borrow().iter() {
            match op {
                Op::CreateBlob(id) => live.push(*id),
                Op::DestroyBlob(id) => live.retain(|b| b != id),
                _ => (),
            }
        }
        live
    }

    pub fn blob_data(&self, id: u32) -> Option<Vec<u8>> {
        self.blob_history.borrow().get(&id).cloned()
    }

    pub fn pending_events(&self) -> usize {
        self.events.borrow().len()
    }

    fn crtc_props(&self) -> Vec<(&'static str, PropertyKind)> {
        let config = self.config.borrow();
        let mut props = vec![
            ("MODE_ID", PropertyKind::Blob),
            ("ACTIVE", PropertyKind::Boolean),
            ("OUT_FENCE_PTR", PropertyKind::Range { min: 0, max: u64::MAX }),
        ];
        if config.gamma_lut_size.is_some() {
            props.push(("GAMMA_LUT", PropertyKind::Blob));
            props.push(("GAMMA_LUT_SIZE", PropertyKind::Range { min: 0, max: u64::from(u32::MAX) }));
        }
        if config.vrr {
            props.push(("VRR_ENABLED", PropertyKind::Boolean));
        }
        props
    }

    fn plane_props() -> Vec<(&'static str, PropertyKind)> {
        let range = PropertyKind::Range { min: 0, max: u64::from(u32::MAX) };
        let signed = PropertyKind::SignedRange { min: i64::from(i32::MIN), max: i64::from(i32::MAX) };
        vec![
            ("type", PropertyKind::Enum(vec![
                ("Overlay".to_owned(), 0),
                ("Primary".to_owned(), 1),
                ("Cursor".to_owned(), 2),
            ])),
            ("FB_ID", PropertyKind::Object),
            ("CRTC_ID", PropertyKind::Object),
            ("SRC_X", range.clone()),
            ("SRC_Y", range.clone()),
            ("SRC_W", range.clone()),
            ("SRC_H", range.clone()),
            ("CRTC_X", signed.clone()),
            ("CRTC_Y", signed),
            ("CRTC_W", range.clone()),
            ("CRTC_H", range),
            ("IN_FENCE_FD", PropertyKind::SignedRange { min: -1, max: i64::from(i32::MAX) }),
            ("FB_DAMAGE_CLIPS", PropertyKind::Blob),
        ]
    }

    fn connector_props() -> Vec<(&'static str, PropertyKind)> {
        vec![
            ("CRTC_ID", PropertyKind::Object),
            ("link-status", PropertyKind::Enum(vec![
                ("Good".to_owned(), 0),
                ("Bad".to_owned(), 1),
            ])),
            ("content type", PropertyKind::Enum(vec![
                ("No Data".to_owned(), 0),
                ("Graphics".to_owned(), 1),
                ("Photo".to_owned(), 2),
                ("Cinema".to_owned(), 3),
                ("Game".to_owned(), 4),
            ])),
            ("max bpc", PropertyKind::Range { min: 6, max: 12 }),
            ("vrr_capable", PropertyKind::Boolean),
            ("non-desktop", PropertyKind::Boolean),
            ("EDID", PropertyKind::Blob),
            ("TILE", PropertyKind::Blob),
        ]
    }

    fn default_value(&self, object: u32, name: &str) -> u64 {
        let config = self.config.borrow();
        match name {
            "type" if object >= PLANE_BASE && object < CONNECTOR_BASE => {
                if (object - PLANE_BASE) % 2 == 0 {
                    1
                } else {
                    2
                }
            }
            "GAMMA_LUT_SIZE" => config.gamma_lut_size.unwrap_or(0),
            "vrr_capable" | "non-desktop" => {
                let Some(c) = config.connectors.iter().find(|c| c.id == object) else {
                    return 0;
                };
                let value = if name == "vrr_capable" {
                    c.vrr_capable
                } else {
                    c.non_desktop
                };
                u64::from(value)
            }
            _ => 0,
        }
    }

    fn uses_blob(name: &str) -> bool {
        matches!(name, "MODE_ID" | "GAMMA_LUT" | "FB_DAMAGE_CLIPS")
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl KmsDevice for StubDevice {
    fn driver(&self) -> io::Result<DriverInfo> {
        Ok(DriverInfo {
            name: "stub".to_owned(),
            description: "In-memory device".to_owned(),
        })
    }

    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        None
    }

    fn enable_atomic(&self) -> io::Result<()> {
        Ok(())
    }

    fn resources(&self) -> io::Result<Resources> {
        let config = self.config.borrow();
        let mut planes = Vec::new();
        for idx in 0..config.crtcs {
            planes.push(primary_id(idx));
            if config.cursor_planes {
                planes.push(cursor_id(idx));
            }
        }
        Ok(Resources {
            crtcs: (0..config.crtcs).map(crtc_id).collect(),
            connectors: config.connectors.iter().map(|c| c.id).collect(),
            planes,
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        Ok(CrtcInfo {
            id,
            gamma_size: self.config.borrow().legacy_gamma_size,
        })
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let crtc = crtc_id((id - PLANE_BASE) / 2);
        Ok(PlaneInfo {
            id,
            possible_crtcs: vec![crtc],
            formats: vec![Fourcc::Argb8888 as u32, Fourcc::Xrgb8888 as u32],
            crtc: None,
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let config = self.config.borrow();
        let connector = config
            .connectors
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;

        let modes = if connector.connected {
            vec![
                calculate_mode_cvt(1920, 1080, 60.),
                calculate_mode_cvt(1280, 720, 60.),
                calculate_mode_cvt(1024, 768, 60.),
            ]
        } else {
            Vec::new()
        };
        let crtc = match self.value(id, "CRTC_ID") {
            0 => None,
            crtc => Some(crtc as u32),
        };

        Ok(ConnectorInfo {
            id,
            name: connector.name.clone(),
            connected: connector.connected,
            modes,
            physical_size: (600, 340),
            possible_crtcs: (0..config.crtcs).map(crtc_id).collect(),
            crtc,
        })
    }

    fn properties(&self, object: u32, kind: ObjectKind) -> io::Result<Vec<PropertyInfo>> {
        let props = match kind {
            ObjectKind::Crtc => self.crtc_props(),
            ObjectKind::Plane => Self::plane_props(),
            ObjectKind::Connector => Self::connector_props(),
        };

        let values = self.values.borrow();
        Ok(props
            .into_iter()
            .map(|(name, kind)| {
                let id = prop(name);
                let value = values
                    .get(&(object, id))
                    .copied()
                    .unwrap_or_else(|| self.default_value(object, name));
                PropertyInfo {
                    id,
                    name: name.to_owned(),
                    value,
                    kind,
                }
            })
            .collect())
    }

    fn get_blob(&self, id: u64) -> io::Result<Vec<u8>> {
        self.blobs
            .borrow()
            .get(&(id as u32))
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let id = self.next_id();
        self.blobs.borrow_mut().insert(id, data.to_vec());
        self.blob_history.borrow_mut().insert(id, data.to_vec());
        self.ops.borrow_mut().push(Op::CreateBlob(id));
        Ok(id)
    }

    fn destroy_blob(&self, id: u32) -> io::Result<()> {
        self.ops.borrow_mut().push(Op::DestroyBlob(id));
        match self.blobs.borrow_mut().remove(&id) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<()> {
        self.ops.borrow_mut().push(Op::Commit {
            flags,
            request: request.clone(),
        });

        let test_only = flags.contains(CommitFlags::TEST_ONLY);
        if (test_only && self.reject_tests.get()) || (!test_only && self.reject_commits.get()) {
            return Err(einval());
        }

        // Blob properties must point at live blobs.
        let blobs = self.blobs.borrow();
        for p in request.props() {
            let name = PROPERTY_NAMES[(p.property - 1000) as usize];
            if Self::uses_blob(name) && p.value != 0 && !blobs.contains_key(&(p.value as u32)) {
                return Err(einval());
            }
        }
        drop(blobs);

        if test_only {
            return Ok(());
        }

        let mut values = self.values.borrow_mut();
        for p in request.props() {
            values.insert((p.object, p.property), p.value);
        }

        // Like the kernel, hand out a new descriptor through every out-fence pointer.
        let out_fence_ptr = prop("OUT_FENCE_PTR");
        for p in request.props() {
            if p.property == out_fence_ptr && p.value != 0 {
                let fd = std::fs::File::open("/dev/null")?.into_raw_fd();
                // SAFETY: the engine passes a pointer to an i32 that outlives the commit.
                unsafe { *(p.value as *mut i32) = fd };
            }
        }

        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            let active = prop("ACTIVE");
            for p in request.props() {
                if p.property == active && p.value == 1 {
                    let sequence = self.sequence.get() + 1;
                    self.sequence.set(sequence);
                    self.events.borrow_mut().push(FlipEvent {
                        crtc: p.object,
                        sequence,
                        time: Duration::from_millis(16 * u64::from(sequence)),
                    });
                }
            }
        }

        Ok(())
    }

    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        let size = self.config.borrow().legacy_gamma_size as usize;
        if size == 0 || red.len() != size || green.len() != size || blue.len() != size {
            return Err(einval());
        }
        self.ops.borrow_mut().push(Op::SetGamma(crtc));
        Ok(())
    }

    fn add_framebuffer(&self, _buffer: &Buffer) -> io::Result<u32> {
        let id = self.next_id();
        self.ops.borrow_mut().push(Op::AddFb(id));
        Ok(id)
    }

    fn destroy_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.ops.borrow_mut().push(Op::DestroyFb(fb));
        Ok(())
    }

    fn read_events(&self) -> io::Result<Vec<FlipEvent>> {
        Ok(std::mem::take(&mut *self.events.borrow_mut()))
    }

    fn create_lease(&self, objects: &[u32]) -> io::Result<(u32, OwnedFd)> {
        let fd = std::fs::File::open("/dev/null")?;
        let lessee = self.next_id();
        self.lessees.borrow_mut().insert(lessee);
        self.ops.borrow_mut().push(Op::CreateLease(objects.to_vec()));
        Ok((lessee, fd.into()))
    }

    fn revoke_lease(&self, lessee: u32) -> io::Result<()> {
        self.ops.borrow_mut().push(Op::RevokeLease(lessee));
        if self.lessees.borrow_mut().remove(&lessee) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn lessees(&self) -> io::Result<Vec<u32>> {
        Ok(self.lessees.borrow().iter().copied().collect())
    }
}
