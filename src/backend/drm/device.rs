//! Kernel mode-setting device access.
//!
//! [`KmsDevice`] is the narrow ioctl surface the atomic engine needs. Objects are addressed by
//! their raw kernel IDs so that the engine does not depend on any particular binding.

use std::io;
use std::iter::zip;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use bitflags::bitflags;
use smithay::backend::allocator::{Buffer as _, Fourcc, Modifier};
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::buffer::{self, PlanarBuffer};
use smithay::reexports::drm::control::atomic::AtomicModeReq;
use smithay::reexports::drm::control::{
    self, connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice,
    FbCmd2Flags, RawResourceHandle,
};
use smithay::reexports::drm::{ClientCapability, Device as BasicDevice};

use crate::buffer::Buffer;
use crate::output::Mode;

bitflags! {
    /// Flags of an atomic commit, with the kernel's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x0001;
        const TEST_ONLY = 0x0100;
        const NONBLOCK = 0x0200;
        const ALLOW_MODESET = 0x0400;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicProp {
    pub object: u32,
    pub property: u32,
    pub value: u64,
}

/// The list of (object, property, value) triples of one atomic commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    props: Vec<AtomicProp>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: u32, property: u32, value: u64) {
        self.props.push(AtomicProp {
            object,
            property,
            value,
        });
    }

    pub fn props(&self) -> &[AtomicProp] {
        &self.props
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Value set for a property, the last one if it was set several times.
    pub fn get(&self, object: u32, property: u32) -> Option<u64> {
        self.props
            .iter()
            .rev()
            .find(|p| p.object == object && p.property == property)
            .map(|p| p.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Crtc,
    Connector,
    Plane,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Enum(Vec<(String, u64)>),
    Bitmask,
    Blob,
    Object,
    Boolean,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: u32,
    pub name: String,
    pub value: u64,
    pub kind: PropertyKind,
}

impl PropertyInfo {
    /// Value of the enum entry called `name`.
    pub fn enum_value(&self, name: &str) -> Option<u64> {
        match &self.kind {
            PropertyKind::Enum(values) => values
                .iter()
                .find_map(|(n, value)| (n == name).then_some(*value)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub planes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    pub id: u32,
    /// Size of the legacy gamma ramp, 0 if the CRTC has none.
    pub gamma_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    pub possible_crtcs: Vec<u32>,
    pub formats: Vec<u32>,
    pub crtc: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub modes: Vec<Mode>,
    /// Physical size in millimeters.
    pub physical_size: (u32, u32),
    pub possible_crtcs: Vec<u32>,
    pub crtc: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: u32,
    pub sequence: u32,
    /// Presentation time on the monotonic clock.
    pub time: Duration,
}

pub trait KmsDevice {
    fn driver(&self) -> io::Result<DriverInfo>;

    fn drm_fd(&self) -> Option<DrmDeviceFd>;

    /// Enables the universal planes and atomic client capabilities.
    fn enable_atomic(&self) -> io::Result<()>;

    fn resources(&self) -> io::Result<Resources>;
    fn crtc(&self, id: u32) -> io::Result<CrtcInfo>;
    fn plane(&self, id: u32) -> io::Result<PlaneInfo>;
    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;
    fn properties(&self, object: u32, kind: ObjectKind) -> io::Result<Vec<PropertyInfo>>;

    fn get_blob(&self, id: u64) -> io::Result<Vec<u8>>;
    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;
    fn destroy_blob(&self, id: u32) -> io::Result<()>;

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<()>;

    /// Sets the gamma ramp through the legacy ioctl.
    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()>;

    fn add_framebuffer(&self, buffer: &Buffer) -> io::Result<u32>;
    fn destroy_framebuffer(&self, fb: u32) -> io::Result<()>;

    /// Reads pending page-flip events, in kernel order.
    fn read_events(&self) -> io::Result<Vec<FlipEvent>>;

    /// Leases `objects`, returning the lessee ID and the lease descriptor.
    fn create_lease(&self, objects: &[u32]) -> io::Result<(u32, OwnedFd)>;
    fn revoke_lease(&self, lessee: u32) -> io::Result<()>;
    fn lessees(&self) -> io::Result<Vec<u32>>;
}

// =============================================================================
// Kernel implementation
// =============================================================================

/// [`KmsDevice`] on a DRM primary node.
pub struct DrmCard {
    fd: DrmDeviceFd,
}

impl DrmCard {
    pub fn new(fd: DrmDeviceFd) -> Self {
        Self { fd }
    }
}

fn handle<T: From<RawResourceHandle>>(id: u32) -> io::Result<T> {
    control::from_u32(id).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
}

fn raw_handle(id: u32) -> io::Result<RawResourceHandle> {
    RawResourceHandle::new(id).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
}

fn property_kind(value_type: property::ValueType) -> PropertyKind {
    use property::ValueType;

    match value_type {
        ValueType::UnsignedRange(min, max) => PropertyKind::Range { min, max },
        ValueType::SignedRange(min, max) => PropertyKind::SignedRange { min, max },
        ValueType::Enum(values) => {
            let (_, entries) = values.values();
            PropertyKind::Enum(
                entries
                    .iter()
                    .map(|e| (e.name().to_string_lossy().into_owned(), e.value()))
                    .collect(),
            )
        }
        ValueType::Bitmask => PropertyKind::Bitmask,
        ValueType::Blob => PropertyKind::Blob,
        ValueType::Boolean => PropertyKind::Boolean,
        ValueType::CRTC
        | ValueType::Connector
        | ValueType::Encoder
        | ValueType::Framebuffer
        | ValueType::Plane
        | ValueType::Property => PropertyKind::Object,
        _ => PropertyKind::Unknown,
    }
}

/// Dmabuf planes imported into GEM handles.
struct ImportedPlanes {
    size: (u32, u32),
    format: Fourcc,
    modifier: Modifier,
    handles: [Option<buffer::Handle>; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
}

impl PlanarBuffer for ImportedPlanes {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<Modifier> {
        (self.modifier != Modifier::Invalid).then_some(self.modifier)
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

impl DrmCard {
    fn close_handles(&self, handles: &[Option<buffer::Handle>; 4]) {
        let mut closed = Vec::new();
        for handle in handles.iter().flatten() {
            // Planes sharing a dmabuf share the GEM handle.
            if closed.contains(handle) {
                continue;
            }
            closed.push(*handle);
            if let Err(err) = self.fd.close_buffer(*handle) {
                debug!("error closing GEM handle: {err:?}");
            }
        }
    }
}

impl KmsDevice for DrmCard {
    fn driver(&self) -> io::Result<DriverInfo> {
        let driver = self.fd.get_driver()?;
        Ok(DriverInfo {
            name: driver.name().to_string_lossy().into_owned(),
            description: driver.description().to_string_lossy().into_owned(),
        })
    }

    fn drm_fd(&self) -> Option<DrmDeviceFd> {
        Some(self.fd.clone())
    }

    fn enable_atomic(&self) -> io::Result<()> {
        self.fd
            .set_client_capability(ClientCapability::UniversalPlanes, true)?;
        self.fd.set_client_capability(ClientCapability::Atomic, true)
    }

    fn resources(&self) -> io::Result<Resources> {
        let res = self.fd.resource_handles()?;
        let planes = self.fd.plane_handles()?;
        Ok(Resources {
            crtcs: res.crtcs().iter().map(|&h| u32::from(h)).collect(),
            connectors: res.connectors().iter().map(|&h| u32::from(h)).collect(),
            planes: planes.iter().map(|&h| u32::from(h)).collect(),
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        let info = self.fd.get_crtc(handle::<crtc::Handle>(id)?)?;
        Ok(CrtcInfo {
            id,
            gamma_size: info.gamma_length(),
        })
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let res = self.fd.resource_handles()?;
        let info = self.fd.get_plane(handle::<plane::Handle>(id)?)?;
        Ok(PlaneInfo {
            id,
            possible_crtcs: res
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(u32::from)
                .collect(),
            formats: info.formats().to_vec(),
            crtc: info.crtc().map(u32::from),
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let res = self.fd.resource_handles()?;
        let info = self.fd.get_connector(handle::<connector::Handle>(id)?, true)?;

        let mut possible_crtcs = Vec::new();
        for encoder in info.encoders() {
            let encoder = self.fd.get_encoder(*encoder)?;
            for crtc in res.filter_crtcs(encoder.possible_crtcs()) {
                let crtc = u32::from(crtc);
                if !possible_crtcs.contains(&crtc) {
                    possible_crtcs.push(crtc);
                }
            }
        }

        let crtc = info
            .current_encoder()
            .and_then(|encoder| self.fd.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc())
            .map(u32::from);

        Ok(ConnectorInfo {
            id,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            connected: info.state() == connector::State::Connected,
            modes: info.modes().to_vec(),
            physical_size: info.size().unwrap_or((0, 0)),
            possible_crtcs,
            crtc,
        })
    }

    fn properties(&self, object: u32, kind: ObjectKind) -> io::Result<Vec<PropertyInfo>> {
        let props = match kind {
            ObjectKind::Crtc => self.fd.get_properties(handle::<crtc::Handle>(object)?)?,
            ObjectKind::Connector => self
                .fd
                .get_properties(handle::<connector::Handle>(object)?)?,
            ObjectKind::Plane => self.fd.get_properties(handle::<plane::Handle>(object)?)?,
        };

        let mut infos = Vec::new();
        for (prop, value) in props {
            let info = self.fd.get_property(prop)?;
            infos.push(PropertyInfo {
                id: u32::from(prop),
                name: info.name().to_string_lossy().into_owned(),
                value,
                kind: property_kind(info.value_type()),
            });
        }
        Ok(infos)
    }

    fn get_blob(&self, id: u64) -> io::Result<Vec<u8>> {
        self.fd.get_property_blob(id)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.fd.as_fd(), &mut data)?;
        Ok(blob.blob_id)
    }

    fn destroy_blob(&self, id: u32) -> io::Result<()> {
        self.fd.destroy_property_blob(u64::from(id))
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> io::Result<()> {
        let _span = tracy_client::span!("DrmCard::atomic_commit");

        let mut req = AtomicModeReq::new();
        for prop in request.props() {
            req.add_raw_property(
                raw_handle(prop.object)?,
                handle::<property::Handle>(prop.property)?,
                prop.value,
            );
        }

        let mut drm_flags = AtomicCommitFlags::empty();
        for (ours, theirs) in [
            (CommitFlags::PAGE_FLIP_EVENT, AtomicCommitFlags::PAGE_FLIP_EVENT),
            (CommitFlags::TEST_ONLY, AtomicCommitFlags::TEST_ONLY),
            (CommitFlags::NONBLOCK, AtomicCommitFlags::NONBLOCK),
            (CommitFlags::ALLOW_MODESET, AtomicCommitFlags::ALLOW_MODESET),
        ] {
            if flags.contains(ours) {
                drm_flags |= theirs;
            }
        }

        self.fd.atomic_commit(drm_flags, req)
    }

    fn set_gamma(&self, crtc: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        self.fd
            .set_gamma(handle::<crtc::Handle>(crtc)?, red, green, blue)
    }

    fn add_framebuffer(&self, buffer: &Buffer) -> io::Result<u32> {
        let _span = tracy_client::span!("DrmCard::add_framebuffer");

        let dmabuf = buffer.dmabuf().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "only dmabufs can be used as framebuffers",
            )
        })?;

        let mut planes = ImportedPlanes {
            size: buffer.size(),
            format: dmabuf.format().code,
            modifier: dmabuf.format().modifier,
            handles: [None; 4],
            pitches: [0; 4],
            offsets: [0; 4],
        };

        let layout = zip(zip(dmabuf.handles(), dmabuf.offsets()), dmabuf.strides());
        for (idx, ((fd, offset), stride)) in layout.take(4).enumerate() {
            match self.fd.prime_fd_to_buffer(fd) {
                Ok(handle) => planes.handles[idx] = Some(handle),
                Err(err) => {
                    self.close_handles(&planes.handles);
                    return Err(err);
                }
            }
            planes.pitches[idx] = stride;
            planes.offsets[idx] = offset;
        }

        let flags = if planes.modifier().is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = self.fd.add_planar_framebuffer(&planes, flags);

        // The framebuffer keeps its own reference to the GEM objects.
        self.close_handles(&planes.handles);

        Ok(u32::from(fb?))
    }

    fn destroy_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.fd.destroy_framebuffer(handle(fb)?)
    }

    fn read_events(&self) -> io::Result<Vec<FlipEvent>> {
        let events = self.fd.receive_events()?;
        Ok(events
            .filter_map(|event| match event {
                control::Event::PageFlip(event) => Some(FlipEvent {
                    crtc: u32::from(event.crtc),
                    sequence: event.frame,
                    time: event.duration,
                }),
                _ => None,
            })
            .collect())
    }

    fn create_lease(&self, objects: &[u32]) -> io::Result<(u32, OwnedFd)> {
        let objects = objects
            .iter()
            .map(|&id| raw_handle(id))
            .collect::<io::Result<Vec<_>>>()?;
        let (lessee, fd) = self.fd.create_lease(&objects, libc::O_CLOEXEC as u32)?;
        Ok((lessee.get(), fd))
    }

    fn revoke_lease(&self, lessee: u32) -> io::Result<()> {
        self.fd.revoke_lease(raw_handle(lessee)?)
    }

    fn lessees(&self) -> io::Result<Vec<u32>> {
        Ok(self
            .fd
            .list_lessees()?
            .into_iter()
            .map(|id| id.get())
            .collect())
    }
}
