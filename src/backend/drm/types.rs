//! Type definitions for the DRM backend.
//!
//! CRTC, plane and connector tables, with the property IDs looked up when the device was opened.

use std::rc::Rc;

use anyhow::Context;

use super::device::{KmsDevice, ObjectKind, PropertyInfo, PropertyKind};
use super::objects::{Framebuffer, PropertyBlob};
use super::tile::TileInfo;
use crate::buffer::Buffer;
use crate::output::{Mode, Output, OutputInfo};

// =============================================================================
// Constants
// =============================================================================

/// Value of the connector `link-status` property when the link is good.
pub const LINK_STATUS_GOOD: u64 = 0;

/// Requested `max bpc`, clamped to the connector's range.
pub const MAX_BPC: u64 = 16;

/// `DRM_PLANE_TYPE_*`.
const PLANE_TYPE_OVERLAY: u64 = 0;
const PLANE_TYPE_PRIMARY: u64 = 1;
const PLANE_TYPE_CURSOR: u64 = 2;

// =============================================================================
// Properties
// =============================================================================

/// Properties of one object, as read from the device.
pub struct PropertySet {
    props: Vec<PropertyInfo>,
}

impl PropertySet {
    pub fn read(device: &dyn KmsDevice, object: u32, kind: ObjectKind) -> anyhow::Result<Self> {
        let props = device
            .properties(object, kind)
            .with_context(|| format!("error getting properties of {kind:?} {object}"))?;
        Ok(Self { props })
    }

    pub fn find(&self, name: &str) -> Option<&PropertyInfo> {
        self.props.iter().find(|p| p.name == name)
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.find(name).map(|p| p.id)
    }

    pub fn require(&self, name: &str) -> anyhow::Result<u32> {
        self.id(name)
            .with_context(|| format!("missing required property {name:?}"))
    }

    pub fn value(&self, name: &str) -> Option<u64> {
        self.find(name).map(|p| p.value)
    }
}

#[derive(Debug, Clone)]
pub struct CrtcProps {
    pub mode_id: u32,
    pub active: u32,
    pub gamma_lut: Option<u32>,
    pub vrr_enabled: Option<u32>,
    pub out_fence_ptr: Option<u32>,
}

impl CrtcProps {
    pub fn from_set(set: &PropertySet) -> anyhow::Result<Self> {
        Ok(Self {
            mode_id: set.require("MODE_ID")?,
            active: set.require("ACTIVE")?,
            gamma_lut: set.id("GAMMA_LUT"),
            vrr_enabled: set.id("VRR_ENABLED"),
            out_fence_ptr: set.id("OUT_FENCE_PTR"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlaneProps {
    pub fb_id: u32,
    pub crtc_id: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub crtc_x: u32,
    pub crtc_y: u32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    pub in_fence_fd: Option<u32>,
    pub fb_damage_clips: Option<u32>,
}

impl PlaneProps {
    pub fn from_set(set: &PropertySet) -> anyhow::Result<Self> {
        Ok(Self {
            fb_id: set.require("FB_ID")?,
            crtc_id: set.require("CRTC_ID")?,
            src_x: set.require("SRC_X")?,
            src_y: set.require("SRC_Y")?,
            src_w: set.require("SRC_W")?,
            src_h: set.require("SRC_H")?,
            crtc_x: set.require("CRTC_X")?,
            crtc_y: set.require("CRTC_Y")?,
            crtc_w: set.require("CRTC_W")?,
            crtc_h: set.require("CRTC_H")?,
            in_fence_fd: set.id("IN_FENCE_FD"),
            fb_damage_clips: set.id("FB_DAMAGE_CLIPS"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorProps {
    pub crtc_id: u32,
    pub link_status: Option<u32>,
    /// `content type` and its enum entries.
    pub content_type: Option<(u32, Vec<(String, u64)>)>,
    /// `max bpc` and its range.
    pub max_bpc: Option<(u32, u64, u64)>,
}

impl ConnectorProps {
    pub fn from_set(set: &PropertySet) -> anyhow::Result<Self> {
        let content_type = set.find("content type").and_then(|p| match &p.kind {
            PropertyKind::Enum(values) => Some((p.id, values.clone())),
            _ => None,
        });
        let max_bpc = set.find("max bpc").and_then(|p| match p.kind {
            PropertyKind::Range { min, max } => Some((p.id, min, max)),
            _ => None,
        });

        Ok(Self {
            crtc_id: set.require("CRTC_ID")?,
            link_status: set.id("link-status"),
            content_type,
            max_bpc,
        })
    }

    pub fn content_type_value(&self, name: &str) -> Option<(u32, u64)> {
        let (id, values) = self.content_type.as_ref()?;
        values
            .iter()
            .find_map(|(n, value)| (n == name).then_some((*id, *value)))
    }

    pub fn max_bpc_value(&self) -> Option<(u32, u64)> {
        self.max_bpc
            .map(|(id, min, max)| (id, MAX_BPC.clamp(min, max.max(min))))
    }
}

// =============================================================================
// Object Tables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Primary,
    Cursor,
    Overlay,
}

impl PlaneType {
    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            PLANE_TYPE_PRIMARY => Some(Self::Primary),
            PLANE_TYPE_CURSOR => Some(Self::Cursor),
            PLANE_TYPE_OVERLAY => Some(Self::Overlay),
            _ => None,
        }
    }
}

/// A buffer attached to a plane together with its framebuffer.
#[derive(Debug, Clone)]
pub struct ScanoutBuffer {
    pub buffer: Rc<Buffer>,
    pub fb: Rc<Framebuffer>,
}

pub struct Plane {
    pub id: u32,
    pub ty: PlaneType,
    pub possible_crtcs: Vec<u32>,
    pub formats: Vec<u32>,
    pub props: PlaneProps,
    /// On screen.
    pub current: Option<ScanoutBuffer>,
    /// Committed, waiting for the page flip.
    pub queued: Option<ScanoutBuffer>,
}

impl Plane {
    /// Buffer the plane shows once pending flips complete.
    pub fn latest(&self) -> Option<&ScanoutBuffer> {
        self.queued.as_ref().or(self.current.as_ref())
    }

    pub fn flip_done(&mut self) {
        if let Some(queued) = self.queued.take() {
            self.current = Some(queued);
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.queued = None;
    }
}

pub struct Crtc {
    pub id: u32,
    pub props: CrtcProps,
    /// Value of `GAMMA_LUT_SIZE`.
    pub gamma_lut_size: u64,
    pub legacy_gamma_size: u32,
    /// Index into the plane table.
    pub primary: usize,
    pub cursor: Option<usize>,
    pub mode: Option<PropertyBlob>,
    pub gamma: Option<PropertyBlob>,
    pub active: bool,
    pub vrr_enabled: bool,
    /// Connector driving this CRTC.
    pub connector: Option<u32>,
    /// Lessee holding this CRTC.
    pub lease: Option<u32>,
}

impl Crtc {
    pub fn is_free(&self) -> bool {
        self.connector.is_none() && self.lease.is_none()
    }

    /// Gamma ramp size per channel, preferring the atomic property over the legacy API.
    pub fn gamma_size(&self) -> usize {
        if self.props.gamma_lut.is_some() && self.gamma_lut_size > 0 {
            self.gamma_lut_size as usize
        } else {
            self.legacy_gamma_size as usize
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CursorState {
    pub buffer: Option<Rc<Buffer>>,
    pub hotspot: (i32, i32),
    pub x: i32,
    pub y: i32,
    /// Changed since the last commit.
    pub dirty: bool,
}

/// Last committed state, re-applied when the session becomes active again.
#[derive(Debug, Clone, Default)]
pub struct RestoreState {
    pub enabled: bool,
    pub mode: Option<Mode>,
    pub buffer: Option<Rc<Buffer>>,
    pub adaptive_sync: bool,
    pub gamma_lut: Option<Vec<u16>>,
}

pub struct Connector {
    pub id: u32,
    pub name: String,
    pub props: ConnectorProps,
    pub possible_crtcs: Vec<u32>,
    pub connected: bool,
    pub vrr_capable: bool,
    pub non_desktop: bool,
    pub tile: Option<TileInfo>,
    /// Index into the CRTC table.
    pub crtc: Option<usize>,
    pub info: OutputInfo,
    pub output: Option<Output>,
    pub cursor: CursorState,
    pub restore: RestoreState,
    pub lease: Option<u32>,
}

/// An in-flight commit waiting for its page-flip event.
pub struct PageFlip {
    pub connector: u32,
    pub output: Output,
    pub commit_seq: u64,
}
