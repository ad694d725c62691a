//! Pure helper functions for the DRM backend.
//!
//! Mode math, kernel blob encoding and EDID parsing. Nothing in here touches a device.

use std::iter::zip;
use std::time::Duration;

use anyhow::{ensure, Context};
use bytemuck::{Pod, Zeroable};
use smithay::reexports::drm::control::{self, ModeFlags, ModeTypeFlags};

use crate::buffer::{clip_damage, Rect};

// =============================================================================
// Mode Calculations
// =============================================================================

/// Calculate the refresh interval from a DRM mode.
pub fn refresh_interval(mode: control::Mode) -> Duration {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;

    let mut numerator = htotal * vtotal * 1_000_000;
    let mut denominator = clock;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        denominator *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        numerator *= 2;
    }

    if mode.vscan() > 1 {
        numerator *= mode.vscan() as u64;
    }

    if denominator == 0 {
        return Duration::ZERO;
    }

    let refresh_interval = (numerator + denominator / 2) / denominator;
    Duration::from_nanos(refresh_interval)
}

/// Calculate a DRM mode using CVT (Coordinated Video Timings).
pub fn calculate_mode_cvt(width: u16, height: u16, refresh: f64) -> control::Mode {
    // Cross-checked with wlroots' implementation:
    // https://gitlab.freedesktop.org/wlroots/wlroots/-/blob/22528542970687720556035790212df8d9bb30bb/backend/drm/util.c#L251

    let options = libdisplay_info::cvt::Options {
        red_blank_ver: libdisplay_info::cvt::ReducedBlankingVersion::None,
        h_pixels: width as i32,
        v_lines: height as i32,
        ip_freq_rqd: refresh,

        // Defaults
        video_opt: false,
        vblank: 0f64,
        additional_hblank: 0,
        early_vsync_rqd: false,
        int_rqd: false,
        margins_rqd: false,
    };
    let cvt_timing = libdisplay_info::cvt::Timing::compute(options);

    let hsync_start = width + cvt_timing.h_front_porch as u16;
    let vsync_start = (cvt_timing.v_lines_rnd + cvt_timing.v_front_porch) as u16;
    let hsync_end = hsync_start + cvt_timing.h_sync as u16;
    let vsync_end = vsync_start + cvt_timing.v_sync as u16;

    let htotal = hsync_end + cvt_timing.h_back_porch as u16;
    let vtotal = vsync_end + cvt_timing.v_back_porch as u16;

    let clock = f64::round(cvt_timing.act_pixel_freq * 1000f64) as u32;
    let vrefresh = f64::round(cvt_timing.act_frame_rate) as u32;

    let flags = drm_ffi::DRM_MODE_FLAG_NHSYNC | drm_ffi::DRM_MODE_FLAG_PVSYNC;

    let mode_name = format!("{width}x{height}@{:.2}", cvt_timing.act_frame_rate);
    let name = modeinfo_name_slice_from_string(&mode_name);

    control::Mode::from(drm_ffi::drm_sys::drm_mode_modeinfo {
        clock,

        hdisplay: width,
        hsync_start,
        hsync_end,
        htotal,

        vdisplay: height,
        vsync_start,
        vsync_end,
        vtotal,

        vrefresh,

        flags,
        type_: drm_ffi::DRM_MODE_TYPE_USERDEF,
        name,

        // Defaults
        hskew: 0,
        vscan: 0,
    })
}

/// Convert a string to a mode name slice (max 31 chars + null terminator).
fn modeinfo_name_slice_from_string(mode_name: &str) -> [core::ffi::c_char; 32] {
    let mut name: [core::ffi::c_char; 32] = [0; 32];

    for (a, b) in zip(&mut name[..31], mode_name.as_bytes()) {
        // Can be u8 on aarch64 and i8 on x86_64.
        *a = *b as _;
    }

    name
}

/// Mode a freshly connected output starts with: the preferred mode with the highest refresh
/// rate, else the first one.
pub fn preferred_mode(modes: &[control::Mode]) -> Option<control::Mode> {
    let mut mode: Option<&control::Mode> = None;

    for m in modes {
        if !m.mode_type().contains(ModeTypeFlags::PREFERRED) {
            continue;
        }
        // Interlaced modes don't appear to work.
        if m.flags().contains(ModeFlags::INTERLACE) {
            continue;
        }

        match mode {
            Some(curr) if curr.vrefresh() >= m.vrefresh() => (),
            _ => mode = Some(m),
        }
    }

    mode.or_else(|| modes.first()).copied()
}

// =============================================================================
// Kernel Blob Layouts
// =============================================================================

/// `struct drm_mode_modeinfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ModeInfoBlob {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; 32],
}

impl From<control::Mode> for ModeInfoBlob {
    fn from(mode: control::Mode) -> Self {
        let raw = drm_ffi::drm_mode_modeinfo::from(mode);
        let mut name = [0u8; 32];
        for (a, b) in zip(&mut name, raw.name) {
            *a = b as u8;
        }

        Self {
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            vrefresh: raw.vrefresh,
            flags: raw.flags,
            type_: raw.type_,
            name,
        }
    }
}

/// `struct drm_color_lut`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ColorLutEntry {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub reserved: u16,
}

/// `struct drm_mode_rect`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DamageRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

pub fn mode_blob(mode: control::Mode) -> Vec<u8> {
    bytemuck::bytes_of(&ModeInfoBlob::from(mode)).to_vec()
}

/// Encodes a ramp laid out as all red entries, then green, then blue.
pub fn gamma_blob(ramp: &[u16]) -> anyhow::Result<Vec<u8>> {
    let (red, green, blue) = split_gamma(ramp)?;
    let entries = zip(zip(red, green), blue)
        .map(|((&red, &green), &blue)| ColorLutEntry {
            red,
            green,
            blue,
            reserved: 0,
        })
        .collect::<Vec<_>>();
    Ok(bytemuck::cast_slice(&entries).to_vec())
}

/// Encodes `damage` clipped to `bounds`. `None` when nothing is left after clipping.
pub fn damage_blob(damage: &[Rect], bounds: Rect) -> Option<Vec<u8>> {
    let rects = clip_damage(damage, bounds)
        .into_iter()
        .map(|r| DamageRect {
            x1: r.x,
            y1: r.y,
            x2: r.x + r.width,
            y2: r.y + r.height,
        })
        .collect::<Vec<_>>();

    if rects.is_empty() {
        return None;
    }
    Some(bytemuck::cast_slice(&rects).to_vec())
}

pub fn split_gamma(ramp: &[u16]) -> anyhow::Result<(&[u16], &[u16], &[u16])> {
    ensure!(
        !ramp.is_empty() && ramp.len() % 3 == 0,
        "gamma ramp length {} is not a multiple of 3",
        ramp.len()
    );
    let size = ramp.len() / 3;
    let (red, rest) = ramp.split_at(size);
    let (green, blue) = rest.split_at(size);
    Ok((red, green, blue))
}

/// Linear ramp of `size` entries per channel.
///
/// The legacy API provides no way to reset the gamma, so this is set manually instead.
pub fn linear_gamma(size: usize) -> Vec<u16> {
    let _span = tracy_client::span!("linear_gamma");

    let mut ramp = vec![0u16; size * 3];
    if size < 2 {
        return ramp;
    }

    let (red, rest) = ramp.split_at_mut(size);
    let (green, blue) = rest.split_at_mut(size);
    let denom = size as u64 - 1;
    for (i, ((r, g), b)) in zip(zip(red, green), blue).enumerate() {
        let value = (0xFFFFu64 * i as u64 / denom) as u16;
        *r = value;
        *g = value;
        *b = value;
    }

    ramp
}

// =============================================================================
// EDID Helpers
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdidInfo {
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

pub fn parse_edid(data: &[u8]) -> anyhow::Result<EdidInfo> {
    let info = libdisplay_info::info::Info::parse_edid(data).context("error parsing EDID")?;
    Ok(EdidInfo {
        make: info.make(),
        model: info.model(),
        serial: info.serial(),
    })
}

// =============================================================================
// Tests
// =============================================================================
