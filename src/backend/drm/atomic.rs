//! Atomic commit engine.
//!
//! Output states are turned into one atomic request in three steps. Preparation creates the kernel
//! objects the request refers to (mode, gamma and damage blobs, framebuffers, fences). Building
//! adds the properties, failing before any ioctl if one cannot be bound. After the ioctl the new
//! objects are either adopted by the CRTC and plane tables or dropped, which destroys them.

use std::cell::Cell;
use std::iter;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;

use anyhow::{bail, ensure, Context};

use super::device::{AtomicRequest, CommitFlags};
use super::helpers::{damage_blob, gamma_blob, linear_gamma, mode_blob, split_gamma};
use super::objects::PropertyBlob;
use super::types::{
    Connector, Crtc, PageFlip, Plane, RestoreState, ScanoutBuffer, LINK_STATUS_GOOD,
};
use super::DrmInner;
use crate::buffer::Buffer;
use crate::output::{Mode, Output, OutputState, StateFields};

/// One output taking part in a commit.
pub struct OutputCommit<'a> {
    pub connector: u32,
    pub output: &'a Output,
    pub state: &'a OutputState,
}

/// Kernel objects created for one output of a commit.
struct Prepared<'a> {
    commit: &'a OutputCommit<'a>,
    conn_idx: usize,
    crtc_idx: Option<usize>,
    enabled: bool,
    mode: Option<Mode>,
    /// `Some` when the mode blob changes, `Some(None)` clearing it.
    mode_blob: Option<Option<PropertyBlob>>,
    gamma_blob: Option<Option<PropertyBlob>>,
    /// Ramp for the legacy gamma ioctl, applied once the commit succeeded.
    legacy_gamma: Option<Vec<u16>>,
    damage_blob: Option<PropertyBlob>,
    primary: Option<ScanoutBuffer>,
    /// `Some` when the cursor plane changes, `Some(None)` hiding it.
    cursor: Option<Option<ScanoutBuffer>>,
    vrr: Option<bool>,
    in_fence: Option<OwnedFd>,
    /// Filled by the kernel with the out-fence descriptor.
    out_fence: Option<Box<Cell<i32>>>,
}

impl Prepared<'_> {
    fn modeset(&self) -> bool {
        self.mode_blob.is_some()
    }
}

/// Picks the CRTC for an output being enabled: the one it is bound to, else the first free CRTC
/// it can drive.
fn assign_crtc(connector: &Connector, crtcs: &[Crtc], claimed: &[usize]) -> Option<usize> {
    if connector.crtc.is_some() {
        return connector.crtc;
    }

    crtcs.iter().enumerate().position(|(idx, crtc)| {
        crtc.is_free() && !claimed.contains(&idx) && connector.possible_crtcs.contains(&crtc.id)
    })
}

fn import(inner: &DrmInner, buffer: &Rc<Buffer>) -> anyhow::Result<ScanoutBuffer> {
    let buffer = match &inner.blitter {
        Some(blitter) => blitter
            .copy(buffer)
            .context("error copying the buffer to the scanout GPU")?,
        None => buffer.clone(),
    };
    let fb = inner
        .fb_cache
        .get_or_create(&buffer)
        .context("error importing the buffer")?;
    Ok(ScanoutBuffer { buffer, fb })
}

fn prepare<'a>(
    inner: &DrmInner,
    commit: &'a OutputCommit<'a>,
    connectors: &[Connector],
    crtcs: &[Crtc],
    claimed: &mut Vec<usize>,
    test_only: bool,
) -> anyhow::Result<Prepared<'a>> {
    let state = commit.state;
    let output = commit.output;

    let conn_idx = connectors
        .iter()
        .position(|c| c.id == commit.connector)
        .context("the connector is gone")?;
    let connector = &connectors[conn_idx];
    ensure!(connector.lease.is_none(), "the connector is leased");

    let enabled = output.pending_enabled(state);
    let mode = output.pending_mode(state);

    let mut prepared = Prepared {
        commit,
        conn_idx,
        crtc_idx: None,
        enabled,
        mode,
        mode_blob: None,
        gamma_blob: None,
        legacy_gamma: None,
        damage_blob: None,
        primary: None,
        cursor: None,
        vrr: None,
        in_fence: None,
        out_fence: None,
    };

    if !enabled {
        // Nothing to turn off without a CRTC.
        if let Some(idx) = connector.crtc {
            prepared.crtc_idx = Some(idx);
            if crtcs[idx].mode.is_some() || crtcs[idx].active {
                prepared.mode_blob = Some(None);
            }
        }
        return Ok(prepared);
    }

    let crtc_idx = assign_crtc(connector, crtcs, claimed).context("no free CRTC")?;
    claimed.push(crtc_idx);
    prepared.crtc_idx = Some(crtc_idx);
    let crtc = &crtcs[crtc_idx];

    let mode = mode.context("no mode")?;
    if state.has(StateFields::MODE) || crtc.mode.is_none() || !crtc.active {
        let blob = PropertyBlob::create(&inner.device, &mode_blob(mode))
            .context("error creating the mode blob")?;
        prepared.mode_blob = Some(Some(blob));
    }

    if state.has(StateFields::GAMMA_LUT) {
        if crtc.props.gamma_lut.is_some() && crtc.gamma_lut_size > 0 {
            let blob = match &state.gamma_lut {
                Some(lut) => {
                    ensure!(
                        lut.len() == crtc.gamma_lut_size as usize * 3,
                        "gamma ramp has {} entries, expected {}",
                        lut.len(),
                        crtc.gamma_lut_size * 3
                    );
                    let data = gamma_blob(lut)?;
                    let blob = PropertyBlob::create(&inner.device, &data)
                        .context("error creating the gamma blob")?;
                    Some(blob)
                }
                None => None,
            };
            prepared.gamma_blob = Some(blob);
        } else if crtc.legacy_gamma_size > 0 {
            let size = crtc.legacy_gamma_size as usize;
            let ramp = match &state.gamma_lut {
                Some(lut) => {
                    ensure!(
                        lut.len() == size * 3,
                        "gamma ramp has {} entries, expected {}",
                        lut.len(),
                        size * 3
                    );
                    lut.clone()
                }
                None => linear_gamma(size),
            };
            prepared.legacy_gamma = Some(ramp);
        } else {
            bail!("setting gamma is not supported");
        }
    }

    if state.has(StateFields::ADAPTIVE_SYNC) {
        if state.adaptive_sync {
            ensure!(connector.vrr_capable, "the sink does not support adaptive sync");
            ensure!(
                crtc.props.vrr_enabled.is_some(),
                "the CRTC does not support adaptive sync"
            );
        }
        if crtc.props.vrr_enabled.is_some() {
            prepared.vrr = Some(state.adaptive_sync);
        }
    }

    if let Some(buffer) = state.buffer.as_ref().filter(|_| state.has(StateFields::BUFFER)) {
        prepared.primary = Some(import(inner, buffer)?);

        if state.has(StateFields::DAMAGE) {
            let has_clips = inner.planes.borrow()[crtc.primary]
                .props
                .fb_damage_clips
                .is_some();
            if has_clips {
                if let Some(data) = damage_blob(&state.damage, buffer.bounds()) {
                    let blob = PropertyBlob::create(&inner.device, &data)
                        .context("error creating the damage blob")?;
                    prepared.damage_blob = Some(blob);
                }
            }
        }
    }

    if let Some(point) = state
        .wait_timeline
        .as_ref()
        .filter(|_| state.has(StateFields::WAIT_TIMELINE))
    {
        let fence = point
            .export_sync_file()
            .context("error exporting the wait fence")?;
        prepared.in_fence = Some(fence);
    }

    if state.has(StateFields::SIGNAL_TIMELINE) && state.signal_timeline.is_some() {
        ensure!(
            crtc.props.out_fence_ptr.is_some(),
            "the CRTC does not support out fences"
        );
        if !test_only {
            prepared.out_fence = Some(Box::new(Cell::new(-1)));
        }
    }

    if crtc.cursor.is_some() && (connector.cursor.dirty || prepared.modeset()) {
        prepared.cursor = Some(match &connector.cursor.buffer {
            Some(buffer) => Some(import(inner, buffer)?),
            None => None,
        });
    }

    Ok(prepared)
}

fn add_plane(
    req: &mut AtomicRequest,
    plane: &Plane,
    crtc: &Crtc,
    fb: &ScanoutBuffer,
    (x, y): (i32, i32),
    (width, height): (u32, u32),
) {
    let (buf_w, buf_h) = fb.buffer.size();
    let p = &plane.props;
    req.add(plane.id, p.fb_id, u64::from(fb.fb.id()));
    req.add(plane.id, p.crtc_id, u64::from(crtc.id));
    req.add(plane.id, p.src_x, 0);
    req.add(plane.id, p.src_y, 0);
    req.add(plane.id, p.src_w, u64::from(buf_w) << 16);
    req.add(plane.id, p.src_h, u64::from(buf_h) << 16);
    // Signed values are passed sign-extended.
    req.add(plane.id, p.crtc_x, i64::from(x) as u64);
    req.add(plane.id, p.crtc_y, i64::from(y) as u64);
    req.add(plane.id, p.crtc_w, u64::from(width));
    req.add(plane.id, p.crtc_h, u64::from(height));
}

fn disable_plane(req: &mut AtomicRequest, plane: &Plane) {
    req.add(plane.id, plane.props.fb_id, 0);
    req.add(plane.id, plane.props.crtc_id, 0);
}

fn build(
    req: &mut AtomicRequest,
    prepared: &Prepared<'_>,
    connectors: &[Connector],
    crtcs: &[Crtc],
    planes: &[Plane],
) -> anyhow::Result<()> {
    let connector = &connectors[prepared.conn_idx];
    let Some(crtc_idx) = prepared.crtc_idx else {
        return Ok(());
    };
    let crtc = &crtcs[crtc_idx];
    let primary = &planes[crtc.primary];
    let cursor = crtc.cursor.map(|idx| &planes[idx]);

    if !prepared.enabled {
        req.add(connector.id, connector.props.crtc_id, 0);
        req.add(crtc.id, crtc.props.mode_id, 0);
        req.add(crtc.id, crtc.props.active, 0);
        if let (Some(prop), true) = (crtc.props.vrr_enabled, crtc.vrr_enabled) {
            req.add(crtc.id, prop, 0);
        }
        disable_plane(req, primary);
        if let Some(cursor) = cursor {
            disable_plane(req, cursor);
        }
        return Ok(());
    }

    let state = prepared.commit.state;
    let mode = prepared.mode.context("no mode")?;

    req.add(connector.id, connector.props.crtc_id, u64::from(crtc.id));
    if let Some(prop) = connector.props.link_status {
        req.add(connector.id, prop, LINK_STATUS_GOOD);
    }
    if state.has(StateFields::CONTENT_TYPE) && connector.props.content_type.is_some() {
        let name = state.content_type.kernel_name();
        let (prop, value) = connector
            .props
            .content_type_value(name)
            .with_context(|| format!("content type {name:?} is not supported"))?;
        req.add(connector.id, prop, value);
    }
    if prepared.modeset() {
        if let Some((prop, value)) = connector.props.max_bpc_value() {
            req.add(connector.id, prop, value);
        }
    }

    if let Some(blob) = &prepared.mode_blob {
        req.add(
            crtc.id,
            crtc.props.mode_id,
            blob.as_ref().map_or(0, |b| u64::from(b.id())),
        );
    }
    req.add(crtc.id, crtc.props.active, 1);
    if let (Some(prop), Some(vrr)) = (crtc.props.vrr_enabled, prepared.vrr) {
        req.add(crtc.id, prop, u64::from(vrr));
    }
    if let Some(blob) = &prepared.gamma_blob {
        let prop = crtc.props.gamma_lut.context("missing GAMMA_LUT")?;
        req.add(crtc.id, prop, blob.as_ref().map_or(0, |b| u64::from(b.id())));
    }
    if let Some(fence) = &prepared.out_fence {
        let prop = crtc.props.out_fence_ptr.context("missing OUT_FENCE_PTR")?;
        req.add(crtc.id, prop, fence.as_ptr() as u64);
    }

    let (width, height) = mode.size();
    match prepared.primary.as_ref().or(primary.latest()) {
        Some(fb) => {
            add_plane(
                req,
                primary,
                crtc,
                fb,
                (0, 0),
                (u32::from(width), u32::from(height)),
            );
        }
        None => debug!("{}: enabling without a buffer", connector.name),
    }
    if let Some(fence) = &prepared.in_fence {
        let prop = primary
            .props
            .in_fence_fd
            .context("the primary plane does not support in fences")?;
        req.add(primary.id, prop, fence.as_raw_fd() as u64);
    }
    if let Some(blob) = &prepared.damage_blob {
        let prop = primary.props.fb_damage_clips.context("missing FB_DAMAGE_CLIPS")?;
        req.add(primary.id, prop, u64::from(blob.id()));
    }

    if let (Some(cursor), Some(update)) = (cursor, &prepared.cursor) {
        match update {
            Some(fb) => {
                let state = &connector.cursor;
                add_plane(
                    req,
                    cursor,
                    crtc,
                    fb,
                    (state.x - state.hotspot.0, state.y - state.hotspot.1),
                    fb.buffer.size(),
                );
            }
            None => disable_plane(req, cursor),
        }
    }

    Ok(())
}

fn commit_flags(prepared: &[Prepared<'_>], test_only: bool) -> CommitFlags {
    let mut flags = CommitFlags::empty();
    if test_only {
        flags |= CommitFlags::TEST_ONLY;
    }
    if prepared.iter().any(|p| p.modeset()) {
        flags |= CommitFlags::ALLOW_MODESET;
    }
    let blocking = prepared.iter().any(|p| p.commit.state.blocking);
    if !test_only && !blocking {
        flags |= CommitFlags::NONBLOCK;
    }
    if !test_only && prepared.iter().any(|p| p.enabled && p.crtc_idx.is_some()) {
        flags |= CommitFlags::PAGE_FLIP_EVENT;
    }
    flags
}

fn describe(commits: &[OutputCommit<'_>]) -> String {
    let names = commits
        .iter()
        .map(|c| c.output.name())
        .collect::<Vec<_>>();
    names.join(", ")
}

/// Tests or commits the states. Returns whether the kernel accepted them.
pub fn commit(inner: &DrmInner, commits: &[OutputCommit<'_>], test_only: bool) -> bool {
    let _span = tracy_client::span!("drm::atomic::commit");

    let what = if test_only { "test" } else { "commit" };
    let outputs = describe(commits);

    let prepared = {
        let connectors = inner.connectors.borrow();
        let crtcs = inner.crtcs.borrow();

        let mut claimed = Vec::new();
        let mut prepared = Vec::with_capacity(commits.len());
        for commit in commits {
            match prepare(inner, commit, &connectors, &crtcs, &mut claimed, test_only) {
                Ok(p) => prepared.push(p),
                Err(err) => {
                    if test_only {
                        debug!("{}: {}: rejecting {what}: {err:?}", inner.name, commit.output.name());
                    } else {
                        warn!("{}: {}: rejecting {what}: {err:?}", inner.name, commit.output.name());
                    }
                    return false;
                }
            }
        }
        prepared
    };

    if !test_only {
        let flips = inner.flips.borrow();
        let crtcs = inner.crtcs.borrow();
        let busy = prepared
            .iter()
            .filter_map(|p| p.crtc_idx)
            .any(|idx| flips.contains_key(&crtcs[idx].id));
        if busy {
            debug!("{}: {outputs}: a page flip is still pending", inner.name);
            return false;
        }
    }

    let mut req = AtomicRequest::new();
    {
        let connectors = inner.connectors.borrow();
        let crtcs = inner.crtcs.borrow();
        let planes = inner.planes.borrow();
        for p in &prepared {
            if let Err(err) = build(&mut req, p, &connectors, &crtcs, &planes) {
                if test_only {
                    debug!("{}: {}: error building the request: {err:?}", inner.name, p.commit.output.name());
                } else {
                    error!("{}: {}: error building the request: {err:?}", inner.name, p.commit.output.name());
                }
                return false;
            }
        }
    }

    if req.is_empty() {
        // Nothing reaches the kernel, e.g. disabling an output that has no CRTC.
        if !test_only {
            for p in &prepared {
                p.commit.output.apply_committed(p.commit.state);
            }
        }
        return true;
    }

    let flags = commit_flags(&prepared, test_only);
    trace!("{}: {outputs}: atomic {what} with {flags:?}", inner.name);

    if let Err(err) = inner.device.atomic_commit(&req, flags) {
        if test_only {
            debug!("{}: {outputs}: atomic test failed: {err:?}", inner.name);
        } else {
            error!("{}: {outputs}: atomic commit failed: {err:?}", inner.name);
        }
        // Dropping the prepared objects destroys the blobs created for this commit.
        return false;
    }

    if test_only {
        return true;
    }

    finish(inner, prepared, flags);
    true
}

/// Adopts the objects of a successful commit.
fn finish(inner: &DrmInner, prepared: Vec<Prepared<'_>>, flags: CommitFlags) {
    let mut flipped = Vec::new();
    let mut legacy_gamma = Vec::new();

    {
        let mut connectors = inner.connectors.borrow_mut();
        let mut crtcs = inner.crtcs.borrow_mut();
        let mut planes = inner.planes.borrow_mut();

        for mut p in prepared {
            let connector = &mut connectors[p.conn_idx];
            let state = p.commit.state;

            let Some(crtc_idx) = p.crtc_idx else {
                connector.restore = RestoreState::default();
                flipped.push((p.commit, None));
                continue;
            };
            let crtc = &mut crtcs[crtc_idx];

            if !p.enabled {
                connector.crtc = None;
                connector.restore = RestoreState::default();
                crtc.connector = None;
                crtc.mode = None;
                crtc.active = false;
                crtc.vrr_enabled = false;
                planes[crtc.primary].clear();
                if let Some(cursor) = crtc.cursor {
                    planes[cursor].clear();
                }
                flipped.push((p.commit, None));
                continue;
            }

            connector.crtc = Some(crtc_idx);
            crtc.connector = Some(connector.id);
            crtc.active = true;
            if let Some(blob) = p.mode_blob.take() {
                // The superseded blob is destroyed here.
                crtc.mode = blob;
            }
            if let Some(blob) = p.gamma_blob.take() {
                crtc.gamma = blob;
            }
            if let Some(vrr) = p.vrr {
                crtc.vrr_enabled = vrr;
            }
            if let Some(ramp) = p.legacy_gamma.take() {
                legacy_gamma.push((crtc.id, ramp));
            }

            if let Some(fb) = p.primary.take() {
                planes[crtc.primary].queued = Some(fb);
            }
            if let (Some(cursor), Some(update)) = (crtc.cursor, p.cursor.take()) {
                let plane = &mut planes[cursor];
                if update.is_none() {
                    plane.current = None;
                }
                plane.queued = update;
                connector.cursor.dirty = false;
            }

            if let Some(fence) = p.out_fence.take() {
                import_out_fence(&inner.name, p.commit, fence.get());
            }

            connector.restore = RestoreState {
                enabled: true,
                mode: p.mode,
                buffer: planes[crtc.primary].latest().map(|fb| fb.buffer.clone()),
                adaptive_sync: crtc.vrr_enabled,
                gamma_lut: if state.has(StateFields::GAMMA_LUT) {
                    state.gamma_lut.clone()
                } else {
                    connector.restore.gamma_lut.take()
                },
            };

            let crtc_id = flags
                .contains(CommitFlags::PAGE_FLIP_EVENT)
                .then_some(crtc.id);
            flipped.push((p.commit, crtc_id));
        }
    }

    for (crtc, ramp) in legacy_gamma {
        if let Err(err) = set_legacy_gamma(inner, crtc, &ramp) {
            warn!("{}: error setting gamma on CRTC {crtc}: {err:?}", inner.name);
        }
    }

    for (commit, crtc) in flipped {
        let commit_seq = commit.output.apply_committed(commit.state);
        if let Some(crtc) = crtc {
            inner.flips.borrow_mut().insert(
                crtc,
                PageFlip {
                    connector: commit.connector,
                    output: commit.output.clone(),
                    commit_seq,
                },
            );
        }
    }
}

fn set_legacy_gamma(inner: &DrmInner, crtc: u32, ramp: &[u16]) -> anyhow::Result<()> {
    let (red, green, blue) = split_gamma(ramp)?;
    inner
        .device
        .set_gamma(crtc, red, green, blue)
        .context("error setting gamma")
}

fn import_out_fence(device: &str, commit: &OutputCommit<'_>, fd: i32) {
    if fd < 0 {
        debug!("{device}: {}: the kernel returned no out fence", commit.output.name());
        return;
    }

    // SAFETY: the kernel wrote a new sync_file descriptor that we now own.
    let fence = unsafe { OwnedFd::from_raw_fd(fd) };
    if let Some(point) = &commit.state.signal_timeline {
        if let Err(err) = point.import_sync_file(fence.as_fd()) {
            warn!("{device}: {}: error importing the out fence: {err:?}", commit.output.name());
        }
    }
}

/// Turns every CRTC and plane off in one modeset.
///
/// Failures are logged and otherwise ignored: the next commit of every output does a full modeset
/// anyway.
pub fn reset(inner: &DrmInner) {
    let _span = tracy_client::span!("drm::atomic::reset");

    let mut req = AtomicRequest::new();
    {
        let connectors = inner.connectors.borrow();
        let crtcs = inner.crtcs.borrow();
        let planes = inner.planes.borrow();

        for connector in connectors.iter().filter(|c| c.lease.is_none()) {
            req.add(connector.id, connector.props.crtc_id, 0);
        }
        for crtc in crtcs.iter().filter(|c| c.lease.is_none()) {
            req.add(crtc.id, crtc.props.mode_id, 0);
            req.add(crtc.id, crtc.props.active, 0);
        }
        let leased_planes = crtcs
            .iter()
            .filter(|c| c.lease.is_some())
            .flat_map(|c| iter::once(c.primary).chain(c.cursor))
            .collect::<Vec<_>>();
        for (idx, plane) in planes.iter().enumerate() {
            if !leased_planes.contains(&idx) {
                disable_plane(&mut req, plane);
            }
        }
    }

    if let Err(err) = inner
        .device
        .atomic_commit(&req, CommitFlags::ALLOW_MODESET)
    {
        error!("{}: error resetting the device: {err:?}", inner.name);
        return;
    }

    let mut connectors = inner.connectors.borrow_mut();
    let mut crtcs = inner.crtcs.borrow_mut();
    let mut planes = inner.planes.borrow_mut();
    for connector in connectors.iter_mut().filter(|c| c.lease.is_none()) {
        connector.crtc = None;
    }
    for crtc in crtcs.iter_mut().filter(|c| c.lease.is_none()) {
        crtc.connector = None;
        crtc.mode = None;
        crtc.active = false;
        crtc.vrr_enabled = false;
        planes[crtc.primary].clear();
        if let Some(cursor) = crtc.cursor {
            planes[cursor].clear();
        }
    }
    inner.flips.borrow_mut().clear();
}
