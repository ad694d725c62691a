use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use insta::assert_snapshot;
use smithay::backend::allocator::Fourcc;
use tracing::Level;

use super::device::{AtomicRequest, CommitFlags};
use super::helpers::{linear_gamma, refresh_interval};
use super::stub::{
    crtc_id, cursor_id, prop, primary_id, Op, StubConfig, StubConnector, StubDevice,
    CONNECTOR_BASE,
};
use super::*;
use crate::backend::OutputCommit;
use crate::buffer::{Buffer, Rect, ShmPixels, SyncPoint, Timeline};
use crate::output::{ContentType, OutputState, PresentEvent, PresentFlags};
use crate::utils::logs;

fn backend_with(config: StubConfig, options: DrmOptions) -> (Rc<StubDevice>, DrmBackend) {
    let device = Rc::new(StubDevice::new(config));
    let backend = DrmBackend::with_device("stub", device.clone(), options).unwrap();
    (device, backend)
}

fn backend(config: StubConfig) -> (Rc<StubDevice>, DrmBackend) {
    backend_with(config, DrmOptions::default())
}

fn buffer(width: u32, height: u32) -> Rc<Buffer> {
    let pixels = ShmPixels {
        data: Vec::new().into(),
        stride: width * 4,
        bytes_per_pixel: 4,
    };
    Rc::new(Buffer::from_shm(width, height, Fourcc::Argb8888, pixels))
}

fn enable_state(output: &Output, buffer: &Rc<Buffer>) -> OutputState {
    let mut state = OutputState::new();
    state.set_enabled(true);
    state.set_mode(output.info().modes[0]);
    state.set_buffer(buffer.clone());
    state
}

/// Enables the output and completes the page flip.
fn enable(backend: &DrmBackend, output: &Output) -> Rc<Buffer> {
    let buffer = buffer(1920, 1080);
    assert!(output.commit(&enable_state(output, &buffer)));
    backend.dispatch();
    buffer
}

fn last_commit(device: &StubDevice) -> (CommitFlags, AtomicRequest) {
    device.commits().pop().unwrap()
}

fn describe(request: &AtomicRequest) -> String {
    let names = [
        "MODE_ID", "ACTIVE", "GAMMA_LUT", "VRR_ENABLED", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y",
        "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "link-status", "max bpc",
        "content type",
    ];
    let mut lines = Vec::new();
    for p in request.props() {
        let name = names
            .iter()
            .find(|n| prop(n) == p.property)
            .copied()
            .unwrap_or("?");
        lines.push(format!("{} {name} = {}", p.object, p.value));
    }
    lines.join("\n")
}

fn value_in(request: &AtomicRequest, object: u32, name: &str) -> Option<u64> {
    request
        .props()
        .iter()
        .find(|p| p.object == object && p.property == prop(name))
        .map(|p| p.value)
}

/// Hands out `/dev/null` as fences and records what passes through.
#[derive(Default)]
struct RecordingTimeline {
    exported: RefCell<Vec<(u64, i32)>>,
    imported: RefCell<Vec<u64>>,
}

impl Timeline for RecordingTimeline {
    fn export_sync_file(&self, point: u64) -> io::Result<OwnedFd> {
        let fd = OwnedFd::from(File::open("/dev/null")?);
        self.exported.borrow_mut().push((point, fd.as_raw_fd()));
        Ok(fd)
    }

    fn import_sync_file(&self, point: u64, _sync_file: BorrowedFd<'_>) -> io::Result<()> {
        self.imported.borrow_mut().push(point);
        Ok(())
    }
}

/// A page flip with a new buffer on an enabled output.
fn flip_state(buffer: &Rc<Buffer>) -> OutputState {
    let mut state = OutputState::new();
    state.set_buffer(buffer.clone());
    state
}

fn record_presents(output: &Output) -> Rc<RefCell<Vec<PresentEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let events_ = events.clone();
    output
        .events()
        .present
        .connect(move |event| events_.borrow_mut().push(*event))
        .forget();
    events
}

#[test]
fn enable_then_disable() {
    let (device, backend) = backend(StubConfig::default());

    let announced = Rc::new(RefCell::new(Vec::new()));
    {
        let announced = announced.clone();
        backend
            .events()
            .new_output
            .connect(move |output| announced.borrow_mut().push(output.name().to_owned()))
            .forget();
    }
    backend.start().unwrap();
    assert_eq!(*announced.borrow(), ["DP-1"]);

    let output = backend.outputs()[0].clone();
    assert_eq!(output.info().preferred_mode, Some(output.info().modes[0]));
    assert_eq!(output.info().description, "Unknown Unknown (DP-1)");

    let buffer = buffer(1920, 1080);
    let enable = enable_state(&output, &buffer);
    assert!(output.commit(&enable));
    assert!(output.is_enabled());

    let (flags, request) = last_commit(&device);
    assert_eq!(
        flags,
        CommitFlags::ALLOW_MODESET | CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT
    );
    assert_snapshot!(describe(&request), @r"
    40 CRTC_ID = 10
    40 link-status = 0
    40 max bpc = 12
    10 MODE_ID = 100
    10 ACTIVE = 1
    20 FB_ID = 101
    20 CRTC_ID = 10
    20 SRC_X = 0
    20 SRC_Y = 0
    20 SRC_W = 125829120
    20 SRC_H = 70778880
    20 CRTC_X = 0
    20 CRTC_Y = 0
    20 CRTC_W = 1920
    20 CRTC_H = 1080
    ");
    assert_eq!(device.live_blobs(), [100]);

    backend.dispatch();

    let mut disable = OutputState::new();
    disable.set_enabled(false);
    assert!(output.commit(&disable));
    assert!(!output.is_enabled());

    let (flags, request) = last_commit(&device);
    assert_eq!(flags, CommitFlags::ALLOW_MODESET | CommitFlags::NONBLOCK);
    let crtc = crtc_id(0);
    let plane = primary_id(0);
    assert_eq!(request.get(CONNECTOR_BASE, prop("CRTC_ID")), Some(0));
    assert_eq!(request.get(crtc, prop("MODE_ID")), Some(0));
    assert_eq!(request.get(crtc, prop("ACTIVE")), Some(0));
    assert_eq!(request.get(plane, prop("FB_ID")), Some(0));
    assert_eq!(request.get(plane, prop("CRTC_ID")), Some(0));
    assert!(device.live_blobs().is_empty());
    assert!(backend.inner.flips.borrow().is_empty());

    // The framebuffer lives as long as its buffer.
    assert!(!device.ops().contains(&Op::DestroyFb(101)));
    drop(enable);
    drop(buffer);
    assert!(device.ops().contains(&Op::DestroyFb(101)));
    assert!(backend.inner.fb_cache.is_empty());
}

#[test]
fn superseded_mode_blobs_are_destroyed_after_the_commit() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let modes = output.info().modes.clone();
    let _buffer = enable(&backend, &output);

    let crtc = crtc_id(0);
    let mut blobs = vec![device.value(crtc, "MODE_ID") as u32];
    for mode in &modes[1..3] {
        let mut state = OutputState::new();
        state.set_mode(*mode);
        assert!(output.commit(&state));
        backend.dispatch();

        let blob = device.value(crtc, "MODE_ID") as u32;
        assert_eq!(device.live_blobs(), [blob]);
        assert_eq!(output.current_mode(), Some(*mode));
        blobs.push(blob);
    }

    let ops = device.ops();
    for pair in blobs.windows(2) {
        let destroys = ops
            .iter()
            .filter(|op| **op == Op::DestroyBlob(pair[0]))
            .count();
        assert_eq!(destroys, 1);

        let destroyed_at = ops.iter().position(|op| *op == Op::DestroyBlob(pair[0]));
        let committed_at = ops.iter().position(|op| match op {
            Op::Commit { request, .. } => {
                request.get(crtc, prop("MODE_ID")) == Some(u64::from(pair[1]))
            }
            _ => false,
        });
        assert!(destroyed_at > committed_at);
    }
}

#[test]
fn failed_modeset_keeps_the_current_blob() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let modes = output.info().modes.clone();
    let _buffer = enable(&backend, &output);
    let current = device.live_blobs();

    device.reject_commits.set(true);
    let mut state = OutputState::new();
    state.set_mode(modes[1]);
    let ops_before = device.ops().len();
    assert!(!output.commit(&state));

    let ops = device.ops();
    let new_ops = &ops[ops_before..];
    let [Op::CreateBlob(created), Op::Commit { .. }, Op::DestroyBlob(destroyed)] = new_ops else {
        panic!("unexpected ops: {new_ops:?}");
    };
    assert_eq!(created, destroyed);
    assert_eq!(device.live_blobs(), current);
    assert_eq!(output.current_mode(), Some(modes[0]));
    assert_eq!(output.commit_seq(), 1);

    device.reject_commits.set(false);
    assert!(output.commit(&state));
    assert_eq!(output.current_mode(), Some(modes[1]));
    assert_eq!(device.live_blobs().len(), 1);
}

#[test]
fn inherited_blobs_are_never_destroyed() {
    let device = Rc::new(StubDevice::new(StubConfig::default()));
    {
        let mut values = device.values.borrow_mut();
        values.insert((crtc_id(0), prop("MODE_ID")), 999);
        values.insert((crtc_id(0), prop("ACTIVE")), 1);
        values.insert((CONNECTOR_BASE, prop("CRTC_ID")), u64::from(crtc_id(0)));
    }
    let backend = DrmBackend::with_device("stub", device.clone(), DrmOptions::default()).unwrap();
    assert_eq!(backend.inner.connectors.borrow()[0].crtc, Some(0));

    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    assert_ne!(device.value(crtc_id(0), "MODE_ID"), 999);

    backend.destroy();
    assert!(!device.ops().contains(&Op::DestroyBlob(999)));
    assert!(device.live_blobs().is_empty());
}

#[test]
fn gamma_blob_rolls_back_on_failure() {
    let config = StubConfig {
        gamma_lut_size: Some(256),
        ..Default::default()
    };
    let (device, backend) = backend(config);
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    assert_eq!(output.gamma_size(), 256);
    let mode_blobs = device.live_blobs();

    device.reject_commits.set(true);
    let mut state = OutputState::new();
    state.set_gamma_lut(Some(linear_gamma(256)));
    let ops_before = device.ops().len();
    assert!(!output.commit(&state));

    let ops = device.ops();
    let new_ops = &ops[ops_before..];
    let [Op::CreateBlob(created), Op::Commit { .. }, Op::DestroyBlob(destroyed)] = new_ops else {
        panic!("unexpected ops: {new_ops:?}");
    };
    assert_eq!(created, destroyed);
    assert_eq!(device.live_blobs(), mode_blobs);
    assert_eq!(device.value(crtc_id(0), "GAMMA_LUT"), 0);
    assert!(backend.inner.crtcs.borrow()[0].gamma.is_none());

    device.reject_commits.set(false);
    assert!(output.commit(&state));
    backend.dispatch();
    let gamma = device.value(crtc_id(0), "GAMMA_LUT") as u32;
    assert_ne!(gamma, 0);
    assert!(device.live_blobs().contains(&gamma));

    let mut reset = OutputState::new();
    reset.set_gamma_lut(None);
    assert!(output.commit(&reset));
    assert_eq!(device.value(crtc_id(0), "GAMMA_LUT"), 0);
    assert_eq!(device.live_blobs(), mode_blobs);
}

#[test]
fn legacy_gamma_is_set_after_the_commit() {
    let config = StubConfig {
        legacy_gamma_size: 256,
        ..Default::default()
    };
    let (device, backend) = backend(config);
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    assert_eq!(output.gamma_size(), 256);

    let mut state = OutputState::new();
    state.set_gamma_lut(Some(linear_gamma(256)));
    let ops_before = device.ops().len();
    assert!(output.commit(&state));

    let ops = device.ops();
    let new_ops = &ops[ops_before..];
    let [Op::Commit { request, .. }, Op::SetGamma(crtc)] = new_ops else {
        panic!("unexpected ops: {new_ops:?}");
    };
    assert_eq!(*crtc, crtc_id(0));
    assert_eq!(request.get(crtc_id(0), prop("GAMMA_LUT")), None);
}

#[test]
fn gamma_without_support_is_rejected() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    assert_eq!(output.gamma_size(), 0);

    let commits = device.commits().len();
    let mut state = OutputState::new();
    state.set_gamma_lut(Some(linear_gamma(256)));
    assert!(!output.commit(&state));
    assert_eq!(device.commits().len(), commits);
}

#[test]
fn page_flips_complete_or_are_discarded() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let presents = record_presents(&output);

    let buffer = buffer(1920, 1080);
    assert!(output.commit(&enable_state(&output, &buffer)));
    assert_eq!(backend.inner.flips.borrow().len(), 1);

    // One commit in flight per CRTC.
    let mut flip = OutputState::new();
    flip.set_buffer(buffer.clone());
    let commits = device.commits().len();
    assert!(!output.commit(&flip));
    assert_eq!(device.commits().len(), commits);

    backend.dispatch();
    assert!(backend.inner.flips.borrow().is_empty());
    assert_eq!(
        *presents.borrow(),
        [PresentEvent {
            commit_seq: 1,
            presented: true,
            when: Some(std::time::Duration::from_millis(16)),
            seq: 1,
            refresh: Some(refresh_interval(output.info().modes[0])),
            flags: PresentFlags::VSYNC
                | PresentFlags::HW_CLOCK
                | PresentFlags::HW_COMPLETION
                | PresentFlags::ZERO_COPY,
        }]
    );

    assert!(output.commit(&flip));
    assert_eq!(backend.inner.flips.borrow().len(), 1);

    backend.destroy();
    assert!(backend.inner.flips.borrow().is_empty());
    let last = presents.borrow().last().copied().unwrap();
    assert_eq!(last.commit_seq, 2);
    assert!(!last.presented);
    assert!(output.is_destroyed());
}

#[test]
fn hotplug_never_commits() {
    let (device, backend) = backend(StubConfig::default());
    backend.start().unwrap();
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    let commits = device.commits().len();

    device.set_connected(CONNECTOR_BASE, false);
    backend.inner.rescan_connectors();
    assert!(output.is_destroyed());
    assert!(backend.outputs().is_empty());
    assert_eq!(device.commits().len(), commits);
    // The CRTC stays lit until the next commit.
    assert_eq!(device.value(crtc_id(0), "ACTIVE"), 1);
    assert_eq!(device.live_blobs().len(), 1);
    assert!(backend.inner.crtcs.borrow()[0].is_free());

    let announced = Rc::new(Cell::new(0));
    {
        let announced = announced.clone();
        backend
            .events()
            .new_output
            .connect(move |_| announced.set(announced.get() + 1))
            .forget();
    }
    device.set_connected(CONNECTOR_BASE, true);
    backend.inner.rescan_connectors();
    assert_eq!(announced.get(), 1);
    assert_eq!(device.commits().len(), commits);

    // The new output picks the CRTC up again, replacing the stale mode.
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    assert_eq!(device.live_blobs().len(), 1);
}

#[test]
fn failed_test_logs_at_debug_without_changing_state() {
    let (device, backend) = backend(StubConfig::default());
    device.reject_tests.set(true);
    let output = backend.outputs()[0].clone();

    let buffer = buffer(1920, 1080);
    let state = enable_state(&output, &buffer);
    let (ok, logs) = logs::capture(|| output.test(&state));
    assert!(!ok);
    assert!(logs.contains(Level::DEBUG, "atomic test failed"));
    assert!(!logs.any_at(Level::WARN));
    assert!(!logs.any_at(Level::ERROR));

    let (flags, _) = last_commit(&device);
    assert_eq!(flags, CommitFlags::TEST_ONLY | CommitFlags::ALLOW_MODESET);
    assert!(!output.is_enabled());
    assert_eq!(output.commit_seq(), 0);
    assert!(device.live_blobs().is_empty());
    assert!(backend.inner.flips.borrow().is_empty());
    assert_eq!(backend.inner.connectors.borrow()[0].crtc, None);
}

#[test]
fn failed_commit_logs_at_error() {
    let (device, backend) = backend(StubConfig::default());
    device.reject_commits.set(true);
    let output = backend.outputs()[0].clone();

    let buffer = buffer(1920, 1080);
    let state = enable_state(&output, &buffer);
    let (ok, logs) = logs::capture(|| output.commit(&state));
    assert!(!ok);
    assert!(logs.contains(Level::ERROR, "atomic commit failed"));
    assert!(!output.is_enabled());
}

#[test]
fn adaptive_sync_needs_a_capable_sink() {
    let config = StubConfig {
        vrr: true,
        ..Default::default()
    };
    let (device, first) = backend(config);
    let output = first.outputs()[0].clone();
    assert!(!output.info().adaptive_sync_supported);

    let buffer = buffer(1920, 1080);
    let mut state = enable_state(&output, &buffer);
    state.set_adaptive_sync(true);
    assert!(!output.commit(&state));
    assert!(device.commits().is_empty());

    let mut config = StubConfig {
        vrr: true,
        ..Default::default()
    };
    config.connectors[0].vrr_capable = true;
    let (device, backend) = backend(config);
    let output = backend.outputs()[0].clone();
    assert!(output.info().adaptive_sync_supported);
    let presents = record_presents(&output);

    let mut state = enable_state(&output, &buffer);
    state.set_adaptive_sync(true);
    assert!(output.commit(&state));
    assert_eq!(device.value(crtc_id(0), "VRR_ENABLED"), 1);
    assert!(output.adaptive_sync());

    backend.dispatch();
    assert_eq!(presents.borrow()[0].refresh, None);
}

#[test]
fn cursor_is_bound_at_the_next_commit() {
    let config = StubConfig {
        cursor_planes: true,
        ..Default::default()
    };
    let (device, backend) = backend(config);
    let output = backend.outputs()[0].clone();
    let buffer = enable(&backend, &output);

    let commits = device.commits().len();
    assert!(output.set_cursor(Some(buffer_for_cursor()), (4, 4)));
    assert!(output.move_cursor(100, 50));
    assert_eq!(device.commits().len(), commits);

    let mut flip = OutputState::new();
    flip.set_buffer(buffer);
    assert!(output.commit(&flip));

    let (_, request) = last_commit(&device);
    let plane = cursor_id(0);
    assert_ne!(request.get(plane, prop("FB_ID")), Some(0));
    assert_eq!(request.get(plane, prop("CRTC_ID")), Some(u64::from(crtc_id(0))));
    assert_eq!(request.get(plane, prop("CRTC_X")), Some(96));
    assert_eq!(request.get(plane, prop("CRTC_Y")), Some(46));
    assert_eq!(request.get(plane, prop("CRTC_W")), Some(64));
    backend.dispatch();

    // Unchanged cursors stay out of the request.
    let mut flip = OutputState::new();
    flip.set_buffer(buffer_for_cursor());
    assert!(output.commit(&flip));
    let (_, request) = last_commit(&device);
    assert_eq!(request.get(plane, prop("FB_ID")), None);
    backend.dispatch();

    assert!(output.set_cursor(None, (0, 0)));
    let mut flip = OutputState::new();
    flip.set_buffer(buffer_for_cursor());
    assert!(output.commit(&flip));
    let (_, request) = last_commit(&device);
    assert_eq!(request.get(plane, prop("FB_ID")), Some(0));
}

fn buffer_for_cursor() -> Rc<Buffer> {
    buffer(64, 64)
}

#[test]
fn disabled_cursor_plane() {
    let config = StubConfig {
        cursor_planes: true,
        ..Default::default()
    };
    let options = DrmOptions {
        disable_cursor_plane: true,
    };
    let (_device, backend) = backend_with(config, options);
    let output = backend.outputs()[0].clone();
    assert!(!output.set_cursor(Some(buffer_for_cursor()), (0, 0)));
    assert!(!output.move_cursor(10, 10));
}

#[test]
fn leases_take_a_crtc_and_end_with_the_lessee() {
    let mut hmd = StubConnector::new(CONNECTOR_BASE + 1, "DP-2");
    hmd.non_desktop = true;
    let config = StubConfig {
        crtcs: 2,
        connectors: vec![StubConnector::new(CONNECTOR_BASE, "DP-1"), hmd],
        ..Default::default()
    };
    let (device, backend) = backend(config);

    let outputs = backend.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].name(), "DP-1");
    assert_eq!(
        backend.leasable_connectors(),
        [(CONNECTOR_BASE + 1, "DP-2".to_owned())]
    );
    assert!(backend.create_lease(&[CONNECTOR_BASE]).is_err());

    let lease = backend.create_lease(&[CONNECTOR_BASE + 1]).unwrap();
    assert_eq!(
        device.ops().last(),
        Some(&Op::CreateLease(vec![
            CONNECTOR_BASE + 1,
            crtc_id(0),
            primary_id(0)
        ]))
    );
    assert!(lease.take_fd().is_some());
    assert!(backend.leasable_connectors().is_empty());

    let terminated = Rc::new(Cell::new(0));
    {
        let terminated = terminated.clone();
        lease
            .terminated()
            .connect(move |()| terminated.set(terminated.get() + 1))
            .forget();
    }

    // The desktop output moves to the remaining CRTC.
    let _buffer = enable(&backend, &outputs[0]);
    let (_, request) = last_commit(&device);
    assert_eq!(
        request.get(CONNECTOR_BASE, prop("CRTC_ID")),
        Some(u64::from(crtc_id(1)))
    );

    // The lessee went away.
    device.revoke_lease(lease.lessee()).unwrap();
    lease::rescan(&backend.inner);
    assert_eq!(terminated.get(), 1);
    assert!(!lease.is_active());
    assert_eq!(backend.leasable_connectors().len(), 1);

    let lease = backend.create_lease(&[CONNECTOR_BASE + 1]).unwrap();
    let lessee = lease.lessee();
    drop(lease);
    assert_eq!(device.ops().last(), Some(&Op::RevokeLease(lessee)));
    assert_eq!(backend.leasable_connectors().len(), 1);
}

#[test]
fn session_activation_resets_and_restores() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);
    let commits = device.commits().len();

    backend.inner.session_activated();

    let all = device.commits();
    let new_commits = &all[commits..];
    let [(reset_flags, reset), (restore_flags, restore)] = new_commits else {
        panic!("unexpected commits: {new_commits:?}");
    };
    assert_eq!(*reset_flags, CommitFlags::ALLOW_MODESET);
    assert_eq!(reset.get(crtc_id(0), prop("ACTIVE")), Some(0));
    assert!(restore_flags.contains(CommitFlags::ALLOW_MODESET));
    assert_eq!(restore.get(crtc_id(0), prop("ACTIVE")), Some(1));
    assert_ne!(restore.get(primary_id(0), prop("FB_ID")), Some(0));

    assert!(output.is_enabled());
    assert_eq!(output.current_mode(), Some(output.info().modes[0]));
    assert_eq!(device.live_blobs().len(), 1);
}

#[test]
fn outputs_commit_together() {
    let config = StubConfig {
        crtcs: 2,
        connectors: vec![
            StubConnector::new(CONNECTOR_BASE, "DP-1"),
            StubConnector::new(CONNECTOR_BASE + 1, "HDMI-A-1"),
        ],
        ..Default::default()
    };
    let (device, backend) = backend(config);
    let outputs = backend.outputs();
    let buffer = buffer(1920, 1080);
    let states = outputs
        .iter()
        .map(|o| enable_state(o, &buffer))
        .collect::<Vec<_>>();
    let commits = outputs
        .iter()
        .zip(&states)
        .map(|(output, state)| OutputCommit { output, state })
        .collect::<Vec<_>>();

    assert!(backend.test(&commits));
    assert!(backend.commit(&commits));

    let all = device.commits();
    assert_eq!(all.len(), 2);
    assert!(all[0].0.contains(CommitFlags::TEST_ONLY));
    let request = &all[1].1;
    assert_eq!(request.get(crtc_id(0), prop("ACTIVE")), Some(1));
    assert_eq!(request.get(crtc_id(1), prop("ACTIVE")), Some(1));
    assert_eq!(backend.inner.flips.borrow().len(), 2);
    assert!(outputs.iter().all(Output::is_enabled));

    // Both flips share the framebuffer of the shared buffer.
    let fbs = device
        .ops()
        .iter()
        .filter(|op| matches!(op, Op::AddFb(_)))
        .count();
    assert_eq!(fbs, 1);
}

#[test]
fn tiles_form_one_monitor() {
    let mut left = StubConnector::new(CONNECTOR_BASE, "DP-1");
    left.tile = Some("7:1:2:1:0:0:1920:2160".to_owned());
    let mut right = StubConnector::new(CONNECTOR_BASE + 1, "DP-2");
    right.tile = Some("7:1:2:1:1:0:1920:2160".to_owned());
    let config = StubConfig {
        crtcs: 2,
        connectors: vec![left, right],
        ..Default::default()
    };
    let (device, backend) = backend(config);
    let outputs = backend.outputs();

    let group = backend.tile_group(&outputs[0]).unwrap();
    assert!(group.complete);
    assert_eq!(group.size, (3840, 2160));
    assert_eq!(group.tile.loc_h, 0);

    device.set_connected(CONNECTOR_BASE + 1, false);
    backend.inner.rescan_connectors();
    let group = backend.tile_group(&outputs[0]).unwrap();
    assert!(!group.complete);
}

#[test]
fn destroy_releases_everything_once() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _buffer = enable(&backend, &output);

    let destroyed = Rc::new(Cell::new(0));
    {
        let destroyed = destroyed.clone();
        backend
            .events()
            .destroy
            .connect(move |()| destroyed.set(destroyed.get() + 1))
            .forget();
    }

    let commits = device.commits().len();
    backend.destroy();
    backend.destroy();
    assert_eq!(destroyed.get(), 1);
    assert!(output.is_destroyed());
    assert!(backend.outputs().is_empty());
    // Teardown leaves the hardware alone.
    assert_eq!(device.commits().len(), commits);
    assert!(device.live_blobs().is_empty());
    assert!(device.ops().iter().any(|op| matches!(op, Op::DestroyFb(_))));
    assert!(backend.inner.fb_cache.is_empty());

    let mut state = OutputState::new();
    state.set_enabled(false);
    assert!(!output.commit(&state));
}

#[test]
fn damage_clips_are_clipped_to_the_buffer() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _first = enable(&backend, &output);

    let next = buffer(1920, 1080);
    let mut state = flip_state(&next);
    state.set_damage(vec![
        Rect::new(-10, -10, 20, 20),
        Rect::new(1900, 1000, 100, 100),
        Rect::new(3000, 3000, 5, 5),
    ]);
    assert!(output.commit(&state));

    let (_, request) = last_commit(&device);
    let blob = value_in(&request, primary_id(0), "FB_DAMAGE_CLIPS").unwrap() as u32;
    let coords = device
        .blob_data(blob)
        .unwrap()
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect::<Vec<_>>();
    assert_eq!(coords, [0, 0, 10, 10, 1900, 1000, 1920, 1080]);

    // Damage only matters to this commit.
    assert!(!device.live_blobs().contains(&blob));
}

#[test]
fn damage_outside_the_buffer_sends_no_clips() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _first = enable(&backend, &output);

    let next = buffer(1920, 1080);
    let mut state = flip_state(&next);
    state.set_damage(vec![Rect::new(5000, 5000, 10, 10)]);
    assert!(output.commit(&state));

    let (_, request) = last_commit(&device);
    assert_eq!(value_in(&request, primary_id(0), "FB_DAMAGE_CLIPS"), None);
}

#[test]
fn wait_timeline_becomes_the_in_fence() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _first = enable(&backend, &output);

    let timeline = Rc::new(RecordingTimeline::default());
    let next = buffer(1920, 1080);
    let mut state = flip_state(&next);
    state.set_wait_timeline(SyncPoint::new(timeline.clone(), 7));
    assert!(output.commit(&state));

    let exported = timeline.exported.borrow().clone();
    let [(7, fd)] = exported[..] else {
        panic!("unexpected exports: {exported:?}");
    };
    let (_, request) = last_commit(&device);
    assert_eq!(
        value_in(&request, primary_id(0), "IN_FENCE_FD"),
        Some(fd as u64)
    );
}

#[test]
fn out_fence_is_imported_into_the_signal_timeline() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _first = enable(&backend, &output);

    let timeline = Rc::new(RecordingTimeline::default());
    let next = buffer(1920, 1080);
    let mut state = flip_state(&next);
    state.set_signal_timeline(SyncPoint::new(timeline.clone(), 9));

    // Tests never ask the kernel for a fence.
    assert!(output.test(&state));
    let (flags, request) = last_commit(&device);
    assert!(flags.contains(CommitFlags::TEST_ONLY));
    assert_eq!(value_in(&request, crtc_id(0), "OUT_FENCE_PTR"), None);
    assert!(timeline.imported.borrow().is_empty());

    assert!(output.commit(&state));
    let (_, request) = last_commit(&device);
    assert!(value_in(&request, crtc_id(0), "OUT_FENCE_PTR").is_some_and(|ptr| ptr != 0));
    assert_eq!(*timeline.imported.borrow(), [9]);
}

#[test]
fn content_type_is_forwarded_to_the_connector() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _first = enable(&backend, &output);

    let next = buffer(1920, 1080);
    let mut state = flip_state(&next);
    state.set_content_type(ContentType::Video);
    assert!(output.commit(&state));

    let (_, request) = last_commit(&device);
    // "Cinema" in the kernel enum.
    assert_eq!(value_in(&request, CONNECTOR_BASE, "content type"), Some(3));
    assert_eq!(output.content_type(), ContentType::Video);
}

#[test]
fn blocking_commits_wait_for_the_kernel() {
    let (device, backend) = backend(StubConfig::default());
    let output = backend.outputs()[0].clone();
    let _first = enable(&backend, &output);
    let (flags, _) = last_commit(&device);
    assert!(flags.contains(CommitFlags::NONBLOCK));

    let next = buffer(1920, 1080);
    let mut state = flip_state(&next);
    state.blocking = true;
    assert!(output.commit(&state));

    let (flags, _) = last_commit(&device);
    assert!(!flags.contains(CommitFlags::NONBLOCK));
    assert!(flags.contains(CommitFlags::PAGE_FLIP_EVENT));
}

#[test]
fn inactive_crtcs_are_not_adopted() {
    let device = Rc::new(StubDevice::new(StubConfig::default()));
    device
        .values
        .borrow_mut()
        .insert((CONNECTOR_BASE, prop("CRTC_ID")), u64::from(crtc_id(0)));
    let backend = DrmBackend::with_device("stub", device.clone(), DrmOptions::default()).unwrap();
    assert_eq!(backend.inner.connectors.borrow()[0].crtc, None);

    // Nothing to turn off.
    let output = backend.outputs()[0].clone();
    let mut disable = OutputState::new();
    disable.set_enabled(false);
    assert!(output.commit(&disable));
    assert!(device.commits().is_empty());

    let _buffer = enable(&backend, &output);
    let (flags, request) = last_commit(&device);
    assert!(flags.contains(CommitFlags::ALLOW_MODESET));
    assert_eq!(
        value_in(&request, CONNECTOR_BASE, "CRTC_ID"),
        Some(u64::from(crtc_id(0)))
    );
}
