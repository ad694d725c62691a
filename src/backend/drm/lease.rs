//! DRM leases: connectors handed over to another DRM client, usually a VR compositor.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};

use anyhow::{bail, ensure, Context};

use super::DrmInner;
use crate::utils::Signal;

pub struct LeaseInner {
    backend: Weak<DrmInner>,
    lessee: u32,
    connectors: Vec<u32>,
    fd: RefCell<Option<OwnedFd>>,
    active: Cell<bool>,
    terminated: Signal<()>,
}

impl LeaseInner {
    /// Gives the leased objects back to the backend and notifies listeners. Does not revoke.
    pub fn terminate(&self) {
        if !self.active.replace(false) {
            return;
        }

        if let Some(backend) = self.backend.upgrade() {
            debug!("{}: lease {} terminated", backend.name, self.lessee);
            release(&backend, self.lessee);
        }
        self.fd.borrow_mut().take();
        self.terminated.emit(&());
        self.terminated.clear();
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        if !self.active.get() {
            return;
        }
        if let Some(backend) = self.backend.upgrade() {
            if let Err(err) = backend.device.revoke_lease(self.lessee) {
                warn!("{}: error revoking lease {}: {err:?}", backend.name, self.lessee);
            }
        }
        self.terminate();
    }
}

/// A lease on connectors of a DRM device. Dropping it revokes the lease.
pub struct DrmLease {
    inner: Rc<LeaseInner>,
}

impl DrmLease {
    pub fn lessee(&self) -> u32 {
        self.inner.lessee
    }

    pub fn connectors(&self) -> &[u32] {
        &self.inner.connectors
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    /// Takes the lease descriptor to hand it to the lessee.
    pub fn take_fd(&self) -> Option<OwnedFd> {
        self.inner.fd.borrow_mut().take()
    }

    /// Emitted once, when the lease ends for any reason.
    pub fn terminated(&self) -> &Signal<()> {
        &self.inner.terminated
    }

    pub fn revoke(&self) {
        if !self.inner.active.get() {
            return;
        }
        if let Some(backend) = self.inner.backend.upgrade() {
            if let Err(err) = backend.device.revoke_lease(self.inner.lessee) {
                warn!("{}: error revoking lease {}: {err:?}", backend.name, self.inner.lessee);
            }
        }
        self.inner.terminate();
    }
}

impl fmt::Debug for DrmLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmLease")
            .field("lessee", &self.inner.lessee)
            .field("connectors", &self.inner.connectors)
            .field("active", &self.inner.active.get())
            .finish()
    }
}

pub(super) fn create(inner: &DrmInner, connectors: &[u32]) -> anyhow::Result<DrmLease> {
    let _span = tracy_client::span!("drm::lease::create");

    ensure!(!inner.destroyed.get(), "the backend is destroyed");
    ensure!(!connectors.is_empty(), "nothing to lease");

    // Connector, CRTC and primary plane of every leased connector.
    let mut objects = Vec::new();
    let mut claimed = Vec::new();
    {
        let conns = inner.connectors.borrow();
        let crtcs = inner.crtcs.borrow();
        let planes = inner.planes.borrow();

        for &id in connectors {
            let connector = conns
                .iter()
                .find(|c| c.id == id)
                .with_context(|| format!("no connector {id}"))?;
            ensure!(connector.lease.is_none(), "{} is already leased", connector.name);
            if connector.output.is_some() {
                bail!("{} is used for the desktop", connector.name);
            }

            let crtc_idx = connector
                .crtc
                .or_else(|| {
                    crtcs.iter().enumerate().position(|(idx, c)| {
                        c.is_free()
                            && !claimed.contains(&idx)
                            && connector.possible_crtcs.contains(&c.id)
                    })
                })
                .with_context(|| format!("no free CRTC for {}", connector.name))?;
            claimed.push(crtc_idx);

            let crtc = &crtcs[crtc_idx];
            objects.extend([connector.id, crtc.id, planes[crtc.primary].id]);
        }
    }

    let (lessee, fd) = inner
        .device
        .create_lease(&objects)
        .context("error creating the lease")?;
    info!("{}: leased {connectors:?} to lessee {lessee}", inner.name);

    {
        let mut conns = inner.connectors.borrow_mut();
        let mut crtcs = inner.crtcs.borrow_mut();
        let mut planes = inner.planes.borrow_mut();

        for (&id, &crtc_idx) in connectors.iter().zip(&claimed) {
            if let Some(connector) = conns.iter_mut().find(|c| c.id == id) {
                connector.lease = Some(lessee);
                connector.crtc = None;
            }
            let crtc = &mut crtcs[crtc_idx];
            crtc.lease = Some(lessee);
            crtc.connector = None;
            // The lessee owns the hardware state now.
            crtc.mode = None;
            crtc.gamma = None;
            crtc.active = false;
            planes[crtc.primary].clear();
            inner.flips.borrow_mut().remove(&crtc.id);
        }
    }

    let lease = Rc::new(LeaseInner {
        backend: inner.this.clone(),
        lessee,
        connectors: connectors.to_vec(),
        fd: RefCell::new(Some(fd)),
        active: Cell::new(true),
        terminated: Signal::new(),
    });

    let mut leases = inner.leases.borrow_mut();
    leases.retain(|l| l.strong_count() > 0);
    leases.push(Rc::downgrade(&lease));

    Ok(DrmLease { inner: lease })
}

/// Unmarks the objects held by `lessee`.
fn release(inner: &DrmInner, lessee: u32) {
    for connector in inner.connectors.borrow_mut().iter_mut() {
        if connector.lease == Some(lessee) {
            connector.lease = None;
        }
    }
    for crtc in inner.crtcs.borrow_mut().iter_mut() {
        if crtc.lease == Some(lessee) {
            crtc.lease = None;
        }
    }
}

/// Ends the leases the kernel no longer knows about, then rescans connectors.
pub(super) fn rescan(inner: &DrmInner) {
    let _span = tracy_client::span!("drm::lease::rescan");

    if inner.destroyed.get() {
        return;
    }

    let lessees = match inner.device.lessees() {
        Ok(lessees) => lessees,
        Err(err) => {
            warn!("{}: error listing lessees: {err:?}", inner.name);
            return;
        }
    };

    let gone = inner
        .leases
        .borrow()
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|l| l.active.get() && !lessees.contains(&l.lessee))
        .collect::<Vec<_>>();
    for lease in gone {
        lease.terminate();
    }

    inner.rescan_connectors();
}
