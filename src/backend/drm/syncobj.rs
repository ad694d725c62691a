//! Timeline DRM syncobjs for explicit synchronization.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::control::{syncobj, Device as ControlDevice};

use crate::buffer::Timeline;

/// `DRM_IOCTL_SYNCOBJ_FD_TO_HANDLE`, `_IOWR('d', 0xC2, struct drm_syncobj_handle)`.
const DRM_IOCTL_SYNCOBJ_FD_TO_HANDLE: libc::c_ulong = 0xC010_64C2;
const DRM_SYNCOBJ_FD_TO_HANDLE_FLAGS_IMPORT_SYNC_FILE: u32 = 1 << 0;

#[repr(C)]
struct SyncobjHandleArgs {
    handle: u32,
    flags: u32,
    fd: i32,
    pad: u32,
}

/// A timeline syncobj on a DRM device.
pub struct DrmSyncobjTimeline {
    fd: DrmDeviceFd,
    handle: syncobj::Handle,
}

impl DrmSyncobjTimeline {
    pub fn create(fd: DrmDeviceFd) -> io::Result<Self> {
        let handle = fd.create_syncobj(false)?;
        Ok(Self { fd, handle })
    }

    /// Imports a timeline shared by a client.
    pub fn import(fd: DrmDeviceFd, timeline: BorrowedFd<'_>) -> io::Result<Self> {
        let handle = fd.fd_to_syncobj(timeline, false)?;
        Ok(Self { fd, handle })
    }

    /// Runs `f` with a temporary binary syncobj, destroying it afterwards.
    fn with_binary<R>(&self, f: impl FnOnce(syncobj::Handle) -> io::Result<R>) -> io::Result<R> {
        let temp = self.fd.create_syncobj(false)?;
        let res = f(temp);
        if let Err(err) = self.fd.destroy_syncobj(temp) {
            debug!("error destroying temporary syncobj: {err:?}");
        }
        res
    }
}

impl Timeline for DrmSyncobjTimeline {
    fn export_sync_file(&self, point: u64) -> io::Result<OwnedFd> {
        let _span = tracy_client::span!("DrmSyncobjTimeline::export_sync_file");

        self.with_binary(|temp| {
            self.fd
                .syncobj_timeline_transfer(self.handle, temp, point, 0)?;
            self.fd.syncobj_to_fd(temp, true)
        })
    }

    fn import_sync_file(&self, point: u64, sync_file: BorrowedFd<'_>) -> io::Result<()> {
        let _span = tracy_client::span!("DrmSyncobjTimeline::import_sync_file");

        self.with_binary(|temp| {
            let mut args = SyncobjHandleArgs {
                handle: u32::from(temp),
                flags: DRM_SYNCOBJ_FD_TO_HANDLE_FLAGS_IMPORT_SYNC_FILE,
                fd: sync_file.as_raw_fd(),
                pad: 0,
            };
            // SAFETY: args matches struct drm_syncobj_handle and outlives the call.
            let ret = unsafe {
                libc::ioctl(
                    self.fd.as_fd().as_raw_fd(),
                    DRM_IOCTL_SYNCOBJ_FD_TO_HANDLE as _,
                    &mut args,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }

            self.fd.syncobj_timeline_transfer(temp, self.handle, 0, point)
        })
    }
}

impl Drop for DrmSyncobjTimeline {
    fn drop(&mut self) {
        if let Err(err) = self.fd.destroy_syncobj(self.handle) {
            debug!("error destroying syncobj: {err:?}");
        }
    }
}
