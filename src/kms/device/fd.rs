use std::{
    collections::HashMap,
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use drm::{
    buffer::Buffer as DrmBuffer,
    control::{
        connector, crtc, dumbbuffer::DumbBuffer, framebuffer, plane, property, AtomicCommitFlags,
        Device as ControlDevice, Mode, PageFlipFlags, ResourceHandles,
    },
    ClientCapability, Device as BasicDevice,
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use rustix::event::{poll, PollFd, PollFlags};
use tracing::{info, trace, warn};

use super::{ConnectorInfo, CrtcInfo, KmsDevice, ObjectId, PlaneInfo, PropertyInfo, Resources};
use crate::kms::{device::AtomicRequest, framebuffer::Framebuffer};
use crate::utils::DeviceFd;

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: DeviceFd,
    privileged: bool,
    dumb_buffers: Mutex<HashMap<u32, DumbBuffer>>,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!(path = ?self.fd.path(), "Dropping device");
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                tracing::error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_fd().as_raw_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// `DeviceFd`, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: DeviceFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
            dumb_buffers: Mutex::new(HashMap::new()),
        };

        // Modesetting needs master on older kernels. Newer kernels grant the permission
        // to the first client anyway, so failing here is not fatal.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Returns if the underlying file descriptor holds the drm master lock
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Returns the underlying file descriptor
    pub fn device_fd(&self) -> DeviceFd {
        self.0.fd.clone()
    }

    fn dumb_buffers(&self) -> MutexGuard<'_, HashMap<u32, DumbBuffer>> {
        self.0.dumb_buffers.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn crtc_mask(res: &ResourceHandles, crtcs: &[crtc::Handle]) -> u32 {
        res.crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| crtcs.contains(crtc))
            .fold(0, |mask, (idx, _)| mask | 1 << idx)
    }
}

fn depth_of(format: DrmFourcc) -> io::Result<u32> {
    match format {
        DrmFourcc::Xrgb8888 | DrmFourcc::Xbgr8888 => Ok(24),
        DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 => Ok(32),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported dumb buffer format {:?}", format),
        )),
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        self.0.fd.path()
    }

    fn minor(&self) -> Option<u32> {
        self.0.fd.minor()
    }

    fn reopen(&self) -> io::Result<Arc<dyn KmsDevice>> {
        let path = KmsDevice::dev_path(self)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "device path unknown"))?;
        let fd = DeviceFd::open(path)?;
        Ok(Arc::new(DrmDeviceFd::new(fd)))
    }

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        BasicDevice::set_client_capability(self, cap, enable)
    }

    fn resources(&self) -> io::Result<Resources> {
        let res = self.resource_handles()?;
        let planes = self.plane_handles()?;
        Ok(Resources {
            crtcs: res.crtcs().to_vec(),
            connectors: res.connectors().to_vec(),
            planes,
        })
    }

    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo> {
        let res = self.resource_handles()?;
        let info = self.get_plane(plane)?;
        let crtcs = res.filter_crtcs(info.possible_crtcs());
        Ok(PlaneInfo {
            handle: plane,
            possible_crtcs: Self::crtc_mask(&res, &crtcs),
        })
    }

    fn connector_info(&self, connector: connector::Handle, probe: bool) -> io::Result<ConnectorInfo> {
        let res = self.resource_handles()?;
        let info = self.get_connector(connector, probe)?;

        let mut possible_crtcs = 0;
        for encoder in info.encoders() {
            match self.get_encoder(*encoder) {
                Ok(encoder) => {
                    let crtcs = res.filter_crtcs(encoder.possible_crtcs());
                    possible_crtcs |= Self::crtc_mask(&res, &crtcs);
                }
                Err(err) => warn!(?encoder, ?err, "could not get encoder"),
            }
        }

        Ok(ConnectorInfo {
            handle: connector,
            interface: info.interface(),
            interface_id: info.interface_id(),
            state: info.state(),
            modes: info.modes().to_vec(),
            possible_crtcs,
        })
    }

    fn crtc_info(&self, crtc: crtc::Handle) -> io::Result<CrtcInfo> {
        let info = self.get_crtc(crtc)?;
        Ok(CrtcInfo {
            handle: crtc,
            framebuffer: info.framebuffer(),
            mode: info.mode(),
            position: info.position(),
        })
    }

    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertyInfo>> {
        let set = match object {
            ObjectId::Crtc(handle) => self.get_properties(handle)?,
            ObjectId::Plane(handle) => self.get_properties(handle)?,
            ObjectId::Connector(handle) => self.get_properties(handle)?,
        };
        let (handles, values) = set.as_props_and_values();
        handles
            .iter()
            .zip(values.iter())
            .map(|(&handle, &value)| {
                let info = self.get_property(handle)?;
                Ok(PropertyInfo {
                    handle,
                    name: info.name().to_string_lossy().into_owned(),
                    value,
                })
            })
            .collect()
    }

    fn set_property(&self, object: ObjectId, prop: property::Handle, value: u64) -> io::Result<()> {
        trace!(?object, ?prop, value, "SetProperty");
        match object {
            ObjectId::Crtc(handle) => ControlDevice::set_property(self, handle, prop, value),
            ObjectId::Plane(handle) => ControlDevice::set_property(self, handle, prop, value),
            ObjectId::Connector(handle) => ControlDevice::set_property(self, handle, prop, value),
        }
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u64> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.as_fd(), &mut data)?;
        Ok(blob.blob_id as u64)
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        match self.create_property_blob(mode)? {
            property::Value::Blob(id) => Ok(id),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("mode blob creation returned {:?}", other),
            )),
        }
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.destroy_property_blob(blob)
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        pos: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        ControlDevice::set_crtc(self, crtc, fb, pos, connectors, mode)
    }

    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<(u32, (u32, u32))>) -> io::Result<()> {
        let (handle, (w, h)) = buffer.unwrap_or((0, (0, 0)));
        drm_ffi::mode::set_cursor(self.as_fd(), crtc.into(), handle, w, h).map(|_| ())
    }

    fn move_cursor(&self, crtc: crtc::Handle, (x, y): (i32, i32)) -> io::Result<()> {
        drm_ffi::mode::move_cursor(self.as_fd(), crtc.into(), x, y).map(|_| ())
    }

    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: (i32, i32, u32, u32),
        src: (u32, u32, u32, u32),
    ) -> io::Result<()> {
        ControlDevice::set_plane(self, plane, crtc, fb, 0, dst, src)
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle, event: bool) -> io::Result<()> {
        let flags = if event {
            PageFlipFlags::EVENT
        } else {
            PageFlipFlags::empty()
        };
        ControlDevice::page_flip(self, crtc, fb, flags, None)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        let mut atomic = drm::control::atomic::AtomicModeReq::new();
        for (object, prop, value) in req.iter() {
            atomic.add_raw_property(object.raw(), prop, value);
        }
        ControlDevice::atomic_commit(self, flags, atomic)
    }

    fn wait_vblank(&self, request_type: u32, sequence: u32) -> io::Result<u32> {
        let reply = drm_ffi::wait_vblank(self.as_fd(), request_type, sequence, 0)?;
        Ok(reply.sequence)
    }

    fn poll_events(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(self, PollFlags::IN)];
        let timeout = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ready = poll(&mut fds, timeout)?;
        Ok(ready > 0)
    }

    fn read_events(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(rustix::io::read(self, buf)?)
    }

    fn create_color_framebuffer(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: DrmModifier,
        color: u32,
    ) -> io::Result<Framebuffer> {
        // dumb buffers are always linear
        if modifier != DrmModifier::Linear {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let depth = depth_of(format)?;

        let mut buffer = self.create_dumb_buffer(size, format, 32)?;
        {
            let mut mapping = self.map_dumb_buffer(&mut buffer)?;
            for pixel in mapping.chunks_exact_mut(4) {
                pixel.copy_from_slice(&color.to_le_bytes());
            }
        }
        let handle = match self.add_framebuffer(&buffer, depth, 32) {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(destroy_err) = self.destroy_dumb_buffer(buffer) {
                    warn!(?destroy_err, "Failed to destroy dumb buffer after framebuffer creation failed");
                }
                return Err(err);
            }
        };
        let gem_handle = u32::from(DrmBuffer::handle(&buffer));
        self.dumb_buffers().insert(gem_handle, buffer);

        Ok(Framebuffer {
            handle,
            gem_handle,
            width: size.0,
            height: size.1,
            format,
            modifier,
        })
    }

    fn destroy_framebuffer(&self, fb: &Framebuffer) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, fb.handle)?;
        if let Some(buffer) = self.dumb_buffers().remove(&fb.gem_handle) {
            self.destroy_dumb_buffer(buffer)?;
        }
        Ok(())
    }
}
