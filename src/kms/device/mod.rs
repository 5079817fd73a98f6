//! Access to the KMS objects of a device
//!
//! The display model never talks to a file descriptor directly. Every ioctl it needs is a
//! method of [`KmsDevice`], which keeps the model independent of where the resources come
//! from: [`DrmDeviceFd`] forwards the calls to a real DRM node, while the simulated
//! [`MockDevice`](mock::MockDevice) (feature `test_device`) emulates a small display
//! controller in memory.

use std::{fmt, io, path::PathBuf, sync::Arc, time::Duration};

use drm::control::{connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Mode, RawResourceHandle};
use drm::ClientCapability;
use drm_fourcc::{DrmFourcc, DrmModifier};

use super::framebuffer::Framebuffer;

mod fd;
#[cfg(any(test, feature = "test_device"))]
pub mod mock;

pub use self::fd::DrmDeviceFd;

/// A KMS object that can carry properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A crtc
    Crtc(crtc::Handle),
    /// A plane
    Plane(plane::Handle),
    /// A connector
    Connector(connector::Handle),
}

impl ObjectId {
    /// Raw object id
    pub fn raw(&self) -> RawResourceHandle {
        match *self {
            ObjectId::Crtc(h) => h.into(),
            ObjectId::Plane(h) => h.into(),
            ObjectId::Connector(h) => h.into(),
        }
    }
}

/// Resource handles of a device, in enumeration order
#[derive(Debug, Clone, Default)]
pub struct Resources {
    /// Crtcs, the index in this list is the pipe index
    pub crtcs: Vec<crtc::Handle>,
    /// Connectors
    pub connectors: Vec<connector::Handle>,
    /// All planes, including primary and cursor planes
    pub planes: Vec<plane::Handle>,
}

/// Static information about a plane
#[derive(Debug, Clone, Copy)]
pub struct PlaneInfo {
    /// Plane handle
    pub handle: plane::Handle,
    /// Bitmask of crtc indices the plane can be attached to
    pub possible_crtcs: u32,
}

/// Connector state as reported by the driver
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Connector handle
    pub handle: connector::Handle,
    /// Connector type
    pub interface: connector::Interface,
    /// Index of the connector among those of the same type, starting at 1
    pub interface_id: u32,
    /// Connection state
    pub state: connector::State,
    /// Supported modes
    pub modes: Vec<Mode>,
    /// Union of the crtc index masks of all encoders of the connector
    pub possible_crtcs: u32,
}

/// Crtc state as reported by the driver
#[derive(Debug, Clone, Copy)]
pub struct CrtcInfo {
    /// Crtc handle
    pub handle: crtc::Handle,
    /// Framebuffer scanned out by the primary plane
    pub framebuffer: Option<framebuffer::Handle>,
    /// Current mode, `None` if the crtc is off
    pub mode: Option<Mode>,
    /// Offset of the primary plane into its framebuffer
    pub position: (u32, u32),
}

/// A property of an object together with its current value
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    /// Property handle
    pub handle: property::Handle,
    /// Property name
    pub name: String,
    /// Current raw value
    pub value: u64,
}

/// Property assignments making up one atomic commit
#[derive(Debug, Clone, Default)]
pub struct AtomicRequest {
    props: Vec<(ObjectId, property::Handle, u64)>,
}

impl AtomicRequest {
    /// Creates an empty request
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    /// Assigns `value` to `prop` of `object`
    ///
    /// A later assignment of the same property replaces the earlier one.
    pub fn add(&mut self, object: ObjectId, prop: property::Handle, value: u64) {
        if let Some(entry) = self
            .props
            .iter_mut()
            .find(|(obj, handle, _)| *obj == object && *handle == prop)
        {
            entry.2 = value;
        } else {
            self.props.push((object, prop, value));
        }
    }

    /// Iterates over all assignments in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, property::Handle, u64)> + '_ {
        self.props.iter().copied()
    }

    /// Number of assignments
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Whether the request assigns anything
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Value assigned to `prop` of `object`, if any
    pub fn value(&self, object: ObjectId, prop: property::Handle) -> Option<u64> {
        self.props
            .iter()
            .find(|(obj, handle, _)| *obj == object && *handle == prop)
            .map(|(_, _, value)| *value)
    }
}

/// The ioctl surface the display model is built on
///
/// All methods take `&self`; implementations are shared between the display model and
/// helper threads through an `Arc<dyn KmsDevice>`.
pub trait KmsDevice: fmt::Debug + Send + Sync {
    /// Path of the device node, for error messages
    fn dev_path(&self) -> Option<PathBuf>;

    /// Minor number of the device node, used to find its debugfs directory
    fn minor(&self) -> Option<u32>;

    /// Opens an independent handle to the same device
    ///
    /// Helper threads generating concurrent load use their own handle instead of sharing
    /// the one owned by the display model.
    fn reopen(&self) -> io::Result<Arc<dyn KmsDevice>>;

    /// Enables or disables a client capability
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;

    /// Enumerates crtcs, connectors and planes
    fn resources(&self) -> io::Result<Resources>;

    /// Static information about a plane
    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo>;

    /// Connector state; `probe` forces the driver to re-detect the sink
    fn connector_info(&self, connector: connector::Handle, probe: bool) -> io::Result<ConnectorInfo>;

    /// Current crtc state
    fn crtc_info(&self, crtc: crtc::Handle) -> io::Result<CrtcInfo>;

    /// All properties of an object with their names and current values
    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertyInfo>>;

    /// Legacy single property update
    fn set_property(&self, object: ObjectId, prop: property::Handle, value: u64) -> io::Result<()>;

    /// Creates a property blob holding `data`, returning its id
    fn create_blob(&self, data: &[u8]) -> io::Result<u64>;

    /// Creates a property blob holding a mode, returning its id
    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64>;

    /// Destroys a property blob
    fn destroy_blob(&self, blob: u64) -> io::Result<()>;

    /// Legacy modeset, `fb == None` disables the crtc
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        pos: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()>;

    /// Legacy cursor image update, `None` hides the cursor
    ///
    /// The buffer is given as gem handle and size.
    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<(u32, (u32, u32))>) -> io::Result<()>;

    /// Legacy cursor move
    fn move_cursor(&self, crtc: crtc::Handle, pos: (i32, i32)) -> io::Result<()>;

    /// Legacy plane update
    ///
    /// `dst` is the destination rectangle in pixels, `src` the source rectangle in 16.16
    /// fixed point.
    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: (i32, i32, u32, u32),
        src: (u32, u32, u32, u32),
    ) -> io::Result<()>;

    /// Legacy page flip of the primary plane, optionally requesting a completion event
    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle, event: bool) -> io::Result<()>;

    /// Submits an atomic request
    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()>;

    /// `DRM_IOCTL_WAIT_VBLANK`, returning the sequence of the reply
    fn wait_vblank(&self, request_type: u32, sequence: u32) -> io::Result<u32>;

    /// Waits until events can be read or `timeout` elapses, returning readiness
    fn poll_events(&self, timeout: Duration) -> io::Result<bool>;

    /// Reads raw event records into `buf`, returning the number of bytes read
    ///
    /// Must not block: without pending events this fails with `EAGAIN`.
    fn read_events(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Allocates a framebuffer filled with a single packed color
    fn create_color_framebuffer(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: DrmModifier,
        color: u32,
    ) -> io::Result<Framebuffer>;

    /// Removes a framebuffer created by [`KmsDevice::create_color_framebuffer`]
    fn destroy_framebuffer(&self, fb: &Framebuffer) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::{AtomicRequest, ObjectId};
    use drm::control::{from_u32, property};

    #[test]
    fn request_replaces_duplicate_assignments() {
        let plane = ObjectId::Plane(from_u32(31).unwrap());
        let fb_id: property::Handle = from_u32(7).unwrap();
        let crtc_id: property::Handle = from_u32(8).unwrap();

        let mut req = AtomicRequest::new();
        assert!(req.is_empty());
        req.add(plane, fb_id, 1);
        req.add(plane, crtc_id, 2);
        req.add(plane, fb_id, 3);

        assert_eq!(req.len(), 2);
        assert_eq!(req.value(plane, fb_id), Some(3));
        assert_eq!(req.iter().map(|(_, _, v)| v).collect::<Vec<_>>(), vec![3, 2]);
    }
}
