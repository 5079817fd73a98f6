//! A simulated display controller
//!
//! [`MockDevice`] implements [`KmsDevice`] in memory. It hands out object and property
//! ids like a driver would, keeps property values per object, validates atomic requests
//! with the rules real drivers apply most commonly and simulates a vblank counter per
//! crtc. Time only moves forward when a caller waits for it: blocking commits and vblank
//! waits advance the counter, pending flip events complete when they are read.
//!
//! Every call that reaches the "driver" is appended to a log ([`MockDevice::calls`]) and
//! single calls can be made to fail ([`MockDevice::fail_next`]).

use std::{
    collections::{HashMap, VecDeque},
    ffi::c_char,
    io,
    num::NonZeroU32,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use drm::control::{
    connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Mode, RawResourceHandle,
};
use drm::ClientCapability;
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::trace;

use super::{AtomicRequest, ConnectorInfo, CrtcInfo, KmsDevice, ObjectId, PlaneInfo, PropertyInfo, Resources};
use crate::kms::{
    display::PlaneType,
    event::{VblankEvent, DRM_EVENT_FLIP_COMPLETE, DRM_EVENT_VBLANK, EVENT_SIZE},
    framebuffer::Framebuffer,
    props::{ConnectorProp, CrtcProp, PlaneProp, PropertyName},
    vblank::{pipe_of_request, VblankFlags},
};
use crate::utils::{Buffer, Rectangle};

const FRAME_USEC: u64 = 16_667;

/// Builds a mode of the given size and refresh rate
pub fn mode(width: u16, height: u16, refresh: u32, preferred: bool) -> Mode {
    let mut name: [c_char; 32] = [0; 32];
    let label = format!("{}x{}", width, height);
    for (dst, src) in name.iter_mut().take(31).zip(label.bytes()) {
        *dst = src as c_char;
    }

    let htotal = width.saturating_add(160);
    let vtotal = height.saturating_add(30);
    let mut type_ = drm_ffi::DRM_MODE_TYPE_DRIVER;
    if preferred {
        type_ |= drm_ffi::DRM_MODE_TYPE_PREFERRED;
    }

    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: htotal as u32 * vtotal as u32 / 1000 * refresh,
        hdisplay: width,
        hsync_start: width.saturating_add(48),
        hsync_end: width.saturating_add(80),
        htotal,
        vdisplay: height,
        vsync_start: height.saturating_add(3),
        vsync_end: height.saturating_add(8),
        vtotal,
        vrefresh: refresh,
        type_,
        name,
        ..Default::default()
    })
}

/// A connector of the simulated device
#[derive(Debug, Clone)]
pub struct MockConnector {
    /// Connector type
    pub interface: connector::Interface,
    /// Whether a sink is attached
    pub connected: bool,
    /// Modes reported for the connector
    pub modes: Vec<Mode>,
    /// Crtc index mask the connector can be driven by
    pub possible_crtcs: u32,
}

impl MockConnector {
    /// A connector with a preferred 1920x1080 mode and a 1280x720 one, usable by any crtc
    pub fn new(interface: connector::Interface, connected: bool) -> MockConnector {
        MockConnector {
            interface,
            connected,
            modes: vec![mode(1920, 1080, 60, true), mode(1280, 720, 60, false)],
            possible_crtcs: u32::MAX,
        }
    }
}

/// Shape and capabilities of the simulated device
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Number of crtcs
    pub crtcs: usize,
    /// Overlay planes per crtc
    pub overlays: usize,
    /// Overlay planes that can be placed on any crtc
    pub shared_overlays: usize,
    /// Whether every crtc has a cursor plane
    pub cursor_planes: bool,
    /// Connectors in enumeration order
    pub connectors: Vec<MockConnector>,
    /// Whether the atomic client capability can be enabled
    pub atomic: bool,
    /// Whether crtcs expose `background_color`
    pub background_color: bool,
    /// Whether crtcs expose `CTM`, `DEGAMMA_LUT` and `GAMMA_LUT`
    pub color_mgmt: bool,
    /// Whether primary and overlay planes expose `rotation`
    pub rotation: bool,
    /// Whether connectors expose `scaling mode`
    pub scaling_mode: bool,
    /// Whether planes may scale, i.e. source and destination sizes may differ
    pub plane_scaling: bool,
    /// Modifiers the planes can scan out
    pub scanout_modifiers: Vec<DrmModifier>,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            crtcs: 2,
            overlays: 1,
            shared_overlays: 0,
            cursor_planes: true,
            connectors: vec![
                MockConnector::new(connector::Interface::HDMIA, true),
                MockConnector::new(connector::Interface::DisplayPort, true),
            ],
            atomic: true,
            background_color: false,
            color_mgmt: true,
            rotation: true,
            scaling_mode: false,
            plane_scaling: false,
            scanout_modifiers: vec![DrmModifier::Linear],
        }
    }
}

/// Ioctls that can be made to fail with [`MockDevice::fail_next`]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockIoctl {
    SetCrtc,
    SetPlane,
    SetCursor,
    MoveCursor,
    SetProperty,
    AtomicCommit,
    PageFlip,
    WaitVblank,
}

/// A call that reached the simulated driver
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    SetCrtc {
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        pos: (u32, u32),
        connectors: Vec<connector::Handle>,
        mode: Option<Mode>,
    },
    SetPlane {
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: (i32, i32, u32, u32),
        src: (u32, u32, u32, u32),
    },
    SetCursor {
        crtc: crtc::Handle,
        buffer: Option<(u32, (u32, u32))>,
    },
    MoveCursor {
        crtc: crtc::Handle,
        pos: (i32, i32),
    },
    SetProperty {
        object: ObjectId,
        name: &'static str,
        value: u64,
    },
    AtomicCommit {
        flags: AtomicCommitFlags,
        props: Vec<(ObjectId, &'static str, u64)>,
    },
    CreateBlob {
        id: u64,
    },
    DestroyBlob {
        id: u64,
    },
    PageFlip {
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
        event: bool,
    },
    WaitVblank {
        request_type: u32,
        sequence: u32,
    },
}

#[derive(Debug, Clone)]
enum Blob {
    Mode(Mode),
    Data(Vec<u8>),
}

#[derive(Debug)]
struct MockCrtc {
    handle: crtc::Handle,
    vblank: u32,
    cursor: Option<(u32, (u32, u32))>,
    cursor_pos: (i32, i32),
}

#[derive(Debug)]
struct MockPlane {
    handle: plane::Handle,
    kind: PlaneType,
    crtc: usize,
    possible_crtcs: u32,
}

impl MockPlane {
    fn can_use(&self, crtc: usize) -> bool {
        self.possible_crtcs & (1 << crtc) != 0
    }
}

#[derive(Debug)]
struct PendingEvent {
    crtc: usize,
    event_type: u32,
    target: u32,
    user_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ObjectKind {
    Crtc,
    Plane,
    Connector,
}

fn kind_of(object: ObjectId) -> ObjectKind {
    match object {
        ObjectId::Crtc(_) => ObjectKind::Crtc,
        ObjectId::Plane(_) => ObjectKind::Plane,
        ObjectId::Connector(_) => ObjectKind::Connector,
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[derive(Debug)]
struct MockState {
    config: MockConfig,
    next_id: NonZeroU32,
    crtcs: Vec<MockCrtc>,
    planes: Vec<MockPlane>,
    connectors: Vec<connector::Handle>,
    prop_ids: HashMap<(ObjectKind, &'static str), property::Handle>,
    prop_names: HashMap<property::Handle, &'static str>,
    object_props: HashMap<ObjectId, Vec<property::Handle>>,
    values: HashMap<(ObjectId, property::Handle), u64>,
    blobs: HashMap<u64, Blob>,
    framebuffers: HashMap<framebuffer::Handle, Framebuffer>,
    universal_planes: bool,
    atomic: bool,
    pending: Vec<PendingEvent>,
    ready: VecDeque<[u8; EVENT_SIZE]>,
    calls: Vec<MockCall>,
    fail_next: Option<(MockIoctl, i32)>,
}

impl MockState {
    fn new(config: MockConfig) -> MockState {
        let mut state = MockState {
            config,
            next_id: NonZeroU32::MIN,
            crtcs: Vec::new(),
            planes: Vec::new(),
            connectors: Vec::new(),
            prop_ids: HashMap::new(),
            prop_names: HashMap::new(),
            object_props: HashMap::new(),
            values: HashMap::new(),
            blobs: HashMap::new(),
            framebuffers: HashMap::new(),
            universal_planes: false,
            atomic: false,
            pending: Vec::new(),
            ready: VecDeque::new(),
            calls: Vec::new(),
            fail_next: None,
        };
        state.populate();
        state
    }

    fn alloc<T: From<RawResourceHandle>>(&mut self) -> T {
        let id = self.next_id;
        self.next_id = id.saturating_add(1);
        T::from(id)
    }

    fn attach(&mut self, object: ObjectId, name: &'static str, value: u64) {
        let kind = kind_of(object);
        let handle = match self.prop_ids.get(&(kind, name)) {
            Some(handle) => *handle,
            None => {
                let handle = self.alloc::<property::Handle>();
                self.prop_ids.insert((kind, name), handle);
                self.prop_names.insert(handle, name);
                handle
            }
        };
        self.object_props.entry(object).or_default().push(handle);
        self.values.insert((object, handle), value);
    }

    fn populate(&mut self) {
        let config = self.config.clone();

        for _ in 0..config.crtcs {
            let handle = self.alloc::<crtc::Handle>();
            let object = ObjectId::Crtc(handle);
            if config.background_color {
                self.attach(object, CrtcProp::Background.name(), 0);
            }
            if config.color_mgmt {
                for prop in [CrtcProp::Ctm, CrtcProp::DegammaLut, CrtcProp::GammaLut] {
                    self.attach(object, prop.name(), 0);
                }
            }
            self.attach(object, CrtcProp::ModeId.name(), 0);
            self.attach(object, CrtcProp::Active.name(), 0);
            self.crtcs.push(MockCrtc {
                handle,
                vblank: 0,
                cursor: None,
                cursor_pos: (0, 0),
            });
        }

        // Primary planes first, then overlays and cursors, the way drivers usually
        // register them.
        let all_crtcs = (1u32 << config.crtcs) - 1;
        let mut planes = Vec::new();
        for kind in std::iter::once(PlaneType::Primary).chain(std::iter::repeat(PlaneType::Overlay).take(config.overlays)) {
            planes.extend((0..config.crtcs).map(|crtc| (kind, crtc, 1u32 << crtc)));
        }
        planes.extend(std::iter::repeat((PlaneType::Overlay, 0, all_crtcs)).take(config.shared_overlays));
        if config.cursor_planes {
            planes.extend((0..config.crtcs).map(|crtc| (PlaneType::Cursor, crtc, 1u32 << crtc)));
        }
        for (kind, crtc, possible_crtcs) in planes {
            let handle = self.alloc::<plane::Handle>();
            let object = ObjectId::Plane(handle);
            for prop in [
                PlaneProp::SrcX,
                PlaneProp::SrcY,
                PlaneProp::SrcW,
                PlaneProp::SrcH,
                PlaneProp::CrtcX,
                PlaneProp::CrtcY,
                PlaneProp::CrtcW,
                PlaneProp::CrtcH,
                PlaneProp::FbId,
                PlaneProp::CrtcId,
            ] {
                self.attach(object, prop.name(), 0);
            }
            self.attach(object, PlaneProp::Type.name(), kind.raw());
            if config.rotation && kind != PlaneType::Cursor {
                self.attach(object, PlaneProp::Rotation.name(), 1);
            }
            self.planes.push(MockPlane {
                handle,
                kind,
                crtc,
                possible_crtcs,
            });
        }

        for _ in &config.connectors {
            let handle = self.alloc::<connector::Handle>();
            let object = ObjectId::Connector(handle);
            if config.scaling_mode {
                self.attach(object, ConnectorProp::ScalingMode.name(), 0);
            }
            self.attach(object, ConnectorProp::CrtcId.name(), 0);
            self.connectors.push(handle);
        }
    }

    fn check_failure(&mut self, ioctl: MockIoctl) -> io::Result<()> {
        match self.fail_next {
            Some((failing, code)) if failing == ioctl => {
                self.fail_next = None;
                trace!(?ioctl, code, "injected failure");
                Err(errno(code))
            }
            _ => Ok(()),
        }
    }

    fn prop(&self, object: ObjectId, name: &str) -> Option<property::Handle> {
        self.object_props
            .get(&object)?
            .iter()
            .find(|handle| self.prop_names.get(handle).map_or(false, |n| *n == name))
            .copied()
    }

    fn value_in(values: &HashMap<(ObjectId, property::Handle), u64>, state: &MockState, object: ObjectId, name: &str) -> u64 {
        state
            .prop(object, name)
            .and_then(|handle| values.get(&(object, handle)).copied())
            .unwrap_or(0)
    }

    fn value(&self, object: ObjectId, name: &str) -> u64 {
        Self::value_in(&self.values, self, object, name)
    }

    fn set_value(&mut self, object: ObjectId, name: &str, value: u64) {
        if let Some(handle) = self.prop(object, name) {
            self.values.insert((object, handle), value);
        }
    }

    fn crtc_index(&self, crtc: crtc::Handle) -> io::Result<usize> {
        self.crtcs
            .iter()
            .position(|c| c.handle == crtc)
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn crtc_index_raw(&self, raw: u64) -> Option<usize> {
        self.crtcs.iter().position(|c| u32::from(c.handle) as u64 == raw)
    }

    fn plane(&self, plane: plane::Handle) -> io::Result<&MockPlane> {
        self.planes
            .iter()
            .find(|p| p.handle == plane)
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn primary_of(&self, crtc: usize) -> Option<plane::Handle> {
        self.planes
            .iter()
            .find(|p| p.crtc == crtc && p.kind == PlaneType::Primary)
            .map(|p| p.handle)
    }

    fn object_exists(&self, object: ObjectId) -> bool {
        self.object_props.contains_key(&object)
    }

    fn mode_blob(&mut self, mode: Mode) -> u64 {
        let id = u32::from(self.alloc::<property::Handle>()) as u64;
        self.blobs.insert(id, Blob::Mode(mode));
        id
    }

    fn crtc_mode(&self, values: &HashMap<(ObjectId, property::Handle), u64>, crtc: usize) -> Option<Mode> {
        let object = ObjectId::Crtc(self.crtcs[crtc].handle);
        let active = Self::value_in(values, self, object, CrtcProp::Active.name()) != 0;
        let blob = Self::value_in(values, self, object, CrtcProp::ModeId.name());
        match self.blobs.get(&blob) {
            Some(Blob::Mode(mode)) if active => Some(*mode),
            _ => None,
        }
    }

    fn check_fb(&self, fb: framebuffer::Handle) -> io::Result<Framebuffer> {
        let fb = *self.framebuffers.get(&fb).ok_or_else(|| errno(libc::ENOENT))?;
        if !self.config.scanout_modifiers.contains(&fb.modifier) {
            trace!(fb = ?fb.handle, modifier = ?fb.modifier, "modifier cannot be scanned out");
            return Err(errno(libc::EINVAL));
        }
        Ok(fb)
    }

    fn check_scaling(&self, src: (u64, u64), dst: (u64, u64)) -> io::Result<()> {
        if !self.config.plane_scaling && (src.0 >> 16, src.1 >> 16) != dst {
            trace!(?src, ?dst, "plane scaling is not supported");
            return Err(errno(libc::EINVAL));
        }
        Ok(())
    }

    fn advance(&mut self, crtc: usize, count: u32) {
        let vblank = self.crtcs[crtc].vblank.wrapping_add(count);
        self.crtcs[crtc].vblank = vblank;

        let crtc_id = u32::from(self.crtcs[crtc].handle);
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|event| event.crtc == crtc && event.target <= vblank);
        self.pending = pending;
        for event in done {
            let usec = vblank as u64 * FRAME_USEC;
            let record = VblankEvent {
                user_data: event.user_data,
                tv_sec: (usec / 1_000_000) as u32,
                tv_usec: (usec % 1_000_000) as u32,
                sequence: vblank,
                crtc_id,
            };
            self.ready.push_back(record.to_bytes(event.event_type));
        }
    }

    fn flip_pending(&self, crtc: usize) -> bool {
        self.pending
            .iter()
            .any(|event| event.crtc == crtc && event.event_type == DRM_EVENT_FLIP_COMPLETE)
    }

    fn complete_pending(&mut self, crtc: usize) {
        if let Some(target) = self
            .pending
            .iter()
            .filter(|event| event.crtc == crtc)
            .map(|event| event.target)
            .min()
        {
            let current = self.crtcs[crtc].vblank;
            self.advance(crtc, target.saturating_sub(current).max(1));
        }
    }

    fn atomic_commit(&mut self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        if !self.atomic {
            return Err(errno(libc::EINVAL));
        }
        if flags.contains(AtomicCommitFlags::TEST_ONLY) && flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            return Err(errno(libc::EINVAL));
        }

        let mut values = self.values.clone();
        let mut modeset = false;
        let mut touched = Vec::new();
        let mut scanout = Vec::new();

        for (object, prop, value) in req.iter() {
            if !self.object_exists(object) {
                return Err(errno(libc::ENOENT));
            }
            let owned = self
                .object_props
                .get(&object)
                .map_or(false, |props| props.contains(&prop));
            if !owned {
                return Err(errno(libc::EINVAL));
            }
            let name = self.prop_names.get(&prop).copied().unwrap_or("");
            let old = values.insert((object, prop), value).unwrap_or(0);

            match object {
                ObjectId::Crtc(handle) => {
                    let idx = self.crtc_index(handle)?;
                    if (name == CrtcProp::ModeId.name() || name == CrtcProp::Active.name()) && old != value {
                        modeset = true;
                    }
                    if name == CrtcProp::ModeId.name() && value != 0 && !matches!(self.blobs.get(&value), Some(Blob::Mode(_))) {
                        return Err(errno(libc::EINVAL));
                    }
                    touched.push(idx);
                    scanout.push(idx);
                }
                ObjectId::Plane(handle) => {
                    let plane = self.plane(handle)?;
                    let mut crtcs: Vec<usize> = Vec::new();
                    if name == PlaneProp::CrtcId.name() {
                        crtcs.extend([old, value].into_iter().filter_map(|raw| self.crtc_index_raw(raw)));
                    }
                    if crtcs.is_empty() {
                        crtcs.push(plane.crtc);
                    }
                    for idx in crtcs {
                        touched.push(idx);
                        if plane.kind != PlaneType::Cursor {
                            scanout.push(idx);
                        }
                    }
                }
                ObjectId::Connector(_) => {
                    if name == ConnectorProp::CrtcId.name() {
                        if old != value {
                            modeset = true;
                        }
                        for raw in [old, value] {
                            if let Some(idx) = self.crtc_index_raw(raw) {
                                touched.push(idx);
                                scanout.push(idx);
                            }
                        }
                    }
                }
            }
        }

        if modeset && !flags.contains(AtomicCommitFlags::ALLOW_MODESET) {
            trace!("modeset required but not allowed");
            return Err(errno(libc::EINVAL));
        }

        // validate the resulting state of every plane
        for plane in &self.planes {
            let object = ObjectId::Plane(plane.handle);
            let get = |prop: PlaneProp| Self::value_in(&values, self, object, prop.name());
            let fb = get(PlaneProp::FbId);
            let crtc = get(PlaneProp::CrtcId);
            if (fb == 0) != (crtc == 0) {
                trace!(plane = ?plane.handle, fb, crtc, "framebuffer and crtc must be set together");
                return Err(errno(libc::EINVAL));
            }
            if fb == 0 {
                continue;
            }
            let Some(idx) = self.crtc_index_raw(crtc).filter(|idx| plane.can_use(*idx)) else {
                trace!(plane = ?plane.handle, crtc, "plane cannot be used on that crtc");
                return Err(errno(libc::EINVAL));
            };
            if self.crtc_mode(&values, idx).is_none() {
                trace!(plane = ?plane.handle, "plane enabled on an inactive crtc");
                return Err(errno(libc::EINVAL));
            }
            let fb = self.check_fb(from_raw(fb)?).map_err(|_| errno(libc::EINVAL))?;
            let (src_w, src_h) = (get(PlaneProp::SrcW), get(PlaneProp::SrcH));
            if get(PlaneProp::SrcX) + src_w > (fb.width as u64) << 16 || get(PlaneProp::SrcY) + src_h > (fb.height as u64) << 16 {
                return Err(errno(libc::ENOSPC));
            }
            self.check_scaling((src_w, src_h), (get(PlaneProp::CrtcW), get(PlaneProp::CrtcH)))?;
        }

        touched.sort_unstable();
        touched.dedup();
        scanout.sort_unstable();
        scanout.dedup();

        if flags.contains(AtomicCommitFlags::NONBLOCK) && touched.iter().any(|crtc| self.flip_pending(*crtc)) {
            return Err(errno(libc::EBUSY));
        }
        let active: Vec<usize> = touched
            .iter()
            .copied()
            .filter(|crtc| self.crtc_mode(&values, *crtc).is_some())
            .collect();
        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) && active.is_empty() {
            return Err(errno(libc::EINVAL));
        }

        if flags.contains(AtomicCommitFlags::TEST_ONLY) {
            return Ok(());
        }

        for crtc in &touched {
            if self.flip_pending(*crtc) {
                self.complete_pending(*crtc);
            }
        }
        self.values = values;

        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            for crtc in &active {
                let target = self.crtcs[*crtc].vblank.wrapping_add(1);
                self.pending.push(PendingEvent {
                    crtc: *crtc,
                    event_type: DRM_EVENT_FLIP_COMPLETE,
                    target,
                    user_data: u32::from(self.crtcs[*crtc].handle) as u64,
                });
            }
        }
        if !flags.contains(AtomicCommitFlags::NONBLOCK) {
            for crtc in scanout {
                if self.crtc_mode(&self.values, crtc).is_some() {
                    self.advance(crtc, 1);
                }
            }
        }
        Ok(())
    }
}

fn from_raw<T: From<RawResourceHandle>>(raw: u64) -> io::Result<T> {
    u32::try_from(raw)
        .ok()
        .and_then(NonZeroU32::new)
        .map(T::from)
        .ok_or_else(|| errno(libc::EINVAL))
}

/// A simulated KMS device
///
/// Clones share the simulated hardware, like two file descriptors of the same device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Creates a device shaped after `config`
    pub fn new(config: MockConfig) -> MockDevice {
        MockDevice {
            state: Arc::new(Mutex::new(MockState::new(config))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// All calls that reached the device so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Forgets the recorded calls
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Makes the next call of `ioctl` fail with `code`
    pub fn fail_next(&self, ioctl: MockIoctl, code: i32) {
        self.state().fail_next = Some((ioctl, code));
    }

    /// Current value of a property, looked up by name
    pub fn property_value(&self, object: ObjectId, name: &str) -> Option<u64> {
        let state = self.state();
        let handle = state.prop(object, name)?;
        state.values.get(&(object, handle)).copied()
    }

    /// Whether a framebuffer created on this device still exists
    pub fn framebuffer_exists(&self, fb: framebuffer::Handle) -> bool {
        self.state().framebuffers.contains_key(&fb)
    }

    /// Whether a property blob exists
    pub fn blob_exists(&self, blob: u64) -> bool {
        self.state().blobs.contains_key(&blob)
    }

    /// Contents of a data blob
    pub fn blob_data(&self, blob: u64) -> Option<Vec<u8>> {
        match self.state().blobs.get(&blob) {
            Some(Blob::Data(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Current vblank count of a crtc
    pub fn vblank_count(&self, crtc: usize) -> u32 {
        self.state().crtcs.get(crtc).map_or(0, |c| c.vblank)
    }

    /// Legacy cursor buffer and position of a crtc
    pub fn cursor(&self, crtc: usize) -> Option<(Option<(u32, (u32, u32))>, (i32, i32))> {
        self.state().crtcs.get(crtc).map(|c| (c.cursor, c.cursor_pos))
    }

    /// Number of events that are queued or waiting for their vblank
    pub fn pending_events(&self) -> usize {
        let state = self.state();
        state.pending.len() + state.ready.len()
    }
}

impl KmsDevice for MockDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }

    fn minor(&self) -> Option<u32> {
        None
    }

    fn reopen(&self) -> io::Result<Arc<dyn KmsDevice>> {
        Ok(Arc::new(self.clone()))
    }

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        let mut state = self.state();
        match cap {
            ClientCapability::UniversalPlanes => state.universal_planes = enable,
            ClientCapability::Atomic => {
                if !state.config.atomic {
                    return Err(errno(libc::EOPNOTSUPP));
                }
                state.atomic = enable;
                if enable {
                    state.universal_planes = true;
                }
            }
            ClientCapability::Stereo3D => return Err(errno(libc::EOPNOTSUPP)),
        }
        Ok(())
    }

    fn resources(&self) -> io::Result<Resources> {
        let state = self.state();
        Ok(Resources {
            crtcs: state.crtcs.iter().map(|c| c.handle).collect(),
            connectors: state.connectors.clone(),
            planes: state
                .planes
                .iter()
                .filter(|p| state.universal_planes || p.kind == PlaneType::Overlay)
                .map(|p| p.handle)
                .collect(),
        })
    }

    fn plane_info(&self, plane: plane::Handle) -> io::Result<PlaneInfo> {
        let state = self.state();
        let info = state.plane(plane)?;
        Ok(PlaneInfo {
            handle: plane,
            possible_crtcs: info.possible_crtcs,
        })
    }

    fn connector_info(&self, connector: connector::Handle, probe: bool) -> io::Result<ConnectorInfo> {
        let state = self.state();
        let idx = state
            .connectors
            .iter()
            .position(|c| *c == connector)
            .ok_or_else(|| errno(libc::ENOENT))?;
        let config = &state.config.connectors[idx];
        let interface_id = state.config.connectors[..idx]
            .iter()
            .filter(|c| c.interface == config.interface)
            .count() as u32
            + 1;
        let all_crtcs = (1u32 << state.crtcs.len()) - 1;
        trace!(?connector, probe, "connector info");

        Ok(ConnectorInfo {
            handle: connector,
            interface: config.interface,
            interface_id,
            state: if config.connected {
                connector::State::Connected
            } else {
                connector::State::Disconnected
            },
            modes: config.modes.clone(),
            possible_crtcs: config.possible_crtcs & all_crtcs,
        })
    }

    fn crtc_info(&self, crtc: crtc::Handle) -> io::Result<CrtcInfo> {
        let state = self.state();
        let idx = state.crtc_index(crtc)?;
        let (framebuffer, position) = match state.primary_of(idx) {
            Some(primary) => {
                let object = ObjectId::Plane(primary);
                let fb = from_raw(state.value(object, PlaneProp::FbId.name())).ok();
                let x = state.value(object, PlaneProp::SrcX.name()) >> 16;
                let y = state.value(object, PlaneProp::SrcY.name()) >> 16;
                (fb, (x as u32, y as u32))
            }
            None => (None, (0, 0)),
        };
        Ok(CrtcInfo {
            handle: crtc,
            framebuffer,
            mode: state.crtc_mode(&state.values, idx),
            position,
        })
    }

    fn properties(&self, object: ObjectId) -> io::Result<Vec<PropertyInfo>> {
        let state = self.state();
        let props = state.object_props.get(&object).ok_or_else(|| errno(libc::ENOENT))?;
        Ok(props
            .iter()
            .map(|handle| PropertyInfo {
                handle: *handle,
                name: state.prop_names.get(handle).copied().unwrap_or_default().to_string(),
                value: state.values.get(&(object, *handle)).copied().unwrap_or(0),
            })
            .collect())
    }

    fn set_property(&self, object: ObjectId, prop: property::Handle, value: u64) -> io::Result<()> {
        let mut state = self.state();
        let name = state.prop_names.get(&prop).copied().unwrap_or("");
        state.calls.push(MockCall::SetProperty { object, name, value });
        state.check_failure(MockIoctl::SetProperty)?;
        let owned = state
            .object_props
            .get(&object)
            .map_or(false, |props| props.contains(&prop));
        if !owned {
            return Err(errno(libc::EINVAL));
        }
        state.values.insert((object, prop), value);
        Ok(())
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u64> {
        let mut state = self.state();
        if data.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        let id = u32::from(state.alloc::<property::Handle>()) as u64;
        state.blobs.insert(id, Blob::Data(data.to_vec()));
        state.calls.push(MockCall::CreateBlob { id });
        Ok(id)
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        let mut state = self.state();
        let id = state.mode_blob(*mode);
        state.calls.push(MockCall::CreateBlob { id });
        Ok(id)
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::DestroyBlob { id: blob });
        state.blobs.remove(&blob).map(|_| ()).ok_or_else(|| errno(libc::ENOENT))
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        pos: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::SetCrtc {
            crtc,
            fb,
            pos,
            connectors: connectors.to_vec(),
            mode,
        });
        state.check_failure(MockIoctl::SetCrtc)?;
        let idx = state.crtc_index(crtc)?;
        let crtc_object = ObjectId::Crtc(crtc);
        let primary = state.primary_of(idx).map(ObjectId::Plane);

        let Some(fb) = fb else {
            state.set_value(crtc_object, CrtcProp::Active.name(), 0);
            state.set_value(crtc_object, CrtcProp::ModeId.name(), 0);
            let raw = u32::from(crtc) as u64;
            let planes: Vec<_> = state
                .planes
                .iter()
                .filter(|p| {
                    p.possible_crtcs == 1 << idx || state.value(ObjectId::Plane(p.handle), PlaneProp::CrtcId.name()) == raw
                })
                .map(|p| p.handle)
                .collect();
            for plane in planes {
                state.set_value(ObjectId::Plane(plane), PlaneProp::FbId.name(), 0);
                state.set_value(ObjectId::Plane(plane), PlaneProp::CrtcId.name(), 0);
            }
            for connector in state.connectors.clone() {
                let object = ObjectId::Connector(connector);
                if state.value(object, ConnectorProp::CrtcId.name()) == raw {
                    state.set_value(object, ConnectorProp::CrtcId.name(), 0);
                }
            }
            return Ok(());
        };

        let mode = mode.ok_or_else(|| errno(libc::EINVAL))?;
        if connectors.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        let info = state.check_fb(fb)?;
        let (w, h) = mode.size();
        let scanned = Rectangle::<u32, Buffer>::from_loc_and_size(pos, (w as u32, h as u32));
        if !scanned.fits_in(info.width, info.height) {
            return Err(errno(libc::ENOSPC));
        }
        for connector in connectors {
            if !state.connectors.contains(connector) {
                return Err(errno(libc::ENOENT));
            }
        }

        let blob = state.mode_blob(mode);
        state.set_value(crtc_object, CrtcProp::ModeId.name(), blob);
        state.set_value(crtc_object, CrtcProp::Active.name(), 1);
        if let Some(primary) = primary {
            for (prop, value) in [
                (PlaneProp::FbId, u32::from(fb) as u64),
                (PlaneProp::CrtcId, u32::from(crtc) as u64),
                (PlaneProp::SrcX, (pos.0 as u64) << 16),
                (PlaneProp::SrcY, (pos.1 as u64) << 16),
                (PlaneProp::SrcW, (w as u64) << 16),
                (PlaneProp::SrcH, (h as u64) << 16),
                (PlaneProp::CrtcX, 0),
                (PlaneProp::CrtcY, 0),
                (PlaneProp::CrtcW, w as u64),
                (PlaneProp::CrtcH, h as u64),
            ] {
                state.set_value(primary, prop.name(), value);
            }
        }
        for connector in connectors {
            state.set_value(
                ObjectId::Connector(*connector),
                ConnectorProp::CrtcId.name(),
                u32::from(crtc) as u64,
            );
        }
        Ok(())
    }

    fn set_cursor(&self, crtc: crtc::Handle, buffer: Option<(u32, (u32, u32))>) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::SetCursor { crtc, buffer });
        state.check_failure(MockIoctl::SetCursor)?;
        let idx = state.crtc_index(crtc)?;
        state.crtcs[idx].cursor = buffer;
        Ok(())
    }

    fn move_cursor(&self, crtc: crtc::Handle, pos: (i32, i32)) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::MoveCursor { crtc, pos });
        state.check_failure(MockIoctl::MoveCursor)?;
        let idx = state.crtc_index(crtc)?;
        state.crtcs[idx].cursor_pos = pos;
        Ok(())
    }

    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: (i32, i32, u32, u32),
        src: (u32, u32, u32, u32),
    ) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::SetPlane {
            plane,
            crtc,
            fb,
            dst,
            src,
        });
        state.check_failure(MockIoctl::SetPlane)?;
        let idx = state.crtc_index(crtc)?;
        if !state.plane(plane)?.can_use(idx) {
            return Err(errno(libc::EINVAL));
        }
        let object = ObjectId::Plane(plane);

        let Some(fb) = fb else {
            state.set_value(object, PlaneProp::FbId.name(), 0);
            state.set_value(object, PlaneProp::CrtcId.name(), 0);
            return Ok(());
        };

        if state.crtc_mode(&state.values, idx).is_none() {
            return Err(errno(libc::EINVAL));
        }
        let info = state.check_fb(fb)?;
        if src.0 as u64 + src.2 as u64 > (info.width as u64) << 16
            || src.1 as u64 + src.3 as u64 > (info.height as u64) << 16
        {
            return Err(errno(libc::ENOSPC));
        }
        state.check_scaling((src.2 as u64, src.3 as u64), (dst.2 as u64, dst.3 as u64))?;

        for (prop, value) in [
            (PlaneProp::FbId, u32::from(fb) as u64),
            (PlaneProp::CrtcId, u32::from(crtc) as u64),
            (PlaneProp::SrcX, src.0 as u64),
            (PlaneProp::SrcY, src.1 as u64),
            (PlaneProp::SrcW, src.2 as u64),
            (PlaneProp::SrcH, src.3 as u64),
            (PlaneProp::CrtcX, dst.0 as i64 as u64),
            (PlaneProp::CrtcY, dst.1 as i64 as u64),
            (PlaneProp::CrtcW, dst.2 as u64),
            (PlaneProp::CrtcH, dst.3 as u64),
        ] {
            state.set_value(object, prop.name(), value);
        }
        Ok(())
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle, event: bool) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(MockCall::PageFlip { crtc, fb, event });
        state.check_failure(MockIoctl::PageFlip)?;
        let idx = state.crtc_index(crtc)?;
        if state.crtc_mode(&state.values, idx).is_none() {
            return Err(errno(libc::EINVAL));
        }
        if state.flip_pending(idx) {
            return Err(errno(libc::EBUSY));
        }
        state.check_fb(fb)?;
        if let Some(primary) = state.primary_of(idx) {
            state.set_value(ObjectId::Plane(primary), PlaneProp::FbId.name(), u32::from(fb) as u64);
        }
        if event {
            let target = state.crtcs[idx].vblank.wrapping_add(1);
            state.pending.push(PendingEvent {
                crtc: idx,
                event_type: DRM_EVENT_FLIP_COMPLETE,
                target,
                user_data: 0,
            });
        }
        Ok(())
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        let mut state = self.state();
        let props = req
            .iter()
            .map(|(object, prop, value)| (object, state.prop_names.get(&prop).copied().unwrap_or(""), value))
            .collect();
        state.calls.push(MockCall::AtomicCommit { flags, props });
        state.check_failure(MockIoctl::AtomicCommit)?;
        state.atomic_commit(flags, req)
    }

    fn wait_vblank(&self, request_type: u32, sequence: u32) -> io::Result<u32> {
        let mut state = self.state();
        state.calls.push(MockCall::WaitVblank {
            request_type,
            sequence,
        });
        state.check_failure(MockIoctl::WaitVblank)?;

        let pipe = pipe_of_request(request_type).0;
        if pipe >= state.crtcs.len() || state.crtc_mode(&state.values, pipe).is_none() {
            return Err(errno(libc::EINVAL));
        }
        let flags = VblankFlags::from_bits_retain(request_type);
        let current = state.crtcs[pipe].vblank;
        let mut target = if flags.contains(VblankFlags::RELATIVE) {
            current.wrapping_add(sequence)
        } else {
            sequence
        };
        if flags.contains(VblankFlags::NEXTONMISS) && target <= current {
            target = current.wrapping_add(1);
        }

        if flags.contains(VblankFlags::EVENT) {
            state.pending.push(PendingEvent {
                crtc: pipe,
                event_type: DRM_EVENT_VBLANK,
                target,
                user_data: 0,
            });
            if target <= current {
                state.advance(pipe, 0);
            }
            return Ok(target);
        }

        if target > current {
            state.advance(pipe, target - current);
        }
        Ok(state.crtcs[pipe].vblank)
    }

    fn poll_events(&self, timeout: Duration) -> io::Result<bool> {
        {
            let state = self.state();
            if !state.ready.is_empty() || !state.pending.is_empty() {
                return Ok(true);
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(false)
    }

    fn read_events(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.ready.is_empty() {
            if let Some(crtc) = state.pending.first().map(|event| event.crtc) {
                state.complete_pending(crtc);
            }
        }
        if state.ready.is_empty() {
            return Err(errno(libc::EAGAIN));
        }
        if buf.len() < EVENT_SIZE {
            return Err(errno(libc::EINVAL));
        }

        let mut len = 0;
        while len + EVENT_SIZE <= buf.len() {
            let Some(record) = state.ready.pop_front() else {
                break;
            };
            buf[len..len + EVENT_SIZE].copy_from_slice(&record);
            len += EVENT_SIZE;
        }
        Ok(len)
    }

    fn create_color_framebuffer(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: DrmModifier,
        _color: u32,
    ) -> io::Result<Framebuffer> {
        let mut state = self.state();
        if size.0 == 0 || size.1 == 0 {
            return Err(errno(libc::EINVAL));
        }
        match format {
            DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888 | DrmFourcc::Xbgr8888 | DrmFourcc::Abgr8888 => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        let handle = state.alloc::<framebuffer::Handle>();
        let gem_handle = u32::from(state.alloc::<framebuffer::Handle>());
        let fb = Framebuffer {
            handle,
            gem_handle,
            width: size.0,
            height: size.1,
            format,
            modifier,
        };
        state.framebuffers.insert(handle, fb);
        Ok(fb)
    }

    fn destroy_framebuffer(&self, fb: &Framebuffer) -> io::Result<()> {
        let mut state = self.state();
        state
            .framebuffers
            .remove(&fb.handle)
            .ok_or_else(|| errno(libc::ENOENT))?;

        // removing a framebuffer that is still scanned out disables the planes using it
        let raw = u32::from(fb.handle) as u64;
        for plane in state.planes.iter().map(|p| p.handle).collect::<Vec<_>>() {
            let object = ObjectId::Plane(plane);
            if state.value(object, PlaneProp::FbId.name()) == raw {
                state.set_value(object, PlaneProp::FbId.name(), 0);
                state.set_value(object, PlaneProp::CrtcId.name(), 0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{mode, MockConfig, MockDevice, MockIoctl};
    use crate::kms::device::{AtomicRequest, KmsDevice, ObjectId};
    use drm::control::{AtomicCommitFlags, ModeTypeFlags};
    use drm::ClientCapability;
    use drm_fourcc::{DrmFourcc, DrmModifier};

    #[test]
    fn hides_primary_and_cursor_planes_without_universal_planes() {
        let dev = MockDevice::new(MockConfig::default());
        assert_eq!(dev.resources().unwrap().planes.len(), 2);
        dev.set_client_capability(ClientCapability::UniversalPlanes, true).unwrap();
        assert_eq!(dev.resources().unwrap().planes.len(), 6);
    }

    #[test]
    fn atomic_can_be_unsupported() {
        let dev = MockDevice::new(MockConfig {
            atomic: false,
            ..MockConfig::default()
        });
        let err = dev.set_client_capability(ClientCapability::Atomic, true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EOPNOTSUPP));
    }

    #[test]
    fn modes_carry_preferred_flag() {
        let preferred = mode(1024, 768, 60, true);
        assert!(preferred.mode_type().contains(ModeTypeFlags::PREFERRED));
        assert_eq!(preferred.size(), (1024, 768));
        assert_eq!(preferred.name().to_str().unwrap(), "1024x768");
        assert!(!mode(800, 600, 60, false).mode_type().contains(ModeTypeFlags::PREFERRED));
    }

    #[test]
    fn legacy_modeset_activates_crtc() {
        let dev = MockDevice::new(MockConfig::default());
        dev.set_client_capability(ClientCapability::UniversalPlanes, true).unwrap();
        let res = dev.resources().unwrap();
        let fb = dev
            .create_color_framebuffer((1920, 1080), DrmFourcc::Xrgb8888, DrmModifier::Linear, 0)
            .unwrap();

        let preferred = mode(1920, 1080, 60, true);
        dev.set_crtc(res.crtcs[0], Some(fb.handle), (0, 0), &[res.connectors[0]], Some(preferred))
            .unwrap();
        let info = dev.crtc_info(res.crtcs[0]).unwrap();
        assert_eq!(info.framebuffer, Some(fb.handle));
        assert_eq!(info.mode, Some(preferred));
        assert_eq!(
            dev.property_value(ObjectId::Connector(res.connectors[0]), "CRTC_ID"),
            Some(u32::from(res.crtcs[0]) as u64)
        );

        dev.set_crtc(res.crtcs[0], None, (0, 0), &[], None).unwrap();
        assert_eq!(dev.crtc_info(res.crtcs[0]).unwrap().mode, None);
    }

    #[test]
    fn atomic_modeset_needs_permission() {
        let dev = MockDevice::new(MockConfig::default());
        dev.set_client_capability(ClientCapability::Atomic, true).unwrap();
        let res = dev.resources().unwrap();
        let crtc = ObjectId::Crtc(res.crtcs[0]);
        let props = dev.properties(crtc).unwrap();
        let active = props.iter().find(|p| p.name == "ACTIVE").unwrap().handle;
        let mode_id = props.iter().find(|p| p.name == "MODE_ID").unwrap().handle;

        let blob = dev.create_mode_blob(&mode(1920, 1080, 60, true)).unwrap();
        let mut req = AtomicRequest::new();
        req.add(crtc, mode_id, blob);
        req.add(crtc, active, 1);

        let err = dev.atomic_commit(AtomicCommitFlags::empty(), &req).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        dev.atomic_commit(AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::TEST_ONLY, &req)
            .unwrap();
        assert_eq!(dev.property_value(crtc, "ACTIVE"), Some(0));
        dev.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, &req).unwrap();
        assert_eq!(dev.property_value(crtc, "ACTIVE"), Some(1));
    }

    #[test]
    fn injected_failures_fire_once() {
        let dev = MockDevice::new(MockConfig::default());
        let res = dev.resources().unwrap();
        dev.fail_next(MockIoctl::MoveCursor, libc::EIO);
        assert!(dev.move_cursor(res.crtcs[0], (1, 1)).is_err());
        dev.move_cursor(res.crtcs[0], (2, 2)).unwrap();
        assert_eq!(dev.cursor(0).unwrap().1, (2, 2));
        assert_eq!(dev.calls().len(), 2);
    }
}
