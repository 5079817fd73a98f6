use std::sync::Arc;

use bitflags::bitflags;
use drm::{
    control::{crtc, plane, property, Mode},
    ClientCapability,
};
use smallvec::SmallVec;
use tracing::{debug, debug_span, info, info_span, warn};

use super::{
    changes::{OutputChanges, PipeChanges, PlaneChanges},
    device::{KmsDevice, ObjectId},
    error::Error,
    framebuffer::Framebuffer,
    output::Output,
    props::{ConnectorProp, CrtcProp, PlaneProp, PropertyCache},
    PipeId,
};
use crate::utils::{Buffer, Physical, Point, Rectangle, Size};

/// Maximum number of planes a pipe can hold, including a cursor without driver plane
pub const MAX_PLANES: usize = 10;

bitflags! {
    /// Plane rotation and reflection, as exposed by the `rotation` property
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rotation: u32 {
        /// No rotation
        const ROTATE_0 = 1 << 0;
        /// Rotated by 90° counter-clockwise
        const ROTATE_90 = 1 << 1;
        /// Rotated by 180°
        const ROTATE_180 = 1 << 2;
        /// Rotated by 270° counter-clockwise
        const ROTATE_270 = 1 << 3;
        /// Mirrored along the x axis
        const REFLECT_X = 1 << 4;
        /// Mirrored along the y axis
        const REFLECT_Y = 1 << 5;
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

impl Rotation {
    /// Name of the rotation part, ignoring reflections
    pub fn name(self) -> &'static str {
        if self.contains(Rotation::ROTATE_90) {
            "90°"
        } else if self.contains(Rotation::ROTATE_180) {
            "180°"
        } else if self.contains(Rotation::ROTATE_270) {
            "270°"
        } else {
            "0°"
        }
    }

    /// Whether width and height are swapped
    pub fn is_transposed(self) -> bool {
        self.intersects(Rotation::ROTATE_90 | Rotation::ROTATE_270)
    }
}

/// Type of a plane as reported by its `type` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Additional plane, usable at any position
    Overlay,
    /// Main plane of the pipe
    Primary,
    /// Cursor plane
    Cursor,
}

impl PlaneType {
    /// Interprets a `type` property value
    pub fn from_raw(value: u64) -> Option<PlaneType> {
        match value {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }

    /// `type` property value of this plane type
    pub fn raw(self) -> u64 {
        match self {
            PlaneType::Overlay => 0,
            PlaneType::Primary => 1,
            PlaneType::Cursor => 2,
        }
    }
}

/// Logical position of a plane on its pipe
///
/// The primary plane always sits in slot 0 and the cursor always in the last slot,
/// overlays are numbered from 1 in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneSlot {
    /// The primary plane
    Primary,
    /// The n-th plane of the pipe, starting at 1 after the primary plane
    Overlay(usize),
    /// The cursor plane
    Cursor,
}

/// A plane attached to a [`Pipe`]
#[derive(Debug)]
pub struct Plane {
    pub(crate) pipe: PipeId,
    pub(crate) index: usize,
    pub(crate) kind: PlaneType,
    pub(crate) handle: Option<plane::Handle>,
    pub(crate) props: PropertyCache<PlaneProp>,
    pub(crate) fb: Option<Framebuffer>,
    pub(crate) src: Rectangle<u32, Buffer>,
    pub(crate) position: Point<i32, Physical>,
    pub(crate) size: Size<u32, Physical>,
    pub(crate) rotation: Rotation,
    pub(crate) changes: PlaneChanges,
}

impl Plane {
    fn new(
        pipe: PipeId,
        kind: PlaneType,
        handle: Option<plane::Handle>,
        props: PropertyCache<PlaneProp>,
    ) -> Plane {
        let rotation = if props.has(PlaneProp::Rotation) {
            Rotation::from_bits_truncate(props.initial_value(PlaneProp::Rotation) as u32)
        } else {
            Rotation::ROTATE_0
        };
        Plane {
            pipe,
            index: 0,
            kind,
            handle,
            props,
            fb: None,
            src: Rectangle::default(),
            position: Point::default(),
            size: Size::default(),
            rotation,
            changes: PlaneChanges::FB,
        }
    }

    /// Pipe the plane belongs to
    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    /// Slot index of the plane on its pipe
    pub fn index(&self) -> usize {
        self.index
    }

    /// Type of the plane
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// Driver plane, `None` for a cursor only reachable through the legacy cursor ioctls
    pub fn handle(&self) -> Option<plane::Handle> {
        self.handle
    }

    /// Property handles of the driver plane
    pub fn props(&self) -> &PropertyCache<PlaneProp> {
        &self.props
    }

    /// Whether the plane can be rotated
    pub fn has_rotation(&self) -> bool {
        self.props.has(PlaneProp::Rotation)
    }

    /// Attached framebuffer
    pub fn fb(&self) -> Option<&Framebuffer> {
        self.fb.as_ref()
    }

    /// Source rectangle in framebuffer pixels
    pub fn src(&self) -> Rectangle<u32, Buffer> {
        self.src
    }

    /// Destination position on the crtc
    pub fn position(&self) -> Point<i32, Physical> {
        self.position
    }

    /// Destination size on the crtc
    pub fn size(&self) -> Size<u32, Physical> {
        self.size
    }

    /// Pending rotation
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Changes not yet committed
    pub fn changes(&self) -> PlaneChanges {
        self.changes
    }

    /// Attaches a framebuffer, or detaches it with `None`
    ///
    /// The destination size and the source rectangle are reset to cover the whole
    /// framebuffer, or to zero when detaching.
    pub fn set_fb(&mut self, fb: Option<&Framebuffer>) {
        match fb {
            Some(fb) => {
                debug!(pipe = %self.pipe, plane = self.index, fb = ?fb.handle, "set_fb");
                self.size = (fb.width, fb.height).into();
                self.src = Rectangle::from_loc_and_size((0, 0), (fb.width, fb.height));
            }
            None => {
                debug!(pipe = %self.pipe, plane = self.index, "set_fb(none)");
                self.size = Size::default();
                self.src = Rectangle::default();
            }
        }
        self.fb = fb.copied();
        self.changes |= PlaneChanges::FB | PlaneChanges::SIZE;
    }

    /// Moves the destination rectangle
    pub fn set_position(&mut self, x: i32, y: i32) {
        debug!(pipe = %self.pipe, plane = self.index, x, y, "set_position");
        self.position = (x, y).into();
        self.changes |= PlaneChanges::POSITION;
    }

    /// Resizes the destination rectangle
    pub fn set_size(&mut self, w: u32, h: u32) {
        debug!(pipe = %self.pipe, plane = self.index, w, h, "set_size");
        self.size = (w, h).into();
        self.changes |= PlaneChanges::SIZE;
    }

    /// Moves the source rectangle within the framebuffer
    pub fn set_fb_position(&mut self, x: u32, y: u32) {
        debug!(pipe = %self.pipe, plane = self.index, x, y, "set_fb_position");
        self.src.loc = (x, y).into();
        self.changes |= PlaneChanges::FB;
    }

    /// Resizes the source rectangle within the framebuffer
    pub fn set_fb_size(&mut self, w: u32, h: u32) {
        debug!(pipe = %self.pipe, plane = self.index, w, h, "set_fb_size");
        self.src.size = (w, h).into();
        self.changes |= PlaneChanges::FB;
    }

    /// Sets the rotation
    ///
    /// Committing a rotation on a plane without rotation property fails.
    pub fn set_rotation(&mut self, rotation: Rotation) {
        debug!(pipe = %self.pipe, plane = self.index, rotation = rotation.name(), "set_rotation");
        self.rotation = rotation;
        self.changes |= PlaneChanges::ROTATION;
    }
}

/// A display pipe, i.e. one crtc and the planes that can be attached to it
#[derive(Debug)]
pub struct Pipe {
    pub(crate) id: PipeId,
    pub(crate) crtc: crtc::Handle,
    pub(crate) planes: SmallVec<[Plane; 4]>,
    pub(crate) props: PropertyCache<CrtcProp>,
    pub(crate) changes: PipeChanges,
    pub(crate) enabled: bool,
    pub(crate) background: u64,
    pub(crate) mode_blob: u64,
    pub(crate) degamma_blob: u64,
    pub(crate) ctm_blob: u64,
    pub(crate) gamma_blob: u64,
}

impl Pipe {
    /// Index of the pipe
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Crtc of the pipe
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// All planes in slot order
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// All planes in slot order, for modification
    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    /// Number of planes, including a cursor without driver plane
    pub fn n_planes(&self) -> usize {
        self.planes.len()
    }

    /// Property handles of the crtc
    pub fn props(&self) -> &PropertyCache<CrtcProp> {
        &self.props
    }

    /// Changes not yet committed
    pub fn changes(&self) -> PipeChanges {
        self.changes
    }

    /// Whether the last legacy commit left the crtc enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pending background color
    pub fn background(&self) -> u64 {
        self.background
    }

    /// Current mode blob, 0 if none was created
    pub fn mode_blob(&self) -> u64 {
        self.mode_blob
    }

    /// Slot index of a logical plane
    pub fn slot_index(&self, slot: PlaneSlot) -> Option<usize> {
        let last = self.planes.len().checked_sub(1)?;
        match slot {
            PlaneSlot::Primary => Some(0),
            PlaneSlot::Cursor => Some(last),
            PlaneSlot::Overlay(n) if n >= 1 && n < last => Some(n),
            PlaneSlot::Overlay(_) => None,
        }
    }

    /// The plane in `slot`
    pub fn plane(&self, slot: PlaneSlot) -> Result<&Plane, Error> {
        let pipe = self.id;
        self.slot_index(slot)
            .map(|idx| &self.planes[idx])
            .ok_or(Error::InvalidPlane { pipe, slot })
    }

    /// The plane in `slot`, for modification
    pub fn plane_mut(&mut self, slot: PlaneSlot) -> Result<&mut Plane, Error> {
        let pipe = self.id;
        match self.slot_index(slot) {
            Some(idx) => Ok(&mut self.planes[idx]),
            None => Err(Error::InvalidPlane { pipe, slot }),
        }
    }

    /// Sets the background color
    pub fn set_background(&mut self, background: u64) {
        debug!(pipe = %self.id, background = format_args!("{:#x}", background), "set_background");
        self.background = background;
        self.changes |= PipeChanges::BACKGROUND;
    }
}

/// Which color management blob to replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorBlob {
    Degamma,
    Ctm,
    Gamma,
}

/// Model of the display hardware of one device
///
/// See the [module documentation](super) for an overview.
#[derive(Debug)]
pub struct Display {
    pub(crate) dev: Arc<dyn KmsDevice>,
    pub(crate) pipes: Vec<Pipe>,
    pub(crate) outputs: Vec<Output>,
    pub(crate) pipes_in_use: u32,
    pub(crate) is_atomic: bool,
    pub(crate) has_cursor_plane: bool,
    pub(crate) span: tracing::Span,
}

impl Display {
    /// Enumerates the pipes, planes and outputs of a device
    ///
    /// Universal planes are always requested, atomic modesetting unless
    /// `KMSPROBE_USE_LEGACY` is set. Every plane starts with a pending framebuffer change
    /// and every pipe with a pending modeset, so the first commit disables everything that
    /// the test did not explicitly set up.
    pub fn new(dev: Arc<dyn KmsDevice>) -> Result<Display, Error> {
        let span = info_span!("display", device = ?dev.dev_path());
        let _guard = span.enter();

        if let Err(err) = dev.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!(?err, "Unable to enable universal planes");
        }
        let is_atomic = if std::env::var("KMSPROBE_USE_LEGACY").is_ok() {
            info!("Atomic modesetting disabled through KMSPROBE_USE_LEGACY");
            false
        } else {
            dev.set_client_capability(ClientCapability::Atomic, true).is_ok()
        };

        let res = dev.resources().map_err(|source| Error::Access {
            errmsg: "Error loading resource handles",
            dev: dev.dev_path(),
            source,
        })?;

        let mut plane_infos = Vec::with_capacity(res.planes.len());
        for handle in &res.planes {
            let info = dev.plane_info(*handle).map_err(|source| Error::Access {
                errmsg: "Error loading plane info",
                dev: dev.dev_path(),
                source,
            })?;
            let props = PropertyCache::<PlaneProp>::fill(&*dev, ObjectId::Plane(*handle))?;
            let kind = if props.has(PlaneProp::Type) {
                PlaneType::from_raw(props.initial_value(PlaneProp::Type)).unwrap_or(PlaneType::Overlay)
            } else {
                PlaneType::Overlay
            };
            plane_infos.push((info, kind, props));
        }

        let mut has_cursor_plane = false;
        let mut pipes = Vec::with_capacity(res.crtcs.len());
        for (idx, crtc) in res.crtcs.iter().enumerate() {
            let id = PipeId(idx);
            let props = PropertyCache::<CrtcProp>::fill(&*dev, ObjectId::Crtc(*crtc))?;

            let mut primary = None;
            let mut overlays = Vec::new();
            let mut cursor = None;
            for (info, kind, plane_props) in &plane_infos {
                if info.possible_crtcs & id.mask() == 0 {
                    continue;
                }
                let plane = Plane::new(id, *kind, Some(info.handle), plane_props.clone());
                match kind {
                    PlaneType::Primary => primary = Some(plane),
                    PlaneType::Cursor => cursor = Some(plane),
                    PlaneType::Overlay => overlays.push(plane),
                }
            }

            let primary = primary.ok_or(Error::NoPrimaryPlane(id))?;
            let cursor = match cursor {
                Some(cursor) => {
                    has_cursor_plane = true;
                    cursor
                }
                None => {
                    debug!(pipe = %id, "no cursor plane, using the legacy cursor");
                    Plane::new(id, PlaneType::Cursor, None, PropertyCache::default())
                }
            };

            let mut planes: SmallVec<[Plane; 4]> = SmallVec::new();
            planes.push(primary);
            planes.extend(overlays);
            planes.push(cursor);
            if planes.len() > MAX_PLANES {
                return Err(Error::TooManyPlanes {
                    pipe: id,
                    count: planes.len(),
                    max: MAX_PLANES,
                });
            }
            for (index, plane) in planes.iter_mut().enumerate() {
                plane.index = index;
            }
            debug!(pipe = %id, crtc = ?crtc, planes = planes.len(), "found pipe");

            pipes.push(Pipe {
                id,
                crtc: *crtc,
                planes,
                background: props.initial_value(CrtcProp::Background),
                props,
                changes: PipeChanges::MODE,
                enabled: false,
                mode_blob: 0,
                degamma_blob: 0,
                ctm_blob: 0,
                gamma_blob: 0,
            });
        }

        let outputs = res
            .connectors
            .iter()
            .enumerate()
            .map(|(index, handle)| Output::new(index, *handle))
            .collect();

        drop(_guard);
        let mut display = Display {
            dev,
            pipes,
            outputs,
            pipes_in_use: 0,
            is_atomic,
            has_cursor_plane,
            span,
        };

        for idx in 0..display.outputs.len() {
            display.refresh_output(idx, false)?;
            display.outputs[idx].changes |= OutputChanges::PIPE;
        }

        let (n_pipes, n_outputs, atomic) = (display.pipes.len(), display.outputs.len(), display.is_atomic);
        info!(pipes = n_pipes, outputs = n_outputs, atomic, "display initialized");
        Ok(display)
    }

    /// The device the display was created for
    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.dev
    }

    /// Whether atomic modesetting was negotiated
    pub fn is_atomic(&self) -> bool {
        self.is_atomic
    }

    /// Whether any pipe has a driver cursor plane
    pub fn has_cursor_plane(&self) -> bool {
        self.has_cursor_plane
    }

    /// Number of pipes
    pub fn n_pipes(&self) -> usize {
        self.pipes.len()
    }

    /// Number of outputs
    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Bitmask of pipes claimed by outputs during the last refresh
    pub fn pipes_in_use(&self) -> u32 {
        self.pipes_in_use
    }

    /// All pipes
    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    /// A pipe
    pub fn pipe(&self, pipe: PipeId) -> Result<&Pipe, Error> {
        self.pipes.get(pipe.0).ok_or(Error::InvalidPipe(pipe))
    }

    /// A pipe, for modification
    pub fn pipe_mut(&mut self, pipe: PipeId) -> Result<&mut Pipe, Error> {
        self.pipes.get_mut(pipe.0).ok_or(Error::InvalidPipe(pipe))
    }

    /// The plane in `slot` of `pipe`
    pub fn plane(&self, pipe: PipeId, slot: PlaneSlot) -> Result<&Plane, Error> {
        self.pipe(pipe)?.plane(slot)
    }

    /// The plane in `slot` of `pipe`, for modification
    pub fn plane_mut(&mut self, pipe: PipeId, slot: PlaneSlot) -> Result<&mut Plane, Error> {
        self.pipe_mut(pipe)?.plane_mut(slot)
    }

    /// Replaces the degamma lookup table, an empty table removes it
    pub fn set_degamma_lut(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), Error> {
        self.replace_color_blob(pipe, ColorBlob::Degamma, data)
    }

    /// Replaces the color transformation matrix, an empty matrix removes it
    pub fn set_ctm(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), Error> {
        self.replace_color_blob(pipe, ColorBlob::Ctm, data)
    }

    /// Replaces the gamma lookup table, an empty table removes it
    pub fn set_gamma_lut(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), Error> {
        self.replace_color_blob(pipe, ColorBlob::Gamma, data)
    }

    fn replace_color_blob(&mut self, pipe: PipeId, which: ColorBlob, data: &[u8]) -> Result<(), Error> {
        let dev = self.dev.clone();
        let pipe = self.pipe_mut(pipe)?;
        let blob = match which {
            ColorBlob::Degamma => &mut pipe.degamma_blob,
            ColorBlob::Ctm => &mut pipe.ctm_blob,
            ColorBlob::Gamma => &mut pipe.gamma_blob,
        };
        debug!(pipe = %pipe.id, ?which, len = data.len(), "replacing color blob");
        replace_blob(&*dev, blob, data)?;
        pipe.changes |= PipeChanges::COLOR_MGMT;
        Ok(())
    }

    /// Reads a crtc property by name directly from the driver
    pub fn pipe_get_property(&self, pipe: PipeId, name: &str) -> Result<Option<(property::Handle, u64)>, Error> {
        let crtc = self.pipe(pipe)?.crtc;
        let props = self.dev.properties(ObjectId::Crtc(crtc)).map_err(|source| Error::Access {
            errmsg: "Failed to get properties of crtc",
            dev: self.dev.dev_path(),
            source,
        })?;
        Ok(props
            .into_iter()
            .find(|prop| prop.name == name)
            .map(|prop| (prop.handle, prop.value)))
    }

    /// All outputs
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// An output
    pub fn output(&self, idx: usize) -> Result<&Output, Error> {
        self.outputs.get(idx).ok_or(Error::InvalidOutput(idx))
    }

    /// Indices of all outputs with a sink attached
    pub fn connected_outputs(&self) -> impl Iterator<Item = usize> + '_ {
        self.outputs
            .iter()
            .filter(|output| output.is_connected())
            .map(|output| output.index)
    }

    /// Indices of the connected outputs that can be driven from `pipe`
    pub fn valid_outputs_for_pipe(&self, pipe: PipeId) -> impl Iterator<Item = usize> + '_ {
        self.outputs
            .iter()
            .filter(move |output| output.is_connected() && output.config.valid_crtc_idx_mask & pipe.mask() != 0)
            .map(|output| output.index)
    }

    /// Output driving `pipe` after the next commit
    pub fn pipe_output(&self, pipe: PipeId) -> Option<&Output> {
        self.outputs
            .iter()
            .find(|output| output.pending_crtc_idx_mask == pipe.mask())
    }

    /// Pipe an output was assigned to
    pub fn output_driving_pipe(&self, output: usize) -> Result<PipeId, Error> {
        let output = self.output(output)?;
        output
            .pending_pipe()
            .ok_or_else(|| Error::NoDrivingPipe(output.name().to_owned()))
    }

    /// The plane in `slot` of the pipe an output was assigned to
    pub fn output_get_plane(&mut self, output: usize, slot: PlaneSlot) -> Result<&mut Plane, Error> {
        let pipe = self.output_driving_pipe(output)?;
        self.plane_mut(pipe, slot)
    }

    /// Assigns an output to `pipe`, or unassigns it with `None`
    ///
    /// Both the previous and the new pipe need a modeset afterwards.
    pub fn set_output_pipe(&mut self, output: usize, pipe: Option<PipeId>) -> Result<(), Error> {
        if let Some(pipe) = pipe {
            self.pipe(pipe)?;
        }
        let out = self.output(output)?;
        if out.name.is_none() {
            return Err(Error::UnnamedOutput(output));
        }
        debug!(parent: &self.span, output = %out.name(), pipe = ?pipe.map(|p| p.to_string()), "set_pipe");

        if let Some(old) = out.pending_pipe() {
            self.pipes[old.0].changes |= PipeChanges::MODE;
        }
        if let Some(pipe) = pipe {
            self.pipes[pipe.0].changes |= PipeChanges::MODE;
        }

        let out = &mut self.outputs[output];
        out.pending_crtc_idx_mask = pipe.map_or(0, PipeId::mask);
        if pipe != out.config.pipe {
            out.changes |= OutputChanges::PIPE;
        }
        self.refresh_output(output, false)
    }

    /// Overrides the mode of an output, `None` restores the driver's preferred mode
    pub fn override_mode(&mut self, output: usize, mode: Option<Mode>) -> Result<(), Error> {
        let span = &self.span;
        let out = self.outputs.get_mut(output).ok_or(Error::InvalidOutput(output))?;
        debug!(parent: span, output = %out.name(), mode = ?mode.map(|m| m.size()), "override_mode");
        out.override_mode = mode;
        if let Some(pipe) = out.pending_pipe() {
            self.pipes[pipe.0].changes |= PipeChanges::MODE;
        }
        Ok(())
    }

    /// Sets the connector's "scaling mode" property
    ///
    /// Fails with a capability error if the connector has no such property.
    pub fn set_scaling_mode(&mut self, output: usize, scaling_mode: u64) -> Result<(), Error> {
        let span = &self.span;
        let out = self.outputs.get_mut(output).ok_or(Error::InvalidOutput(output))?;
        if !out.config.props.has(ConnectorProp::ScalingMode) {
            return Err(Error::ScalingModeUnsupported(out.name().to_owned()));
        }
        debug!(parent: span, output = %out.name(), scaling_mode, "set_scaling_mode");
        out.scaling_mode = scaling_mode;
        out.changes |= OutputChanges::SCALING_MODE;
        Ok(())
    }

    /// Probes all connectors again on the next refresh
    pub fn force_reprobe(&mut self) {
        for output in &mut self.outputs {
            output.force_reprobe = true;
        }
    }

    /// Resolves the pipe of every output before a commit
    ///
    /// Fails if two outputs requested the same pipe.
    pub fn refresh(&mut self) -> Result<(), Error> {
        self.pipes_in_use = 0;

        for (i, a) in self.outputs.iter().enumerate() {
            if a.pending_crtc_idx_mask == 0 {
                continue;
            }
            if let Some(b) = self.outputs[i + 1..]
                .iter()
                .find(|b| b.pending_crtc_idx_mask == a.pending_crtc_idx_mask)
            {
                return Err(Error::PipeConflict {
                    a: a.name().to_owned(),
                    b: b.name().to_owned(),
                    pipe: PipeId::from_mask(a.pending_crtc_idx_mask).unwrap_or(PipeId(0)),
                });
            }
        }

        for idx in 0..self.outputs.len() {
            self.refresh_output(idx, true)?;
        }
        Ok(())
    }

    /// Re-reads the state of output `idx`
    ///
    /// In the final pass before a commit, pipes claimed by earlier outputs are masked out
    /// and the selected pipe is claimed.
    pub(crate) fn refresh_output(&mut self, idx: usize, final_pass: bool) -> Result<(), Error> {
        let _span = debug_span!(parent: &self.span, "refresh_output", output = idx).entered();
        let mut mask = self.outputs[idx].pending_crtc_idx_mask;
        if final_pass {
            mask &= !self.pipes_in_use;
        }
        let dev = self.dev.clone();
        let output = &mut self.outputs[idx];
        output.refresh(&*dev, mask)?;

        if let Some(pipe) = output.config.pipe {
            debug!(output = %output.name(), %pipe, "selecting pipe");
            if final_pass {
                self.pipes_in_use |= pipe.mask();
            }
        }
        Ok(())
    }
}

pub(crate) fn replace_blob(dev: &dyn KmsDevice, blob: &mut u64, data: &[u8]) -> Result<(), Error> {
    if *blob != 0 {
        dev.destroy_blob(*blob).map_err(|source| Error::Access {
            errmsg: "Failed to destroy property blob",
            dev: dev.dev_path(),
            source,
        })?;
        *blob = 0;
    }
    if !data.is_empty() {
        *blob = dev.create_blob(data).map_err(|source| Error::Access {
            errmsg: "Failed to create property blob",
            dev: dev.dev_path(),
            source,
        })?;
    }
    Ok(())
}

impl Drop for Display {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        for pipe in &self.pipes {
            for blob in [pipe.mode_blob, pipe.degamma_blob, pipe.ctm_blob, pipe.gamma_blob] {
                if blob == 0 {
                    continue;
                }
                if let Err(err) = self.dev.destroy_blob(blob) {
                    warn!(pipe = %pipe.id, blob, ?err, "failed to destroy blob");
                }
            }
        }
        debug!("display released");
    }
}
