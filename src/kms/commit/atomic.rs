use drm::control::{plane, AtomicCommitFlags};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::kms::{
    changes::{OutputChanges, PipeChanges, PlaneChanges},
    device::{AtomicRequest, KmsDevice, ObjectId},
    display::{replace_blob, Display, Pipe, Plane},
    error::Error,
    output::Output,
    props::{ConnectorProp, CrtcProp, PlaneProp},
    PipeId,
};

impl Display {
    /// Builds a single request from all pending changes and submits it
    pub(super) fn commit_atomic_request(&mut self, flags: AtomicCommitFlags) -> Result<(), Error> {
        if !self.is_atomic {
            return Err(Error::AtomicUnsupported);
        }
        let dev = self.dev.clone();
        let mut req = AtomicRequest::new();
        let owners = plane_owners(&self.pipes)?;

        for idx in 0..self.pipes.len() {
            let id = self.pipes[idx].id;
            let output = self
                .outputs
                .iter()
                .find(|output| output.pending_crtc_idx_mask == id.mask());
            let pipe = &mut self.pipes[idx];
            prepare_crtc(&*dev, pipe, output, &mut req)?;
            for plane in &pipe.planes {
                let owner = plane
                    .handle
                    .and_then(|handle| owners.iter().find(|(h, _)| *h == handle))
                    .map(|(_, owner)| *owner);
                if plane.fb.is_none() && owner.map_or(false, |owner| owner != pipe.id) {
                    trace!(pipe = %pipe.id, plane = plane.index, ?owner, "plane in use by another pipe");
                    continue;
                }
                prepare_plane(pipe, plane, &mut req)?;
            }
        }

        for output in &self.outputs {
            if output.config.connector.is_none() {
                continue;
            }
            trace!(output = %output.name(), pipe = ?output.config.pipe, "preparing connector");
            prepare_connector(self, output, &mut req)?;
        }

        debug!(props = req.len(), ?flags, "atomic commit");
        dev.atomic_commit(flags, &req).map_err(|source| Error::Access {
            errmsg: "Atomic commit failed",
            dev: dev.dev_path(),
            source,
        })
    }
}

/// Pipe each enabled plane is assigned to.
///
/// Planes that can feed several crtcs appear once on every pipe they are possible on;
/// only one of those copies may hold a framebuffer.
fn plane_owners(pipes: &[Pipe]) -> Result<SmallVec<[(plane::Handle, PipeId); 8]>, Error> {
    let mut owners: SmallVec<[(plane::Handle, PipeId); 8]> = SmallVec::new();
    for pipe in pipes {
        for plane in &pipe.planes {
            let (Some(handle), Some(_)) = (plane.handle, plane.fb) else {
                continue;
            };
            if let Some((_, first)) = owners.iter().find(|(h, _)| *h == handle) {
                return Err(Error::PlaneInUse {
                    index: plane.index,
                    first: *first,
                    second: pipe.id,
                });
            }
            owners.push((handle, pipe.id));
        }
    }
    Ok(owners)
}

fn prepare_crtc(dev: &dyn KmsDevice, pipe: &mut Pipe, output: Option<&Output>, req: &mut AtomicRequest) -> Result<(), Error> {
    let object = ObjectId::Crtc(pipe.crtc);

    if pipe.changes.contains(PipeChanges::BACKGROUND) {
        req.add(object, pipe.props.require(CrtcProp::Background, object)?, pipe.background);
    }
    if pipe.changes.contains(PipeChanges::COLOR_MGMT) {
        req.add(object, pipe.props.require(CrtcProp::DegammaLut, object)?, pipe.degamma_blob);
        req.add(object, pipe.props.require(CrtcProp::Ctm, object)?, pipe.ctm_blob);
        req.add(object, pipe.props.require(CrtcProp::GammaLut, object)?, pipe.gamma_blob);
    }

    if pipe.changes.contains(PipeChanges::MODE) {
        match output {
            Some(output) => {
                let mode = output
                    .mode()
                    .ok_or_else(|| Error::NoModeForOutput(output.name().to_owned()))?;
                replace_blob(dev, &mut pipe.mode_blob, &[])?;
                pipe.mode_blob = dev.create_mode_blob(&mode).map_err(|source| Error::Access {
                    errmsg: "Failed to create mode blob",
                    dev: dev.dev_path(),
                    source,
                })?;
                debug!(
                    pipe = %pipe.id,
                    mode = %mode.name().to_string_lossy(),
                    output = %output.name(),
                    "setting mode"
                );
            }
            None => {
                replace_blob(dev, &mut pipe.mode_blob, &[])?;
                debug!(pipe = %pipe.id, "setting NULL mode");
            }
        }
        req.add(object, pipe.props.require(CrtcProp::ModeId, object)?, pipe.mode_blob);
        req.add(object, pipe.props.require(CrtcProp::Active, object)?, output.is_some() as u64);
    }
    Ok(())
}

fn prepare_plane(pipe: &Pipe, plane: &Plane, req: &mut AtomicRequest) -> Result<(), Error> {
    let Some(handle) = plane.handle else {
        return Ok(());
    };
    let object = ObjectId::Plane(handle);
    if plane.changes.contains(PlaneChanges::ROTATION) && !plane.has_rotation() {
        return Err(Error::RotationUnsupported {
            pipe: plane.pipe,
            index: plane.index,
        });
    }
    let prop = |name: PlaneProp| plane.props.require(name, object);

    trace!(pipe = %pipe.id, plane = plane.index, fb = ?plane.fb.map(|fb| fb.handle), "populating plane");
    if plane.changes.contains(PlaneChanges::FB) {
        let (crtc, fb) = match plane.fb {
            Some(fb) => (u32::from(pipe.crtc) as u64, u32::from(fb.handle) as u64),
            None => (0, 0),
        };
        req.add(object, prop(PlaneProp::CrtcId)?, crtc);
        req.add(object, prop(PlaneProp::FbId)?, fb);
    }

    if plane.changes.intersects(PlaneChanges::POSITION | PlaneChanges::SIZE) {
        trace!(src = ?plane.src, pos = ?plane.position, size = ?plane.size, "plane geometry");
        let [src_x, src_y, src_w, src_h] = plane.src.to_fixed();
        req.add(object, prop(PlaneProp::SrcX)?, src_x);
        req.add(object, prop(PlaneProp::SrcY)?, src_y);
        req.add(object, prop(PlaneProp::SrcW)?, src_w);
        req.add(object, prop(PlaneProp::SrcH)?, src_h);
        req.add(object, prop(PlaneProp::CrtcX)?, plane.position.x as i64 as u64);
        req.add(object, prop(PlaneProp::CrtcY)?, plane.position.y as i64 as u64);
        req.add(object, prop(PlaneProp::CrtcW)?, plane.size.w as u64);
        req.add(object, prop(PlaneProp::CrtcH)?, plane.size.h as u64);
    }

    if plane.changes.contains(PlaneChanges::ROTATION) {
        req.add(object, prop(PlaneProp::Rotation)?, plane.rotation.bits() as u64);
    }
    Ok(())
}

fn prepare_connector(display: &Display, output: &Output, req: &mut AtomicRequest) -> Result<(), Error> {
    let object = ObjectId::Connector(output.handle);
    let props = &output.config.props;

    if output.changes.contains(OutputChanges::SCALING_MODE) {
        req.add(
            object,
            props.require(ConnectorProp::ScalingMode, object)?,
            output.scaling_mode,
        );
    }
    if output.changes.contains(OutputChanges::PIPE) {
        let crtc = match output.config.pipe {
            Some(pipe) => u32::from(display.pipe(pipe)?.crtc) as u64,
            None => 0,
        };
        req.add(object, props.require(ConnectorProp::CrtcId, object)?, crtc);
    }
    Ok(())
}
