use tracing::{debug, trace};

use super::CommitStyle;
use crate::kms::{
    changes::{PipeChanges, PlaneChanges},
    device::{KmsDevice, ObjectId},
    display::{Display, Pipe, Plane, PlaneType},
    error::Error,
    output::Output,
    props::{CrtcProp, PlaneProp},
    vblank::wait_for_vblank,
    PipeId,
};

fn access(dev: &dyn KmsDevice, errmsg: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    let dev = dev.dev_path();
    move |source| Error::Access { errmsg, dev, source }
}

impl Display {
    /// Programs every pipe with per-resource ioctls
    pub(super) fn commit_legacy(&mut self, style: CommitStyle) -> Result<(), Error> {
        let dev = self.dev.clone();
        let mut valid_outs = 0;

        for idx in 0..self.pipes.len() {
            let id = PipeId(idx);
            let output = self
                .outputs
                .iter()
                .find(|output| output.pending_crtc_idx_mask == id.mask());
            if output.is_some() {
                valid_outs += 1;
            }
            commit_pipe(&*dev, &mut self.pipes[idx], output, style)?;
        }

        if valid_outs == 0 {
            return Err(Error::NoActiveOutputs);
        }
        Ok(())
    }
}

fn commit_pipe(dev: &dyn KmsDevice, pipe: &mut Pipe, output: Option<&Output>, style: CommitStyle) -> Result<(), Error> {
    let crtc = ObjectId::Crtc(pipe.crtc);

    // crtc properties are best effort on legacy commits
    if pipe.changes.contains(PipeChanges::BACKGROUND) {
        if let Some(prop) = pipe.props.get(CrtcProp::Background) {
            if let Err(err) = dev.set_property(crtc, prop, pipe.background) {
                trace!(pipe = %pipe.id, ?err, "setting background failed");
            }
        }
    }
    if pipe.changes.contains(PipeChanges::COLOR_MGMT) {
        for (prop, blob) in [
            (CrtcProp::DegammaLut, pipe.degamma_blob),
            (CrtcProp::Ctm, pipe.ctm_blob),
            (CrtcProp::GammaLut, pipe.gamma_blob),
        ] {
            if let Some(handle) = pipe.props.get(prop) {
                if let Err(err) = dev.set_property(crtc, handle, blob) {
                    trace!(pipe = %pipe.id, prop = ?prop, ?err, "setting color property failed");
                }
            }
        }
    }

    let mut need_wait = false;
    for idx in 0..pipe.planes.len() {
        if pipe.planes[idx].changes.intersects(PlaneChanges::SCANOUT) {
            need_wait = true;
        }
        match (style, pipe.planes[idx].kind) {
            (CommitStyle::Legacy, PlaneType::Cursor) => commit_cursor(dev, pipe.crtc, &pipe.planes[idx])?,
            (CommitStyle::Legacy, PlaneType::Primary) => {
                pipe.enabled = commit_primary(dev, pipe, output)?;
            }
            _ => commit_plane(dev, pipe.crtc, &pipe.planes[idx])?,
        }
    }

    if need_wait && pipe.enabled {
        wait_for_vblank(dev, pipe.id)?;
    }
    Ok(())
}

fn commit_cursor(dev: &dyn KmsDevice, crtc: drm::control::crtc::Handle, cursor: &Plane) -> Result<(), Error> {
    if cursor.changes.contains(PlaneChanges::FB) {
        let buffer = cursor
            .fb
            .map(|fb| (fb.gem_handle, (cursor.size.w, cursor.size.h)));
        debug!(pipe = %cursor.pipe, ?buffer, "SetCursor");
        dev.set_cursor(crtc, buffer)
            .map_err(access(dev, "Failed to set cursor"))?;
    }
    if cursor.changes.contains(PlaneChanges::POSITION) {
        let pos = (cursor.position.x, cursor.position.y);
        debug!(pipe = %cursor.pipe, ?pos, "MoveCursor");
        dev.move_cursor(crtc, pos)
            .map_err(access(dev, "Failed to move cursor"))?;
    }
    Ok(())
}

/// Programs the primary plane with a modeset, returning whether the crtc is enabled
fn commit_primary(dev: &dyn KmsDevice, pipe: &Pipe, output: Option<&Output>) -> Result<bool, Error> {
    let primary = &pipe.planes[0];
    if primary.position.x != 0 || primary.position.y != 0 {
        return Err(Error::LegacyPrimaryWindowed(pipe.id));
    }
    if primary.changes.contains(PlaneChanges::ROTATION) {
        return Err(Error::LegacyPrimaryRotated(pipe.id));
    }
    if !primary.changes.intersects(PlaneChanges::SCANOUT) {
        return Ok(pipe.enabled);
    }

    match primary.fb {
        Some(fb) => {
            let output = output.ok_or(Error::NoOutputForPipe(pipe.id))?;
            let mode = output
                .mode()
                .ok_or_else(|| Error::NoModeForOutput(output.name().to_owned()))?;
            let pos = (primary.src.loc.x, primary.src.loc.y);
            debug!(
                output = %output.name(),
                pipe = %pipe.id,
                fb = ?fb.handle,
                ?pos,
                mode = ?mode.size(),
                "SetCrtc"
            );
            dev.set_crtc(pipe.crtc, Some(fb.handle), pos, &[output.handle], Some(mode))
                .map_err(access(dev, "Failed to set crtc"))?;
            Ok(true)
        }
        None => {
            debug!(pipe = %pipe.id, "SetCrtc, disabling");
            dev.set_crtc(pipe.crtc, None, (0, 0), &[], None)
                .map_err(access(dev, "Failed to disable crtc"))?;
            Ok(false)
        }
    }
}

fn commit_plane(dev: &dyn KmsDevice, crtc: drm::control::crtc::Handle, plane: &Plane) -> Result<(), Error> {
    let Some(handle) = plane.handle else {
        trace!(pipe = %plane.pipe, plane = plane.index, "no driver plane, skipping");
        return Ok(());
    };
    if plane.changes.contains(PlaneChanges::ROTATION) && !plane.has_rotation() {
        return Err(Error::RotationUnsupported {
            pipe: plane.pipe,
            index: plane.index,
        });
    }

    if plane.changes.intersects(PlaneChanges::FB | PlaneChanges::SIZE) && plane.fb.is_none() {
        debug!(pipe = %plane.pipe, plane = plane.index, "SetPlane, disabling");
        dev.set_plane(handle, crtc, None, (0, 0, 0, 0), (0, 0, 0, 0))
            .map_err(access(dev, "Failed to disable plane"))?;
    } else if plane.changes.intersects(PlaneChanges::SCANOUT) {
        let [x, y, w, h] = plane.src.to_fixed().map(|v| v as u32);
        let src = (x, y, w, h);
        let dst = (plane.position.x, plane.position.y, plane.size.w, plane.size.h);
        debug!(
            pipe = %plane.pipe,
            plane = plane.index,
            fb = ?plane.fb.map(|fb| fb.handle),
            src = ?plane.src,
            ?dst,
            "SetPlane"
        );
        dev.set_plane(handle, crtc, plane.fb.map(|fb| fb.handle), dst, src)
            .map_err(access(dev, "Failed to set plane"))?;
    }

    if plane.changes.contains(PlaneChanges::ROTATION) {
        let prop = plane.props.require(PlaneProp::Rotation, ObjectId::Plane(handle))?;
        dev.set_property(ObjectId::Plane(handle), prop, plane.rotation.bits() as u64)
            .map_err(access(dev, "Failed to set plane rotation"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::kms::{
        device::mock::{MockCall, MockConfig, MockDevice, MockIoctl},
        framebuffer::tests::white_fb,
        CommitStyle, Display, Error, PipeId, PlaneChanges, PlaneSlot, Rotation,
    };
    use std::sync::Arc;

    fn setup() -> (Arc<MockDevice>, Display) {
        let dev = Arc::new(MockDevice::new(MockConfig::default()));
        let mut display = Display::new(dev.clone()).unwrap();
        display.set_output_pipe(0, Some(PipeId(0))).unwrap();
        (dev, display)
    }

    #[test]
    fn primary_is_programmed_with_a_modeset() {
        let (dev, mut display) = setup();
        let fb = white_fb(&dev, (1920, 1080));
        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_fb(Some(fb.as_ref()));
        display.commit2(CommitStyle::Legacy).unwrap();

        let crtc = display.pipe(PipeId(0)).unwrap().crtc();
        let connector = display.output(0).unwrap().handle();
        assert!(dev.calls().iter().any(|call| matches!(
            call,
            MockCall::SetCrtc { crtc: c, fb: Some(f), connectors, mode: Some(_), .. }
                if *c == crtc && *f == fb.as_ref().handle && connectors == &vec![connector]
        )));
        assert!(display.pipe(PipeId(0)).unwrap().is_enabled());
        assert!(!display.pipe(PipeId(1)).unwrap().is_enabled());
        for pipe in display.pipes() {
            for plane in pipe.planes() {
                assert!(plane.changes().is_empty());
            }
        }
    }

    #[test]
    fn second_commit_is_a_noop() {
        let (dev, mut display) = setup();
        let fb = white_fb(&dev, (1920, 1080));
        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_fb(Some(fb.as_ref()));
        display.commit2(CommitStyle::Legacy).unwrap();

        dev.clear_calls();
        display.commit2(CommitStyle::Legacy).unwrap();
        assert!(dev.calls().is_empty(), "{:?}", dev.calls());
    }

    #[test]
    fn cursor_uses_cursor_ioctls() {
        let (dev, mut display) = setup();
        let fb = white_fb(&dev, (1920, 1080));
        let cursor_fb = white_fb(&dev, (64, 64));
        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_fb(Some(fb.as_ref()));
        display.commit2(CommitStyle::Legacy).unwrap();

        let cursor = display.plane_mut(PipeId(0), PlaneSlot::Cursor).unwrap();
        cursor.set_fb(Some(cursor_fb.as_ref()));
        cursor.set_position(100, 50);
        display.commit2(CommitStyle::Legacy).unwrap();

        let (buffer, pos) = dev.cursor(0).unwrap();
        assert_eq!(buffer, Some((cursor_fb.as_ref().gem_handle, (64, 64))));
        assert_eq!(pos, (100, 50));
    }

    #[test]
    fn windowed_primary_is_refused() {
        let (dev, mut display) = setup();
        let fb = white_fb(&dev, (1920, 1080));
        let primary = display.plane_mut(PipeId(0), PlaneSlot::Primary).unwrap();
        primary.set_fb(Some(fb.as_ref()));
        primary.set_position(10, 0);
        assert!(matches!(
            display.try_commit2(CommitStyle::Legacy),
            Err(Error::LegacyPrimaryWindowed(PipeId(0)))
        ));
    }

    #[test]
    fn rotation_survives_legacy_commit_of_primary() {
        let (dev, mut display) = setup();
        let fb = white_fb(&dev, (1920, 1080));
        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_fb(Some(fb.as_ref()));
        display.commit2(CommitStyle::Legacy).unwrap();

        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_rotation(Rotation::ROTATE_180);
        assert!(matches!(
            display.try_commit2(CommitStyle::Legacy),
            Err(Error::LegacyPrimaryRotated(PipeId(0)))
        ));

        display.commit2(CommitStyle::Universal).unwrap();
        let primary = display.plane(PipeId(0), PlaneSlot::Primary).unwrap();
        assert!(!primary.changes().contains(PlaneChanges::ROTATION));
    }

    #[test]
    fn no_output_is_an_error() {
        let dev = Arc::new(MockDevice::new(MockConfig::default()));
        let mut display = Display::new(dev.clone()).unwrap();
        assert!(matches!(
            display.try_commit2(CommitStyle::Legacy),
            Err(Error::NoActiveOutputs)
        ));
    }

    #[test]
    fn first_failure_stops_programming() {
        let (dev, mut display) = setup();
        let fb = white_fb(&dev, (1920, 1080));
        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_fb(Some(fb.as_ref()));
        dev.fail_next(MockIoctl::SetCrtc, libc::EINVAL);

        let err = display.commit2(CommitStyle::Legacy).unwrap_err();
        assert!(err.is_rejection());
        assert!(!dev
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::SetPlane { .. } | MockCall::SetCursor { .. })));
        let primary = display.plane(PipeId(0), PlaneSlot::Primary).unwrap();
        assert!(primary.changes().contains(PlaneChanges::FB));
    }
}
