use std::time::Duration;

use kmsprobe::{
    kms::{
        device::ObjectId,
        event::{read_event, read_flip_event},
        AtomicCommitFlags, CommitStyle, KmsDevice, PipeId, PlaneSlot, PlaneType,
    },
    utils::Deadline,
    ErrorKind,
};
use tracing::{debug, info};

use crate::harness::{check, ActiveOutput, Fixture, SubtestError};

fn scanout_fb(fixture: &Fixture, active: &ActiveOutput) -> Result<Option<u32>, SubtestError> {
    let info = fixture
        .dev
        .crtc_info(active.crtc)
        .map_err(|source| SubtestError::Io {
            context: "querying the crtc",
            source,
        })?;
    Ok(info.framebuffer.map(u32::from))
}

fn plane_fb_id(dev: &dyn KmsDevice, object: ObjectId) -> Result<u64, SubtestError> {
    let props = dev.properties(object).map_err(|source| SubtestError::Io {
        context: "reading plane properties",
        source,
    })?;
    Ok(props
        .iter()
        .find(|prop| prop.name == "FB_ID")
        .map_or(0, |prop| prop.value))
}

pub fn basic_legacy_commit(fixture: &mut Fixture) -> Result<(), SubtestError> {
    let active = fixture.prepare_output()?;
    let fb = fixture.color_fb(active.size, (0.0, 0.0, 1.0))?;
    let handle = u32::from(fb.as_ref().handle);

    fixture
        .display
        .plane_mut(active.pipe, PlaneSlot::Primary)?
        .set_fb(Some(fb.as_ref()));
    fixture.display.commit2(CommitStyle::Legacy)?;
    let current = scanout_fb(fixture, &active)?;
    check(current == Some(handle), || {
        format!("crtc scans out {:?} instead of {}", current, handle)
    })?;

    // nothing changed, so this must not touch the primary plane
    fixture.display.commit2(CommitStyle::Legacy)?;
    let pipe = fixture.display.pipe(active.pipe)?;
    check(pipe.planes().iter().all(|plane| plane.changes().is_empty()), || {
        "change flags survived a commit".into()
    })?;

    fixture
        .display
        .plane_mut(active.pipe, PlaneSlot::Primary)?
        .set_fb(None);
    fixture.display.commit2(CommitStyle::Legacy)?;
    let current = scanout_fb(fixture, &active)?;
    check(current.is_none(), || format!("crtc still scans out {:?}", current))
}

pub fn atomic_test_only(fixture: &mut Fixture) -> Result<(), SubtestError> {
    fixture.require_atomic()?;
    let active = fixture.prepare_output()?;
    let red = fixture.color_fb(active.size, (1.0, 0.0, 0.0))?;
    let green = fixture.color_fb(active.size, (0.0, 1.0, 0.0))?;
    fixture.modeset(&active, &red)?;

    fixture
        .display
        .plane_mut(active.pipe, PlaneSlot::Primary)?
        .set_fb(Some(green.as_ref()));
    fixture
        .display
        .try_commit_atomic(AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET)?;
    let current = scanout_fb(fixture, &active)?;
    check(current == Some(u32::from(red.as_ref().handle)), || {
        "a TEST_ONLY commit changed the hardware state".into()
    })?;

    fixture.display.commit2(CommitStyle::Atomic)?;
    let current = scanout_fb(fixture, &active)?;
    check(current == Some(u32::from(green.as_ref().handle)), || {
        format!("crtc scans out {:?} after the real commit", current)
    })?;

    let idle = (0..fixture.display.n_pipes())
        .map(PipeId)
        .find(|pipe| *pipe != active.pipe && fixture.display.pipe_output(*pipe).is_none());
    let Some(idle) = idle else {
        info!("single pipe, not checking rejections");
        return Ok(());
    };

    let small = fixture.color_fb((64, 64), (1.0, 1.0, 1.0))?;
    fixture
        .display
        .plane_mut(idle, PlaneSlot::Primary)?
        .set_fb(Some(small.as_ref()));
    let result = fixture
        .display
        .try_commit_atomic(AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET);
    fixture.display.plane_mut(idle, PlaneSlot::Primary)?.set_fb(None);
    match result {
        Err(err) if err.is_rejection() => {
            debug!(pipe = %idle, "plane on an inactive pipe rejected");
            Ok(())
        }
        Err(err) => Err(err.into()),
        Ok(()) => Err(SubtestError::Failed(format!(
            "enabling a plane on inactive pipe {} was accepted",
            idle
        ))),
    }
}

pub fn flip_event_nonblocking(fixture: &mut Fixture) -> Result<(), SubtestError> {
    fixture.require_atomic()?;
    let active = fixture.prepare_output()?;
    let fbs = [
        fixture.color_fb(active.size, (1.0, 0.0, 0.0))?,
        fixture.color_fb(active.size, (0.0, 0.0, 1.0))?,
    ];
    fixture.modeset(&active, &fbs[0])?;
    let dev = fixture.dev.clone();

    for i in 1..=4 {
        fixture
            .display
            .plane_mut(active.pipe, PlaneSlot::Primary)?
            .set_fb(Some(fbs[i % 2].as_ref()));
        fixture
            .display
            .commit_atomic(AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT)?;

        let event = read_flip_event(&*dev, Duration::from_secs(1))?;
        let crtc_id = u32::from(active.crtc);
        check(event.crtc_id == 0 || event.crtc_id == crtc_id, || {
            format!("flip event for crtc {} instead of {}", event.crtc_id, crtc_id)
        })?;

        match read_event(&*dev, &Deadline::after(Duration::from_millis(50), "extra event")) {
            Err(err) if err.kind() == ErrorKind::Timeout => {}
            Err(err) => return Err(err.into()),
            Ok(event) => {
                return Err(SubtestError::Failed(format!(
                    "unexpected second event {:#x}",
                    event.event_type()
                )))
            }
        }
    }
    Ok(())
}

pub fn plane_all_transition(fixture: &mut Fixture) -> Result<(), SubtestError> {
    let active = fixture.prepare_output()?;
    let primary_fb = fixture.color_fb(active.size, (0.0, 0.0, 1.0))?;
    let overlay_fb = fixture.color_fb((active.size.0.min(256), active.size.1.min(256)), (0.0, 1.0, 0.0))?;
    let cursor_fb = fixture.cursor_fb((64, 64))?;
    fixture.modeset(&active, &primary_fb)?;
    let style = fixture.plane_style();

    for round in 0..3 {
        for enable in [true, false] {
            let pipe = fixture.display.pipe_mut(active.pipe)?;
            for plane in pipe.planes_mut().iter_mut().skip(1) {
                if plane.handle().is_none() {
                    continue;
                }
                let offset = (plane.index() as i32 + round) * 16;
                match (enable, plane.kind()) {
                    (false, _) => plane.set_fb(None),
                    (true, PlaneType::Cursor) => plane.set_fb(Some(cursor_fb.as_ref())),
                    (true, _) => plane.set_fb(Some(overlay_fb.as_ref())),
                }
                if enable {
                    plane.set_position(offset, offset);
                }
            }
            fixture.display.commit2(style)?;

            let pipe = fixture.display.pipe(active.pipe)?;
            for plane in pipe.planes().iter().skip(1) {
                let Some(handle) = plane.handle() else {
                    continue;
                };
                check(plane.changes().is_empty(), || {
                    format!("plane {} still has pending changes", plane.index())
                })?;
                if fixture.display.is_atomic() {
                    let expected = plane.fb().map_or(0, |fb| u32::from(fb.handle) as u64);
                    let current = plane_fb_id(&*fixture.dev, ObjectId::Plane(handle))?;
                    check(current == expected, || {
                        format!("plane {} scans out {} instead of {}", plane.index(), current, expected)
                    })?;
                }
            }
            debug!(round, enable, "plane transition done");
        }
    }
    Ok(())
}
