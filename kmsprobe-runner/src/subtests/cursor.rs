use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use kmsprobe::kms::{
    event::read_flip_event,
    vblank::{query_vblank_count, wait_for_vblank, VblankFlags},
    ColorFramebuffer, CommitStyle, KmsDevice, PlaneSlot,
};
use rand::Rng;
use tracing::debug;

use crate::harness::{check, ActiveOutput, Fixture, SubtestError};

const CURSOR_SIZE: (u32, u32) = (64, 64);
const FLIPS: usize = 16;
const HELPER_THREADS: usize = 4;
const STRESS_DURATION: Duration = Duration::from_millis(300);

fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> SubtestError {
    move |source| SubtestError::Io { context, source }
}

/// Shows a cursor on `active` through the legacy cursor ioctls
fn setup_cursor(fixture: &mut Fixture, active: &ActiveOutput) -> Result<ColorFramebuffer, SubtestError> {
    let cursor = fixture.cursor_fb(CURSOR_SIZE)?;
    fixture
        .display
        .plane_mut(active.pipe, PlaneSlot::Cursor)?
        .set_fb(Some(cursor.as_ref()));
    fixture.display.commit2(CommitStyle::Legacy)?;
    Ok(cursor)
}

pub fn cursor_vs_flip_same_frame(fixture: &mut Fixture) -> Result<(), SubtestError> {
    let active = fixture.prepare_output()?;
    let fbs = [
        fixture.color_fb(active.size, (1.0, 0.0, 0.0))?,
        fixture.color_fb(active.size, (0.0, 1.0, 0.0))?,
    ];
    fixture.modeset(&active, &fbs[0])?;
    let _cursor = setup_cursor(fixture, &active)?;

    let dev = fixture.dev.clone();
    for i in 0..FLIPS {
        let target = query_vblank_count(&*dev, active.pipe, VblankFlags::NEXTONMISS)?;
        dev.page_flip(active.crtc, fbs[(i + 1) % 2].as_ref().handle, true)
            .map_err(io("page flip"))?;
        let pos = (i as i32 * 8, i as i32 * 4);
        dev.move_cursor(active.crtc, pos).map_err(io("moving the cursor"))?;

        let now = query_vblank_count(&*dev, active.pipe, VblankFlags::empty())?;
        check(now == target, || {
            format!("cursor update took {} vblanks", now.wrapping_sub(target))
        })?;

        let event = read_flip_event(&*dev, Duration::from_secs(1))?;
        check(event.sequence.wrapping_sub(target) <= 1, || {
            format!("flip completed at {} for a request at {}", event.sequence, target)
        })?;
        debug!(flip = i, target, completed = event.sequence, "flip done");
    }
    Ok(())
}

/// Moves the cursor to random positions until `stop` is raised
///
/// Each helper opens its own handle to sample the vblank counter, which must never run
/// backwards while the cursor is hammered.
fn cursor_hammer(
    dev: &dyn KmsDevice,
    active: &ActiveOutput,
    stop: &AtomicBool,
) -> Result<u64, SubtestError> {
    let sampler = dev.reopen().map_err(io("reopening the device"))?;
    let mut rng = rand::thread_rng();
    let (w, h) = (active.size.0 as i32, active.size.1 as i32);
    let mut last = query_vblank_count(&*sampler, active.pipe, VblankFlags::empty())?;
    let mut moves = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let pos = (rng.gen_range(0..w), rng.gen_range(0..h));
        dev.move_cursor(active.crtc, pos).map_err(io("moving the cursor"))?;
        moves += 1;

        if moves % 16 == 0 {
            let now = query_vblank_count(&*sampler, active.pipe, VblankFlags::empty())?;
            check(now.wrapping_sub(last) < u32::MAX / 2, || {
                format!("vblank counter went backwards from {} to {}", last, now)
            })?;
            last = now;
        }
    }
    Ok(moves)
}

pub fn cursor_stress_threads(fixture: &mut Fixture) -> Result<(), SubtestError> {
    let active = fixture.prepare_output()?;
    let fb = fixture.color_fb(active.size, (0.0, 0.0, 1.0))?;
    fixture.modeset(&active, &fb)?;
    let _cursor = setup_cursor(fixture, &active)?;

    let dev = fixture.dev.clone();
    let stop = AtomicBool::new(false);

    let (frames, helpers) = thread::scope(|scope| {
        let helpers: Vec<_> = (0..HELPER_THREADS)
            .map(|_| scope.spawn(|| cursor_hammer(&*dev, &active, &stop)))
            .collect();

        let frames = (|| -> Result<u32, SubtestError> {
            let deadline = Instant::now() + STRESS_DURATION;
            let mut frames = 0;
            while Instant::now() < deadline {
                let before = query_vblank_count(&*dev, active.pipe, VblankFlags::empty())?;
                wait_for_vblank(&*dev, active.pipe)?;
                let after = query_vblank_count(&*dev, active.pipe, VblankFlags::empty())?;
                check(after != before, || format!("vblank wait returned early at {}", before))?;
                frames += 1;
            }
            Ok(frames)
        })();
        stop.store(true, Ordering::Relaxed);

        let helpers: Vec<_> = helpers
            .into_iter()
            .map(|helper| {
                helper
                    .join()
                    .unwrap_or_else(|_| Err(SubtestError::Failed("cursor thread panicked".into())))
            })
            .collect();
        (frames, helpers)
    });

    let frames = frames?;
    let mut moves = 0;
    for result in helpers {
        moves += result?;
    }
    debug!(frames, moves, "cursor stress done");
    check(moves > 0, || "no cursor update went through".into())
}
