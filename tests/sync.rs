use std::{sync::Arc, time::Duration};

use drm_fourcc::{DrmFourcc, DrmModifier};
use kmsprobe::{
    kms::{
        create_color_fb,
        event::{read_event, read_flip_event, DrmEvent},
        vblank::{query_vblank_count, wait_for_vblank, VblankFlags},
        AtomicCommitFlags, ColorFramebuffer, CommitStyle, Display, Error, KmsDevice, MockConfig, MockDevice, PipeId,
        PlaneSlot,
    },
    utils::Deadline,
    ErrorKind,
};

fn fb(dev: &Arc<MockDevice>, rgb: (f64, f64, f64)) -> ColorFramebuffer {
    create_color_fb(dev.clone(), (1920, 1080), DrmFourcc::Xrgb8888, DrmModifier::Linear, rgb).unwrap()
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Lights up pipe A with a black framebuffer
fn lit(style: CommitStyle) -> (Arc<MockDevice>, Display, ColorFramebuffer) {
    init_logging();
    let dev = Arc::new(MockDevice::new(MockConfig::default()));
    let mut display = Display::new(dev.clone()).unwrap();
    display.set_output_pipe(0, Some(PipeId(0))).unwrap();
    let black = fb(&dev, (0.0, 0.0, 0.0));
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(black.as_ref()));
    display.commit2(style).unwrap();
    (dev, display, black)
}

#[test]
fn nonblocking_atomic_flip_delivers_one_event() {
    let (dev, mut display, _black) = lit(CommitStyle::Atomic);
    let crtc = u32::from(display.pipe(PipeId(0)).unwrap().crtc());
    let white = fb(&dev, (1.0, 1.0, 1.0));

    let before = query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap();
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(white.as_ref()));
    display
        .commit_atomic(AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT)
        .unwrap();

    let event = read_flip_event(&*dev, Duration::from_secs(1)).unwrap();
    assert_eq!(event.crtc_id, crtc);
    assert_eq!(event.sequence, before.wrapping_add(1));

    let err = read_event(&*dev, &Deadline::after(Duration::from_millis(50), "spurious event")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn vblank_waits_advance_the_counter() {
    let (dev, _display, _black) = lit(CommitStyle::Legacy);

    let start = query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap();
    wait_for_vblank(&*dev, PipeId(0)).unwrap();
    assert_eq!(
        query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap(),
        start.wrapping_add(1)
    );

    let next = query_vblank_count(&*dev, PipeId(0), VblankFlags::NEXTONMISS).unwrap();
    assert_eq!(next, start.wrapping_add(2));
    assert_eq!(query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap(), next);
}

#[test]
fn idle_pipes_have_no_vblanks() {
    let (dev, _display, _black) = lit(CommitStyle::Legacy);
    let err = query_vblank_count(&*dev, PipeId(1), VblankFlags::empty()).unwrap_err();
    assert_eq!(err.errno(), Some(libc::EINVAL));
    assert!(matches!(wait_for_vblank(&*dev, PipeId(40)), Err(Error::InvalidPipe(PipeId(40)))));
}

#[test]
fn legacy_flips_complete_one_at_a_time() {
    let (dev, display, black) = lit(CommitStyle::Legacy);
    let crtc = display.pipe(PipeId(0)).unwrap().crtc();
    let white = fb(&dev, (1.0, 1.0, 1.0));

    dev.page_flip(crtc, white.as_ref().handle, true).unwrap();
    let busy = dev.page_flip(crtc, black.as_ref().handle, true).unwrap_err();
    assert_eq!(busy.raw_os_error(), Some(libc::EBUSY));

    let event = read_flip_event(&*dev, Duration::from_secs(1)).unwrap();
    assert_eq!(event.crtc_id, u32::from(crtc));
    assert_eq!(dev.crtc_info(crtc).unwrap().framebuffer, Some(white.as_ref().handle));

    dev.page_flip(crtc, black.as_ref().handle, true).unwrap();
    let second = read_flip_event(&*dev, Duration::from_secs(1)).unwrap();
    assert!(second.sequence > event.sequence);
    assert!(second.time() > event.time());
}

#[test]
fn vblank_events_are_not_flip_events() {
    let (dev, _display, _black) = lit(CommitStyle::Legacy);
    let request = (VblankFlags::RELATIVE | VblankFlags::EVENT).bits();
    let target = dev.wait_vblank(request, 1).unwrap();

    let deadline = Deadline::after(Duration::from_secs(1), "vblank event");
    match read_event(&*dev, &deadline).unwrap() {
        DrmEvent::Vblank(event) => assert_eq!(event.sequence, target),
        other => panic!("unexpected event {:?}", other),
    }

    dev.wait_vblank(request, 1).unwrap();
    let err = read_flip_event(&*dev, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, Error::UnexpectedEvent(_)));
}

#[test]
fn missing_flip_events_time_out() {
    let (dev, _display, _black) = lit(CommitStyle::Atomic);
    let err = read_flip_event(&*dev, Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}
