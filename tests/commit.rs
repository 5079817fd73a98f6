use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use kmsprobe::kms::{
    create_color_fb, device::ObjectId, AtomicCommitFlags, ColorFramebuffer, CommitStyle, Display, Error, KmsDevice,
    MockCall, MockConfig, MockDevice, MockIoctl, PipeId, PlaneChanges, PlaneSlot,
};

fn fb(dev: &Arc<MockDevice>, size: (u32, u32), modifier: DrmModifier) -> ColorFramebuffer {
    create_color_fb(dev.clone(), size, DrmFourcc::Xrgb8888, modifier, (0.2, 0.4, 0.6)).unwrap()
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(config: MockConfig) -> (Arc<MockDevice>, Display) {
    init_logging();
    let dev = Arc::new(MockDevice::new(config));
    let mut display = Display::new(dev.clone()).unwrap();
    display.set_output_pipe(0, Some(PipeId(0))).unwrap();
    (dev, display)
}

fn assert_clean(display: &Display) {
    for pipe in display.pipes() {
        assert!(pipe.changes().is_empty(), "pipe {} has {:?}", pipe.id(), pipe.changes());
        for plane in pipe.planes() {
            assert!(plane.changes().is_empty(), "plane {} has {:?}", plane.index(), plane.changes());
        }
    }
    for output in display.outputs() {
        assert!(output.changes().is_empty(), "{} has {:?}", output.name(), output.changes());
    }
}

#[test]
fn legacy_commit_sets_the_crtc_framebuffer() {
    let (dev, mut display) = setup(MockConfig::default());
    let primary = fb(&dev, (1920, 1080), DrmModifier::Linear);
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(primary.as_ref()));
    display.commit().unwrap();

    let crtc = display.pipe(PipeId(0)).unwrap().crtc();
    let info = dev.crtc_info(crtc).unwrap();
    assert_eq!(info.framebuffer, Some(primary.as_ref().handle));
    assert_eq!(info.mode.unwrap().size(), (1920, 1080));
    assert!(display.pipe(PipeId(0)).unwrap().is_enabled());
    assert_clean(&display);

    dev.clear_calls();
    display.commit().unwrap();
    assert!(dev.calls().is_empty(), "unexpected calls {:?}", dev.calls());
}

#[test]
fn atomic_commit_matches_the_model() {
    let (dev, mut display) = setup(MockConfig {
        plane_scaling: true,
        ..MockConfig::default()
    });
    let primary = fb(&dev, (1920, 1080), DrmModifier::Linear);
    let overlay = fb(&dev, (512, 512), DrmModifier::Linear);
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(primary.as_ref()));
    let plane = display.plane_mut(PipeId(0), PlaneSlot::Overlay(1)).unwrap();
    plane.set_fb(Some(overlay.as_ref()));
    plane.set_position(100, 200);
    plane.set_size(256, 128);
    let handle = plane.handle().unwrap();
    display.commit2(CommitStyle::Atomic).unwrap();
    assert_clean(&display);

    let object = ObjectId::Plane(handle);
    assert_eq!(dev.property_value(object, "FB_ID"), Some(u32::from(overlay.as_ref().handle) as u64));
    assert_eq!(dev.property_value(object, "CRTC_X"), Some(100));
    assert_eq!(dev.property_value(object, "CRTC_Y"), Some(200));
    assert_eq!(dev.property_value(object, "CRTC_W"), Some(256));
    assert_eq!(dev.property_value(object, "CRTC_H"), Some(128));
    assert_eq!(dev.property_value(object, "SRC_W"), Some(512 << 16));
    assert_eq!(dev.property_value(object, "SRC_H"), Some(512 << 16));

    let plane = display.plane(PipeId(0), PlaneSlot::Overlay(1)).unwrap();
    assert_eq!(plane.size(), (256, 128).into());
    assert_eq!(plane.position(), (100, 200).into());
}

#[test]
fn test_only_accepts_swaps_and_rejects_unscannable_buffers() {
    let (dev, mut display) = setup(MockConfig::default());
    let first = fb(&dev, (1920, 1080), DrmModifier::Linear);
    let second = fb(&dev, (1920, 1080), DrmModifier::Linear);
    let tiled = fb(&dev, (1920, 1080), DrmModifier::I915_x_tiled);
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(first.as_ref()));
    display.commit2(CommitStyle::Atomic).unwrap();
    let flags = AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET;

    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(second.as_ref()));
    display.try_commit_atomic(flags).unwrap();

    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(tiled.as_ref()));
    let err = display.try_commit_atomic(flags).unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(err.kind(), kmsprobe::ErrorKind::Rejected);

    let primary = display.plane(PipeId(0), PlaneSlot::Primary).unwrap();
    assert!(primary.changes().contains(PlaneChanges::FB));
    let crtc = display.pipe(PipeId(0)).unwrap().crtc();
    assert_eq!(dev.crtc_info(crtc).unwrap().framebuffer, Some(first.as_ref().handle));
}

#[test]
fn universal_commits_use_setplane_for_the_primary() {
    let (dev, mut display) = setup(MockConfig::default());
    let first = fb(&dev, (1920, 1080), DrmModifier::Linear);
    let second = fb(&dev, (1920, 1080), DrmModifier::Linear);
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(first.as_ref()));
    display.commit2(CommitStyle::Legacy).unwrap();

    dev.clear_calls();
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(second.as_ref()));
    display.commit2(CommitStyle::Universal).unwrap();

    let calls = dev.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        MockCall::SetPlane { fb: Some(fb), .. } if *fb == second.as_ref().handle
    )));
    assert!(!calls.iter().any(|call| matches!(call, MockCall::SetCrtc { .. })));
}

#[test]
fn failed_commits_keep_their_changes() {
    let (dev, mut display) = setup(MockConfig::default());
    let primary = fb(&dev, (1920, 1080), DrmModifier::Linear);
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(primary.as_ref()));

    dev.fail_next(MockIoctl::SetCrtc, libc::EINVAL);
    let err = display.commit2(CommitStyle::Legacy).unwrap_err();
    match &err {
        Error::Commit { style, source } => {
            assert_eq!(*style, CommitStyle::Legacy);
            assert!(matches!(**source, Error::Access { .. }));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.errno(), Some(libc::EINVAL));
    assert!(display
        .plane(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .changes()
        .contains(PlaneChanges::FB));

    display.commit2(CommitStyle::Legacy).unwrap();
    assert_clean(&display);
}

#[test]
fn color_management_is_committed_as_blobs() {
    let (dev, mut display) = setup(MockConfig::default());
    let primary = fb(&dev, (1920, 1080), DrmModifier::Linear);
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(primary.as_ref()));
    let gamma: Vec<u8> = (0..=255u8).flat_map(|v| [v, v, v, v, v, v, 0, 0]).collect();
    display.set_gamma_lut(PipeId(0), &gamma).unwrap();
    display.commit2(CommitStyle::Atomic).unwrap();

    let crtc = ObjectId::Crtc(display.pipe(PipeId(0)).unwrap().crtc());
    let blob = dev.property_value(crtc, "GAMMA_LUT").unwrap();
    assert_ne!(blob, 0);
    assert_eq!(dev.blob_data(blob).unwrap(), gamma);
    assert_eq!(dev.property_value(crtc, "CTM"), Some(0));
}
