use std::sync::Arc;

use drm::control::connector;
use kmsprobe::kms::{
    device::mock, CommitStyle, Display, Error, KmsDevice, MockConfig, MockConnector, MockDevice, OutputChanges,
    PipeChanges, PipeId, PlaneSlot, PlaneType,
};

fn setup(config: MockConfig) -> (Arc<MockDevice>, Display) {
    let dev = Arc::new(MockDevice::new(config));
    let display = Display::new(dev.clone()).unwrap();
    (dev, display)
}

#[test]
fn plane_slots_are_stable() {
    let (_, display) = setup(MockConfig {
        crtcs: 3,
        overlays: 2,
        ..MockConfig::default()
    });
    assert_eq!(display.n_pipes(), 3);

    for pipe in display.pipes() {
        assert_eq!(pipe.plane(PlaneSlot::Primary).unwrap().index(), 0);
        assert_eq!(pipe.plane(PlaneSlot::Overlay(1)).unwrap().index(), 1);
        assert_eq!(pipe.plane(PlaneSlot::Overlay(2)).unwrap().index(), 2);
        let cursor = pipe.plane(PlaneSlot::Cursor).unwrap();
        assert_eq!(cursor.index(), pipe.n_planes() - 1);
        assert_eq!(cursor.kind(), PlaneType::Cursor);
        assert!(pipe.planes().iter().all(|plane| plane.pipe() == pipe.id()));
    }
}

#[test]
fn outputs_are_named_after_their_connector() {
    let (_, display) = setup(MockConfig {
        connectors: vec![
            MockConnector::new(connector::Interface::HDMIA, true),
            MockConnector::new(connector::Interface::DisplayPort, false),
            MockConnector::new(connector::Interface::DisplayPort, true),
        ],
        ..MockConfig::default()
    });

    let names: Vec<_> = display.outputs().iter().map(|output| output.name().to_owned()).collect();
    assert_eq!(names, ["HDMI-A-1", "DP-1", "DP-2"]);
    assert_eq!(display.connected_outputs().collect::<Vec<_>>(), [0, 2]);
    assert_eq!(display.valid_outputs_for_pipe(PipeId(1)).collect::<Vec<_>>(), [0, 2]);
    assert_eq!(display.output(0).unwrap().mode().unwrap().size(), (1920, 1080));
    assert!(display.output(1).unwrap().pipe().is_none());
}

#[test]
fn restricted_connectors_only_list_their_pipes() {
    let mut edp = MockConnector::new(connector::Interface::EmbeddedDisplayPort, true);
    edp.possible_crtcs = 0b10;
    let (_, display) = setup(MockConfig {
        connectors: vec![edp],
        ..MockConfig::default()
    });
    assert_eq!(display.valid_outputs_for_pipe(PipeId(0)).count(), 0);
    assert_eq!(display.valid_outputs_for_pipe(PipeId(1)).collect::<Vec<_>>(), [0]);
}

#[test]
fn assigning_pipes_tracks_changes() {
    let (_, mut display) = setup(MockConfig::default());
    display.set_output_pipe(0, Some(PipeId(1))).unwrap();

    let output = display.output(0).unwrap();
    assert_eq!(output.pending_pipe(), Some(PipeId(1)));
    assert_eq!(output.pipe(), Some(PipeId(1)));
    assert!(output.changes().contains(OutputChanges::PIPE));
    assert!(display.pipe(PipeId(1)).unwrap().changes().contains(PipeChanges::MODE));
    assert_eq!(display.pipe_output(PipeId(1)).unwrap().index(), 0);
    assert_eq!(display.output_driving_pipe(0).unwrap(), PipeId(1));
    assert!(matches!(display.output_driving_pipe(1), Err(Error::NoDrivingPipe(_))));

    assert!(matches!(
        display.set_output_pipe(0, Some(PipeId(7))),
        Err(Error::InvalidPipe(PipeId(7)))
    ));
    assert!(matches!(display.output(5), Err(Error::InvalidOutput(5))));
}

#[test]
fn two_outputs_on_one_pipe_fail_before_committing() {
    let (dev, mut display) = setup(MockConfig::default());
    display.set_output_pipe(0, Some(PipeId(0))).unwrap();
    display.set_output_pipe(1, Some(PipeId(0))).unwrap();
    dev.clear_calls();

    let err = display.try_commit2(CommitStyle::Atomic).unwrap_err();
    match err {
        Error::PipeConflict { a, b, pipe } => {
            assert_eq!((a.as_str(), b.as_str(), pipe), ("HDMI-A-1", "DP-1", PipeId(0)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(dev.calls().is_empty());
}

#[test]
fn override_mode_replaces_the_preferred_mode() {
    let (dev, mut display) = setup(MockConfig::default());
    display.set_output_pipe(0, Some(PipeId(0))).unwrap();
    display.override_mode(0, Some(mock::mode(1280, 720, 60, false))).unwrap();
    assert_eq!(display.output(0).unwrap().mode().unwrap().size(), (1280, 720));

    let fb = kmsprobe::kms::create_color_fb(
        dev.clone(),
        (1280, 720),
        drm_fourcc::DrmFourcc::Xrgb8888,
        drm_fourcc::DrmModifier::Linear,
        (0.0, 0.0, 0.0),
    )
    .unwrap();
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(fb.as_ref()));
    display.commit2(CommitStyle::Atomic).unwrap();
    let crtc = display.pipe(PipeId(0)).unwrap().crtc();
    assert_eq!(dev.crtc_info(crtc).unwrap().mode.unwrap().size(), (1280, 720));

    display.override_mode(0, None).unwrap();
    assert_eq!(display.output(0).unwrap().mode().unwrap().size(), (1920, 1080));
    assert!(display.pipe(PipeId(0)).unwrap().changes().contains(PipeChanges::MODE));
}

#[test]
fn scaling_mode_needs_the_property() {
    let (dev, mut display) = setup(MockConfig::default());
    let err = display.set_scaling_mode(0, 1).unwrap_err();
    assert!(matches!(err, Error::ScalingModeUnsupported(_)));
    assert_eq!(err.kind(), kmsprobe::ErrorKind::Capability);
    assert!(!display.output(0).unwrap().changes().contains(OutputChanges::SCALING_MODE));

    // the rejected request must not leak into the next commit
    display.set_output_pipe(0, Some(PipeId(0))).unwrap();
    let fb = kmsprobe::kms::create_color_fb(
        dev.clone(),
        (1920, 1080),
        drm_fourcc::DrmFourcc::Xrgb8888,
        drm_fourcc::DrmModifier::Linear,
        (0.0, 0.0, 0.0),
    )
    .unwrap();
    display
        .plane_mut(PipeId(0), PlaneSlot::Primary)
        .unwrap()
        .set_fb(Some(fb.as_ref()));
    display.try_commit2(CommitStyle::Atomic).unwrap();

    let (_, mut display) = setup(MockConfig {
        scaling_mode: true,
        ..MockConfig::default()
    });
    display.set_scaling_mode(0, 2).unwrap();
    assert!(display.output(0).unwrap().changes().contains(OutputChanges::SCALING_MODE));
}

#[test]
fn crtc_properties_are_looked_up_by_name() {
    let (_, display) = setup(MockConfig::default());
    assert!(display.pipe_get_property(PipeId(0), "ACTIVE").unwrap().is_some());
    assert!(display.pipe_get_property(PipeId(0), "NOT_A_PROPERTY").unwrap().is_none());
    assert!(display.pipe_get_property(PipeId(4), "ACTIVE").is_err());
}
