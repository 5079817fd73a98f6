use std::{ffi::CString, fs, io::Write, os::unix::ffi::OsStrExt, path::Path};

use kmsprobe::{
    crc::{self, CrcSource, PipeCrc},
    debugfs::DebugFs,
    kms::PipeId,
    ErrorKind,
};

fn legacy_line(frame: u32, words: [u32; 5]) -> String {
    format!(
        "{:8} {:8x} {:8x} {:8x} {:8x} {:8x}\n",
        frame, words[0], words[1], words[2], words[3], words[4]
    )
}

fn generic_line(frame: u32, words: &[u32]) -> String {
    let mut line = format!("{:#010x}", frame);
    for word in words {
        line.push_str(&format!(" {:#010x}", word));
    }
    line.push('\n');
    line
}

fn generic_crtc(root: &Path, index: usize, data: Option<&str>) {
    let dir = root.join(format!("crtc-{}/crc", index));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("control"), "").unwrap();
    if let Some(data) = data {
        fs::write(dir.join("data"), data).unwrap();
    }
}

#[test]
fn generic_sessions_read_the_data_file() {
    let tmp = tempfile::tempdir().unwrap();
    let data = [generic_line(1, &[0xaa, 0xbb]), generic_line(2, &[0xaa, 0xbb])].concat();
    generic_crtc(tmp.path(), 0, Some(&data));
    let debugfs = DebugFs::at(tmp.path()).unwrap();

    crc::require_pipe_crc(&debugfs).unwrap();
    let mut session = PipeCrc::new(&debugfs, PipeId(0), CrcSource::Auto).unwrap();
    assert!(!session.is_legacy());
    assert!(!session.is_running());

    session.start().unwrap();
    assert!(session.is_running());
    let crcs = session.get_crcs(2).unwrap();
    assert_eq!(crcs.len(), 2);
    assert_eq!(crcs[0].frame, Some(1));
    assert_eq!(crcs[1].frame, Some(2));
    crc::assert_crc_equal(&crcs[0], &crcs[1]).unwrap();
    session.stop().unwrap();

    assert_eq!(fs::read_to_string(tmp.path().join("crtc-0/crc/control")).unwrap(), "auto");
    assert_eq!(session.collect_one().unwrap(), crcs[0]);
}

#[test]
fn legacy_sessions_skip_the_first_records() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("i915_display_crc_ctl"), "").unwrap();
    let data = [
        legacy_line(10, [0xffff_ffff; 5]),
        legacy_line(11, [0; 5]),
        legacy_line(12, [1, 2, 3, 4, 5]),
    ]
    .concat();
    fs::write(tmp.path().join("i915_pipe_A_crc"), data).unwrap();
    let debugfs = DebugFs::at(tmp.path()).unwrap();

    crc::require_pipe_crc(&debugfs).unwrap();
    let mut session = PipeCrc::new(&debugfs, PipeId(0), CrcSource::Auto).unwrap();
    assert!(session.is_legacy());

    let crc = session.collect_one().unwrap();
    assert_eq!(crc.frame, Some(12));
    assert_eq!(crc.words.as_slice(), &[1, 2, 3, 4, 5]);
    assert!(!session.is_running());

    let ctl = fs::read_to_string(tmp.path().join("i915_display_crc_ctl")).unwrap();
    assert!(ctl.contains("pipe A auto"), "control file was {:?}", ctl);
    assert!(ctl.ends_with("pipe A none"), "control file was {:?}", ctl);
}

#[test]
fn nonblocking_reads_return_what_is_there() {
    let tmp = tempfile::tempdir().unwrap();
    generic_crtc(tmp.path(), 0, Some(""));
    let data = ["garbage\n".to_owned(), generic_line(7, &[0x1234])].concat();
    generic_crtc(tmp.path(), 1, Some(&data));
    let debugfs = DebugFs::at(tmp.path()).unwrap();

    let mut empty = PipeCrc::new_nonblock(&debugfs, PipeId(0), CrcSource::Auto).unwrap();
    empty.start().unwrap();
    assert!(empty.get_crcs(4).unwrap().is_empty());
    assert!(empty.read_crc().unwrap().is_none());

    let mut noisy = PipeCrc::new_nonblock(&debugfs, PipeId(1), CrcSource::Auto).unwrap();
    noisy.start().unwrap();
    let crcs = noisy.get_crcs(4).unwrap();
    assert_eq!(crcs.len(), 1);
    assert_eq!(crcs[0].frame, Some(7));
    assert_eq!(crcs[0].to_string(), "00001234");
}

#[test]
fn records_split_across_reads_are_joined() {
    let tmp = tempfile::tempdir().unwrap();
    generic_crtc(tmp.path(), 0, None);
    let fifo = tmp.path().join("crtc-0/crc/data");
    let path = CString::new(fifo.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(path.as_ptr(), 0o600) }, 0);
    let debugfs = DebugFs::at(tmp.path()).unwrap();

    let mut session = PipeCrc::new_nonblock(&debugfs, PipeId(0), CrcSource::Auto).unwrap();
    session.start().unwrap();
    let mut writer = fs::OpenOptions::new().write(true).open(&fifo).unwrap();

    let line = generic_line(3, &[0xdead, 0xbeef]);
    let (head, tail) = line.split_at(line.len() / 2);
    writer.write_all(head.as_bytes()).unwrap();
    assert!(session.read_crc().unwrap().is_none());
    assert!(session.read_crc().unwrap().is_none());

    writer.write_all(tail.as_bytes()).unwrap();
    let crc = session.read_crc().unwrap().unwrap();
    assert_eq!(crc.frame, Some(3));
    assert_eq!(crc.words.as_slice(), &[0xdead, 0xbeef]);
    assert!(session.read_crc().unwrap().is_none());
}

#[test]
fn reading_a_stopped_session_fails() {
    let tmp = tempfile::tempdir().unwrap();
    generic_crtc(tmp.path(), 0, Some(&generic_line(1, &[1])));
    let debugfs = DebugFs::at(tmp.path()).unwrap();

    let mut session = PipeCrc::new(&debugfs, PipeId(0), CrcSource::Auto).unwrap();
    let err = session.read_crc().unwrap_err();
    assert!(matches!(err, crc::Error::NotRunning(PipeId(0))));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[test]
fn missing_interfaces_are_capability_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let debugfs = DebugFs::at(tmp.path()).unwrap();
    let err = crc::require_pipe_crc(&debugfs).unwrap_err();
    assert!(matches!(err, crc::Error::NotSupported(_)));
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(
        PipeCrc::new(&debugfs, PipeId(0), CrcSource::Auto).unwrap_err().kind(),
        ErrorKind::Capability
    );

    // control file without a data file
    generic_crtc(tmp.path(), 0, None);
    let mut session = PipeCrc::new(&debugfs, PipeId(0), CrcSource::Auto).unwrap();
    let err = session.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(!session.is_running());
}

#[test]
fn reset_turns_every_pipe_off() {
    let tmp = tempfile::tempdir().unwrap();
    generic_crtc(tmp.path(), 0, None);
    generic_crtc(tmp.path(), 1, None);
    fs::write(tmp.path().join("crtc-1/crc/control"), "auto").unwrap();
    let debugfs = DebugFs::at(tmp.path()).unwrap();

    crc::reset_all(&debugfs).unwrap();
    for crtc in 0..2 {
        let ctl = fs::read_to_string(tmp.path().join(format!("crtc-{}/crc/control", crtc))).unwrap();
        assert_eq!(ctl, "none");
    }

    let legacy = tempfile::tempdir().unwrap();
    fs::write(legacy.path().join("i915_display_crc_ctl"), "").unwrap();
    crc::reset_all(&DebugFs::at(legacy.path()).unwrap()).unwrap();
    let ctl = fs::read_to_string(legacy.path().join("i915_display_crc_ctl")).unwrap();
    assert_eq!(ctl, "pipe A nonepipe B nonepipe C none");
}
