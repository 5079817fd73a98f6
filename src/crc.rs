//! Pipe CRC capture through debugfs
//!
//! The display engine can compute a checksum of every frame it scans out. Comparing the
//! checksums of two scenes is the only reliable way to tell whether the hardware really
//! displayed the same thing, so most visual tests are built on [`PipeCrc`].
//!
//! Two kernel interfaces exist:
//!
//! - the generic one, with a `crtc-<index>/crc/control` file accepting a source name and
//!   a `crtc-<index>/crc/data` file producing one line per frame,
//! - the older i915 one, with a shared `i915_display_crc_ctl` control file and one
//!   `i915_pipe_<name>_crc` data file per pipe.
//!
//! The generic interface is preferred whenever its control file exists. Note that checksum
//! collisions are possible, so tests may only rely on two checksums being equal, never on
//! them being different.

use std::{
    fmt,
    fs::File,
    io::{self, Write},
    time::Duration,
};

use rustix::event::{poll, PollFd, PollFlags};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::{
    debugfs::{self, DebugFs},
    kms::PipeId,
    utils::{Deadline, Expired},
    ErrorKind,
};

/// Maximum number of checksum words in one record
pub const MAX_CRC_ENTRIES: usize = 10;
/// Longest line of the generic data file
pub const MAX_LINE_LEN: usize = 10 + 11 * MAX_CRC_ENTRIES + 1;
/// Length of a line of the legacy data files
pub const LEGACY_LINE_LEN: usize = 6 * 8 + 5 + 1;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const LEGACY_CTL: &str = "i915_display_crc_ctl";

/// Tap point the checksum is computed at
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrcSource {
    None,
    Plane1,
    Plane2,
    Pf,
    Pipe,
    Tv,
    DpB,
    DpC,
    DpD,
    /// Let the driver pick, supported everywhere on recent kernels
    Auto,
}

impl CrcSource {
    /// Name written to the control file
    pub fn name(self) -> &'static str {
        match self {
            CrcSource::None => "none",
            CrcSource::Plane1 => "plane1",
            CrcSource::Plane2 => "plane2",
            CrcSource::Pf => "pf",
            CrcSource::Pipe => "pipe",
            CrcSource::Tv => "TV",
            CrcSource::DpB => "DP-B",
            CrcSource::DpC => "DP-C",
            CrcSource::DpD => "DP-D",
            CrcSource::Auto => "auto",
        }
    }
}

/// Errors of the CRC capture
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The debugfs directory is unusable
    #[error(transparent)]
    DebugFs(#[from] debugfs::Error),
    /// The kernel offers no CRC interface for this device
    #[error("Pipe CRCs are not supported: {0}")]
    NotSupported(&'static str),
    /// The driver refused the requested source
    #[error("CRC source {requested:?} is not supported on pipe {pipe}")]
    UnsupportedSource {
        /// Pipe of the session
        pipe: PipeId,
        /// Requested source
        requested: CrcSource,
    },
    /// Reading or writing a CRC file failed
    #[error("CRC file access failed: {0}")]
    Io(#[source] io::Error),
    /// A line of the data file could not be parsed
    #[error("Malformed CRC line {0:?}")]
    Malformed(String),
    /// Data was read from a session that was not started
    #[error("CRC capture on pipe {0} is not running")]
    NotRunning(PipeId),
    /// No record arrived in time
    #[error(transparent)]
    Timeout(#[from] Expired),
    /// Two checksums differ
    #[error("CRC mismatch: {expected} != {got}")]
    Mismatch {
        /// Reference checksum
        expected: Crc,
        /// Checksum read back
        got: Crc,
    },
}

impl Error {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DebugFs(err) => err.kind(),
            Error::NotSupported(_) | Error::UnsupportedSource { .. } => ErrorKind::Capability,
            Error::Io(err) => crate::kms::error_kind_of_io(err),
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Malformed(_) | Error::NotRunning(_) | Error::Mismatch { .. } => ErrorKind::Protocol,
        }
    }
}

/// One checksum record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Crc {
    /// Frame counter of the record, `None` if the driver could not tell
    pub frame: Option<u32>,
    /// Checksum words
    pub words: SmallVec<[u32; MAX_CRC_ENTRIES]>,
}

fn parse_hex(field: &str) -> Option<u32> {
    let field = field.trim();
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u32::from_str_radix(digits, 16).ok()
}

impl Crc {
    /// Number of checksum words
    pub fn n_words(&self) -> usize {
        self.words.len()
    }

    /// Whether the record carries a frame counter
    pub fn has_valid_frame(&self) -> bool {
        self.frame.is_some()
    }

    /// Compares the checksum words, ignoring the frame counter
    pub fn same_checksum(&self, other: &Crc) -> bool {
        self.words == other.words
    }

    /// Parses a line of the legacy interface: a decimal frame counter and five hex words
    pub fn parse_legacy(line: &str) -> Option<Crc> {
        let mut fields = line.split_whitespace();
        let frame = fields.next()?.parse::<u32>().ok()?;
        let words = fields.map(parse_hex).collect::<Option<SmallVec<_>>>()?;
        if words.len() != 5 {
            return None;
        }
        Some(Crc {
            frame: Some(frame),
            words,
        })
    }

    /// Parses a line of the generic interface
    ///
    /// The first ten characters hold the frame counter in hex, or `XXXXXXXXXX` if the
    /// frame is unknown. Every checksum word follows in an eleven character column.
    pub fn parse_generic(line: &str) -> Option<Crc> {
        let line = line.trim_end_matches('\n');
        if line.len() < 10 || !line.is_char_boundary(10) {
            return None;
        }
        let (frame, rest) = line.split_at(10);
        let frame = if frame == "XXXXXXXXXX" {
            None
        } else {
            Some(parse_hex(frame)?)
        };

        let mut words = SmallVec::new();
        for column in rest.as_bytes().chunks(11) {
            if words.len() == MAX_CRC_ENTRIES {
                return None;
            }
            words.push(parse_hex(std::str::from_utf8(column).ok()?)?);
        }
        Some(Crc { frame, words })
    }

    /// Logs warnings for checksums that usually indicate a powered down or broken unit
    pub fn sanity_check(&self) {
        if self.words.iter().any(|word| *word == 0xffff_ffff) {
            warn!(crc = %self, "Suspicious CRC: it looks like the CRC read back was from a register in a powered down well");
        }
        if self.words.iter().all(|word| *word == 0) {
            warn!(crc = %self, "Suspicious CRC: All values are 0.");
        }
    }
}

impl fmt::Display for Crc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.words.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:08x}", word)?;
        }
        Ok(())
    }
}

/// Fails unless both checksums are equal
pub fn assert_crc_equal(expected: &Crc, got: &Crc) -> Result<(), Error> {
    if expected.same_checksum(got) {
        Ok(())
    } else {
        Err(Error::Mismatch {
            expected: expected.clone(),
            got: got.clone(),
        })
    }
}

#[derive(Debug)]
enum Backend {
    Legacy { ctl: File, data: File },
    Generic { ctl: File, data: Option<File> },
}

/// A checksum capture session on one pipe
///
/// Sessions capture nothing until [`PipeCrc::start`]; dropping a running session stops it.
#[derive(Debug)]
pub struct PipeCrc {
    debugfs: DebugFs,
    pipe: PipeId,
    source: CrcSource,
    nonblock: bool,
    backend: Backend,
    pending: Vec<u8>,
    running: bool,
}

impl PipeCrc {
    /// Creates a blocking session
    pub fn new(debugfs: &DebugFs, pipe: PipeId, source: CrcSource) -> Result<PipeCrc, Error> {
        PipeCrc::create(debugfs, pipe, source, false)
    }

    /// Creates a session whose reads return early when no record is available
    pub fn new_nonblock(debugfs: &DebugFs, pipe: PipeId, source: CrcSource) -> Result<PipeCrc, Error> {
        PipeCrc::create(debugfs, pipe, source, true)
    }

    fn create(debugfs: &DebugFs, pipe: PipeId, source: CrcSource, nonblock: bool) -> Result<PipeCrc, Error> {
        let backend = match debugfs.open_write(&format!("crtc-{}/crc/control", pipe.0)) {
            Ok(ctl) => {
                debug!(%pipe, "Using generic frame CRC ABI");
                Backend::Generic { ctl, data: None }
            }
            Err(_) => {
                let ctl = debugfs.open_write(LEGACY_CTL)?;
                let data = debugfs.open_read(&format!("i915_pipe_{}_crc", pipe), nonblock)?;
                debug!(%pipe, "Using legacy frame CRC ABI");
                Backend::Legacy { ctl, data }
            }
        };

        Ok(PipeCrc {
            debugfs: debugfs.clone(),
            pipe,
            source,
            nonblock,
            backend,
            pending: Vec::with_capacity(MAX_LINE_LEN),
            running: false,
        })
    }

    /// Pipe of the session
    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    /// Whether the legacy interface is in use
    pub fn is_legacy(&self) -> bool {
        matches!(self.backend, Backend::Legacy { .. })
    }

    /// Whether capturing was started
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts capturing
    ///
    /// Fails with a capability error if the driver does not support the source.
    #[profiling::function]
    pub fn start(&mut self) -> Result<(), Error> {
        self.stop()?;

        let pipe = self.pipe;
        let source = self.source;
        let unsupported = move |err: io::Error| {
            if err.raw_os_error() == Some(libc::EINVAL) {
                Error::UnsupportedSource {
                    pipe,
                    requested: source,
                }
            } else {
                Error::Io(err)
            }
        };

        match &mut self.backend {
            Backend::Legacy { ctl, .. } => {
                let cmd = format!("pipe {} {}", pipe, source.name());
                trace!(%pipe, %cmd, "starting CRC capture");
                ctl.write_all(cmd.as_bytes()).map_err(unsupported)?;
            }
            Backend::Generic { ctl, data } => {
                trace!(%pipe, source = source.name(), "starting CRC capture");
                ctl.write_all(source.name().as_bytes()).map_err(unsupported)?;
                let file = self
                    .debugfs
                    .open_read(&format!("crtc-{}/crc/data", pipe.0), self.nonblock)
                    .map_err(|err| match err {
                        debugfs::Error::Io { source, .. } => unsupported(source),
                        other => Error::DebugFs(other),
                    })?;
                *data = Some(file);
            }
        }
        self.running = true;

        if self.is_legacy() {
            // the first two records after enabling are unreliable
            self.read_one()?;
            self.read_one()?;
        }
        Ok(())
    }

    /// Stops capturing
    pub fn stop(&mut self) -> Result<(), Error> {
        self.pending.clear();
        self.running = false;
        match &mut self.backend {
            Backend::Legacy { ctl, .. } => {
                let cmd = format!("pipe {} none", self.pipe);
                ctl.write_all(cmd.as_bytes()).map_err(Error::Io)?;
            }
            Backend::Generic { data, .. } => {
                *data = None;
            }
        }
        Ok(())
    }

    fn data(&self) -> Option<&File> {
        match &self.backend {
            Backend::Legacy { data, .. } => Some(data),
            Backend::Generic { data, .. } => data.as_ref(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Reads the next line, `None` if nothing is available right now
    fn read_line(&mut self) -> Result<Option<String>, Error> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        if !self.running {
            return Err(Error::NotRunning(self.pipe));
        }

        let read_len = if self.is_legacy() { LEGACY_LINE_LEN } else { MAX_LINE_LEN };
        let deadline = Deadline::after(READ_TIMEOUT, "CRC reading");
        loop {
            let data = self.data().ok_or(Error::NotRunning(self.pipe))?;
            if !self.nonblock {
                let timeout = deadline.remaining()?.as_millis().min(i32::MAX as u128) as i32;
                let mut fds = [PollFd::new(data, PollFlags::IN)];
                match poll(&mut fds, timeout) {
                    Ok(0) => return Err(Error::Timeout(Expired(deadline.what()))),
                    Ok(_) => {}
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(err) => return Err(Error::Io(err.into())),
                }
            }

            let mut buf = [0u8; MAX_LINE_LEN];
            let read = match rustix::io::read(data, &mut buf[..read_len]) {
                Ok(read) => read,
                Err(rustix::io::Errno::INTR) => continue,
                // a partial record stays pending until its newline arrives
                Err(rustix::io::Errno::AGAIN) if self.nonblock => return Ok(None),
                Err(rustix::io::Errno::AGAIN) => continue,
                Err(err) => return Err(Error::Io(err.into())),
            };
            if read == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Ok(Some(line));
            }

            self.pending.extend_from_slice(&buf[..read]);
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            deadline.remaining()?;
        }
    }

    /// Reads one record, `None` if nothing is available right now
    pub fn read_crc(&mut self) -> Result<Option<Crc>, Error> {
        let Some(line) = self.read_line()? else {
            return Ok(None);
        };
        let crc = if self.is_legacy() {
            Crc::parse_legacy(&line)
        } else {
            Crc::parse_generic(&line)
        };
        match crc {
            Some(crc) => {
                trace!(pipe = %self.pipe, frame = ?crc.frame, %crc, "read CRC");
                Ok(Some(crc))
            }
            None => Err(Error::Malformed(line)),
        }
    }

    /// Blocks until one record is available
    pub fn read_one(&mut self) -> Result<Crc, Error> {
        let deadline = Deadline::after(READ_TIMEOUT, "CRC record");
        loop {
            if let Some(crc) = self.read_crc()? {
                return Ok(crc);
            }
            deadline.remaining()?;
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Reads up to `n` records
    ///
    /// In non-blocking mode fewer records, even none, may be returned. Malformed lines are
    /// skipped.
    pub fn get_crcs(&mut self, n: usize) -> Result<Vec<Crc>, Error> {
        let mut crcs = Vec::with_capacity(n);
        while crcs.len() < n {
            match self.read_crc() {
                Ok(Some(crc)) => crcs.push(crc),
                Ok(None) => break,
                Err(Error::Malformed(line)) => {
                    warn!(pipe = %self.pipe, %line, "skipping malformed CRC line");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(crcs)
    }

    /// Captures a single record, starting and stopping the session around it
    pub fn collect_one(&mut self) -> Result<Crc, Error> {
        self.start()?;
        let crc = self.read_one();
        self.stop()?;
        let crc = crc?;
        crc.sanity_check();
        Ok(crc)
    }
}

impl Drop for PipeCrc {
    fn drop(&mut self) {
        if self.running {
            if let Err(err) = self.stop() {
                warn!(pipe = %self.pipe, %err, "failed to stop CRC capture");
            }
        }
    }
}

/// Checks that the device supports pipe CRCs at all
pub fn require_pipe_crc(debugfs: &DebugFs) -> Result<(), Error> {
    if debugfs.open_rw("crtc-0/crc/control").is_ok() {
        return Ok(());
    }
    let mut ctl = debugfs
        .open_rw(LEGACY_CTL)
        .map_err(|_| Error::NotSupported("No display_crc_ctl found, kernel too old"))?;
    match ctl.write_all(b"pipe A none").and_then(|_| ctl.flush()) {
        Err(err) if err.raw_os_error() == Some(libc::ENODEV) => {
            Err(Error::NotSupported("CRCs not supported on this platform"))
        }
        _ => Ok(()),
    }
}

/// Disables capturing on every pipe
///
/// Writes `none` to every generic control file, or turns off pipes A to C through the
/// legacy control file if there are none.
pub fn reset_all(debugfs: &DebugFs) -> Result<(), Error> {
    let mut done = false;
    for entry in debugfs.entries()? {
        if !entry.starts_with("crtc-") {
            continue;
        }
        let Ok(mut ctl) = debugfs.open_write(&format!("{}/crc/control", entry)) else {
            continue;
        };
        ctl.write_all(CrcSource::None.name().as_bytes()).map_err(Error::Io)?;
        done = true;
    }
    if done {
        return Ok(());
    }

    if let Ok(mut ctl) = debugfs.open_write(LEGACY_CTL) {
        for pipe in 0..3 {
            ctl.write_all(format!("pipe {} none", PipeId(pipe)).as_bytes())
                .map_err(Error::Io)?;
        }
    }
    Ok(())
}
