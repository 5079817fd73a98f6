//! Subtest registry, fixtures and result reporting

use std::{
    fmt, io,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use drm::control::crtc;
use drm_fourcc::{DrmFourcc, DrmModifier};
use kmsprobe::{
    crc, debugfs,
    kms::{
        self, create_color_fb, ColorFramebuffer, CommitStyle, Display, DrmDeviceFd, KmsDevice, MockConfig,
        MockDevice, PipeId, PlaneSlot,
    },
    utils::DeviceFd,
    ErrorKind,
};
use tracing::{info, warn};

use crate::ringbuf::RingBuffer;

/// All subtests passed, or passed and skipped
pub const EXIT_SUCCESS: i32 = 0;
/// Every selected subtest was skipped
pub const EXIT_SKIP: i32 = 77;
/// A subtest did not finish in time
pub const EXIT_TIMEOUT: i32 = 78;
/// The command line selected nothing
pub const EXIT_INVALID: i32 = 79;
/// A subtest failed
pub const EXIT_FAILURE: i32 = 99;

/// Everything that ends a subtest early
#[derive(Debug, thiserror::Error)]
pub enum SubtestError {
    #[error("Test requirement not met: {0}")]
    Skip(String),
    #[error("Test assertion failure: {0}")]
    Failed(String),
    #[error(transparent)]
    Kms(#[from] kms::Error),
    #[error(transparent)]
    Crc(#[from] crc::Error),
    #[error(transparent)]
    DebugFs(#[from] debugfs::Error),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SubtestError {
    pub fn outcome(&self) -> Outcome {
        let kind = match self {
            SubtestError::Skip(_) => return Outcome::Skip,
            SubtestError::Failed(_) => return Outcome::Fail,
            SubtestError::Kms(err) => err.kind(),
            SubtestError::Crc(err) => err.kind(),
            SubtestError::DebugFs(err) => err.kind(),
            SubtestError::Io { .. } => ErrorKind::Protocol,
        };
        match kind {
            ErrorKind::Capability => Outcome::Skip,
            ErrorKind::Timeout => Outcome::Timeout,
            _ => Outcome::Fail,
        }
    }
}

/// Skips the subtest unless `cond` holds
pub fn require(cond: bool, what: &str) -> Result<(), SubtestError> {
    if cond {
        Ok(())
    } else {
        Err(SubtestError::Skip(what.to_owned()))
    }
}

/// Fails the subtest unless `cond` holds
pub fn check(cond: bool, what: impl FnOnce() -> String) -> Result<(), SubtestError> {
    if cond {
        Ok(())
    } else {
        Err(SubtestError::Failed(what()))
    }
}

/// Result of one subtest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Skip,
    Fail,
    Timeout,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "SUCCESS",
            Outcome::Skip => "SKIP",
            Outcome::Fail => "FAIL",
            Outcome::Timeout => "TIMEOUT",
        })
    }
}

/// Process exit code for a set of subtest results
pub fn exit_code(outcomes: &[Outcome]) -> i32 {
    if outcomes.is_empty() {
        EXIT_INVALID
    } else if outcomes.contains(&Outcome::Fail) {
        EXIT_FAILURE
    } else if outcomes.contains(&Outcome::Timeout) {
        EXIT_TIMEOUT
    } else if outcomes.contains(&Outcome::Success) {
        EXIT_SUCCESS
    } else {
        EXIT_SKIP
    }
}

/// Shell-style matching of a subtest name
///
/// `*` matches any run of characters, `?` a single one, and a comma separates
/// alternative patterns.
pub fn matches_subtest(pattern: &str, name: &str) -> bool {
    pattern.split(',').any(|alt| glob_match(alt.as_bytes(), name.as_bytes()))
}

fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut backtrack = None;
    while n < name.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(c) if *c == b'?' || *c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == b'*')
}

/// Device the subtests run against
#[derive(Debug, Clone)]
pub enum Target {
    Node(PathBuf),
    Mock,
}

/// An output driving a pipe, as set up by [`Fixture::prepare_output`]
#[derive(Debug, Clone, Copy)]
pub struct ActiveOutput {
    pub output: usize,
    pub pipe: PipeId,
    pub crtc: crtc::Handle,
    pub size: (u32, u32),
}

/// Per-subtest state: an open device and a fresh display model
#[derive(Debug)]
pub struct Fixture {
    pub dev: Arc<dyn KmsDevice>,
    pub display: Display,
}

impl Fixture {
    pub fn open(target: &Target) -> Result<Fixture, SubtestError> {
        let dev: Arc<dyn KmsDevice> = match target {
            Target::Mock => Arc::new(MockDevice::new(MockConfig::default())),
            Target::Node(path) => {
                let fd = DeviceFd::open(path)
                    .map_err(|err| SubtestError::Skip(format!("cannot open {}: {}", path.display(), err)))?;
                Arc::new(DrmDeviceFd::new(fd))
            }
        };
        let display = Display::new(dev.clone())?;
        Ok(Fixture { dev, display })
    }

    /// Commit style for plane updates without modeset
    pub fn plane_style(&self) -> CommitStyle {
        if self.display.is_atomic() {
            CommitStyle::Atomic
        } else {
            CommitStyle::Universal
        }
    }

    /// Commit style able to modeset
    pub fn modeset_style(&self) -> CommitStyle {
        if self.display.is_atomic() {
            CommitStyle::Atomic
        } else {
            CommitStyle::Legacy
        }
    }

    pub fn require_atomic(&self) -> Result<(), SubtestError> {
        require(self.display.is_atomic(), "atomic modesetting")
    }

    /// Routes the first connected output with a mode to a pipe it supports
    pub fn prepare_output(&mut self) -> Result<ActiveOutput, SubtestError> {
        let found = (0..self.display.n_pipes()).map(PipeId).find_map(|pipe| {
            self.display
                .valid_outputs_for_pipe(pipe)
                .find_map(|idx| Some((idx, pipe, self.display.output(idx).ok()?.mode()?)))
        });
        let (output, pipe, mode) = found.ok_or_else(|| SubtestError::Skip("no connected output".into()))?;

        self.display.set_output_pipe(output, Some(pipe))?;
        let (w, h) = mode.size();
        let active = ActiveOutput {
            output,
            pipe,
            crtc: self.display.pipe(pipe)?.crtc(),
            size: (w as u32, h as u32),
        };
        info!(output = %self.display.output(output)?.name(), %pipe, ?active.size, "using output");
        Ok(active)
    }

    pub fn color_fb(&self, size: (u32, u32), rgb: (f64, f64, f64)) -> Result<ColorFramebuffer, SubtestError> {
        Ok(create_color_fb(
            self.dev.clone(),
            size,
            DrmFourcc::Xrgb8888,
            DrmModifier::Linear,
            rgb,
        )?)
    }

    pub fn cursor_fb(&self, size: (u32, u32)) -> Result<ColorFramebuffer, SubtestError> {
        Ok(create_color_fb(
            self.dev.clone(),
            size,
            DrmFourcc::Argb8888,
            DrmModifier::Linear,
            (1.0, 1.0, 1.0),
        )?)
    }

    /// Shows `fb` full screen on the primary plane of `active`
    pub fn modeset(&mut self, active: &ActiveOutput, fb: &ColorFramebuffer) -> Result<(), SubtestError> {
        let style = self.modeset_style();
        self.display
            .plane_mut(active.pipe, PlaneSlot::Primary)?
            .set_fb(Some(fb.as_ref()));
        self.display.commit2(style)?;
        Ok(())
    }

    /// Turns every plane and pipe off again, best effort
    pub fn reset(&mut self) {
        for pipe in 0..self.display.n_pipes() {
            if let Ok(pipe) = self.display.pipe_mut(PipeId(pipe)) {
                for plane in pipe.planes_mut() {
                    plane.set_fb(None);
                }
            }
        }
        for output in 0..self.display.n_outputs() {
            if self.display.output(output).map_or(false, |o| o.pipe().is_some()) {
                if let Err(err) = self.display.set_output_pipe(output, None) {
                    warn!(output, %err, "failed to unassign output");
                }
            }
        }
        match self.display.try_commit2(self.modeset_style()) {
            Ok(()) | Err(kms::Error::NoActiveOutputs) => {}
            Err(err) => warn!(%err, "failed to reset the display"),
        }
    }
}

/// A registered subtest
pub struct Subtest {
    pub name: &'static str,
    pub description: &'static str,
    pub run: fn(&mut Fixture) -> Result<(), SubtestError>,
}

impl fmt::Debug for Subtest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtest").field("name", &self.name).finish()
    }
}

/// Runs the selected subtests in registration order
pub struct Harness<'a> {
    subtests: &'a [Subtest],
    target: Target,
    log: RingBuffer,
}

impl<'a> Harness<'a> {
    pub fn new(subtests: &'a [Subtest], target: Target, log: RingBuffer) -> Harness<'a> {
        Harness { subtests, target, log }
    }

    pub fn list(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.subtests.iter().map(|subtest| subtest.name)
    }

    /// Runs every subtest matching `filter`, or all of them, and returns the exit code
    pub fn run(&self, filter: Option<&str>) -> i32 {
        let selected: Vec<&Subtest> = self
            .subtests
            .iter()
            .filter(|subtest| filter.map_or(true, |pattern| matches_subtest(pattern, subtest.name)))
            .collect();
        if selected.is_empty() {
            eprintln!("Unknown subtest: {}", filter.unwrap_or_default());
            return EXIT_INVALID;
        }

        let outcomes: Vec<Outcome> = selected.into_iter().map(|subtest| self.run_one(subtest)).collect();
        exit_code(&outcomes)
    }

    fn run_one(&self, subtest: &Subtest) -> Outcome {
        println!("Starting subtest: {}", subtest.name);
        self.log.reset();
        let start = Instant::now();

        let result = Fixture::open(&self.target).and_then(|mut fixture| {
            let result = (subtest.run)(&mut fixture);
            fixture.reset();
            result
        });

        let outcome = match result {
            Ok(()) => Outcome::Success,
            Err(err) => {
                let outcome = err.outcome();
                match outcome {
                    Outcome::Skip => println!("{}", err),
                    _ => {
                        eprintln!("Subtest {} failed: {}", subtest.name, err);
                        if let Err(err) = self.log.dump(&mut io::stderr()) {
                            warn!(%err, "failed to dump the log buffer");
                        }
                    }
                }
                outcome
            }
        };
        println!(
            "Subtest {}: {} ({:.3}s)",
            subtest.name,
            outcome,
            start.elapsed().as_secs_f64()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::{
        exit_code, matches_subtest, Fixture, Outcome, EXIT_FAILURE, EXIT_INVALID, EXIT_SKIP, EXIT_SUCCESS, EXIT_TIMEOUT,
    };
    use kmsprobe::kms::{device::ObjectId, Display, KmsDevice, MockConfig, MockDevice, MockIoctl};
    use std::sync::Arc;

    #[test]
    fn reset_is_best_effort() {
        let mock = Arc::new(MockDevice::new(MockConfig::default()));
        let dev: Arc<dyn KmsDevice> = mock.clone();
        let display = Display::new(dev.clone()).unwrap();
        let mut fixture = Fixture { dev, display };
        let active = fixture.prepare_output().unwrap();
        let fb = fixture.color_fb(active.size, (0.0, 0.0, 0.0)).unwrap();
        fixture.modeset(&active, &fb).unwrap();
        let crtc = ObjectId::Crtc(active.crtc);
        assert_eq!(mock.property_value(crtc, "ACTIVE"), Some(1));

        mock.fail_next(MockIoctl::AtomicCommit, libc::EINVAL);
        fixture.reset();
        assert!(fixture.display.output(active.output).unwrap().pipe().is_none());
        assert_eq!(mock.property_value(crtc, "ACTIVE"), Some(1));

        fixture.reset();
        assert_eq!(mock.property_value(crtc, "ACTIVE"), Some(0));
    }

    #[test]
    fn wildcards() {
        assert!(matches_subtest("crc-stable", "crc-stable"));
        assert!(matches_subtest("cursor-*", "cursor-stress-threads"));
        assert!(matches_subtest("*-commit", "basic-legacy-commit"));
        assert!(matches_subtest("crc-st?ble", "crc-stable"));
        assert!(matches_subtest("nope,crc-*", "crc-stable"));
        assert!(matches_subtest("*", "anything"));
        assert!(!matches_subtest("cursor-*", "crc-stable"));
        assert!(!matches_subtest("crc", "crc-stable"));
        assert!(!matches_subtest("crc-stable?", "crc-stable"));
    }

    #[test]
    fn exit_codes() {
        use Outcome::*;
        assert_eq!(exit_code(&[]), EXIT_INVALID);
        assert_eq!(exit_code(&[Success, Skip]), EXIT_SUCCESS);
        assert_eq!(exit_code(&[Skip, Skip]), EXIT_SKIP);
        assert_eq!(exit_code(&[Success, Timeout]), EXIT_TIMEOUT);
        assert_eq!(exit_code(&[Timeout, Fail, Success]), EXIT_FAILURE);
    }
}
