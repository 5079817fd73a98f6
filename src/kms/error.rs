use std::{io, path::PathBuf};

use super::{commit::CommitStyle, device::ObjectId, PipeId, PlaneSlot};
use crate::utils::Expired;

/// Coarse classification of an [`Error`]
///
/// Test code uses the kind to decide whether a failure means the driver is broken,
/// the hardware simply lacks a feature, or a probe was answered negatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or missing mandatory resource, always fatal
    Protocol,
    /// The driver or hardware lacks a feature; the test is inapplicable
    Capability,
    /// Interrupted or would-block I/O, normally retried internally
    Transient,
    /// The driver rejected a commit with `EINVAL`
    Rejected,
    /// A blocking operation did not finish in time
    Timeout,
}

/// Errors thrown by the [`Display`](super::Display) and the helpers operating on it
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device returned an error for an ioctl
    #[error("DRM access error: {errmsg} on device `{dev:?}` ({source})")]
    Access {
        /// Error message associated to the access error
        errmsg: &'static str,
        /// Device on which the error was generated
        dev: Option<PathBuf>,
        /// Underlying device error
        source: io::Error,
    },
    /// A pipe without a primary plane was found during enumeration
    #[error("Pipe {0} has no primary plane")]
    NoPrimaryPlane(PipeId),
    /// A pipe exposes more planes than the display model can hold
    #[error("Pipe {pipe} has {count} planes, exceeding the maximum of {max}")]
    TooManyPlanes {
        /// Affected pipe
        pipe: PipeId,
        /// Number of planes found
        count: usize,
        /// Maximum supported
        max: usize,
    },
    /// The pipe index is out of range
    #[error("Pipe {0} does not exist")]
    InvalidPipe(PipeId),
    /// The requested plane slot does not exist on the pipe
    #[error("Plane {slot:?} does not exist on pipe {pipe}")]
    InvalidPlane {
        /// Pipe that was queried
        pipe: PipeId,
        /// Requested logical plane
        slot: PlaneSlot,
    },
    /// The output index is out of range
    #[error("Output {0} does not exist")]
    InvalidOutput(usize),
    /// The output has no connector information, so it cannot be assigned
    #[error("Output {0} has no connector and cannot be assigned to a pipe")]
    UnnamedOutput(usize),
    /// The output was expected to drive a pipe but is unassigned
    #[error("Output {0} is not driving any pipe")]
    NoDrivingPipe(String),
    /// Two outputs requested the same pipe
    #[error("{a} and {b} are both trying to use pipe {pipe}")]
    PipeConflict {
        /// First output
        a: String,
        /// Second output
        b: String,
        /// Pipe claimed by both
        pipe: PipeId,
    },
    /// The primary plane was moved away from the origin for a legacy commit
    #[error("Primary plane of pipe {0} cannot be windowed with a legacy commit")]
    LegacyPrimaryWindowed(PipeId),
    /// The primary plane was rotated for a legacy commit
    #[error("Primary plane of pipe {0} cannot be rotated with a legacy commit")]
    LegacyPrimaryRotated(PipeId),
    /// A rotation was requested on a plane without a rotation property
    #[error("Plane {index} of pipe {pipe} does not support rotation")]
    RotationUnsupported {
        /// Pipe of the plane
        pipe: PipeId,
        /// Index of the plane on the pipe
        index: usize,
    },
    /// A plane shared between pipes was given a framebuffer on more than one of them
    #[error("Plane {index} is enabled on both pipe {first} and pipe {second}")]
    PlaneInUse {
        /// Index of the plane on the second pipe
        index: usize,
        /// Pipe that enabled the plane first
        first: PipeId,
        /// Pipe that tried to enable it again
        second: PipeId,
    },
    /// A framebuffer was attached to the primary plane of a pipe without output
    #[error("No output is driving pipe {0}")]
    NoOutputForPipe(PipeId),
    /// The output driving a pipe has no mode to program
    #[error("Output {0} has no usable mode")]
    NoModeForOutput(String),
    /// A legacy commit found no pipe with an output attached
    #[error("No pipe has an output assigned, nothing was enabled")]
    NoActiveOutputs,
    /// The device does not speak the atomic modesetting protocol
    #[error("Atomic modesetting is not supported by this device")]
    AtomicUnsupported,
    /// The connector lacks the "scaling mode" property
    #[error("Connector {0} does not expose the \"scaling mode\" property")]
    ScalingModeUnsupported(String),
    /// A blocking operation exceeded its deadline
    #[error(transparent)]
    Timeout(#[from] Expired),
    /// An event of an unexpected type was read from the device
    #[error("Unexpected DRM event type {0:#x}")]
    UnexpectedEvent(u32),
    /// A short read returned less than an event header or a truncated record
    #[error("Truncated DRM event record of {0} bytes")]
    TruncatedEvent(usize),
    /// A commit that was expected to succeed failed
    #[error("{style:?} commit failed")]
    Commit {
        /// Commit protocol in use
        style: CommitStyle,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
    /// A property the display model depends on is missing
    #[error("The device is missing the property '{name}' on {object:?}")]
    UnknownProperty {
        /// Object that was queried
        object: ObjectId,
        /// Property name
        name: &'static str,
    },
}

impl Error {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Access { source, .. } => kind_of_io(source),
            Error::AtomicUnsupported | Error::ScalingModeUnsupported(_) => ErrorKind::Capability,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Commit { source, .. } if source.kind() == ErrorKind::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Protocol,
        }
    }

    /// Raw OS error code returned by the driver, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Access { source, .. } => source.raw_os_error(),
            Error::Commit { source, .. } => source.errno(),
            _ => None,
        }
    }

    /// True if the driver answered a (test-only) commit with `EINVAL`
    pub fn is_rejection(&self) -> bool {
        self.errno() == Some(libc::EINVAL)
    }
}

pub(crate) fn kind_of_io(err: &io::Error) -> ErrorKind {
    match err.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ERANGE) => ErrorKind::Rejected,
        Some(libc::EOPNOTSUPP) | Some(libc::ENODEV) | Some(libc::ENOENT) => ErrorKind::Capability,
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => ErrorKind::Transient,
        _ => match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => ErrorKind::Transient,
            io::ErrorKind::Unsupported | io::ErrorKind::NotFound => ErrorKind::Capability,
            io::ErrorKind::InvalidInput => ErrorKind::Rejected,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Protocol,
        },
    }
}
