//! Display pipeline model and commit engine
//!
//! A [`Display`] mirrors the KMS resources of a device: one [`Pipe`] per CRTC with the
//! planes that can be attached to it, and one [`Output`] per connector. Test code mutates
//! the model through the setters on [`Plane`], [`Pipe`] and [`Display`]; every setter only
//! records the new value together with a change flag. Nothing reaches the driver until one
//! of the commit functions runs:
//!
//! - [`Display::commit2`] / [`Display::try_commit2`] with [`CommitStyle::Legacy`] issue one
//!   ioctl per changed resource (`SETCRTC`, `CURSOR`, `SETPLANE`, `SETPROPERTY`),
//! - [`CommitStyle::Universal`] uses `SETPLANE` for every plane including the primary one,
//! - [`Display::commit_atomic`] / [`Display::try_commit_atomic`] build a single atomic
//!   request from the same change flags.
//!
//! After a successful (and not test-only) commit the change flags are cleared, so
//! committing twice without touching the model is a no-op on the driver side.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kmsprobe::kms::{CommitStyle, Display, DrmDeviceFd, PipeId, PlaneSlot, create_color_fb};
//! use kmsprobe::utils::DeviceFd;
//! use drm_fourcc::{DrmFourcc, DrmModifier};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fd = DeviceFd::open("/dev/dri/card0")?;
//! let device = Arc::new(DrmDeviceFd::new(fd));
//! let mut display = Display::new(device.clone())?;
//!
//! let output = display.connected_outputs().next().expect("no connected output");
//! display.set_output_pipe(output, Some(PipeId(0)))?;
//! let (w, h) = display.output(output)?.mode().expect("no mode").size();
//!
//! let fb = create_color_fb(device, (w as u32, h as u32), DrmFourcc::Xrgb8888, DrmModifier::Linear, (0.0, 0.0, 1.0))?;
//! display.plane_mut(PipeId(0), PlaneSlot::Primary)?.set_fb(Some(fb.as_ref()));
//! display.commit2(CommitStyle::Legacy)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use drm::control::{connector, Mode, ModeTypeFlags};
use tracing::debug;

mod changes;
mod commit;
pub mod device;
mod display;
mod error;
pub mod event;
mod framebuffer;
mod output;
mod props;
pub mod vblank;

pub use self::changes::{OutputChanges, PipeChanges, PlaneChanges};
pub use self::commit::CommitStyle;
#[cfg(any(test, feature = "test_device"))]
pub use self::device::mock::{MockCall, MockConfig, MockConnector, MockDevice, MockIoctl};
pub use self::device::{DrmDeviceFd, KmsDevice};
pub use self::display::{Display, Pipe, Plane, PlaneSlot, PlaneType, Rotation, MAX_PLANES};
pub use self::error::{Error, ErrorKind};
pub(crate) use self::error::kind_of_io as error_kind_of_io;
pub use self::framebuffer::{create_color_fb, ColorFramebuffer, Framebuffer};
pub use self::output::{ConnectorConfig, Output};
pub use self::props::{ConnectorProp, CrtcProp, PlaneProp, PropertyCache, PropertyName};

pub use drm::control::AtomicCommitFlags;

/// Index of a display pipe (CRTC) in resource enumeration order
///
/// Pipes are named by letter, pipe 0 being `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub usize);

impl PipeId {
    /// Parses a pipe name such as `A` or `b`
    pub fn from_name(name: char) -> Option<PipeId> {
        let upper = name.to_ascii_uppercase();
        upper
            .is_ascii_uppercase()
            .then(|| PipeId((upper as u8 - b'A') as usize))
    }

    /// Bit of this pipe in a crtc index mask
    pub fn mask(self) -> u32 {
        1 << self.0
    }

    /// Lowest pipe set in a crtc index mask
    pub fn from_mask(mask: u32) -> Option<PipeId> {
        (mask != 0).then(|| PipeId(mask.trailing_zeros() as usize))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 26 {
            write!(f, "{}", (b'A' + self.0 as u8) as char)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Short name of a connector type as used in output names
pub fn connector_type_str(interface: connector::Interface) -> &'static str {
    use connector::Interface;

    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        _ => "Unknown",
    }
}

/// Picks the preferred mode of a mode list, falling back to the first one
pub fn default_mode(modes: &[Mode]) -> Option<Mode> {
    modes
        .iter()
        .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
        .copied()
}

/// Logs a mode at debug level
pub fn dump_mode(mode: &Mode) {
    let (w, h) = mode.size();
    debug!(
        name = %mode.name().to_string_lossy(),
        refresh = mode.vrefresh(),
        clock = mode.clock(),
        hdisplay = w,
        vdisplay = h,
        flags = ?mode.flags(),
        mode_type = ?mode.mode_type(),
        "mode"
    );
}
