//! Vblank counter queries and waits
//!
//! The counters are read with `DRM_IOCTL_WAIT_VBLANK`. Pipe 0 is addressed without extra
//! bits, pipe 1 with [`VblankFlags::SECONDARY`] and every further pipe through the
//! high-crtc field of the request type.

use bitflags::bitflags;
use tracing::trace;

use super::{device::KmsDevice, error::Error, PipeId};

bitflags! {
    /// Request type bits of a vblank request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VblankFlags: u32 {
        /// The sequence is relative to the current count
        const RELATIVE = 0x0000_0001;
        /// Queue an event instead of blocking
        const EVENT = 0x0400_0000;
        /// If the target already passed, wait for the next vblank instead
        const NEXTONMISS = 0x1000_0000;
        /// Addresses pipe 1
        const SECONDARY = 0x2000_0000;
    }
}

/// Mask of the high-crtc field within a request type
pub const HIGH_CRTC_MASK: u32 = 0x0000_003e;
/// Shift of the high-crtc field within a request type
pub const HIGH_CRTC_SHIFT: u32 = 1;

/// Request type bits addressing `pipe`
pub fn pipe_select(pipe: PipeId) -> Result<u32, Error> {
    match pipe.0 {
        0 => Ok(0),
        1 => Ok(VblankFlags::SECONDARY.bits()),
        n => {
            let bits = (n as u32).checked_shl(HIGH_CRTC_SHIFT).unwrap_or(u32::MAX);
            if n > 31 || bits & !HIGH_CRTC_MASK != 0 {
                Err(Error::InvalidPipe(pipe))
            } else {
                Ok(bits)
            }
        }
    }
}

/// Pipe addressed by a request type, the inverse of [`pipe_select`]
pub fn pipe_of_request(request_type: u32) -> PipeId {
    let high = (request_type & HIGH_CRTC_MASK) >> HIGH_CRTC_SHIFT;
    if high != 0 {
        PipeId(high as usize)
    } else if request_type & VblankFlags::SECONDARY.bits() != 0 {
        PipeId(1)
    } else {
        PipeId(0)
    }
}

/// Returns the current vblank count of `pipe`
///
/// With [`VblankFlags::NEXTONMISS`] the call blocks until the next vblank and returns
/// its number instead.
pub fn query_vblank_count(dev: &dyn KmsDevice, pipe: PipeId, flags: VblankFlags) -> Result<u32, Error> {
    let request = VblankFlags::RELATIVE.bits() | pipe_select(pipe)? | flags.bits();
    let sequence = dev.wait_vblank(request, 0).map_err(|source| Error::Access {
        errmsg: "Failed to query vblank counter",
        dev: dev.dev_path(),
        source,
    })?;
    trace!(%pipe, sequence, ?flags, "vblank count");
    Ok(sequence)
}

/// Blocks until the next vblank of `pipe`
pub fn wait_for_vblank(dev: &dyn KmsDevice, pipe: PipeId) -> Result<(), Error> {
    let request = VblankFlags::RELATIVE.bits() | pipe_select(pipe)?;
    let sequence = dev.wait_vblank(request, 1).map_err(|source| Error::Access {
        errmsg: "Failed to wait for vblank",
        dev: dev.dev_path(),
        source,
    })?;
    trace!(%pipe, sequence, "waited for vblank");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{pipe_of_request, pipe_select, query_vblank_count, wait_for_vblank, VblankFlags};
    use crate::kms::{
        device::mock::{MockConfig, MockDevice},
        CommitStyle, Display, PipeId, PlaneSlot,
    };
    use std::sync::Arc;

    #[test]
    fn pipe_selectors() {
        assert_eq!(pipe_select(PipeId(0)).unwrap(), 0);
        assert_eq!(pipe_select(PipeId(1)).unwrap(), 0x2000_0000);
        assert_eq!(pipe_select(PipeId(2)).unwrap(), 0x4);
        assert_eq!(pipe_select(PipeId(31)).unwrap(), 0x3e);
        assert!(pipe_select(PipeId(32)).is_err());

        for pipe in 0..8 {
            assert_eq!(pipe_of_request(pipe_select(PipeId(pipe)).unwrap() | 1), PipeId(pipe));
        }
    }

    #[test]
    fn counters_advance_on_wait() {
        let dev = Arc::new(MockDevice::new(MockConfig::default()));
        let mut display = Display::new(dev.clone()).unwrap();
        let fb = crate::kms::framebuffer::tests::white_fb(&dev, (1920, 1080));
        display.set_output_pipe(0, Some(PipeId(0))).unwrap();
        display
            .plane_mut(PipeId(0), PlaneSlot::Primary)
            .unwrap()
            .set_fb(Some(fb.as_ref()));
        display.commit2(CommitStyle::Legacy).unwrap();

        let start = query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap();
        assert_eq!(query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap(), start);
        wait_for_vblank(&*dev, PipeId(0)).unwrap();
        assert_eq!(query_vblank_count(&*dev, PipeId(0), VblankFlags::empty()).unwrap(), start + 1);
        assert_eq!(
            query_vblank_count(&*dev, PipeId(0), VblankFlags::NEXTONMISS).unwrap(),
            start + 2
        );
    }

    #[test]
    fn disabled_pipe_has_no_counter() {
        let dev = MockDevice::new(MockConfig::default());
        assert!(query_vblank_count(&dev, PipeId(1), VblankFlags::empty()).is_err());
    }
}
