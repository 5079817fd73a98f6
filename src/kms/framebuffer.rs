//! Framebuffers for test scenes

use std::sync::Arc;

use drm::control::framebuffer;
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{trace, warn};

use super::device::KmsDevice;
use super::error::Error;

/// A framebuffer as referenced by a [`Plane`](super::Plane)
///
/// This only describes the buffer; planes keep a copy of it while it is attached,
/// ownership stays with the test code that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    /// Framebuffer object
    pub handle: framebuffer::Handle,
    /// Gem handle of the backing buffer, used by the legacy cursor ioctl
    pub gem_handle: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub format: DrmFourcc,
    /// Layout modifier
    pub modifier: DrmModifier,
}

impl Framebuffer {
    /// Size in pixels
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// A framebuffer filled with a single color, removed on drop
#[derive(Debug)]
pub struct ColorFramebuffer {
    dev: Arc<dyn KmsDevice>,
    fb: Framebuffer,
}

impl AsRef<Framebuffer> for ColorFramebuffer {
    fn as_ref(&self) -> &Framebuffer {
        &self.fb
    }
}

impl Drop for ColorFramebuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb.handle, "destroying framebuffer");
        if let Err(err) = self.dev.destroy_framebuffer(&self.fb) {
            warn!(fb = ?self.fb.handle, ?err, "failed to destroy framebuffer");
        }
    }
}

/// Packs normalized rgb components into an opaque ARGB8888 pixel
pub fn pack_argb8888((r, g, b): (f64, f64, f64)) -> u32 {
    let channel = |c: f64| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
    0xff00_0000 | channel(r) << 16 | channel(g) << 8 | channel(b)
}

/// Creates a framebuffer of `size` filled with the color `rgb`
///
/// Components are given in the 0.0..=1.0 range.
#[profiling::function]
pub fn create_color_fb(
    dev: Arc<dyn KmsDevice>,
    size: (u32, u32),
    format: DrmFourcc,
    modifier: DrmModifier,
    rgb: (f64, f64, f64),
) -> Result<ColorFramebuffer, Error> {
    let fb = dev
        .create_color_framebuffer(size, format, modifier, pack_argb8888(rgb))
        .map_err(|source| Error::Access {
            errmsg: "Failed to create framebuffer",
            dev: dev.dev_path(),
            source,
        })?;
    trace!(fb = ?fb.handle, width = size.0, height = size.1, ?format, "created framebuffer");
    Ok(ColorFramebuffer { dev, fb })
}
