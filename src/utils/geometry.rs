//! Coordinates tagged with the space they live in
//!
//! Plane source rectangles are expressed in framebuffer pixels ([`Buffer`]), destination
//! rectangles in pipe pixels ([`Physical`]). Keeping the two apart at the type level
//! catches mixed-up arguments to the plane setters.

/// Pixels of a pipe's active area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Physical;

/// Pixels of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Buffer;

/// A point in the coordinate space `Kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: Kind,
}

impl<N, Kind: Default> From<(N, N)> for Point<N, Kind> {
    fn from((x, y): (N, N)) -> Self {
        Point {
            x,
            y,
            _kind: Kind::default(),
        }
    }
}

impl<N, Kind> From<Point<N, Kind>> for (N, N) {
    fn from(point: Point<N, Kind>) -> (N, N) {
        (point.x, point.y)
    }
}

/// An extent in the coordinate space `Kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size<N, Kind> {
    /// width
    pub w: N,
    /// height
    pub h: N,
    _kind: Kind,
}

impl<N: Default + PartialEq, Kind> Size<N, Kind> {
    /// True if either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.w == N::default() || self.h == N::default()
    }
}

impl<N, Kind: Default> From<(N, N)> for Size<N, Kind> {
    fn from((w, h): (N, N)) -> Self {
        Size {
            w,
            h,
            _kind: Kind::default(),
        }
    }
}

impl<N, Kind> From<Size<N, Kind>> for (N, N) {
    fn from(size: Size<N, Kind>) -> (N, N) {
        (size.w, size.h)
    }
}

/// A rectangle given by its top-left corner and its size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle<N, Kind> {
    /// top-left corner
    pub loc: Point<N, Kind>,
    /// extent
    pub size: Size<N, Kind>,
}

impl<N, Kind: Default> Rectangle<N, Kind> {
    /// Builds a rectangle from anything convertible to a corner and a size
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }
}

impl Rectangle<u32, Buffer> {
    /// `x, y, w, h` in the 16.16 fixed point format of the plane `SRC_*` properties
    pub fn to_fixed(&self) -> [u64; 4] {
        [self.loc.x, self.loc.y, self.size.w, self.size.h].map(|v| u64::from(v) << 16)
    }

    /// Whether the rectangle lies within a `width` x `height` framebuffer
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        let right = self.loc.x.checked_add(self.size.w);
        let bottom = self.loc.y.checked_add(self.size.h);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }
}
