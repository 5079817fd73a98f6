//! Various utilities functions and types

mod deadline;
mod fd;
mod geometry;

pub use self::deadline::{Deadline, Expired};
pub use self::fd::DeviceFd;
pub use self::geometry::{Buffer, Physical, Point, Rectangle, Size};
