use bitflags::bitflags;

bitflags! {
    /// Pending changes of a [`Plane`](super::Plane)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlaneChanges: u8 {
        /// Framebuffer or source rectangle changed
        const FB = 1 << 0;
        /// Destination position changed
        const POSITION = 1 << 1;
        /// Destination size changed
        const SIZE = 1 << 2;
        /// Rotation changed
        const ROTATION = 1 << 3;
    }
}

bitflags! {
    /// Pending changes of a [`Pipe`](super::Pipe)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipeChanges: u8 {
        /// Mode or output assignment changed, a modeset is needed
        const MODE = 1 << 0;
        /// Background color changed
        const BACKGROUND = 1 << 1;
        /// Degamma, ctm or gamma blobs changed
        const COLOR_MGMT = 1 << 2;
    }
}

bitflags! {
    /// Pending changes of an [`Output`](super::Output)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputChanges: u8 {
        /// The pipe driving the output changed
        const PIPE = 1 << 0;
        /// The scaling mode property changed
        const SCALING_MODE = 1 << 1;
    }
}

impl PlaneChanges {
    /// Changes that alter what is scanned out, so the pipe has to wait for a vblank
    pub const SCANOUT: PlaneChanges = PlaneChanges::FB
        .union(PlaneChanges::POSITION)
        .union(PlaneChanges::SIZE);
}
