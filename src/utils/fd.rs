use std::{
    fs::{self, OpenOptions},
    io,
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use rustix::fs::{fstat, FileType};

/// Ref-counted file descriptor of an open device node
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl DeviceFd {
    /// Opens the device node at `path` for reading and writing.
    ///
    /// The descriptor is opened non-blocking, so reads of the DRM event queue return
    /// `EAGAIN` instead of stalling when no event is pending.
    pub fn open(path: impl AsRef<Path>) -> io::Result<DeviceFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)?;
        Ok(DeviceFd::from(OwnedFd::from(file)))
    }

    /// Path the descriptor was opened from, as reported by procfs
    pub fn path(&self) -> Option<PathBuf> {
        fs::read_link(format!("/proc/self/fd/{}", self.0.as_raw_fd())).ok()
    }

    /// Minor number of the node, `None` unless it is a character device
    pub fn minor(&self) -> Option<u32> {
        let stat = fstat(self).ok()?;
        (FileType::from_raw_mode(stat.st_mode) == FileType::CharacterDevice).then(|| rustix::fs::minor(stat.st_rdev))
    }
}

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<OwnedFd> for DeviceFd {
    fn from(fd: OwnedFd) -> Self {
        DeviceFd(Arc::new(fd))
    }
}
