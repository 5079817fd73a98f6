//! Access to the debugfs directory of a DRM device
//!
//! Drivers expose diagnostics (and the CRC interface used by [`crate::crc`]) below
//! `<debugfs>/dri/<minor>`. The mount point is searched at `/debug` and
//! `/sys/kernel/debug`, or taken from the `KMSPROBE_DEBUGFS` environment variable.
//! debugfs is never mounted on the caller's behalf.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::{kms::KmsDevice, ErrorKind};

/// Mount points searched for debugfs, in order
pub const MOUNT_POINTS: &[&str] = &["/debug", "/sys/kernel/debug"];

/// Errors of the debugfs helpers
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No mounted debugfs with a `dri` directory was found
    #[error("debugfs is not mounted")]
    NotMounted,
    /// The device is not a character device node, so its minor is unknown
    #[error("Unable to determine the minor number of the device")]
    UnknownMinor,
    /// The debugfs directory of the device does not exist
    #[error("No debugfs directory at {0}")]
    NoDeviceDirectory(PathBuf),
    /// Accessing a debugfs file failed
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File that was accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Classifies the error
    ///
    /// A missing debugfs means the test cannot run here, any other I/O failure is fatal.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotMounted | Error::UnknownMinor | Error::NoDeviceDirectory(_) => ErrorKind::Capability,
            Error::Io { source, .. } => crate::kms::error_kind_of_io(source),
        }
    }

    /// Raw OS error code, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Locates the debugfs mount point
pub fn mount_point() -> Result<PathBuf, Error> {
    if let Some(path) = std::env::var_os("KMSPROBE_DEBUGFS") {
        return Ok(PathBuf::from(path));
    }
    MOUNT_POINTS
        .iter()
        .map(PathBuf::from)
        .find(|root| root.join("dri").is_dir())
        .ok_or(Error::NotMounted)
}

/// The debugfs directory of one DRM device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugFs {
    dir: PathBuf,
}

impl DebugFs {
    /// Directory of the device with the given minor number
    pub fn for_minor(minor: u32) -> Result<DebugFs, Error> {
        let dir = mount_point()?.join("dri").join(minor.to_string());
        DebugFs::at(dir)
    }

    /// Directory of an open device
    pub fn for_device(dev: &dyn KmsDevice) -> Result<DebugFs, Error> {
        let minor = dev.minor().ok_or(Error::UnknownMinor)?;
        DebugFs::for_minor(minor)
    }

    /// Uses `dir` as the device directory
    pub fn at(dir: impl Into<PathBuf>) -> Result<DebugFs, Error> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::NoDeviceDirectory(dir));
        }
        debug!(dir = %dir.display(), "using debugfs directory");
        Ok(DebugFs { dir })
    }

    /// The device directory
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Whether `name` exists below the device directory
    pub fn exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    fn io_error(&self, name: &str) -> impl FnOnce(io::Error) -> Error {
        let path = self.dir.join(name);
        move |source| Error::Io { path, source }
    }

    /// Opens a file for reading, optionally without blocking
    pub fn open_read(&self, name: &str, nonblock: bool) -> Result<File, Error> {
        let flags = if nonblock { libc::O_NONBLOCK } else { 0 };
        trace!(name, nonblock, "opening debugfs file");
        OpenOptions::new()
            .read(true)
            .custom_flags(flags | libc::O_CLOEXEC)
            .open(self.dir.join(name))
            .map_err(self.io_error(name))
    }

    /// Opens a file for writing
    pub fn open_write(&self, name: &str) -> Result<File, Error> {
        trace!(name, "opening debugfs file for writing");
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(self.dir.join(name))
            .map_err(self.io_error(name))
    }

    /// Opens a file for reading and writing
    pub fn open_rw(&self, name: &str) -> Result<File, Error> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(self.dir.join(name))
            .map_err(self.io_error(name))
    }

    /// Reads a whole file
    pub fn read(&self, name: &str) -> Result<String, Error> {
        let mut contents = String::new();
        self.open_read(name, false)?
            .read_to_string(&mut contents)
            .map_err(self.io_error(name))?;
        Ok(contents)
    }

    /// Whether any line of `name` contains `substring`
    pub fn search(&self, name: &str, substring: &str) -> Result<bool, Error> {
        let reader = BufReader::new(self.open_read(name, false)?);
        for line in reader.lines() {
            if line.map_err(self.io_error(name))?.contains(substring) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Logs the contents of `name` at debug level
    pub fn dump(&self, name: &str) -> Result<(), Error> {
        let contents = self.read(name)?;
        debug!("{}:\n{}", name, contents);
        Ok(())
    }

    /// Names of the entries of the device directory
    pub fn entries(&self) -> Result<Vec<String>, Error> {
        let mut names = fs::read_dir(&self.dir)
            .map_err(self.io_error(""))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::{DebugFs, Error};
    use crate::ErrorKind;
    use std::fs;

    #[test]
    fn missing_directory_is_a_capability_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = DebugFs::at(tmp.path().join("dri/7")).unwrap_err();
        assert!(matches!(err, Error::NoDeviceDirectory(_)));
        assert_eq!(err.kind(), ErrorKind::Capability);
    }

    #[test]
    fn read_and_search() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("i915_capabilities"), "gen: 9\nhas_fbc: yes\n").unwrap();
        let debugfs = DebugFs::at(tmp.path()).unwrap();

        assert!(debugfs.exists("i915_capabilities"));
        assert_eq!(debugfs.read("i915_capabilities").unwrap().lines().count(), 2);
        assert!(debugfs.search("i915_capabilities", "has_fbc").unwrap());
        assert!(!debugfs.search("i915_capabilities", "has_psr").unwrap());
        assert!(debugfs.dump("i915_capabilities").is_ok());

        let err = debugfs.read("nope").unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(err.kind(), ErrorKind::Capability);
    }

    #[test]
    fn lists_entries() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("crtc-1/crc")).unwrap();
        fs::create_dir_all(tmp.path().join("crtc-0/crc")).unwrap();
        fs::write(tmp.path().join("name"), "vkms").unwrap();
        let debugfs = DebugFs::at(tmp.path()).unwrap();
        assert_eq!(debugfs.entries().unwrap(), vec!["crtc-0", "crtc-1", "name"]);
    }
}
