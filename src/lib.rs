#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # kmsprobe: a validation toolkit for KMS display drivers
//!
//! This crate models the display hardware exposed by a DRM device (pipes, the planes
//! attached to them and the outputs driving them) and commits changes of that model to the
//! driver, either through the legacy one-ioctl-per-resource interface or through a single
//! atomic transaction.
//!
//! ## Structure of the crate
//!
//! - [`kms`] contains the display model ([`kms::Display`]), its change tracking, both
//!   commit protocols and helpers to synchronize with vertical blanks and flip events.
//! - [`crc`] captures per-frame pipe checksums through debugfs, which is the only way to
//!   verify what the hardware actually scanned out.
//! - [`debugfs`] locates and accesses the debugfs directory of a DRM device.
//!
//! All hardware access goes through the [`kms::KmsDevice`] trait. [`kms::DrmDeviceFd`]
//! implements it for an open DRM node; with the `test_device` feature a simulated device
//! ([`kms::MockDevice`]) is available as well.
//!
//! ### Logging
//!
//! kmsprobe makes extensive use of [`tracing`] for its internal logging. Commits run inside
//! a `commit` span and every programmed property is reported at `trace` level, so that a
//! failing test can show exactly which values reached the driver.
//!
//! ### Configuration
//!
//! Two environment variables influence the library:
//!
//! - `KMSPROBE_USE_LEGACY`: when set, [`kms::Display`] does not negotiate atomic modesetting
//!   even if the driver supports it.
//! - `KMSPROBE_DEBUGFS`: overrides the debugfs mount point used by [`debugfs::DebugFs`].

pub mod crc;
pub mod debugfs;
pub mod kms;
pub mod utils;

pub use kms::ErrorKind;
