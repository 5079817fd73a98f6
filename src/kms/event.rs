//! Completion events read from the device
//!
//! Page flips and vblank requests with the event flag set are answered asynchronously
//! through the device file descriptor. Each record starts with a header carrying its type
//! and length; [`read_event`] reads exactly one record at a time.

use std::time::Duration;

use tracing::trace;

use super::{
    device::KmsDevice,
    error::{kind_of_io, Error, ErrorKind},
};
use crate::utils::Deadline;

/// Event type of a vblank event
pub const DRM_EVENT_VBLANK: u32 = 1;
/// Event type of a page flip completion
pub const DRM_EVENT_FLIP_COMPLETE: u32 = 2;
/// Event type of a crtc sequence event
pub const DRM_EVENT_CRTC_SEQUENCE: u32 = 3;

const HEADER_SIZE: usize = 8;
/// Size of the largest event record
pub const EVENT_SIZE: usize = 32;

/// Payload of vblank and flip completion events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VblankEvent {
    /// User data passed with the request
    pub user_data: u64,
    /// Seconds part of the vblank timestamp
    pub tv_sec: u32,
    /// Microseconds part of the vblank timestamp
    pub tv_usec: u32,
    /// Vblank sequence the event completed at
    pub sequence: u32,
    /// Crtc the event belongs to, 0 on old kernels
    pub crtc_id: u32,
}

impl VblankEvent {
    /// Timestamp of the vblank
    pub fn time(&self) -> Duration {
        Duration::new(self.tv_sec as u64, self.tv_usec.saturating_mul(1000))
    }

    /// Serializes the event into a record of type `event_type`
    pub fn to_bytes(&self, event_type: u32) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        buf[0..4].copy_from_slice(&event_type.to_ne_bytes());
        buf[4..8].copy_from_slice(&(EVENT_SIZE as u32).to_ne_bytes());
        buf[8..16].copy_from_slice(&self.user_data.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.tv_sec.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.tv_usec.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.sequence.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.crtc_id.to_ne_bytes());
        buf
    }
}

/// An event read from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrmEvent {
    /// A vblank requested with the event flag happened
    Vblank(VblankEvent),
    /// A page flip or atomic commit completed
    FlipComplete(VblankEvent),
    /// A crtc sequence event
    CrtcSequence {
        /// User data passed with the request
        user_data: u64,
        /// Timestamp in nanoseconds
        time_ns: i64,
        /// 64 bit vblank sequence
        sequence: u64,
    },
    /// Unknown event type, raw record provided
    Unknown(u32, Vec<u8>),
}

impl DrmEvent {
    /// Type field of the record the event was parsed from
    pub fn event_type(&self) -> u32 {
        match self {
            DrmEvent::Vblank(_) => DRM_EVENT_VBLANK,
            DrmEvent::FlipComplete(_) => DRM_EVENT_FLIP_COMPLETE,
            DrmEvent::CrtcSequence { .. } => DRM_EVENT_CRTC_SEQUENCE,
            DrmEvent::Unknown(kind, _) => *kind,
        }
    }
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

/// Parses a single event record
///
/// Trailing bytes after the first record are ignored.
pub fn parse_event(buf: &[u8]) -> Result<DrmEvent, Error> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::TruncatedEvent(buf.len()));
    }
    let event_type = u32_at(buf, 0);
    let length = u32_at(buf, 4) as usize;
    if length < HEADER_SIZE || buf.len() < length {
        return Err(Error::TruncatedEvent(buf.len()));
    }
    let record = &buf[..length];

    match event_type {
        DRM_EVENT_VBLANK | DRM_EVENT_FLIP_COMPLETE => {
            if length < EVENT_SIZE {
                return Err(Error::TruncatedEvent(length));
            }
            let event = VblankEvent {
                user_data: u64_at(record, 8),
                tv_sec: u32_at(record, 16),
                tv_usec: u32_at(record, 20),
                sequence: u32_at(record, 24),
                crtc_id: u32_at(record, 28),
            };
            Ok(if event_type == DRM_EVENT_VBLANK {
                DrmEvent::Vblank(event)
            } else {
                DrmEvent::FlipComplete(event)
            })
        }
        DRM_EVENT_CRTC_SEQUENCE => {
            if length < EVENT_SIZE {
                return Err(Error::TruncatedEvent(length));
            }
            Ok(DrmEvent::CrtcSequence {
                user_data: u64_at(record, 8),
                time_ns: u64_at(record, 16) as i64,
                sequence: u64_at(record, 24),
            })
        }
        other => Ok(DrmEvent::Unknown(other, record.to_vec())),
    }
}

/// Reads the next event, waiting until `deadline`
///
/// Interrupted and would-block reads are retried until the deadline expires.
pub fn read_event(dev: &dyn KmsDevice, deadline: &Deadline) -> Result<DrmEvent, Error> {
    loop {
        let remaining = deadline.remaining()?;
        match dev.poll_events(remaining) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) if kind_of_io(&err) == ErrorKind::Transient => continue,
            Err(source) => {
                return Err(Error::Access {
                    errmsg: "Failed to poll for events",
                    dev: dev.dev_path(),
                    source,
                })
            }
        }

        let mut buf = [0u8; EVENT_SIZE];
        match dev.read_events(&mut buf) {
            Ok(len) => {
                let event = parse_event(&buf[..len])?;
                trace!(?event, "read event");
                return Ok(event);
            }
            Err(err) if kind_of_io(&err) == ErrorKind::Transient => continue,
            Err(source) => {
                return Err(Error::Access {
                    errmsg: "Failed to read event",
                    dev: dev.dev_path(),
                    source,
                })
            }
        }
    }
}

/// Reads the next event and checks it is a flip completion
pub fn read_flip_event(dev: &dyn KmsDevice, timeout: Duration) -> Result<VblankEvent, Error> {
    let deadline = Deadline::after(timeout, "page flip event");
    match read_event(dev, &deadline)? {
        DrmEvent::FlipComplete(event) => Ok(event),
        other => Err(Error::UnexpectedEvent(other.event_type())),
    }
}
