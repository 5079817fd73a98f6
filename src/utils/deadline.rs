use std::time::{Duration, Instant};

/// A monotonic point in time after which a blocking operation is abandoned
///
/// Blocking helpers check the deadline cooperatively before each wait and bound every
/// wait by [`Deadline::remaining`], so a stuck operation surfaces as [`Expired`] instead of
/// hanging the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    what: &'static str,
}

impl Deadline {
    /// Creates a deadline `timeout` from now, labelled with the guarded operation.
    pub fn after(timeout: Duration, what: &'static str) -> Deadline {
        Deadline {
            at: Instant::now() + timeout,
            what,
        }
    }

    /// Time left until expiry, or `Err` once the deadline passed.
    pub fn remaining(&self) -> Result<Duration, Expired> {
        let now = Instant::now();
        if now >= self.at {
            Err(Expired(self.what))
        } else {
            Ok(self.at - now)
        }
    }

    /// Label of the guarded operation
    pub fn what(&self) -> &'static str {
        self.what
    }
}

/// A [`Deadline`] expired
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timed out waiting for {0}")]
pub struct Expired(pub &'static str);

#[cfg(test)]
mod tests {
    use super::{Deadline, Expired};
    use std::time::Duration;

    #[test]
    fn expires() {
        let deadline = Deadline::after(Duration::ZERO, "nothing");
        assert_eq!(deadline.remaining(), Err(Expired("nothing")));

        let deadline = Deadline::after(Duration::from_secs(60), "a minute");
        assert!(deadline.remaining().unwrap() > Duration::from_secs(30));
        assert_eq!(deadline.what(), "a minute");
        assert_eq!(Expired("vblank").to_string(), "timed out waiting for vblank");
    }
}
