use std::time::{Duration, Instant};

/// Point in time after which a blocking wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Never expires.
    Forever,

    /// Expires at the given instant.
    At(Instant),
}

impl Deadline {
    /// A deadline that has already expired, turning waits into a single
    /// non-blocking check.
    pub fn now() -> Self {
        Deadline::At(Instant::now())
    }

    pub fn has_expired(&self) -> bool {
        match self {
            Deadline::Forever => false,
            Deadline::At(at) => Instant::now() >= *at,
        }
    }

    /// Time left before expiry, `None` for [`Deadline::Forever`].
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Forever => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => Deadline::At(at),
            None => Deadline::Forever,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}
