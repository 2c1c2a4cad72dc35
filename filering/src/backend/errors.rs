use io_uring::squeue::PushError;
use nix::errno::Errno;
use std::io;

/// Ring-level failures. These describe the state of the ring itself, not of a
/// request: a full submission ring defers work, it never fails it.
#[derive(thiserror::Error, Debug)]
pub enum RingError {
    /// Every submission slot holds an entry the kernel has not consumed yet.
    #[error("Submission ring is full, cannot stage entry")]
    QueueFull,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RingError::QueueFull => true,
            RingError::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EBUSY | libc::EINTR)),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RingError::Io(e) => e.raw_os_error(),
            RingError::QueueFull => None,
        }
    }
}

impl From<PushError> for RingError {
    fn from(_: PushError) -> Self {
        RingError::QueueFull
    }
}

impl From<Errno> for RingError {
    fn from(errno: Errno) -> Self {
        RingError::Io(errno.into())
    }
}

impl PartialEq for RingError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::QueueFull, Self::QueueFull) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind() && a.raw_os_error() == b.raw_os_error(),
            _ => false,
        }
    }
}

impl From<RingError> for io::Error {
    fn from(e: RingError) -> Self {
        match e {
            RingError::Io(io_err) => io_err,
            _ => io::Error::other(e.to_string()),
        }
    }
}
