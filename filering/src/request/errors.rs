/// The error stored in a request's result slot.
///
/// Every failure is terminal for the request that carries it; the engine
/// never retries on its own.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileError {
    /// Bad path, flags or file handle, or the ring could not be set up.
    #[error("failed to open file or invalid file handle")]
    Open,

    #[error("read failed")]
    Read,

    #[error("write failed")]
    Write,

    /// The request was canceled before it could complete.
    #[error("operation was aborted")]
    Abort,

    /// Submission-layer or platform failure not otherwise classified.
    #[error("unspecified error")]
    Unspecified,

    #[error("permission denied")]
    Permissions,

    /// The engine could not accept the request at this time, e.g. it was
    /// queued from inside a completion callback of the same engine.
    #[error("engine resources unavailable")]
    Resource,
}

impl FileError {
    /// Classifies a negative ring result. Cancellation always wins over the
    /// operation-specific `default`.
    pub(crate) fn from_errno(errno: i32, default: FileError) -> Self {
        match errno {
            libc::ECANCELED => FileError::Abort,
            _ => default,
        }
    }

    /// Stat failures distinguish missing targets from permission problems.
    pub(crate) fn from_stat_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED => FileError::Abort,
            libc::ENOENT | libc::EBADF => FileError::Open,
            libc::EACCES | libc::EPERM => FileError::Permissions,
            _ => FileError::Unspecified,
        }
    }
}
