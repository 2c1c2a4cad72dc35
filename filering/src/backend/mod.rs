//! Ring primitives: the platform handle to a submission/completion ring.
//!
//! The engine is written once against [`RingBackend`]. [`UringRing`] drives the
//! kernel's `io_uring`; [`EmulatedRing`] is a userspace ring with the same
//! contract, used where `io_uring` is unavailable and to make ring-level edge
//! cases (full queues, completion overflow) reproducible in tests.

use anyhow::Result;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::os::fd::RawFd;

use crate::engine::EngineConfig;
use crate::request::OperationSet;
use crate::utils::WakeSource;

// Exports
mod emulated;
pub use emulated::EmulatedRing;

mod errors;
pub use errors::RingError;

mod uring;
pub use uring::UringRing;

/// How a backend keeps Close/Flush from overtaking earlier submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// The ring itself orders barrier entries after everything submitted
    /// before them.
    Native,

    /// The ring only drains entries already submitted; the engine must also
    /// hold back new entries until an outstanding flush completes.
    Tracked,
}

/// What a backend can do, as reported after initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Submission slots, as granted by the ring (may exceed the request).
    pub sq_entries: u32,

    /// Completion slots, as granted by the ring (may exceed the request).
    pub cq_entries: u32,

    /// Largest byte count a single submission may transfer.
    pub max_transfer_len: usize,

    pub barrier: Barrier,

    /// Operations the backend completes while they are pushed, without a
    /// completion entry.
    pub synchronous: OperationSet,

    /// Operations the backend can execute at all.
    pub supported: OperationSet,
}

/// One operation in backend-neutral form. Pointers reference memory owned by
/// the queued request.
#[derive(Debug, Clone, Copy)]
pub enum SubmissionOp {
    Open {
        path: *const libc::c_char,
        flags: OFlag,
        mode: Mode,
    },
    Close {
        fd: RawFd,
    },
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
    },
    Readv {
        fd: RawFd,
        iovecs: *const libc::iovec,
        count: u32,
        offset: u64,
    },
    Writev {
        fd: RawFd,
        iovecs: *const libc::iovec,
        count: u32,
        offset: u64,
    },
    Fsync {
        fd: RawFd,
    },
    Statx {
        fd: RawFd,
        buf: *mut libc::statx,
    },
    Cancel {
        target: u64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionEntry {
    pub user_data: u64,
    pub op: SubmissionOp,

    /// Must not start before every previously submitted entry has completed.
    pub drain: bool,
}

/// A retired entry: the user data it was submitted with and its result,
/// `-errno` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub user_data: u64,
    pub result: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// The entry occupies a submission slot until the next [`RingBackend::enter`].
    Staged,

    /// The backend executed the entry on the spot; no completion will follow.
    Completed(i32),
}

pub trait RingBackend: Sized {
    fn try_new(cfg: &EngineConfig) -> Result<Self>;

    fn capabilities(&self) -> &Capabilities;

    fn wake(&self) -> &WakeSource;

    /// Writes one entry into the next free submission slot.
    ///
    /// # Safety
    ///
    /// Every pointer in `entry` must stay valid until the entry's completion
    /// has been reaped, or until this call returns for `Pushed::Completed` and
    /// errors.
    unsafe fn push(&mut self, entry: &SubmissionEntry) -> Result<Pushed, RingError>;

    /// Hands up to `to_submit` staged entries to the kernel without waiting.
    /// Returns how many were accepted.
    fn enter(&mut self, to_submit: u32) -> Result<u32, RingError>;

    /// Moves every available completion into `out`, releasing their slots.
    fn reap(&mut self, out: &mut Vec<CompletionEntry>);
}
