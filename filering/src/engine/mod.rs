//! The per-thread ring engine.
//!
//! An [`Engine`] owns the pending queue and one ring backend. Requests move
//! through `Queued -> Staged -> InFlight -> Finished`, with split transfers
//! looping back from `InFlight` to `Queued` until every chunk has been
//! moved. Everything happens on the owning thread, synchronously inside
//! [`Engine::queue_request`], [`Engine::submit_requests`] and completion
//! draining.

use std::cell::Cell;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{
    Capabilities, CompletionEntry, Pushed, RingBackend, RingError, SubmissionEntry, SubmissionOp,
    UringRing,
};
use crate::queue::{PendingQueue, PendingRequest, RequestHandle};
use crate::request::{FileError, Operation, Request};
use crate::utils::Deadline;

// Exports
mod builder;
pub use builder::{Builder, EngineConfig};

mod complete;

mod shared;
pub use shared::{
    queue_request, submit_requests, supports_operation, wait_for_request, with_shared_instance,
};

mod submit;


/// How long dropping an engine waits for the kernel to give back requests it
/// still owns.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot of the engine's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Entries pushed into the ring and not yet retired through a completion.
    /// Never exceeds `cq_entries`.
    pub in_flight: u32,

    /// Entries pushed into the ring but not yet handed to the kernel. Never
    /// exceeds `sq_entries`.
    pub staged: u32,

    /// Requests currently carrying split-continuation state.
    pub split_operations: usize,

    /// Requests queued and not yet finished.
    pub pending: usize,

    pub sq_entries: u32,
    pub cq_entries: u32,
}

/// Multiplexes file requests onto a ring.
///
/// An engine is bound to the thread that created it and is neither `Send`
/// nor `Sync`. Completion callbacks run synchronously inside engine calls
/// and cannot call back into the same engine.
pub struct Engine<B: RingBackend = UringRing> {
    queue: PendingQueue,
    backend: B,

    /// Adopted from the backend after initialisation; the ring may have
    /// rounded the requested sizes up.
    caps: Capabilities,

    in_flight: u32,
    staged: u32,
    split_operations: usize,

    /// A flush is in the ring and the backend cannot order later entries
    /// behind it on its own.
    flush_in_progress: bool,

    /// Staged entries are waiting for the next return to the event loop.
    stage_pending: bool,

    /// The ring refused the last push. Cleared by a successful enter or a
    /// completion drain.
    queue_was_full: bool,

    shutting_down: bool,

    /// Set for the duration of a submission pass. Shared with the guard that
    /// resets it.
    preparing: Rc<Cell<bool>>,

    /// Scratch buffer reused across completion drains.
    completions: Vec<CompletionEntry>,
}

impl<B: RingBackend> Engine<B> {
    pub(crate) fn new(backend: B) -> Self {
        let caps = *backend.capabilities();

        Self {
            queue: PendingQueue::with_capacity(caps.cq_entries as usize),
            backend,
            caps,
            in_flight: 0,
            staged: 0,
            split_operations: 0,
            flush_in_progress: false,
            stage_pending: false,
            queue_was_full: false,
            shutting_down: false,
            preparing: Rc::new(Cell::new(false)),
            completions: Vec::with_capacity(caps.cq_entries as usize),
        }
    }

    /// Accepts a request and tries to stage it right away.
    ///
    /// Returns [`RequestHandle::INVALID`] when the request already finished
    /// synchronously (its callback has run), otherwise a handle usable with
    /// [`Engine::wait_for_request`] and [`CancelRequest`].
    ///
    /// Staged entries reach the kernel immediately only when the submission
    /// ring is full; otherwise the push is deferred to the next
    /// [`Engine::process_events`] or [`Engine::submit_requests`].
    ///
    /// [`CancelRequest`]: crate::CancelRequest
    pub fn queue_request(&mut self, request: impl Into<Request>) -> RequestHandle {
        let request = request.into();
        let op = request.operation();

        if self.shutting_down || self.preparing.get() {
            tracing::debug!(?op, "engine busy, rejecting request");
            request.finish_with_error(FileError::Resource);
            return RequestHandle::INVALID;
        }

        if !self.caps.supported.has(op) {
            tracing::debug!(?op, "operation not supported by ring backend");
            request.finish_with_error(FileError::Unspecified);
            return RequestHandle::INVALID;
        }

        let handle = self.queue.push_back(PendingRequest::new(request));
        tracing::trace!(?handle, ?op, "queued request");

        // Cancels race ahead of everything not yet submitted.
        if op == Operation::Cancel {
            self.queue.move_before_cursor(handle);
        }

        self.prepare_requests();

        if self.staged == self.caps.sq_entries && self.in_flight <= self.caps.cq_entries {
            self.submit_requests();
        } else if !self.stage_pending && self.staged > 0 {
            self.stage_pending = true;
        }

        if self.queue.contains(handle) {
            handle
        } else {
            RequestHandle::INVALID
        }
    }

    /// Pushes every staged entry to the kernel, then stages whatever fits in
    /// the freed window and pushes once more.
    pub fn submit_requests(&mut self) {
        self.stage_pending = false;

        if self.staged == 0 {
            return;
        }

        if self.submit_to_ring() {
            self.prepare_requests();
            if self.staged > 0 {
                self.submit_to_ring();
            }
        }

        if self.staged > 0 {
            self.stage_pending = true;
        }
    }

    /// Blocks the calling thread until `handle` has finished or `deadline`
    /// expires. Returns `true` if the request is no longer pending.
    ///
    /// Drains completions itself, so it works without an event loop.
    pub fn wait_for_request(&mut self, handle: RequestHandle, deadline: impl Into<Deadline>) -> bool {
        if !self.queue.contains(handle) {
            return true;
        }

        let deadline = deadline.into();

        if self.staged > 0 {
            self.submit_requests();
        }
        self.completion_ready();

        loop {
            if !self.queue.contains(handle) {
                return true;
            }

            if self.in_flight == 0 {
                // Nothing in the ring will wake us; give the queue one more
                // chance to make progress.
                self.prepare_requests();
                if self.staged > 0 {
                    self.submit_requests();
                }
                self.completion_ready();

                if !self.queue.contains(handle) {
                    return true;
                }
                if self.in_flight == 0 {
                    tracing::warn!(?handle, "request cannot make progress");
                    return false;
                }
            }

            match self.backend.wake().wait(deadline) {
                Ok(true) => {}
                Ok(false) => return !self.queue.contains(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait on wake source");
                    return !self.queue.contains(handle);
                }
            }

            self.completion_ready();
            if self.staged > 0 {
                self.submit_requests();
            }
        }
    }

    /// Event-loop hook: runs a deferred submission, then drains completions.
    /// Call it when [`Engine::wake_fd`] becomes readable, and before blocking
    /// whenever [`Engine::has_deferred_submit`] is set.
    pub fn process_events(&mut self) {
        if self.stage_pending {
            self.submit_requests();
        }
        self.completion_ready();
    }

    pub fn has_deferred_submit(&self) -> bool {
        self.stage_pending
    }

    /// Descriptor that becomes readable when completions are ready.
    pub fn wake_fd(&self) -> RawFd {
        self.backend.wake().as_raw_fd()
    }

    pub fn supports_operation(&self, op: Operation) -> bool {
        self.caps.supported.has(op)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn is_pending(&self, handle: RequestHandle) -> bool {
        self.queue.contains(handle)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            in_flight: self.in_flight,
            staged: self.staged,
            split_operations: self.split_operations,
            pending: self.queue.len(),
            sq_entries: self.caps.sq_entries,
            cq_entries: self.caps.cq_entries,
        }
    }

    /// Hands every staged entry to the kernel. Returns `false` if the ring
    /// refused.
    fn submit_to_ring(&mut self) -> bool {
        match self.backend.enter(self.staged) {
            Ok(submitted) => {
                tracing::debug!(submitted, staged = self.staged, "submitted to ring");
                self.staged -= submitted.min(self.staged);
                self.queue_was_full = false;
                true
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::debug!(error = %e, staged = self.staged, "ring busy, submission deferred");
                } else {
                    tracing::warn!(error = %e, staged = self.staged, "failed to submit to ring");
                }
                false
            }
        }
    }

    /// Asks the ring to cancel every submitted request. Cancel entries carry
    /// no handle, their completions are discarded. Each cancel waits for a
    /// free completion slot, so `in_flight` stays within `cq_entries`.
    fn cancel_submitted(&mut self, deadline: Deadline) {
        for handle in self.queue.handles() {
            if !self.queue.get(handle).is_some_and(|p| p.submitted) {
                continue;
            }

            if !self.reserve_completion_slot(deadline) {
                tracing::warn!(in_flight = self.in_flight, "no completion slot left for shutdown cancels");
                break;
            }

            // The target may have completed while we waited.
            if !self.queue.get(handle).is_some_and(|p| p.submitted) {
                continue;
            }

            let entry = SubmissionEntry {
                user_data: RequestHandle::INVALID.user_data(),
                op: SubmissionOp::Cancel {
                    target: handle.user_data(),
                },
                drain: false,
            };

            loop {
                // SAFETY: cancel entries reference no memory.
                match unsafe { self.backend.push(&entry) } {
                    Ok(Pushed::Staged) => {
                        self.staged += 1;
                        self.in_flight += 1;
                        break;
                    }
                    Ok(Pushed::Completed(_)) => break,
                    Err(RingError::QueueFull) if self.staged > 0 => {
                        if !self.submit_to_ring() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, ?handle, "failed to cancel request on shutdown");
                        break;
                    }
                }
            }
        }

        if self.staged > 0 {
            self.submit_to_ring();
        }
    }

    /// Retires completions until the completion ring has room for one more
    /// entry. Returns `false` if `deadline` passed first.
    fn reserve_completion_slot(&mut self, deadline: Deadline) -> bool {
        while self.in_flight >= self.caps.cq_entries {
            if self.staged > 0 && !self.submit_to_ring() {
                return false;
            }

            match self.backend.wake().wait(deadline) {
                Ok(true) => self.completion_ready(),
                Ok(false) => return false,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait on wake source");
                    return false;
                }
            }
        }

        true
    }
}

impl<B: RingBackend> AsRawFd for Engine<B> {
    fn as_raw_fd(&self) -> RawFd {
        self.wake_fd()
    }
}

impl<B: RingBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.shutting_down = true;

        if self.staged > 0 {
            self.submit_to_ring();
        }
        let deadline = Deadline::from(SHUTDOWN_TIMEOUT);
        self.cancel_submitted(deadline);

        while self.in_flight > 0 {
            match self.backend.wake().wait(deadline) {
                Ok(true) => self.completion_ready(),
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait on wake source during shutdown");
                    break;
                }
            }
        }

        let mut leaked = 0;
        for handle in self.queue.handles() {
            let Some(pending) = self.take(handle) else {
                continue;
            };

            if pending.submitted {
                // The kernel may still write into these buffers.
                mem::forget(pending);
                leaked += 1;
            } else {
                pending.request.finish_with_error(FileError::Abort);
            }
        }

        if leaked > 0 {
            tracing::warn!(leaked, "engine dropped with requests still owned by the kernel");
        }
    }
}
