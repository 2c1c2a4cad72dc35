use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;
use std::slice;

use crate::backend::{Barrier, Pushed, RingBackend, RingError, SubmissionEntry, SubmissionOp};
use crate::engine::Engine;
use crate::queue::{PendingRequest, RequestHandle};
use crate::request::extra::{iovecs_for, MAX_IOVECS};
use crate::request::{Extra, FileError, ReadWriteExtra, Request};
use crate::utils::ScopeGuard;

/// Outcome of preparing the request at the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prepared {
    /// An entry was written into the submission ring.
    Staged,

    /// The request finished without occupying a ring slot.
    Completed,

    /// The request has to wait; later requests wait behind it.
    Defer,

    /// The ring had no free slot.
    QueueFull,
}

enum Encoded {
    Submit { op: SubmissionOp, drain: bool },
    Defer,
    Cancel(RequestHandle),
}

impl<B: RingBackend> Engine<B> {
    /// Walks the queue from the cursor, staging requests while both rings
    /// have room and no flush barrier is outstanding.
    pub(super) fn prepare_requests(&mut self) {
        if self.preparing.get() || self.shutting_down || self.queue.cursor().is_none() {
            return;
        }

        self.preparing.set(true);
        let preparing = Rc::clone(&self.preparing);
        let _guard = ScopeGuard::new(move || preparing.set(false));

        while !self.flush_in_progress
            && !self.queue_was_full
            && self.staged < self.caps.sq_entries
            && self.in_flight < self.caps.cq_entries
        {
            let Some(handle) = self.queue.cursor() else {
                break;
            };

            match self.prepare_request(handle) {
                Prepared::Staged | Prepared::Completed => {}
                Prepared::Defer => {
                    tracing::debug!(?handle, split_operations = self.split_operations, "deferred barrier");
                    break;
                }
                Prepared::QueueFull => {
                    tracing::debug!(?handle, staged = self.staged, "submission ring full");
                    self.queue_was_full = true;
                    break;
                }
            }
        }
    }

    fn prepare_request(&mut self, handle: RequestHandle) -> Prepared {
        let max_len = self.caps.max_transfer_len;
        let pending = self.queue.expect_mut(handle);

        if pending.request.fd().is_some_and(|fd| fd <= 0) {
            tracing::debug!(?handle, fd = pending.request.fd(), "invalid file handle");
            self.finish_with_error(handle, FileError::Open);
            return Prepared::Completed;
        }

        let (op, drain) = match encode(pending, max_len, &mut self.split_operations) {
            Ok(Encoded::Submit { op, drain }) => (op, drain),
            Ok(Encoded::Defer) => return Prepared::Defer,
            Ok(Encoded::Cancel(target)) => match self.queue.get(target) {
                // Already finished, the cancel is a no-op.
                None => {
                    self.finish(handle);
                    return Prepared::Completed;
                }
                Some(target_request) if !target_request.submitted => {
                    tracing::trace!(?target, "aborting unsubmitted request");
                    self.finish_with_error(target, FileError::Abort);
                    self.finish(handle);
                    return Prepared::Completed;
                }
                Some(_) => (
                    SubmissionOp::Cancel {
                        target: target.user_data(),
                    },
                    false,
                ),
            },
            Err(error) => {
                self.finish_with_error(handle, error);
                return Prepared::Completed;
            }
        };

        let entry = SubmissionEntry {
            user_data: handle.user_data(),
            op,
            drain,
        };

        // SAFETY: every pointer in `op` targets the request's own buffers or
        // its boxed extra state. Both stay where they are until the request
        // leaves the queue, which never happens while the ring owns an entry
        // for it.
        match unsafe { self.backend.push(&entry) } {
            Ok(Pushed::Staged) => {
                let pending = self.queue.expect_mut(handle);
                pending.submitted = true;

                if matches!(pending.request, Request::Flush(_)) && self.caps.barrier == Barrier::Tracked {
                    self.flush_in_progress = true;
                }

                self.queue.advance_cursor();
                self.staged += 1;
                self.in_flight += 1;

                tracing::trace!(?handle, ?op, drain, "staged entry");
                Prepared::Staged
            }
            Ok(Pushed::Completed(result)) => {
                tracing::trace!(?handle, result, "completed at push");
                self.complete_request(handle, result);
                Prepared::Completed
            }
            Err(RingError::QueueFull) => Prepared::QueueFull,
            Err(e) => {
                tracing::warn!(error = %e, ?handle, "failed to push entry");
                self.finish_with_error(handle, FileError::Unspecified);
                Prepared::Completed
            }
        }
    }
}

/// Translates a request into its next ring entry, attaching continuation
/// state the first time a transfer does not fit in one entry.
fn encode(
    pending: &mut PendingRequest,
    max_len: usize,
    split_operations: &mut usize,
) -> Result<Encoded, FileError> {
    let PendingRequest { request, extra, .. } = pending;

    let op = match request {
        Request::Open(req) => {
            let path = CString::new(req.path.as_os_str().as_bytes()).map_err(|_| FileError::Open)?;
            let path_ptr = path.as_ptr();
            *extra = Some(Extra::Path(path));

            SubmissionOp::Open {
                path: path_ptr,
                flags: req.mode.to_oflag(),
                mode: crate::request::OpenMode::create_mode(),
            }
        }
        Request::Close(req) => {
            if *split_operations > 0 {
                return Ok(Encoded::Defer);
            }
            return Ok(Encoded::Submit {
                op: SubmissionOp::Close { fd: req.fd },
                drain: true,
            });
        }
        Request::Flush(req) => {
            if *split_operations > 0 {
                return Ok(Encoded::Defer);
            }
            return Ok(Encoded::Submit {
                op: SubmissionOp::Fsync { fd: req.fd },
                drain: true,
            });
        }
        Request::Read(req) => {
            if req.destination.len() > max_len {
                ensure_split(extra, slice::from_ref(&req.destination), split_operations);
            }

            let (skip, done) = split_position(extra);
            let rest = &mut req.destination[skip..];
            SubmissionOp::Read {
                fd: req.fd,
                buf: rest.as_mut_ptr(),
                len: rest.len().min(max_len) as u32,
                offset: req.offset + done,
            }
        }
        Request::Write(req) => {
            if req.source.len() > max_len {
                ensure_split(extra, slice::from_ref(&req.source), split_operations);
            }

            let (skip, done) = split_position(extra);
            let rest = &req.source[skip..];
            SubmissionOp::Write {
                fd: req.fd,
                buf: rest.as_ptr(),
                len: rest.len().min(max_len) as u32,
                offset: req.offset + done,
            }
        }
        Request::VectoredRead(req) => {
            let (iovecs, count, offset) =
                encode_vectored(extra, &mut req.destinations, req.offset, max_len, split_operations);
            SubmissionOp::Readv {
                fd: req.fd,
                iovecs,
                count,
                offset,
            }
        }
        Request::VectoredWrite(req) => {
            let (iovecs, count, offset) =
                encode_vectored(extra, &mut req.sources, req.offset, max_len, split_operations);
            SubmissionOp::Writev {
                fd: req.fd,
                iovecs,
                count,
                offset,
            }
        }
        Request::Stat(req) => {
            let Extra::Stat(buf) = extra.insert(Extra::new_stat()) else {
                unreachable!("stat buffer was just inserted");
            };
            SubmissionOp::Statx {
                fd: req.fd,
                buf: &mut **buf,
            }
        }
        Request::Cancel(req) => return Ok(Encoded::Cancel(req.handle)),
    };

    Ok(Encoded::Submit { op, drain: false })
}

fn ensure_split(extra: &mut Option<Extra>, spans: &[Vec<u8>], split_operations: &mut usize) {
    if extra.as_ref().is_some_and(Extra::is_split) {
        return;
    }

    tracing::debug!(spans = spans.len(), "splitting transfer");
    *extra = Some(Extra::Split(Box::new(ReadWriteExtra::new(spans))));
    *split_operations += 1;
}

/// Offset into the current span and bytes moved so far.
fn split_position(extra: &Option<Extra>) -> (usize, u64) {
    match extra {
        Some(Extra::Split(state)) => (state.span_offset, state.total_processed),
        _ => (0, 0),
    }
}

fn encode_vectored(
    extra: &mut Option<Extra>,
    spans: &mut [Vec<u8>],
    offset: u64,
    max_len: usize,
    split_operations: &mut usize,
) -> (*const libc::iovec, u32, u64) {
    let total: usize = spans.iter().map(Vec::len).sum();
    if total > max_len || spans.len() > MAX_IOVECS {
        ensure_split(extra, spans, split_operations);
    }

    if let Some(Extra::Split(state)) = extra {
        let offset = offset + state.total_processed;
        let iovecs = state.next_iovecs(spans, max_len);
        return (iovecs.as_ptr(), iovecs.len() as u32, offset);
    }

    let iovecs = Box::new(iovecs_for(spans));
    let (ptr, count) = (iovecs.as_ptr(), iovecs.len() as u32);
    *extra = Some(Extra::Iovecs(iovecs));

    (ptr, count, offset)
}
