use std::mem;
use std::slice;

use crate::backend::{CompletionEntry, RingBackend};
use crate::engine::Engine;
use crate::queue::{PendingRequest, RequestHandle};
use crate::request::{Extra, FileError, Progress, Request, RequestResult};

impl<B: RingBackend> Engine<B> {
    /// Drains every available completion, then refills the ring.
    pub(super) fn completion_ready(&mut self) {
        self.backend.wake().drain();

        let mut completions = mem::take(&mut self.completions);
        self.backend.reap(&mut completions);

        if completions.is_empty() {
            self.completions = completions;
            return;
        }

        self.queue_was_full = false;

        for cqe in completions.drain(..) {
            debug_assert!(self.in_flight > 0, "completion without an entry in flight");
            self.in_flight = self.in_flight.saturating_sub(1);
            self.dispatch(cqe);
        }
        self.completions = completions;

        self.prepare_requests();
        if !self.stage_pending && self.staged > 0 {
            self.submit_requests();
        }
    }

    fn dispatch(&mut self, cqe: CompletionEntry) {
        let handle = RequestHandle::from_user_data(cqe.user_data);

        // Shutdown cancels carry no handle.
        if !handle.is_valid() {
            return;
        }

        if !self.queue.get(handle).is_some_and(|p| p.submitted) {
            tracing::warn!(?handle, result = cqe.result, "stale completion");
            return;
        }

        tracing::trace!(?handle, result = cqe.result, "completion");
        self.complete_request(handle, cqe.result);
    }

    /// Resolves one ring result for `handle`: either finishes the request or
    /// puts it back in front of the cursor for its next chunk.
    pub(super) fn complete_request(&mut self, handle: RequestHandle, result: i32) {
        let pending = self.queue.expect_mut(handle);
        pending.submitted = false;

        if matches!(pending.request, Request::Flush(_)) {
            self.flush_in_progress = false;
        }

        match apply_result(pending, result) {
            Progress::Finished => self.finish(handle),
            Progress::MoreToDo => {
                tracing::debug!(?handle, processed = result, "continuing split transfer");
                self.queue.move_before_cursor(handle);
            }
        }
    }

    /// Removes the request and hands it to its callback.
    pub(super) fn finish(&mut self, handle: RequestHandle) {
        if let Some(pending) = self.take(handle) {
            pending.request.invoke_callback();
        }
    }

    pub(super) fn finish_with_error(&mut self, handle: RequestHandle, error: FileError) {
        if let Some(pending) = self.take(handle) {
            tracing::trace!(?handle, %error, "request failed");
            pending.request.finish_with_error(error);
        }
    }

    pub(super) fn take(&mut self, handle: RequestHandle) -> Option<PendingRequest> {
        let pending = self.queue.remove(handle)?;
        if pending.is_split() {
            self.split_operations -= 1;
        }
        Some(pending)
    }
}

fn apply_result(pending: &mut PendingRequest, result: i32) -> Progress {
    let PendingRequest { request, extra, .. } = pending;

    match request {
        Request::Open(req) => {
            req.result = Some(if result < 0 {
                Err(FileError::from_errno(-result, FileError::Open))
            } else {
                Ok(result)
            });
        }
        Request::Close(req) => req.result = Some(unit_result(result, FileError::Open)),
        Request::Flush(req) => req.result = Some(unit_result(result, FileError::Write)),
        Request::Stat(req) => {
            req.result = Some(if result < 0 {
                Err(FileError::from_stat_errno(-result))
            } else {
                match extra {
                    Some(Extra::Stat(buf)) => Ok(buf.stx_size),
                    _ => unreachable!("stat request without a status buffer"),
                }
            });
        }
        Request::Read(req) => {
            let spans = slice::from_ref(&req.destination);
            return transfer(&mut req.result, extra, result, FileError::Read, spans);
        }
        Request::Write(req) => {
            let spans = slice::from_ref(&req.source);
            return transfer(&mut req.result, extra, result, FileError::Write, spans);
        }
        Request::VectoredRead(req) => {
            return transfer(&mut req.result, extra, result, FileError::Read, &req.destinations);
        }
        Request::VectoredWrite(req) => {
            return transfer(&mut req.result, extra, result, FileError::Write, &req.sources);
        }
        // The outcome shows in the target's result.
        Request::Cancel(_) => {}
    }

    Progress::Finished
}

fn unit_result(result: i32, error: FileError) -> Result<(), FileError> {
    if result < 0 {
        Err(FileError::from_errno(-result, error))
    } else {
        Ok(())
    }
}

fn transfer(
    slot: &mut RequestResult<u64>,
    extra: &mut Option<Extra>,
    result: i32,
    error: FileError,
    spans: &[Vec<u8>],
) -> Progress {
    if result < 0 {
        *slot = Some(Err(FileError::from_errno(-result, error)));
        return Progress::Finished;
    }

    let processed = result as usize;

    let Some(Extra::Split(state)) = extra else {
        *slot = Some(Ok(processed as u64));
        return Progress::Finished;
    };

    // No progress means end of file for reads; report what was moved.
    let progress = if processed == 0 {
        Progress::Finished
    } else {
        state.advance(processed, spans)
    };

    if progress == Progress::Finished {
        *slot = Some(Ok(state.total_processed));
    }

    progress
}
