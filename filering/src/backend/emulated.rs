use anyhow::Result;
use nix::errno::Errno;
use std::collections::VecDeque;
use std::ffi::CStr;

use crate::backend::{
    Barrier, Capabilities, CompletionEntry, Pushed, RingBackend, RingError, SubmissionEntry,
    SubmissionOp,
};
use crate::engine::EngineConfig;
use crate::request::OperationSet;
use crate::utils::WakeSource;

/// A userspace ring with the same contract as the kernel one.
///
/// Staged entries execute sequentially on [`RingBackend::enter`] with
/// positional syscalls, so barriers hold natively. Open and Stat run at push
/// time and never produce a completion entry. The completion ring is bounded;
/// entries beyond its capacity wait in an overflow list instead of being
/// dropped.
pub struct EmulatedRing {
    staged: VecDeque<Staged>,
    completions: VecDeque<CompletionEntry>,
    overflow: VecDeque<CompletionEntry>,
    wake: WakeSource,
    caps: Capabilities,
}

struct Staged {
    entry: SubmissionEntry,

    /// Set by a later cancel staged against this entry.
    canceled: bool,

    /// Outcome of a cancel entry, decided when it was pushed.
    cancel_result: i32,
}

impl EmulatedRing {
    fn post(&mut self, completion: CompletionEntry) {
        if self.completions.len() < self.caps.cq_entries as usize {
            self.completions.push_back(completion);
        } else {
            tracing::debug!(user_data = completion.user_data, "completion ring overflow");
            self.overflow.push_back(completion);
        }
    }

    #[cfg(test)]
    pub(crate) fn overflowed(&self) -> usize {
        self.overflow.len()
    }
}

impl RingBackend for EmulatedRing {
    fn try_new(cfg: &EngineConfig) -> Result<Self> {
        let caps = Capabilities {
            // Round up the way the kernel does.
            sq_entries: cfg.sq_entries.next_power_of_two(),
            cq_entries: cfg.cq_entries.next_power_of_two(),
            max_transfer_len: cfg.max_transfer_len,
            barrier: Barrier::Native,
            synchronous: OperationSet::OPEN | OperationSet::STAT,
            supported: OperationSet::all(),
        };

        Ok(Self {
            staged: VecDeque::with_capacity(caps.sq_entries as usize),
            completions: VecDeque::with_capacity(caps.cq_entries as usize),
            overflow: VecDeque::new(),
            wake: WakeSource::try_new()?,
            caps,
        })
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn wake(&self) -> &WakeSource {
        &self.wake
    }

    unsafe fn push(&mut self, entry: &SubmissionEntry) -> Result<Pushed, RingError> {
        match entry.op {
            SubmissionOp::Open { path, flags, mode } => {
                let path = unsafe { CStr::from_ptr(path) };
                let res = nix::fcntl::open(path, flags, mode);
                return Ok(Pushed::Completed(to_result(res)));
            }
            SubmissionOp::Statx { fd, buf } => {
                let res = nix::sys::stat::fstat(fd).map(|st| {
                    unsafe { (*buf).stx_size = st.st_size as u64 };
                    0
                });
                return Ok(Pushed::Completed(to_result(res)));
            }
            _ => {}
        }

        if self.staged.len() == self.caps.sq_entries as usize {
            return Err(RingError::QueueFull);
        }

        let cancel_result = match entry.op {
            SubmissionOp::Cancel { target } => {
                match self
                    .staged
                    .iter_mut()
                    .find(|s| s.entry.user_data == target && !s.canceled)
                {
                    Some(target) => {
                        target.canceled = true;
                        0
                    }
                    None => -libc::ENOENT,
                }
            }
            _ => 0,
        };

        self.staged.push_back(Staged {
            entry: *entry,
            canceled: false,
            cancel_result,
        });

        Ok(Pushed::Staged)
    }

    fn enter(&mut self, to_submit: u32) -> Result<u32, RingError> {
        let mut submitted = 0;

        while submitted < to_submit {
            let Some(staged) = self.staged.pop_front() else {
                break;
            };

            let result = if staged.canceled {
                -libc::ECANCELED
            } else {
                match staged.entry.op {
                    SubmissionOp::Cancel { .. } => staged.cancel_result,
                    // SAFETY: the engine keeps every buffer alive until the
                    // completion is reaped.
                    op => unsafe { execute(op) },
                }
            };

            self.post(CompletionEntry {
                user_data: staged.entry.user_data,
                result,
            });
            submitted += 1;
        }

        if submitted > 0 {
            self.wake.notify()?;
        }

        Ok(submitted)
    }

    fn reap(&mut self, out: &mut Vec<CompletionEntry>) {
        out.extend(self.completions.drain(..));

        // Overflowed entries are flushed back once the ring has room, and
        // announced like fresh completions.
        let mut flushed = false;
        while self.completions.len() < self.caps.cq_entries as usize {
            let Some(completion) = self.overflow.pop_front() else {
                break;
            };
            self.completions.push_back(completion);
            flushed = true;
        }

        if flushed {
            if let Err(e) = self.wake.notify() {
                tracing::warn!(error = %e, "failed to signal flushed completions");
            }
        }
    }
}

fn to_result(res: nix::Result<i32>) -> i32 {
    match res {
        Ok(value) => value,
        Err(errno) => -(errno as i32),
    }
}

unsafe fn execute(op: SubmissionOp) -> i32 {
    let res = unsafe {
        match op {
            SubmissionOp::Close { fd } => libc::close(fd) as isize,
            SubmissionOp::Read {
                fd,
                buf,
                len,
                offset,
            } => libc::pread(fd, buf.cast(), len as usize, offset as libc::off_t),
            SubmissionOp::Write {
                fd,
                buf,
                len,
                offset,
            } => libc::pwrite(fd, buf.cast(), len as usize, offset as libc::off_t),
            SubmissionOp::Readv {
                fd,
                iovecs,
                count,
                offset,
            } => libc::preadv(fd, iovecs, count as libc::c_int, offset as libc::off_t),
            SubmissionOp::Writev {
                fd,
                iovecs,
                count,
                offset,
            } => libc::pwritev(fd, iovecs, count as libc::c_int, offset as libc::off_t),
            SubmissionOp::Fsync { fd } => libc::fsync(fd) as isize,
            SubmissionOp::Open { .. } | SubmissionOp::Statx { .. } | SubmissionOp::Cancel { .. } => {
                unreachable!("{op:?} is never staged")
            }
        }
    };

    if res < 0 {
        -Errno::last_raw()
    } else {
        // Transfers are capped well below i32::MAX.
        res as i32
    }
}
