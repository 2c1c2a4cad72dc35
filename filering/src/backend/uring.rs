use anyhow::{Context, Result};
use io_uring::squeue::{self, Entry};
use io_uring::types::{self, Fd};
use io_uring::{opcode, IoUring, Probe};
use std::os::fd::AsRawFd;

use crate::backend::{
    Barrier, Capabilities, CompletionEntry, Pushed, RingBackend, RingError, SubmissionEntry,
    SubmissionOp,
};
use crate::engine::EngineConfig;
use crate::request::{Operation, OperationSet};
use crate::utils::WakeSource;

/// Ring primitive backed by the kernel's `io_uring`.
///
/// Completions are signalled through an eventfd registered with the ring.
/// Close and Flush carry `IOSQE_IO_DRAIN`, which only orders them after
/// entries already submitted, so flushes are reported as a tracked barrier:
/// the engine holds back new entries until the flush completes.
pub struct UringRing {
    ring: IoUring,
    wake: WakeSource,
    caps: Capabilities,
}

impl RingBackend for UringRing {
    fn try_new(cfg: &EngineConfig) -> Result<Self> {
        let ring = IoUring::builder()
            .setup_cqsize(cfg.cq_entries)
            .build(cfg.sq_entries)
            .context("failed to set up io_uring")?;

        // Without NODROP the kernel silently discards completions once the CQ
        // overflows. Admission control keeps in-flight entries below the CQ
        // size so this is survivable, but worth knowing about.
        if !ring.params().is_feature_nodrop() {
            tracing::warn!("IORING_FEAT_NODROP is not supported by this kernel");
        }

        let wake = WakeSource::try_new()?;
        ring.submitter()
            .register_eventfd(wake.as_raw_fd())
            .context("failed to register eventfd with io_uring")?;

        let caps = Capabilities {
            // Adopt what the kernel granted, it rounds sizes up.
            sq_entries: ring.params().sq_entries(),
            cq_entries: ring.params().cq_entries(),
            max_transfer_len: cfg.max_transfer_len,
            barrier: Barrier::Tracked,
            synchronous: OperationSet::empty(),
            supported: probe_supported(&ring),
        };

        tracing::debug!(
            sq_entries = caps.sq_entries,
            cq_entries = caps.cq_entries,
            supported = ?caps.supported,
            "io_uring initialized"
        );

        Ok(Self { ring, wake, caps })
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn wake(&self) -> &WakeSource {
        &self.wake
    }

    unsafe fn push(&mut self, entry: &SubmissionEntry) -> Result<Pushed, RingError> {
        let mut sqe = encode(&entry.op).user_data(entry.user_data);
        if entry.drain {
            sqe = sqe.flags(squeue::Flags::IO_DRAIN);
        }

        // Dropping the `SubmissionQueue` handle publishes the new tail with
        // release ordering.
        unsafe { self.ring.submission().push(&sqe)? };

        Ok(Pushed::Staged)
    }

    fn enter(&mut self, to_submit: u32) -> Result<u32, RingError> {
        // Submit without IORING_ENTER_GETEVENTS, completions are picked up
        // through the eventfd.
        let submitted = unsafe {
            self.ring
                .submitter()
                .enter::<libc::sigset_t>(to_submit, 0, 0, None)?
        };

        Ok(submitted as u32)
    }

    fn reap(&mut self, out: &mut Vec<CompletionEntry>) {
        // Dropping the `CompletionQueue` handle publishes the advanced head.
        out.extend(self.ring.completion().map(|cqe| CompletionEntry {
            user_data: cqe.user_data(),
            result: cqe.result(),
        }));

        // The kernel parks completions it could not post and only flushes
        // them on an enter that asks for events.
        if self.ring.submission().cq_overflow() {
            // SAFETY: nothing is submitted and no argument is passed.
            let res = unsafe {
                self.ring
                    .submitter()
                    .enter::<libc::sigset_t>(0, 0, IORING_ENTER_GETEVENTS, None)
            };
            if let Err(e) = res {
                tracing::warn!(error = %e, "failed to flush overflowed completions");
            }

            out.extend(self.ring.completion().map(|cqe| CompletionEntry {
                user_data: cqe.user_data(),
                result: cqe.result(),
            }));
        }
    }
}

const IORING_ENTER_GETEVENTS: u32 = 1 << 0;

// Statx on the descriptor itself: empty path plus AT_EMPTY_PATH.
const EMPTY_PATH: &std::ffi::CStr = c"";

fn encode(op: &SubmissionOp) -> Entry {
    match *op {
        SubmissionOp::Open { path, flags, mode } => {
            opcode::OpenAt::new(Fd(libc::AT_FDCWD), path)
                .flags(flags.bits())
                .mode(mode.bits())
                .build()
        }
        SubmissionOp::Close { fd } => opcode::Close::new(Fd(fd)).build(),
        SubmissionOp::Read {
            fd,
            buf,
            len,
            offset,
        } => opcode::Read::new(Fd(fd), buf, len).offset(offset).build(),
        SubmissionOp::Write {
            fd,
            buf,
            len,
            offset,
        } => opcode::Write::new(Fd(fd), buf, len).offset(offset).build(),
        SubmissionOp::Readv {
            fd,
            iovecs,
            count,
            offset,
        } => opcode::Readv::new(Fd(fd), iovecs, count)
            .offset(offset)
            .build(),
        SubmissionOp::Writev {
            fd,
            iovecs,
            count,
            offset,
        } => opcode::Writev::new(Fd(fd), iovecs, count)
            .offset(offset)
            .build(),
        SubmissionOp::Fsync { fd } => opcode::Fsync::new(Fd(fd)).build(),
        SubmissionOp::Statx { fd, buf } => {
            opcode::Statx::new(Fd(fd), EMPTY_PATH.as_ptr(), buf.cast::<types::statx>())
                .flags(libc::AT_EMPTY_PATH)
                .mask(libc::STATX_ALL)
                .build()
        }
        SubmissionOp::Cancel { target } => opcode::AsyncCancel::new(target).build(),
    }
}

fn opcode_for(op: Operation) -> u8 {
    match op {
        Operation::Open => opcode::OpenAt::CODE,
        Operation::Close => opcode::Close::CODE,
        Operation::Read => opcode::Read::CODE,
        Operation::Write => opcode::Write::CODE,
        Operation::VectoredRead => opcode::Readv::CODE,
        Operation::VectoredWrite => opcode::Writev::CODE,
        Operation::Flush => opcode::Fsync::CODE,
        Operation::Stat => opcode::Statx::CODE,
        Operation::Cancel => opcode::AsyncCancel::CODE,
    }
}

// Kernels older than 5.6 cannot be probed; assume everything is there and let
// unsupported opcodes fail per request with EINVAL.
fn probe_supported(ring: &IoUring) -> OperationSet {
    let mut probe = Probe::new();
    if let Err(e) = ring.submitter().register_probe(&mut probe) {
        tracing::debug!(error = %e, "io_uring opcode probe unavailable");
        return OperationSet::all();
    }

    Operation::ALL
        .into_iter()
        .filter(|op| probe.is_supported(opcode_for(*op)))
        .fold(OperationSet::empty(), |set, op| set | op.into())
}
