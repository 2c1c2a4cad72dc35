use crate::utils::Deadline;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

/// The notification primitive through which a ring tells its owner that
/// completions are ready.
///
/// Backed by a non-blocking `eventfd(2)`. The kernel ring signals it through
/// `IORING_REGISTER_EVENTFD`, the emulated ring writes to it directly. Event
/// loops integrate the engine by polling [`WakeSource::as_raw_fd`] for
/// readability.
#[derive(Debug)]
pub struct WakeSource {
    fd: EventFd,
}

impl WakeSource {
    pub(crate) fn try_new() -> Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .context("failed to create eventfd")?;

        Ok(Self { fd })
    }

    pub(crate) fn notify(&self) -> io::Result<()> {
        self.fd.write(1)?;
        Ok(())
    }

    /// Resets the counter so the next readiness edge reflects new completions
    /// only.
    pub(crate) fn drain(&self) {
        match self.fd.read() {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => tracing::warn!(error = %e, "failed to drain wake source"),
        }
    }

    /// Blocks until the wake source is signalled or `deadline` expires.
    /// Returns `Ok(false)` on timeout.
    pub(crate) fn wait(&self, deadline: Deadline) -> io::Result<bool> {
        loop {
            let timeout = match deadline.remaining() {
                None => PollTimeout::NONE,
                Some(remaining) => poll_timeout(remaining),
            };

            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => {
                    if deadline.has_expired() {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// Rounds up so a sub-millisecond remainder does not degrade into a busy loop.
fn poll_timeout(remaining: Duration) -> PollTimeout {
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    let millis = i32::try_from(millis).unwrap_or(i32::MAX);

    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}

impl AsFd for WakeSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for WakeSource {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_idle() -> Result<()> {
        let wake = WakeSource::try_new()?;
        let start = Instant::now();

        assert!(!wake.wait(Deadline::from(Duration::from_millis(20)))?);
        assert!(start.elapsed() >= Duration::from_millis(20));

        Ok(())
    }

    #[test]
    fn test_notify_then_drain() -> Result<()> {
        let wake = WakeSource::try_new()?;

        wake.notify()?;
        wake.notify()?;
        assert!(wake.wait(Deadline::now())?);

        wake.drain();
        assert!(!wake.wait(Deadline::now())?);

        // Draining an empty counter is a no-op.
        wake.drain();
        Ok(())
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(
            poll_timeout(Duration::from_micros(10)),
            PollTimeout::try_from(1).unwrap()
        );
        assert_eq!(poll_timeout(Duration::ZERO), PollTimeout::ZERO);
        assert_eq!(poll_timeout(Duration::MAX), PollTimeout::MAX);
    }
}
