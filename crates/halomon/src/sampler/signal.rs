//! Realtime-signal plumbing for ring-buffer wakeups.
//!
//! Each perf fd is configured to raise a realtime signal when its ring
//! passes the watermark. The signal is never delivered as an interrupt:
//! it is blocked process-wide and converted into a readable file
//! descriptor (`signalfd`), which only the monitor thread's reactor
//! consumes. No handler ever runs on an application stack.

use std::mem;
use std::os::unix::io::RawFd;

use crate::error::{HaloError, Result};

/// The realtime signal carrying ring wakeups. Offset past SIGRTMIN to
/// stay clear of runtimes that claim the first few RT signals.
pub fn sampling_signal() -> i32 {
    libc::SIGRTMIN() + 4
}

/// Block the sampling signal on the calling thread.
///
/// Must run on the application's startup thread before it spawns anything:
/// thread signal masks are inherited, so blocking early is what makes the
/// block effectively process-wide. A thread created beforehand could still
/// have the signal delivered as an interrupt.
pub fn block_sampling_signal() -> Result<()> {
    let signal = sampling_signal();
    // Safety: sigset manipulation on a local, then a standard syscall.
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, signal);
        if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) == -1 {
            return Err(HaloError::os("sigprocmask"));
        }
    }
    Ok(())
}

/// Owns the signalfd for the sampling signal.
#[derive(Debug)]
pub struct SignalFd {
    fd: RawFd,
}

impl SignalFd {
    /// Open a non-blocking signalfd for the sampling signal, blocking it
    /// on this thread as well in case the caller never did.
    pub fn new() -> Result<Self> {
        block_sampling_signal()?;
        let signal = sampling_signal();
        // Safety: sigset manipulation on a local, then a standard syscall.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signal);

            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd == -1 {
                return Err(HaloError::os("signalfd"));
            }
            Ok(SignalFd { fd })
        }
    }

    /// Raw descriptor, for reactor registration.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Wait up to `timeout_ms` for the signalfd to become readable.
    pub fn wait_readable(&self, timeout_ms: i32) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // Safety: pollfd is a local out-param.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(HaloError::Os {
                op: "poll signalfd",
                source: err,
            });
        }
        Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
    }

    /// Drain every queued siginfo, returning the perf fd each one names.
    ///
    /// Realtime signals queue one siginfo per wakeup, and `F_SETSIG`
    /// routing fills `ssi_fd` with the descriptor that became ready.
    pub fn drain_ready(&self) -> Result<Vec<RawFd>> {
        let mut ready = Vec::new();
        let expected_signal = sampling_signal() as u32;

        loop {
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let len = mem::size_of::<libc::signalfd_siginfo>();
            // Safety: reading into a properly sized, owned buffer.
            let n = unsafe {
                libc::read(self.fd, &mut info as *mut _ as *mut libc::c_void, len)
            };

            if n == -1 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(ready),
                    Some(libc::EINTR) => continue,
                    _ => {
                        return Err(HaloError::Os {
                            op: "read signalfd",
                            source: err,
                        })
                    }
                }
            }
            if n as usize != len {
                return Err(HaloError::Sampler(format!(
                    "short signalfd read: {n} of {len} bytes"
                )));
            }
            if info.ssi_signo != expected_signal {
                // Not ours; the mask should make this impossible.
                continue;
            }
            ready.push(info.ssi_fd as RawFd);
        }
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        // Safety: fd came from our own signalfd call.
        unsafe {
            libc::close(self.fd);
        }
    }
}
