//! Per-CPU perf event handles.
//!
//! One handle per CPU the process may be scheduled on, each opened with
//! inherit=1 so every current and future thread of the process is counted.
//! The handle owns the event fd and its mmap ring, routes ring wakeups to
//! the sampling signal, and exposes the idempotent start/stop/reset/period
//! controls.

use std::os::unix::io::RawFd;

use log::warn;
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

use halo_wire::RawSample;

use crate::error::{HaloError, Result};
use crate::sampler::ring::RingBuffer;

/// Sampled event: retired instructions. Cycles stall on frequency
/// scaling; instructions track actual progress of the workload.
const EVENT_TYPE: u32 = sys::bindings::PERF_TYPE_HARDWARE;
const EVENT_CONFIG: u64 = sys::bindings::PERF_COUNT_HW_INSTRUCTIONS as u64;

/// `F_SETSIG`, missing from this target's `libc` bindings; value is
/// architecture-independent on Linux (see `asm-generic/fcntl.h`).
const F_SETSIG: libc::c_int = 10;

/// The fine-grained branch filter: user-space calls, returns, and
/// conditionals.
fn precise_branch_filter() -> u64 {
    (sys::bindings::PERF_SAMPLE_BRANCH_USER
        | sys::bindings::PERF_SAMPLE_BRANCH_ANY_CALL
        | sys::bindings::PERF_SAMPLE_BRANCH_ANY_RETURN
        | sys::bindings::PERF_SAMPLE_BRANCH_COND) as u64
}

/// The fallback filter for hardware that cannot slice the branch buffer
/// by type.
fn any_branch_filter() -> u64 {
    (sys::bindings::PERF_SAMPLE_BRANCH_USER | sys::bindings::PERF_SAMPLE_BRANCH_ANY) as u64
}

fn build_attr(period: u64, data_pages: usize, page_size: usize) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.size = std::mem::size_of::<perf_event_attr>() as u32;
    attr.type_ = EVENT_TYPE;
    attr.config = EVENT_CONFIG;

    // Created disabled; StartSampling enables via ioctl.
    attr.set_disabled(1);
    // Count new child threads too.
    attr.set_inherit(1);
    // Self-monitoring must not require privileges.
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);

    // Timestamps comparable with the agent's own clock reads.
    attr.set_use_clockid(1);
    attr.clockid = libc::CLOCK_MONOTONIC_RAW;

    // Fork/exit, comm, and executable-mmap records in the stream.
    attr.set_task(1);
    attr.set_comm(1);
    attr.set_comm_exec(1);
    attr.set_mmap(1);

    attr.__bindgen_anon_1.sample_period = period;
    attr.sample_type = (sys::bindings::PERF_SAMPLE_IDENTIFIER
        | sys::bindings::PERF_SAMPLE_IP
        | sys::bindings::PERF_SAMPLE_TID
        | sys::bindings::PERF_SAMPLE_TIME
        | sys::bindings::PERF_SAMPLE_ADDR
        | sys::bindings::PERF_SAMPLE_STREAM_ID
        | sys::bindings::PERF_SAMPLE_CALLCHAIN
        | sys::bindings::PERF_SAMPLE_BRANCH_STACK
        | sys::bindings::PERF_SAMPLE_WEIGHT
        | sys::bindings::PERF_SAMPLE_DATA_SRC) as u64;

    // Kernel frames are noise for a user-space optimizer.
    attr.set_exclude_callchain_kernel(1);

    // Wake at half a ring of data so drains amortize.
    attr.set_watermark(1);
    attr.__bindgen_anon_2.wakeup_watermark = (data_pages * page_size / 2) as u32;

    // Request skid-free IPs where the PMU can deliver them.
    attr.set_precise_ip(2);

    attr.branch_sample_type = precise_branch_filter();
    attr
}

/// One CPU's sampling handle.
#[derive(Debug)]
pub struct PerfHandle {
    fd: RawFd,
    ring: RingBuffer,
    cpu: u32,
}

impl PerfHandle {
    /// Open the event on `cpu` for the whole process, map its ring, and
    /// route wakeups to `signal`.
    pub fn open(
        cpu: u32,
        pid: libc::pid_t,
        period: u64,
        data_pages: usize,
        signal: i32,
    ) -> Result<Self> {
        let page_size = crate::linker::memory::page_size();
        let mut attr = build_attr(period, data_pages, page_size);

        // Safety: attr is a properly initialized struct the syscall only
        // reads (and may size-adjust on E2BIG).
        let mut fd = unsafe { sys::perf_event_open(&mut attr, pid, cpu as i32, -1, 0) };
        if fd == -1 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EINVAL) {
                // Older PMUs cannot filter the branch buffer by type; fall
                // back to any-branch before giving up.
                warn!(
                    "sampler: cpu {cpu}: precise branch filter unsupported, \
                     falling back to any-branch"
                );
                attr = build_attr(period, data_pages, page_size);
                attr.branch_sample_type = any_branch_filter();
                fd = unsafe { sys::perf_event_open(&mut attr, pid, cpu as i32, -1, 0) };
            }
            if fd == -1 {
                return Err(Self::open_error(cpu));
            }
        }

        let ring = match RingBuffer::map(fd, data_pages, page_size) {
            Ok(ring) => ring,
            Err(e) => {
                // Safety: fd is ours and unused beyond this point.
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        // Route ring wakeups to the realtime signal, owned by this process.
        // Safety: plain fcntl calls on our own fd.
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_RDWR | libc::O_NONBLOCK | libc::O_ASYNC);
            libc::fcntl(fd, F_SETSIG, signal);
            libc::fcntl(fd, libc::F_SETOWN, pid);
        }

        Ok(PerfHandle { fd, ring, cpu })
    }

    fn open_error(cpu: u32) -> HaloError {
        let errno = std::io::Error::last_os_error();
        let hint = match errno.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => {
                "; consider lowering /proc/sys/kernel/perf_event_paranoid"
            }
            Some(libc::ENOENT) | Some(libc::ENODEV) => "; event unsupported on this CPU",
            _ => "",
        };
        HaloError::Sampler(format!("perf_event_open failed on cpu {cpu}: {errno}{hint}"))
    }

    /// The event fd, as it appears in signal payloads.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// CPU this handle samples.
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Start counting. Idempotent.
    pub fn enable(&self) {
        // Safety: ioctl on our own perf fd.
        unsafe {
            sys::ioctls::ENABLE(self.fd, 0);
        }
    }

    /// Stop counting. Idempotent.
    pub fn disable(&self) {
        unsafe {
            sys::ioctls::DISABLE(self.fd, 0);
        }
    }

    /// Reset the event counter.
    pub fn reset(&self) {
        unsafe {
            sys::ioctls::RESET(self.fd, 0);
        }
    }

    /// Change the sampling period.
    pub fn set_period(&self, period: u64) {
        unsafe {
            sys::ioctls::PERIOD(self.fd, period);
        }
    }

    /// Drain the ring into `batch`; returns samples appended.
    pub fn drain(&mut self, batch: &mut Vec<RawSample>) -> usize {
        self.ring.drain(batch)
    }
}

impl Drop for PerfHandle {
    fn drop(&mut self) {
        // The ring mapping survives the close and is torn down by the
        // ring's own drop.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_matches_contract() {
        let attr = build_attr(15_485_867, 8, 4096);
        assert_eq!(attr.type_, EVENT_TYPE);
        assert_eq!(attr.config, EVENT_CONFIG);
        assert_eq!(attr.disabled(), 1);
        assert_eq!(attr.inherit(), 1);
        assert_eq!(attr.exclude_kernel(), 1);
        assert_eq!(attr.exclude_hv(), 1);
        assert_eq!(attr.exclude_callchain_kernel(), 1);
        assert_eq!(attr.watermark(), 1);
        assert_eq!(attr.precise_ip(), 2);
        assert_eq!(attr.clockid, libc::CLOCK_MONOTONIC_RAW);
        assert_eq!(unsafe { attr.__bindgen_anon_1.sample_period }, 15_485_867);
        // Half of 8 pages of 4096 bytes.
        assert_eq!(unsafe { attr.__bindgen_anon_2.wakeup_watermark }, 16384);
        assert_eq!(attr.branch_sample_type, precise_branch_filter());
    }

    #[test]
    fn filters_are_distinct() {
        // The fallback must actually relax the request.
        assert_ne!(precise_branch_filter(), any_branch_filter());
        assert_eq!(
            any_branch_filter()
                & (sys::bindings::PERF_SAMPLE_BRANCH_ANY as u64),
            sys::bindings::PERF_SAMPLE_BRANCH_ANY as u64
        );
    }
}
