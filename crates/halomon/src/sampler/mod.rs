//! Hardware sampling: per-CPU kernel ring buffers drained on signal
//! readiness.
//!
//! The kernel interface binds each ring to a (task, CPU) pair, so the
//! sampler opens one handle per CPU the process can run on; inherit=1
//! extends coverage to threads spawned later. Half-full rings wake the
//! process via a realtime signal that the monitor observes as fd
//! readiness; no handler ever interrupts an application thread.

pub mod perf;
pub mod ring;
pub mod signal;

use log::{debug, info, warn};

use halo_wire::RawSample;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::host::online_cpus;
use crate::sampler::perf::PerfHandle;
use crate::sampler::signal::{sampling_signal, SignalFd};
use crate::stats::SummaryStats;

/// The sampling engine: all per-CPU handles plus the shared wakeup fd.
pub struct Sampler {
    handles: Vec<PerfHandle>,
    signal_fd: SignalFd,
    enabled: bool,
    /// Per-drain batch sizes, for debug telemetry.
    drain_stats: SummaryStats,
}

impl Sampler {
    /// Open handles for every online CPU. Fails if the signal fd or any
    /// handle cannot be constructed, since a partially blind sampler would
    /// skew every profile the server sees.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let signal_fd = SignalFd::new()?;
        let cpus = online_cpus()?;
        // Safety: getpid cannot fail.
        let pid = unsafe { libc::getpid() };

        let mut handles = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            handles.push(PerfHandle::open(
                cpu,
                pid,
                config.sample_period,
                config.ring_pages,
                sampling_signal(),
            )?);
        }

        info!(
            "sampler: {} cpu handles, period {}, {} ring pages",
            handles.len(),
            config.sample_period,
            config.ring_pages
        );

        Ok(Sampler {
            handles,
            signal_fd,
            enabled: false,
            drain_stats: SummaryStats::new(),
        })
    }

    /// Whether sampling is currently on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of per-CPU handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Reset counters and enable every handle. Idempotent.
    pub fn start(&mut self) {
        if self.enabled {
            return;
        }
        for handle in &self.handles {
            handle.reset();
            handle.enable();
        }
        self.enabled = true;
        debug!("sampler: started");
    }

    /// Disable every handle. Idempotent.
    pub fn stop(&mut self) {
        if !self.enabled {
            return;
        }
        for handle in &self.handles {
            handle.disable();
        }
        self.enabled = false;
        debug!("sampler: stopped");
    }

    /// Reset every handle's counter.
    pub fn reset(&mut self) {
        for handle in &self.handles {
            handle.reset();
        }
    }

    /// Push a new period to every handle.
    pub fn set_period(&mut self, period: u64) {
        for handle in &self.handles {
            handle.set_period(period);
        }
        debug!("sampler: period set to {period}");
    }

    /// Service pending ring wakeups, appending decoded samples to `batch`.
    /// Returns the number appended.
    pub fn poll(&mut self, batch: &mut Vec<RawSample>) -> Result<usize> {
        let mut appended = 0;
        for ready_fd in self.signal_fd.drain_ready()? {
            match self.handles.iter_mut().find(|h| h.fd() == ready_fd) {
                Some(handle) => {
                    let n = handle.drain(batch);
                    appended += n;
                    self.drain_stats.record(n as f64);
                }
                None => {
                    warn!("sampler: wakeup for unknown fd {ready_fd}");
                }
            }
        }
        Ok(appended)
    }

    /// Running statistics over per-drain batch sizes.
    pub fn drain_stats(&self) -> &SummaryStats {
        &self.drain_stats
    }
}
