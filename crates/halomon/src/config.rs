//! Agent configuration from the environment.
//!
//! The agent is linked into someone else's process, so there is no command
//! line to parse; everything arrives through `HALO_*` environment variables.
//! Malformed values fall back to the default with a warning rather than
//! aborting the host application.

use log::warn;

/// Default optimization-server hostname.
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Default optimization-server port.
pub const DEFAULT_PORT: u16 = 29000;

/// Default sampling period. A large prime, so the sample cadence cannot
/// phase-lock with periodic behavior in the workload.
pub const DEFAULT_SAMPLE_PERIOD: u64 = 15_485_867;

/// Default number of data pages in each perf ring buffer (the kernel header
/// page is extra). Must be a power of two.
pub const DEFAULT_RING_PAGES: usize = 8;

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Optimization server hostname (`HALO_HOSTNAME`).
    pub hostname: String,
    /// Optimization server port (`HALO_PORT`).
    pub port: u16,
    /// Initial sampling period (`HALO_SAMPLE_PERIOD`).
    pub sample_period: u64,
    /// Data pages per perf ring (`HALO_RING_PAGES`), power of two.
    pub ring_pages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            sample_period: DEFAULT_SAMPLE_PERIOD,
            ring_pages: DEFAULT_RING_PAGES,
        }
    }
}

impl AgentConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let mut cfg = AgentConfig::default();

        if let Ok(host) = std::env::var("HALO_HOSTNAME") {
            if !host.is_empty() {
                cfg.hostname = host;
            }
        }

        if let Some(port) = parse_var::<u16>("HALO_PORT") {
            cfg.port = port;
        }

        if let Some(period) = parse_var::<u64>("HALO_SAMPLE_PERIOD") {
            if period > 0 {
                cfg.sample_period = period;
            } else {
                warn!("config: HALO_SAMPLE_PERIOD must be positive, keeping default");
            }
        }

        if let Some(pages) = parse_var::<usize>("HALO_RING_PAGES") {
            if pages.is_power_of_two() {
                cfg.ring_pages = pages;
            } else {
                warn!(
                    "config: HALO_RING_PAGES={} is not a power of two, keeping default {}",
                    pages, DEFAULT_RING_PAGES
                );
            }
        }

        cfg
    }

    /// `host:port` string for the connector.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("config: ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.hostname, "localhost");
        assert_eq!(cfg.port, 29000);
        assert_eq!(cfg.sample_period, 15_485_867);
        assert!(cfg.ring_pages.is_power_of_two());
    }

    #[test]
    fn server_addr_format() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.server_addr(), "localhost:29000");
    }
}
