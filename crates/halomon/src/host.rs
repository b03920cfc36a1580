//! Host and process introspection for enrollment.
//!
//! The server schedules compilation for this exact machine, so enrollment
//! carries the process triple, the CPU model, and the CPU feature map.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::error::{HaloError, Result};

/// LLVM-style triple describing the running process.
pub fn process_triple() -> String {
    // The vendor component is always `unknown` for the targets we run on.
    let arch = std::env::consts::ARCH;
    match std::env::consts::OS {
        "linux" => format!("{arch}-unknown-linux-gnu"),
        other => format!("{arch}-unknown-{other}"),
    }
}

/// Path to this process's executable, via /proc/self/exe.
pub fn self_exe_path() -> Result<PathBuf> {
    fs::read_link("/proc/self/exe").map_err(|e| HaloError::Os {
        op: "readlink /proc/self/exe",
        source: e,
    })
}

/// Host CPU model name and feature map from /proc/cpuinfo.
///
/// The feature map is a `BTreeMap` so the enrollment encoding is
/// deterministic. All features listed in `flags` are present-by-definition;
/// the boolean exists because the wire schema models absence too.
pub fn host_cpu_info() -> (String, BTreeMap<String, bool>) {
    let content = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    parse_cpuinfo(&content)
}

fn parse_cpuinfo(content: &str) -> (String, BTreeMap<String, bool>) {
    let mut model = String::from("unknown");
    let mut features = BTreeMap::new();

    // Only the first processor stanza is needed; every core reports the
    // same model and flags on the machines we target.
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            if !model.is_empty() && !features.is_empty() {
                break;
            }
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "model name" if model == "unknown" => model = value.to_string(),
            "flags" | "Features" if features.is_empty() => {
                for flag in value.split_whitespace() {
                    features.insert(flag.to_string(), true);
                }
            }
            _ => {}
        }
    }

    (model, features)
}

/// Nanoseconds on CLOCK_MONOTONIC_RAW, the clock the sampler stamps
/// records with. Timestamps from both sources are directly comparable.
pub fn monotonic_raw_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: clock_gettime writes the out-param and nothing else.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Online CPU ids from /sys/devices/system/cpu/online.
///
/// The file holds ranges like `0-3` or `0-3,8-11`.
pub fn online_cpus() -> Result<Vec<u32>> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online").map_err(|e| {
        HaloError::Os {
            op: "read /sys/devices/system/cpu/online",
            source: e,
        }
    })?;
    parse_cpu_ranges(content.trim())
        .ok_or_else(|| HaloError::Sampler(format!("unparseable cpu online list: {content:?}")))
}

fn parse_cpu_ranges(content: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for range in content.split(',') {
        if let Some((start, end)) = range.split_once('-') {
            let start: u32 = start.parse().ok()?;
            let end: u32 = end.parse().ok()?;
            cpus.extend(start..=end);
        } else {
            cpus.push(range.parse().ok()?);
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_has_arch_and_os() {
        let triple = process_triple();
        assert!(triple.contains(std::env::consts::ARCH));
        assert_eq!(triple.matches('-').count(), 3);
    }

    #[test]
    fn cpuinfo_parse() {
        let content = "\
processor\t: 0
model name\t: AMD EPYC 7B13 64-Core Processor
flags\t\t: fpu vme sse2 avx2

processor\t: 1
model name\t: AMD EPYC 7B13 64-Core Processor
flags\t\t: fpu vme sse2 avx2
";
        let (model, features) = parse_cpuinfo(content);
        assert_eq!(model, "AMD EPYC 7B13 64-Core Processor");
        assert_eq!(features.len(), 4);
        assert_eq!(features.get("avx2"), Some(&true));
    }

    #[test]
    fn cpu_range_parse() {
        assert_eq!(parse_cpu_ranges("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_ranges("0-1,4-5").unwrap(), vec![0, 1, 4, 5]);
        assert_eq!(parse_cpu_ranges("7").unwrap(), vec![7]);
        assert!(parse_cpu_ranges("0-x").is_none());
    }

    #[test]
    fn self_exe_exists() {
        let path = self_exe_path().unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_raw_ns();
        let b = monotonic_raw_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
