//! Process memory-map queries.
//!
//! Sampled instruction pointers are process virtual addresses; turning them
//! into in-object offsets requires knowing where each object file landed.
//! /proc/self/maps is parsed by hand: one line per mapping,
//! `start-end perms offset dev inode pathname`.

use std::fs;
use std::path::Path;

use crate::error::{HaloError, Result};

/// Find the VA range occupied by mappings of `path` in this process.
///
/// All mappings of the file are folded into a single [min start, max end)
/// range, which covers the usual split of an ELF into r--/r-x/rw- segments.
pub fn module_va_range(path: &Path) -> Result<(u64, u64)> {
    let content = fs::read_to_string("/proc/self/maps").map_err(|e| HaloError::Os {
        op: "read /proc/self/maps",
        source: e,
    })?;
    find_range(&content, &path.to_string_lossy()).ok_or_else(|| HaloError::NoMapping {
        path: path.display().to_string(),
    })
}

fn find_range(maps: &str, path: &str) -> Option<(u64, u64)> {
    let mut start_addr: Option<u64> = None;
    let mut end_addr: Option<u64> = None;

    for line in maps.lines() {
        let mut parts = line.split_whitespace();
        let range = parts.next()?;
        // Pathname is the sixth column; mappings without one (heap, anon)
        // have only five.
        let Some(pathname) = parts.nth(4) else {
            continue;
        };
        if pathname != path {
            continue;
        }

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;

        start_addr = Some(start_addr.map_or(start, |s| s.min(start)));
        end_addr = Some(end_addr.map_or(end, |e| e.max(end)));
    }

    match (start_addr, end_addr) {
        (Some(s), Some(e)) => Some((s, e)),
        _ => None,
    }
}
