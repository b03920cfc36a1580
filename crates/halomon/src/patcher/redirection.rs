//! The redirection table read by compiler-inserted sleds.
//!
//! One entry per slot id: a target address (0 = unredirected) and an entry
//! counter. The layout is part of the trampoline ABI: a contiguous array of
//! 16-byte `{u64 target, u64 count}` records indexed by slot id. The sled
//! reads the target with an ordinary load and bumps the counter atomically;
//! the monitor side publishes targets with sequentially-consistent
//! exchanges so the prior target can be recovered for symbol release
//! without a lock.
//!
//! The array is allocated exactly once and its base address is published to
//! the compiler runtime before the first sled is enabled; it never moves
//! afterwards.

use std::sync::atomic::{AtomicU64, Ordering};

/// One slot of the redirection table. Layout is fixed by the trampoline.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RedirectionEntry {
    /// Tail-call target; 0 means fall through to the original body.
    pub target: AtomicU64,
    /// Entry count, incremented by the sled on every call.
    pub call_count: AtomicU64,
}

// The trampoline indexes the array as 16-byte records; a layout drift here
// would corrupt the target process.
const _: () = assert!(std::mem::size_of::<RedirectionEntry>() == 16);
const _: () = assert!(std::mem::align_of::<RedirectionEntry>() == 8);

/// The table itself: a boxed slice whose heap allocation never moves.
#[derive(Debug)]
pub struct RedirectionTable {
    entries: Box<[RedirectionEntry]>,
}

impl RedirectionTable {
    /// Allocate a zeroed table with one entry per slot.
    pub fn new(slots: usize) -> Self {
        let entries = (0..slots).map(|_| RedirectionEntry::default()).collect();
        RedirectionTable { entries }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Base pointer for publication to the compiler runtime. Stable for
    /// the life of the table.
    pub fn base_ptr(&self) -> *const RedirectionEntry {
        self.entries.as_ptr()
    }

    /// Atomically install a new target, returning the previous one.
    pub fn swap_target(&self, slot: u32, new_target: u64) -> u64 {
        self.entries[slot as usize]
            .target
            .swap(new_target, Ordering::SeqCst)
    }

    /// Monitor's view of the current target.
    pub fn target(&self, slot: u32) -> u64 {
        self.entries[slot as usize].target.load(Ordering::SeqCst)
    }

    /// Current entry count. Counters are never reset by readers; the
    /// server computes deltas.
    pub fn call_count(&self, slot: u32) -> u64 {
        self.entries[slot as usize].call_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl RedirectionTable {
    /// Test stand-in for one sled execution: relaxed target read plus an
    /// atomic counter bump, exactly what the compiler-inserted stub does.
    pub fn simulate_entry(&self, slot: u32) -> u64 {
        let entry = &self.entries[slot as usize];
        entry.call_count.fetch_add(1, Ordering::Relaxed);
        entry.target.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_pointer_is_stable() {
        let table = RedirectionTable::new(64);
        let base = table.base_ptr();
        // Moving the table value moves the Box, not the heap allocation.
        let moved = table;
        assert_eq!(base, moved.base_ptr());
    }

    #[test]
    fn swap_returns_prior_target() {
        let table = RedirectionTable::new(4);
        assert_eq!(table.swap_target(2, 0x1000), 0);
        assert_eq!(table.swap_target(2, 0x2000), 0x1000);
        assert_eq!(table.swap_target(2, 0), 0x2000);
        assert_eq!(table.target(2), 0);
    }

    #[test]
    fn counters_accumulate_per_slot() {
        let table = RedirectionTable::new(2);
        for _ in 0..5 {
            table.simulate_entry(0);
        }
        table.simulate_entry(1);
        assert_eq!(table.call_count(0), 5);
        assert_eq!(table.call_count(1), 1);
    }

    #[test]
    fn sled_sees_installed_target() {
        let table = RedirectionTable::new(1);
        table.swap_target(0, 0x7f00_0020_0400);
        assert_eq!(table.simulate_entry(0), 0x7f00_0020_0400);
    }
}
