//! Per-function redirection and entry-count instrumentation.
//!
//! The patcher owns the redirection table and the per-slot state machine:
//!
//! ```text
//! Unpatched --(install target, enable sled)--> Redirected
//! Redirected --(atomic target swap)----------> Redirected
//! Redirected --(disable sled, clear target)--> Unpatched
//! ```
//!
//! Targets are installed before the sled is enabled and swapped with
//! sequentially-consistent exchanges, so application threads racing through
//! a sled only ever observe 0 or a retained, valid target. Redirecting to
//! the reserved `<original>` module installs target 0 while leaving the
//! sled enabled: calls fall through to the original body but keep counting.
//!
//! The patcher is driven exclusively by the monitor thread; application
//! threads touch only the redirection table through compiler-inserted code.

pub mod redirection;
pub mod sled;

use std::sync::Arc;

use log::{debug, info};
use rustc_hash::FxHashMap;

use halo_wire::{CallCountData, FunctionState, ModifyFunction};

use crate::error::{HaloError, Result};
use crate::host::monotonic_raw_ns;
use crate::linker::DyLib;
use crate::patcher::redirection::RedirectionTable;
use crate::patcher::sled::SledRuntime;
use crate::ORIGINAL_MODULE;

/// Monitor-side view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    /// Sled dormant, no redirection, no counting.
    Unpatched,
    /// Sled live: counting entries and following the table target.
    Redirected,
}

#[derive(Debug)]
struct SlotMeta {
    status: PatchStatus,
    /// Entry address of the owning function.
    func_addr: u64,
}

/// Redirection and instrumentation engine.
pub struct Patcher {
    runtime: Box<dyn SledRuntime>,
    table: RedirectionTable,
    meta: Vec<SlotMeta>,
    addr_to_slot: FxHashMap<u64, u32>,
    /// JIT modules admitted for redirection, by name.
    dylibs: FxHashMap<String, Arc<DyLib>>,
}

impl Patcher {
    /// Initialize from the compiler runtime: size the redirection table,
    /// publish its base (exactly once; the trampolines hold the pointer
    /// forever), and build the address → slot map.
    pub fn new(runtime: Box<dyn SledRuntime>) -> Result<Self> {
        let slots = runtime.max_slot_id() as usize + 1;
        let table = RedirectionTable::new(slots);

        if !runtime.publish_table(table.base_ptr()) {
            return Err(HaloError::TablePublishFailed);
        }

        let mut meta = Vec::with_capacity(slots);
        let mut addr_to_slot = FxHashMap::default();
        for slot in 0..slots as u32 {
            let func_addr = runtime.function_address(slot);
            addr_to_slot.insert(func_addr, slot);
            meta.push(SlotMeta {
                status: PatchStatus::Unpatched,
                func_addr,
            });
        }

        info!(
            "patcher: initialized {} slots, table base {:#x}",
            slots,
            table.base_ptr() as usize
        );

        Ok(Patcher {
            runtime,
            table,
            meta,
            addr_to_slot,
            dylibs: FxHashMap::default(),
        })
    }

    /// Slot id for a function entry address.
    pub fn slot_of(&self, addr: u64) -> Result<u32> {
        self.addr_to_slot
            .get(&addr)
            .copied()
            .ok_or(HaloError::UnknownFunction { addr })
    }

    /// Whether an address belongs to a patchable function.
    pub fn is_patchable(&self, addr: u64) -> bool {
        self.addr_to_slot.contains_key(&addr)
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.meta.len()
    }

    /// Monitor-side state of a slot.
    pub fn status(&self, slot: u32) -> PatchStatus {
        self.meta[slot as usize].status
    }

    /// Monitor-side view of a slot's published target.
    pub fn target(&self, slot: u32) -> u64 {
        self.table.target(slot)
    }

    /// Whether any slot is currently instrumented.
    pub fn is_instrumenting(&self) -> bool {
        self.meta
            .iter()
            .any(|m| m.status != PatchStatus::Unpatched)
    }

    /// Admit a JIT module for redirection. `<original>` is reserved and
    /// names must be unique.
    pub fn add_module(&mut self, dylib: Arc<DyLib>) -> Result<()> {
        if dylib.name == ORIGINAL_MODULE || self.dylibs.contains_key(&dylib.name) {
            return Err(HaloError::DuplicateModule {
                name: dylib.name.clone(),
            });
        }
        self.dylibs.insert(dylib.name.clone(), dylib);
        Ok(())
    }

    /// Access an admitted module.
    pub fn module(&self, name: &str) -> Option<&Arc<DyLib>> {
        self.dylibs.get(name)
    }

    /// Apply a server patch directive.
    pub fn modify(&mut self, req: &ModifyFunction) -> Result<()> {
        match req.desired_state {
            FunctionState::Unpatched => self.unpatch(req.addr),
            FunctionState::Redirected => {
                self.redirect_to(req.addr, &req.other_lib, &req.other_name)?;
                debug!(
                    "patcher: redirected {} @ {:#x} -> {}::{}",
                    req.name, req.addr, req.other_lib, req.other_name
                );
                Ok(())
            }
            FunctionState::Bakeoff => {
                let slot = self.slot_of(req.addr)?;
                Err(HaloError::InvalidTransition {
                    slot,
                    reason: "bakeoff is reserved by the server design and not implemented"
                        .to_string(),
                })
            }
        }
    }

    /// Unpatched transition: disable the sled, clear the target, release
    /// the prior target's symbol use. A no-op on already-unpatched slots.
    fn unpatch(&mut self, addr: u64) -> Result<()> {
        let slot = self.slot_of(addr)?;
        if self.meta[slot as usize].status == PatchStatus::Unpatched {
            return Ok(());
        }

        self.runtime.disable(slot);
        self.meta[slot as usize].status = PatchStatus::Unpatched;

        let prior = self.table.swap_target(slot, 0);
        self.release_target(prior)
    }

    /// Redirected transition: resolve and retain the new target, swap it
    /// in, enable the sled if this is the first redirection, release the
    /// prior target.
    fn redirect_to(&mut self, addr: u64, lib: &str, symbol: &str) -> Result<()> {
        let slot = self.slot_of(addr)?;

        let new_target = if lib == ORIGINAL_MODULE {
            // Restore the original body but keep the sled (and counters)
            // live.
            0
        } else {
            let dylib = self
                .dylibs
                .get(lib)
                .ok_or_else(|| HaloError::UnknownLibrary {
                    name: lib.to_string(),
                })?;
            let probe = dylib.symbol(symbol).ok_or_else(|| HaloError::UnknownSymbol {
                module: lib.to_string(),
                symbol: symbol.to_string(),
            })?;
            if !probe.callable {
                return Err(HaloError::Link {
                    module: lib.to_string(),
                    reason: format!("symbol {symbol} is not callable"),
                });
            }
            // Retain before publishing so the target is never visible
            // without a use holding it alive.
            dylib.require(symbol)?.address
        };

        let prior = self.table.swap_target(slot, new_target);

        match self.meta[slot as usize].status {
            PatchStatus::Unpatched => {
                self.runtime.enable_redirect(slot);
                self.meta[slot as usize].status = PatchStatus::Redirected;
            }
            PatchStatus::Redirected => {}
        }

        self.release_target(prior)
    }

    /// Release one use of whatever symbol sits at `target`. Target 0 is
    /// the original body and holds no use.
    fn release_target(&self, target: u64) -> Result<()> {
        if target == 0 {
            return Ok(());
        }
        for dylib in self.dylibs.values() {
            if dylib.release_addr(target) {
                return Ok(());
            }
        }
        Err(HaloError::NoOwningModule { addr: target })
    }

    /// Snapshot entry counters for every instrumented slot, address-sorted.
    /// Counters keep running; the server computes deltas.
    pub fn serialize_call_counts(&self) -> CallCountData {
        let mut function_counts = Vec::new();
        for (slot, meta) in self.meta.iter().enumerate() {
            if meta.status == PatchStatus::Unpatched {
                continue;
            }
            function_counts.push((meta.func_addr, self.table.call_count(slot as u32)));
        }
        function_counts.sort_unstable_by_key(|&(addr, _)| addr);
        CallCountData {
            timestamp: monotonic_raw_ns(),
            function_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sled::stub::StubRuntime;
    use super::*;
    use crate::linker::testutil::{ready_session, simple_object};
    use crate::linker::LinkerSession;

    const FIB: u64 = 0x7f00_0000_1234;
    const OTHER: u64 = 0x7f00_0000_2000;

    fn patcher_with_stub() -> (Patcher, Arc<parking_lot::Mutex<sled::stub::StubState>>) {
        let runtime = StubRuntime::new(vec![FIB, OTHER]);
        let state = runtime.state.clone();
        (Patcher::new(Box::new(runtime)).unwrap(), state)
    }

    fn load_opt_a(session: &mut LinkerSession) -> Arc<DyLib> {
        let bytes = simple_object("fib_v2", 42);
        let (dylib, _) = session
            .load_module("optA", &bytes, &["fib_v2".to_string()])
            .unwrap();
        dylib
    }

    #[test]
    fn init_publishes_table_once() {
        let (patcher, state) = patcher_with_stub();
        assert_eq!(patcher.slot_count(), 2);
        assert_eq!(
            state.lock().table_base,
            Some(patcher.table.base_ptr() as usize)
        );
        assert_eq!(patcher.slot_of(FIB).unwrap(), 0);
        assert_eq!(patcher.slot_of(OTHER).unwrap(), 1);
        assert!(patcher.slot_of(0xdead).is_err());
    }

    #[test]
    fn publish_failure_is_fatal() {
        let mut runtime = StubRuntime::new(vec![FIB]);
        runtime.fail_publish = true;
        assert!(matches!(
            Patcher::new(Box::new(runtime)),
            Err(HaloError::TablePublishFailed)
        ));
    }

    #[test]
    fn redirect_then_unpatch_round_trip() {
        let (mut patcher, state) = patcher_with_stub();
        let mut session = ready_session();
        let dylib = load_opt_a(&mut session);
        let target = dylib.symbol("fib_v2").unwrap().address;
        patcher.add_module(dylib.clone()).unwrap();

        // Scenario B: redirect fib to optA::fib_v2.
        patcher
            .modify(&ModifyFunction {
                name: "fib".into(),
                addr: FIB,
                desired_state: FunctionState::Redirected,
                other_lib: "optA".into(),
                other_name: "fib_v2".into(),
            })
            .unwrap();

        assert_eq!(patcher.status(0), PatchStatus::Redirected);
        assert_eq!(patcher.target(0), target);
        assert_eq!(dylib.symbol("fib_v2").unwrap().uses(), 1);
        assert!(state.lock().enabled.contains(&0));
        assert!(patcher.is_instrumenting());

        // A sled execution lands on the new target.
        assert_eq!(patcher.table.simulate_entry(0), target);

        // Scenario C: unpatch releases the use and clears everything.
        patcher
            .modify(&ModifyFunction {
                name: "fib".into(),
                addr: FIB,
                desired_state: FunctionState::Unpatched,
                other_lib: String::new(),
                other_name: String::new(),
            })
            .unwrap();

        assert_eq!(patcher.status(0), PatchStatus::Unpatched);
        assert_eq!(patcher.target(0), 0);
        assert_eq!(dylib.symbol("fib_v2").unwrap().uses(), 0);
        assert!(dylib.reclaim_eligible());
        assert!(!state.lock().enabled.contains(&0));
        assert!(!patcher.is_instrumenting());
    }

    #[test]
    fn state_unpatched_iff_target_zero() {
        let (mut patcher, _) = patcher_with_stub();
        let mut session = ready_session();
        patcher.add_module(load_opt_a(&mut session)).unwrap();

        // Every transition of the normal redirect cycle maintains
        // state == Unpatched ⇔ target == 0.
        let check = |p: &Patcher| {
            for slot in 0..p.slot_count() as u32 {
                let unpatched = p.status(slot) == PatchStatus::Unpatched;
                assert_eq!(unpatched, p.target(slot) == 0);
            }
        };

        check(&patcher);
        patcher
            .redirect_to(FIB, "optA", "fib_v2")
            .unwrap();
        check(&patcher);
        patcher.unpatch(FIB).unwrap();
        check(&patcher);
    }

    #[test]
    fn double_redirect_swaps_uses() {
        let (mut patcher, state) = patcher_with_stub();
        let mut session = ready_session();
        let opt_a = load_opt_a(&mut session);
        let bytes = simple_object("fib_v3", 43);
        let (opt_b, _) = session
            .load_module("optB", &bytes, &["fib_v3".to_string()])
            .unwrap();
        patcher.add_module(opt_a.clone()).unwrap();
        patcher.add_module(opt_b.clone()).unwrap();

        patcher.redirect_to(FIB, "optA", "fib_v2").unwrap();
        patcher.redirect_to(FIB, "optB", "fib_v3").unwrap();

        // T2 retained once, T1 released once, still redirected.
        assert_eq!(opt_a.symbol("fib_v2").unwrap().uses(), 0);
        assert_eq!(opt_b.symbol("fib_v3").unwrap().uses(), 1);
        assert_eq!(patcher.status(0), PatchStatus::Redirected);
        assert_eq!(
            patcher.target(0),
            opt_b.symbol("fib_v3").unwrap().address
        );

        // The sled was enabled exactly once across both redirects.
        let flips: Vec<_> = state.lock().flips.clone();
        assert_eq!(flips, vec![(0, true)]);
    }

    #[test]
    fn redirect_to_original_keeps_sled_counting() {
        let (mut patcher, state) = patcher_with_stub();
        let mut session = ready_session();
        let opt_a = load_opt_a(&mut session);
        patcher.add_module(opt_a.clone()).unwrap();

        patcher.redirect_to(FIB, "optA", "fib_v2").unwrap();
        patcher
            .redirect_to(FIB, ORIGINAL_MODULE, "fib")
            .unwrap();

        // Target cleared, prior use released, sled still live.
        assert_eq!(patcher.target(0), 0);
        assert_eq!(opt_a.symbol("fib_v2").unwrap().uses(), 0);
        assert_eq!(patcher.status(0), PatchStatus::Redirected);
        assert!(state.lock().enabled.contains(&0));
        assert!(patcher.is_instrumenting());
    }

    #[test]
    fn unpatch_is_idempotent() {
        let (mut patcher, state) = patcher_with_stub();
        patcher.unpatch(FIB).unwrap();
        patcher.unpatch(FIB).unwrap();
        // Never-patched slots produce no runtime flips at all.
        assert!(state.lock().flips.is_empty());
    }

    #[test]
    fn bakeoff_rejected() {
        let (mut patcher, _) = patcher_with_stub();
        let err = patcher
            .modify(&ModifyFunction {
                name: "fib".into(),
                addr: FIB,
                desired_state: FunctionState::Bakeoff,
                other_lib: String::new(),
                other_name: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, HaloError::InvalidTransition { slot: 0, .. }));
    }

    #[test]
    fn structured_errors() {
        let (mut patcher, _) = patcher_with_stub();
        let mut session = ready_session();
        patcher.add_module(load_opt_a(&mut session)).unwrap();

        assert!(matches!(
            patcher.redirect_to(0xbad, "optA", "fib_v2"),
            Err(HaloError::UnknownFunction { addr: 0xbad })
        ));
        assert!(matches!(
            patcher.redirect_to(FIB, "nope", "fib_v2"),
            Err(HaloError::UnknownLibrary { .. })
        ));
        assert!(matches!(
            patcher.redirect_to(FIB, "optA", "nope"),
            Err(HaloError::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn module_registry_rules() {
        let (mut patcher, _) = patcher_with_stub();
        let mut session = ready_session();
        let dylib = load_opt_a(&mut session);
        patcher.add_module(dylib.clone()).unwrap();
        assert!(matches!(
            patcher.add_module(dylib),
            Err(HaloError::DuplicateModule { .. })
        ));
    }

    #[test]
    fn call_count_snapshot_skips_unpatched() {
        // Scenario D: two patched slots with known counters; unpatched
        // slots absent.
        let (mut patcher, _) = patcher_with_stub();
        let mut session = ready_session();
        patcher.add_module(load_opt_a(&mut session)).unwrap();

        patcher.redirect_to(FIB, "optA", "fib_v2").unwrap();
        patcher
            .redirect_to(OTHER, ORIGINAL_MODULE, "other")
            .unwrap();

        for _ in 0..42 {
            patcher.table.simulate_entry(0);
        }
        for _ in 0..1009 {
            patcher.table.simulate_entry(1);
        }

        let snap = patcher.serialize_call_counts();
        assert!(snap.timestamp > 0);
        assert_eq!(
            snap.function_counts,
            vec![(FIB, 42), (OTHER, 1009)]
        );

        // Counters are not reset by serialization.
        let again = patcher.serialize_call_counts();
        assert_eq!(again.function_counts, vec![(FIB, 42), (OTHER, 1009)]);

        // After unpatching, the slot disappears from snapshots.
        patcher.unpatch(FIB).unwrap();
        let after = patcher.serialize_call_counts();
        assert_eq!(after.function_counts, vec![(OTHER, 1009)]);
    }
}
