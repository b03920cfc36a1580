//! The monitor control loop.
//!
//! A single dedicated thread owns everything mutable: the inventory, the
//! patcher, the linker session, and the socket. Application threads only
//! ever touch the redirection table through compiler-inserted sleds. Each
//! loop iteration flushes entry-count snapshots, services inbound server
//! messages, forwards freshly drained samples, and sleeps a randomized
//! 50–150 ms so the agent cannot phase-lock with the sampled workload.
//!
//! There is no offline mode: if the server cannot be reached at startup
//! the agent thread logs and exits, leaving the application untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};

use halo_wire::{
    ClientEnroll, LoadDyLib, MessageKind, ModifyFunction, ModuleInfo, SetSamplingPeriod,
};

use crate::bitcode::data_layout_from_bitcode;
use crate::config::AgentConfig;
use crate::error::{HaloError, Result};
use crate::host;
use crate::inventory::binary::{parse_binary, ParsedBinary};
use crate::inventory::process_map::module_va_range;
use crate::inventory::{CodeInventory, FunctionRecord, ModuleMap};
use crate::linker::LinkerSession;
use crate::net::Client;
use crate::patcher::sled::SledRuntime;
use crate::patcher::Patcher;
use crate::sampler::Sampler;
use crate::ORIGINAL_MODULE;

/// Connection retry policy, matching the server's startup race window.
const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Mutable state of the monitor thread.
pub struct MonitorState {
    config: AgentConfig,
    inventory: CodeInventory,
    patcher: Patcher,
    linker: LinkerSession,
    sampler: Option<Sampler>,
    pending_samples: Vec<halo_wire::RawSample>,
}

impl MonitorState {
    /// State with no sampler attached yet.
    pub fn new(config: AgentConfig, patcher: Patcher) -> Self {
        MonitorState {
            config,
            inventory: CodeInventory::new(),
            patcher,
            linker: LinkerSession::new(),
            sampler: None,
            pending_samples: Vec::new(),
        }
    }

    /// Resolve a sampled IP against the inventory. Misses are normal.
    pub fn lookup(&self, ip: u64) -> Option<&FunctionRecord> {
        self.inventory.lookup(ip).map(|(_, f)| f)
    }

    /// Gather everything enrollment needs from the executable's parsed
    /// image: the wire ModuleInfo, the inventory map, and the global
    /// symbol addresses for the linker's fallback resolution tier.
    ///
    /// The patchable cross-check runs here: every name in the compiler's
    /// patchable list must resolve to a function address the patch
    /// runtime registered, or the configuration is broken beyond repair.
    pub fn build_enrollment(
        &self,
        obj_path: &str,
        vma_start: u64,
        vma_end: u64,
        parsed: &ParsedBinary,
    ) -> Result<(ModuleInfo, ModuleMap, FxHashMap<String, u64>)> {
        let delta = if parsed.is_pie { vma_start } else { 0 };

        let patchable: FxHashSet<&str> = parsed
            .artifacts
            .patchable_names
            .iter()
            .map(String::as_str)
            .collect();

        let mut map = ModuleMap::new(ORIGINAL_MODULE, vma_start, vma_end, delta);
        let mut funcs = Vec::with_capacity(parsed.functions.len());
        let mut globals = FxHashMap::default();
        let mut seen_patchable: FxHashSet<&str> = FxHashSet::default();

        for f in &parsed.functions {
            let start = f.address + delta;
            let is_patchable = patchable.contains(f.raw_name.as_str());

            if is_patchable {
                if !self.patcher.is_patchable(start) {
                    return Err(HaloError::PatchableMismatch {
                        name: f.raw_name.clone(),
                    });
                }
                seen_patchable.insert(f.raw_name.as_str());
            }

            let record = FunctionRecord {
                label: f.label.clone(),
                start,
                size: f.size,
                patchable: is_patchable,
                slot: self.patcher.slot_of(start).ok(),
            };
            // Weak-alias ties keep the first symbol; genuine overlaps are
            // dropped rather than trusted.
            if let Err(e) = map.insert(f.address, record) {
                warn!("inventory: skipping {}: {e}", f.raw_name);
            }

            globals.insert(f.raw_name.clone(), start);
            funcs.push(halo_wire::FunctionInfo {
                label: f.label.clone(),
                start,
                size: f.size,
                patchable: is_patchable,
            });
        }

        // Patchable names with no function symbol at all.
        for name in &parsed.artifacts.patchable_names {
            if !seen_patchable.contains(name.as_str()) {
                return Err(HaloError::PatchableMismatch { name: name.clone() });
            }
        }

        let module_info = ModuleInfo {
            obj_path: obj_path.to_string(),
            vma_start,
            vma_end,
            vma_delta: delta,
            build_flags: parsed.artifacts.build_flags.clone(),
            funcs,
            bitcode: parsed.artifacts.bitcode.clone(),
        };

        Ok((module_info, map, globals))
    }

    /// Handle one inbound message. Replies are queued on `out`; the
    /// return value is false exactly when the server asked us to leave
    /// the react loop.
    pub fn dispatch(
        &mut self,
        kind: MessageKind,
        body: &[u8],
        out: &mut Vec<(MessageKind, Vec<u8>)>,
    ) -> bool {
        match kind {
            MessageKind::StartSampling => {
                info!("monitor: starting sampling");
                if let Some(sampler) = &mut self.sampler {
                    sampler.start();
                }
            }
            MessageKind::StopSampling => {
                info!("monitor: stopping sampling");
                if let Some(sampler) = &mut self.sampler {
                    sampler.stop();
                }
                self.pending_samples.clear();
            }
            MessageKind::SetSamplingPeriod => match SetSamplingPeriod::decode(body) {
                Ok(req) => {
                    if let Some(sampler) = &mut self.sampler {
                        sampler.set_period(req.period);
                    }
                }
                Err(e) => warn!("monitor: bad SetSamplingPeriod body: {e}"),
            },
            MessageKind::LoadDyLib => match LoadDyLib::decode(body) {
                Ok(req) => {
                    if let Err(e) = self.handle_load(&req, out) {
                        // A name clash in the module registry corrupts the
                        // redirection layer's invariants; it is in the
                        // fatal bucket, unlike a broken object.
                        if is_process_fatal(&e) {
                            error!("monitor: fatal during load of dylib {}: {e}", req.name);
                            std::process::exit(1);
                        }
                        error!("monitor: load of dylib {} failed: {e}", req.name);
                    }
                }
                Err(e) => warn!("monitor: bad LoadDyLib body: {e}"),
            },
            MessageKind::ModifyFunction => match ModifyFunction::decode(body) {
                Ok(req) => {
                    if let Err(e) = self.patcher.modify(&req) {
                        error!(
                            "monitor: modify of {} @ {:#x} failed: {e}",
                            req.name, req.addr
                        );
                    }
                }
                Err(e) => warn!("monitor: bad ModifyFunction body: {e}"),
            },
            MessageKind::Shutdown => {
                info!("monitor: server requested shutdown");
                return false;
            }
            other => {
                warn!("monitor: unexpected message kind {:?}", other);
            }
        }
        true
    }

    /// Build a module from server-supplied object bytes, admit it for
    /// redirection, index it for sample lookup, and queue the DyLibInfo
    /// reply.
    fn handle_load(
        &mut self,
        req: &LoadDyLib,
        out: &mut Vec<(MessageKind, Vec<u8>)>,
    ) -> Result<()> {
        let (dylib, info) =
            self.linker
                .load_module(&req.name, &req.object_bytes, &req.declared_symbols)?;
        self.patcher.add_module(dylib.clone())?;

        let (start, end) = dylib.image_range();
        let mut map = ModuleMap::new(req.name.clone(), start, end, start);
        for (name, sym) in dylib.symbols() {
            if sym.size == 0 {
                continue;
            }
            let record = FunctionRecord {
                label: name.to_string(),
                start: sym.address,
                size: sym.size,
                patchable: false,
                slot: None,
            };
            if let Err(e) = map.insert(sym.address - start, record) {
                warn!("inventory: skipping {}::{name}: {e}", req.name);
            }
        }
        self.inventory.insert_module(map)?;

        out.push((MessageKind::DyLibInfo, info.encode()));
        Ok(())
    }

    /// One react-loop iteration against a connected client. Returns false
    /// when the loop should end.
    fn react_once(&mut self, client: &mut Client) -> Result<bool> {
        // Entry-count snapshots first: they are cheap and the server uses
        // their cadence to compute rates.
        if self.patcher.is_instrumenting() {
            let data = self.patcher.serialize_call_counts();
            if !data.function_counts.is_empty() {
                client.send(MessageKind::CallCountData, &data.encode())?;
            }
        }

        // Service everything the server queued.
        let mut out = Vec::new();
        loop {
            match client.poll_message()? {
                Some((kind, body)) => {
                    if !self.dispatch(kind, &body, &mut out) {
                        return Ok(false);
                    }
                }
                None => break,
            }
        }
        for (kind, body) in out {
            client.send(kind, &body)?;
        }

        // Forward freshly drained samples.
        if let Some(sampler) = &mut self.sampler {
            if sampler.is_enabled() {
                sampler.poll(&mut self.pending_samples)?;
                let batch = self.pending_samples.len();
                for sample in self.pending_samples.drain(..) {
                    client.send(MessageKind::RawSample, &sample.encode())?;
                }
                if batch > 0 {
                    log::debug!(
                        "monitor: sent {batch} samples (mean batch {:.1})",
                        sampler.drain_stats().mean()
                    );
                }
            }
        }

        Ok(true)
    }
}

/// Errors the spec pins to process exit: a half-initialized redirection
/// layer or a wrong data layout cannot be survived by just dropping the
/// agent thread.
///
/// OS failures are matched by exact operation: only the executable-memory
/// calls backing JIT modules qualify. The sampler's ring mmap is not here;
/// a process that cannot sample can still run unoptimized.
fn is_process_fatal(e: &HaloError) -> bool {
    match e {
        HaloError::TablePublishFailed
        | HaloError::DuplicateModule { .. }
        | HaloError::PatchableMismatch { .. }
        | HaloError::Bitcode(_) => true,
        HaloError::Os { op, .. } => *op == "mmap executable memory" || *op == "mprotect",
        _ => false,
    }
}

/// Entry point of the monitor thread.
pub fn monitor_loop(config: AgentConfig, runtime: Box<dyn SledRuntime>, shutdown: Arc<AtomicBool>) {
    match run(config, runtime, &shutdown) {
        Ok(()) => info!("monitor: agent thread finished"),
        Err(e) if is_process_fatal(&e) => {
            error!("monitor: fatal: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("monitor: agent thread exiting: {e}");
        }
    }
}

fn run(
    config: AgentConfig,
    runtime: Box<dyn SledRuntime>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let patcher = Patcher::new(runtime)?;
    let mut state = MonitorState::new(config, patcher);

    // Connect. No server, no agent.
    let addr = state.config.server_addr();
    let mut client = Client::connect_with_retries(&addr, CONNECT_ATTEMPTS, CONNECT_DELAY)?;

    // Enroll: describe the process and its executable to the server.
    let exe_path = host::self_exe_path()?;
    let (vma_start, vma_end) = module_va_range(&exe_path)?;
    let parsed = parse_binary(&exe_path)?;
    let obj_path = exe_path.display().to_string();
    let (module_info, module_map, globals) =
        state.build_enrollment(&obj_path, vma_start, vma_end, &parsed)?;

    // An accurate data layout is required before any object can be
    // linked; the embedded bitcode is the only authoritative source.
    let layout = data_layout_from_bitcode(&module_info.bitcode)?;
    state.linker.set_data_layout(layout);
    state.linker.set_original_globals(globals);
    state.inventory.insert_module(module_map)?;

    let (host_cpu, features) = host::host_cpu_info();
    let enroll = ClientEnroll {
        process_triple: host::process_triple(),
        host_cpu,
        cpu_features: features.into_iter().collect(),
        module: module_info,
    };
    client.send(MessageKind::ClientEnroll, &enroll.encode())?;
    info!("monitor: enrolled with {addr}");

    // Sampling machinery after enrollment; its construction failure
    // carries the actionable hint in the error text.
    state.sampler = Some(Sampler::new(&state.config)?);

    // React loop.
    let mut rng = rand::thread_rng();
    while !shutdown.load(Ordering::Relaxed) {
        if !state.react_once(&mut client)? {
            break;
        }
        // Jittered so the agent cannot phase-lock with the workload.
        std::thread::sleep(Duration::from_millis(rng.gen_range(50..=150)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::binary::{BinaryArtifacts, RawFunction};
    use crate::linker::testutil::{simple_object, LAYOUT};
    use crate::patcher::sled::stub::StubRuntime;
    use halo_wire::{DyLibInfo, FunctionState};

    const FIB_VA: u64 = 0x7f00_0000_1234;

    fn parsed_fixture() -> ParsedBinary {
        ParsedBinary {
            is_pie: true,
            functions: vec![
                RawFunction {
                    raw_name: "fib".into(),
                    label: "fib".into(),
                    address: 0x1234,
                    size: 0x80,
                },
                RawFunction {
                    raw_name: "helper".into(),
                    label: "helper".into(),
                    address: 0x2000,
                    size: 0x40,
                },
            ],
            artifacts: BinaryArtifacts {
                bitcode: Vec::new(),
                build_flags: vec!["-O2".into()],
                patchable_names: vec!["fib".into()],
            },
        }
    }

    fn state_with_stub() -> MonitorState {
        let runtime = StubRuntime::new(vec![FIB_VA]);
        let patcher = Patcher::new(Box::new(runtime)).unwrap();
        let mut state = MonitorState::new(AgentConfig::default(), patcher);
        state.linker.set_data_layout(LAYOUT.to_string());
        state
    }

    #[test]
    fn enrollment_scenario() {
        // Scenario A: PIE range [0x7f0000000000, 0x7f0000010000), fib at
        // offset 0x1234 size 0x80.
        let mut state = state_with_stub();
        let parsed = parsed_fixture();
        let (info, map, globals) = state
            .build_enrollment(
                "/usr/bin/target",
                0x7f00_0000_0000,
                0x7f00_0001_0000,
                &parsed,
            )
            .unwrap();

        assert_eq!(info.vma_delta, 0x7f00_0000_0000);
        let fib = info.funcs.iter().find(|f| f.label == "fib").unwrap();
        assert_eq!(fib.start, FIB_VA);
        assert_eq!(fib.size, 0x80);
        assert!(fib.patchable);
        let helper = info.funcs.iter().find(|f| f.label == "helper").unwrap();
        assert!(!helper.patchable);

        assert_eq!(globals["fib"], FIB_VA);

        state.inventory.insert_module(map).unwrap();
        // A sampled IP inside fib resolves to it.
        let hit = state.lookup(0x7f00_0000_1260).unwrap();
        assert_eq!(hit.label, "fib");
        assert_eq!(hit.slot, Some(0));
        // An unknown IP resolves to nothing, without error (Scenario F).
        assert!(state.lookup(0x10).is_none());
    }

    #[test]
    fn non_pie_enrollment_has_zero_delta() {
        let runtime = StubRuntime::new(vec![0x1234]);
        let patcher = Patcher::new(Box::new(runtime)).unwrap();
        let state = MonitorState::new(AgentConfig::default(), patcher);

        let mut parsed = parsed_fixture();
        parsed.is_pie = false;
        let (info, _, _) = state
            .build_enrollment("/usr/bin/target", 0x400000, 0x500000, &parsed)
            .unwrap();
        assert_eq!(info.vma_delta, 0);
        assert_eq!(info.funcs[0].start, 0x1234);
    }

    #[test]
    fn patchable_mismatch_is_detected() {
        // The patcher knows nothing about fib's address.
        let runtime = StubRuntime::new(vec![0xdead_0000]);
        let patcher = Patcher::new(Box::new(runtime)).unwrap();
        let state = MonitorState::new(AgentConfig::default(), patcher);

        let err = state
            .build_enrollment(
                "/usr/bin/target",
                0x7f00_0000_0000,
                0x7f00_0001_0000,
                &parsed_fixture(),
            )
            .unwrap_err();
        assert!(matches!(err, HaloError::PatchableMismatch { ref name } if name == "fib"));
    }

    #[test]
    fn patchable_name_without_symbol_is_detected() {
        let state = state_with_stub();
        let mut parsed = parsed_fixture();
        parsed.artifacts.patchable_names.push("ghost".into());
        let err = state
            .build_enrollment(
                "/usr/bin/target",
                0x7f00_0000_0000,
                0x7f00_0001_0000,
                &parsed,
            )
            .unwrap_err();
        assert!(matches!(err, HaloError::PatchableMismatch { ref name } if name == "ghost"));
    }

    #[test]
    fn load_dylib_round_trip() {
        let mut state = state_with_stub();
        let req = LoadDyLib {
            name: "optA".into(),
            object_bytes: simple_object("fib_v2", 42),
            declared_symbols: vec!["fib_v2".into()],
        };

        let mut out = Vec::new();
        assert!(state.dispatch(MessageKind::LoadDyLib, &req.encode(), &mut out));

        // Exactly one reply: the DyLibInfo.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, MessageKind::DyLibInfo);
        let info = DyLibInfo::decode(&out[0].1).unwrap();
        assert_eq!(info.name, "optA");
        assert_eq!(info.symbols[0].label, "fib_v2");

        // The module is admitted for redirection and indexed for lookup.
        assert!(state.patcher.module("optA").is_some());
        let hit = state.lookup(info.symbols[0].start).unwrap();
        assert_eq!(hit.label, "fib_v2");
    }

    #[test]
    fn full_redirect_flow_through_dispatch() {
        // Scenarios B and C driven through the message layer.
        let mut state = state_with_stub();
        let mut out = Vec::new();

        let load = LoadDyLib {
            name: "optA".into(),
            object_bytes: simple_object("fib_v2", 42),
            declared_symbols: vec!["fib_v2".into()],
        };
        assert!(state.dispatch(MessageKind::LoadDyLib, &load.encode(), &mut out));
        let info = DyLibInfo::decode(&out[0].1).unwrap();
        let target = info.symbols[0].start;

        let redirect = ModifyFunction {
            name: "fib".into(),
            addr: FIB_VA,
            desired_state: FunctionState::Redirected,
            other_lib: "optA".into(),
            other_name: "fib_v2".into(),
        };
        assert!(state.dispatch(MessageKind::ModifyFunction, &redirect.encode(), &mut out));
        assert_eq!(state.patcher.target(0), target);

        let unpatch = ModifyFunction {
            name: "fib".into(),
            addr: FIB_VA,
            desired_state: FunctionState::Unpatched,
            other_lib: String::new(),
            other_name: String::new(),
        };
        assert!(state.dispatch(MessageKind::ModifyFunction, &unpatch.encode(), &mut out));
        assert_eq!(state.patcher.target(0), 0);
        assert!(state.patcher.module("optA").unwrap().reclaim_eligible());
    }

    #[test]
    fn duplicate_load_is_classified_fatal() {
        // The realistic runtime trigger for the fatal name-clash bucket: a
        // second LoadDyLib reusing a taken name. The dispatch arm exits
        // the process on this classification, so drive handle_load
        // directly and assert the classification itself.
        let mut state = state_with_stub();
        let req = LoadDyLib {
            name: "optA".into(),
            object_bytes: simple_object("fib_v2", 42),
            declared_symbols: vec!["fib_v2".into()],
        };

        let mut out = Vec::new();
        state.handle_load(&req, &mut out).unwrap();

        let err = state.handle_load(&req, &mut out).unwrap_err();
        assert!(matches!(err, HaloError::DuplicateModule { ref name } if name == "optA"));
        assert!(is_process_fatal(&err));

        // The reserved name is the same bucket.
        let reserved = LoadDyLib {
            name: ORIGINAL_MODULE.into(),
            object_bytes: simple_object("fib_v2", 42),
            declared_symbols: vec![],
        };
        let err = state.handle_load(&reserved, &mut out).unwrap_err();
        assert!(is_process_fatal(&err));

        // Only the first load produced a reply.
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn failed_modify_keeps_the_loop_running() {
        let mut state = state_with_stub();
        let mut out = Vec::new();
        let bad = ModifyFunction {
            name: "nope".into(),
            addr: 0xbad,
            desired_state: FunctionState::Redirected,
            other_lib: "missing".into(),
            other_name: "x".into(),
        };
        assert!(state.dispatch(MessageKind::ModifyFunction, &bad.encode(), &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn shutdown_and_unknown_kinds() {
        let mut state = state_with_stub();
        let mut out = Vec::new();
        assert!(state.dispatch(MessageKind::Unknown(77), &[], &mut out));
        assert!(state.dispatch(MessageKind::ClientEnroll, &[], &mut out));
        assert!(!state.dispatch(MessageKind::Shutdown, &[], &mut out));
    }

    #[test]
    fn malformed_bodies_are_survived() {
        let mut state = state_with_stub();
        let mut out = Vec::new();
        assert!(state.dispatch(MessageKind::SetSamplingPeriod, &[1, 2], &mut out));
        assert!(state.dispatch(MessageKind::LoadDyLib, &[0xff; 3], &mut out));
        assert!(state.dispatch(MessageKind::ModifyFunction, &[], &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn fatal_classification() {
        assert!(is_process_fatal(&HaloError::TablePublishFailed));
        assert!(is_process_fatal(&HaloError::PatchableMismatch {
            name: "f".into()
        }));
        assert!(is_process_fatal(&HaloError::Bitcode("bad".into())));
        assert!(is_process_fatal(&HaloError::DuplicateModule {
            name: ORIGINAL_MODULE.into()
        }));
        assert!(!is_process_fatal(&HaloError::UnknownFunction { addr: 1 }));
        assert!(!is_process_fatal(&HaloError::Connection(
            std::io::Error::new(std::io::ErrorKind::Other, "x")
        )));
    }

    #[test]
    fn fatal_os_ops_are_exact() {
        let os = |op: &'static str| HaloError::Os {
            op,
            source: std::io::Error::from_raw_os_error(libc::ENOMEM),
        };

        // Executable-memory failures back JIT modules and are fatal.
        assert!(is_process_fatal(&os("mmap executable memory")));
        assert!(is_process_fatal(&os("mprotect")));

        // A ring mmap failure only loses sampling; the application can
        // keep running unoptimized.
        assert!(!is_process_fatal(&os("mmap perf ring")));
        assert!(!is_process_fatal(&os("sigprocmask")));
    }
}
