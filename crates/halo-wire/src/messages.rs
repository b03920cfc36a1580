//! Message kinds and payload definitions.
//!
//! Client→server: [`ClientEnroll`], [`RawSample`], [`CallCountData`],
//! [`DyLibInfo`]. Server→client: `StartSampling`, `StopSampling`,
//! [`SetSamplingPeriod`], [`LoadDyLib`], [`ModifyFunction`], `Shutdown`.
//! `StartSampling`, `StopSampling` and `Shutdown` carry empty bodies.
//!
//! Discriminants are part of the protocol and never reorderable. Map-like
//! fields (CPU features, call counts) are encoded as key-sorted vectors so
//! the same message always produces the same bytes.

use crate::codec::{WireReader, WireWriter};
use crate::{WireError, WireResult};

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Message kind carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ClientEnroll,
    RawSample,
    CallCountData,
    DyLibInfo,
    StartSampling,
    StopSampling,
    SetSamplingPeriod,
    LoadDyLib,
    ModifyFunction,
    Shutdown,
    /// A kind this build does not know. Kept so the receiver can log the
    /// raw discriminant and continue.
    Unknown(u32),
}

impl MessageKind {
    /// Wire discriminant.
    pub fn as_u32(self) -> u32 {
        match self {
            MessageKind::ClientEnroll => 0,
            MessageKind::RawSample => 1,
            MessageKind::CallCountData => 2,
            MessageKind::DyLibInfo => 3,
            MessageKind::StartSampling => 4,
            MessageKind::StopSampling => 5,
            MessageKind::SetSamplingPeriod => 6,
            MessageKind::LoadDyLib => 7,
            MessageKind::ModifyFunction => 8,
            MessageKind::Shutdown => 9,
            MessageKind::Unknown(v) => v,
        }
    }

    /// Decode a wire discriminant. Never fails; unknown values are preserved.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => MessageKind::ClientEnroll,
            1 => MessageKind::RawSample,
            2 => MessageKind::CallCountData,
            3 => MessageKind::DyLibInfo,
            4 => MessageKind::StartSampling,
            5 => MessageKind::StopSampling,
            6 => MessageKind::SetSamplingPeriod,
            7 => MessageKind::LoadDyLib,
            8 => MessageKind::ModifyFunction,
            9 => MessageKind::Shutdown,
            other => MessageKind::Unknown(other),
        }
    }
}

/// Desired per-function patch state in a [`ModifyFunction`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    /// Sled disabled, redirection target cleared.
    Unpatched,
    /// Sled enabled, calls transfer through the redirection table.
    Redirected,
    /// Reserved by the server design; the agent rejects it.
    Bakeoff,
}

impl FunctionState {
    fn as_u8(self) -> u8 {
        match self {
            FunctionState::Unpatched => 0,
            FunctionState::Redirected => 1,
            FunctionState::Bakeoff => 2,
        }
    }

    fn from_u8(v: u8) -> WireResult<Self> {
        match v {
            0 => Ok(FunctionState::Unpatched),
            1 => Ok(FunctionState::Redirected),
            2 => Ok(FunctionState::Bakeoff),
            other => Err(WireError::InvalidEnum {
                field: "desired_state",
                value: other as u64,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// One function of a module, as reported to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Demangled name if demangling succeeded, raw symbol name otherwise.
    pub label: String,
    /// Absolute start address in the running process.
    pub start: u64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the compiler marked this function patchable.
    pub patchable: bool,
}

impl FunctionInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.label);
        w.put_u64(self.start);
        w.put_u64(self.size);
        w.put_bool(self.patchable);
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(FunctionInfo {
            label: r.get_str()?,
            start: r.get_u64()?,
            size: r.get_u64()?,
            patchable: r.get_bool()?,
        })
    }
}

/// Description of one loaded module (the executable at enrollment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Filesystem path of the object.
    pub obj_path: String,
    /// Start of the module's VA range in the process.
    pub vma_start: u64,
    /// End (exclusive) of the module's VA range.
    pub vma_end: u64,
    /// Subtracted from a sampled IP to obtain an in-object offset.
    pub vma_delta: u64,
    /// Compiler command-line tokens recovered from the binary.
    pub build_flags: Vec<String>,
    /// Functions of the module.
    pub funcs: Vec<FunctionInfo>,
    /// Embedded bitcode of the compile.
    pub bitcode: Vec<u8>,
}

impl ModuleInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.obj_path);
        w.put_u64(self.vma_start);
        w.put_u64(self.vma_end);
        w.put_u64(self.vma_delta);
        w.put_seq(&self.build_flags, |w, s| w.put_str(s));
        w.put_seq(&self.funcs, |w, f| f.encode(w));
        w.put_bytes(&self.bitcode);
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(ModuleInfo {
            obj_path: r.get_str()?,
            vma_start: r.get_u64()?,
            vma_end: r.get_u64()?,
            vma_delta: r.get_u64()?,
            build_flags: r.get_seq(|r| r.get_str())?,
            funcs: r.get_seq(FunctionInfo::decode)?,
            bitcode: r.get_bytes()?,
        })
    }
}

/// First message on the wire: who we are and what we are running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEnroll {
    /// LLVM-style process triple, e.g. `x86_64-unknown-linux-gnu`.
    pub process_triple: String,
    /// Host CPU model name.
    pub host_cpu: String,
    /// CPU feature presence map, key-sorted.
    pub cpu_features: Vec<(String, bool)>,
    /// The original executable.
    pub module: ModuleInfo,
}

impl ClientEnroll {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(&self.process_triple);
        w.put_str(&self.host_cpu);
        w.put_seq(&self.cpu_features, |w, (name, present)| {
            w.put_str(name);
            w.put_bool(*present);
        });
        self.module.encode(&mut w);
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = ClientEnroll {
            process_triple: r.get_str()?,
            host_cpu: r.get_str()?,
            cpu_features: r.get_seq(|r| Ok((r.get_str()?, r.get_bool()?)))?,
            module: ModuleInfo::decode(&mut r)?,
        };
        r.finish()?;
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One entry of the last-branch record stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInfo {
    pub from: u64,
    pub to: u64,
    pub mispred: bool,
    pub predicted: bool,
}

impl BranchInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.from);
        w.put_u64(self.to);
        w.put_bool(self.mispred);
        w.put_bool(self.predicted);
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(BranchInfo {
            from: r.get_u64()?,
            to: r.get_u64()?,
            mispred: r.get_bool()?,
            predicted: r.get_bool()?,
        })
    }
}

/// One decoded hardware sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawSample {
    /// Sampled instruction pointer.
    pub instr_ptr: u64,
    /// Thread that was executing.
    pub thread_id: u32,
    /// CLOCK_MONOTONIC_RAW timestamp.
    pub time: u64,
    /// Hardware-reported cost of the sampled event.
    pub weight: u64,
    /// Call chain, latest return address first. Kernel frames excluded.
    pub call_context: Vec<u64>,
    /// Last-branch record sequence.
    pub branches: Vec<BranchInfo>,
}

impl RawSample {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.instr_ptr);
        w.put_u32(self.thread_id);
        w.put_u64(self.time);
        w.put_u64(self.weight);
        w.put_seq(&self.call_context, |w, ip| w.put_u64(*ip));
        w.put_seq(&self.branches, |w, b| b.encode(w));
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = RawSample {
            instr_ptr: r.get_u64()?,
            thread_id: r.get_u32()?,
            time: r.get_u64()?,
            weight: r.get_u64()?,
            call_context: r.get_seq(|r| r.get_u64())?,
            branches: r.get_seq(BranchInfo::decode)?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Snapshot of entry counters for every instrumented function.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallCountData {
    /// CLOCK_MONOTONIC_RAW timestamp of the snapshot.
    pub timestamp: u64,
    /// (function start address, counter value), address-sorted. Functions
    /// in the unpatched state are absent.
    pub function_counts: Vec<(u64, u64)>,
}

impl CallCountData {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.timestamp);
        w.put_seq(&self.function_counts, |w, (addr, count)| {
            w.put_u64(*addr);
            w.put_u64(*count);
        });
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = CallCountData {
            timestamp: r.get_u64()?,
            function_counts: r.get_seq(|r| Ok((r.get_u64()?, r.get_u64()?)))?,
        };
        r.finish()?;
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Dynamic libraries
// ---------------------------------------------------------------------------

/// One materialized symbol of a JIT module, as reported back to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Symbol name as declared in the load request.
    pub label: String,
    /// Absolute address after linking.
    pub start: u64,
    /// Size in bytes (0 for non-function symbols of unknown size).
    pub size: u64,
    /// JIT symbols are never themselves patchable.
    pub patchable: bool,
}

impl SymbolInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.label);
        w.put_u64(self.start);
        w.put_u64(self.size);
        w.put_bool(self.patchable);
    }

    fn decode(r: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(SymbolInfo {
            label: r.get_str()?,
            start: r.get_u64()?,
            size: r.get_u64()?,
            patchable: r.get_bool()?,
        })
    }
}

/// Reply to [`LoadDyLib`]: where each declared symbol landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DyLibInfo {
    /// Module name from the load request.
    pub name: String,
    /// Resolved symbols.
    pub symbols: Vec<SymbolInfo>,
}

impl DyLibInfo {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(&self.name);
        w.put_seq(&self.symbols, |w, s| s.encode(w));
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = DyLibInfo {
            name: r.get_str()?,
            symbols: r.get_seq(SymbolInfo::decode)?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Server request: link this relocatable object into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDyLib {
    /// Unique module name chosen by the server. `<original>` is reserved.
    pub name: String,
    /// Relocatable object bytes.
    pub object_bytes: Vec<u8>,
    /// Symbols the server expects the object to define.
    pub declared_symbols: Vec<String>,
}

impl LoadDyLib {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(&self.name);
        w.put_bytes(&self.object_bytes);
        w.put_seq(&self.declared_symbols, |w, s| w.put_str(s));
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = LoadDyLib {
            name: r.get_str()?,
            object_bytes: r.get_bytes()?,
            declared_symbols: r.get_seq(|r| r.get_str())?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Server request: change the patch state of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyFunction {
    /// Function label, for diagnostics.
    pub name: String,
    /// Function start address in the original executable.
    pub addr: u64,
    /// Requested state.
    pub desired_state: FunctionState,
    /// For `Redirected`: module holding the replacement. `<original>`
    /// restores the original body while keeping the sled enabled.
    pub other_lib: String,
    /// For `Redirected`: replacement symbol name within `other_lib`.
    pub other_name: String,
}

impl ModifyFunction {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(&self.name);
        w.put_u64(self.addr);
        w.put_u8(self.desired_state.as_u8());
        w.put_str(&self.other_lib);
        w.put_str(&self.other_name);
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = ModifyFunction {
            name: r.get_str()?,
            addr: r.get_u64()?,
            desired_state: FunctionState::from_u8(r.get_u8()?)?,
            other_lib: r.get_str()?,
            other_name: r.get_str()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Server request: change the sampling period on every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSamplingPeriod {
    /// New event period.
    pub period: u64,
}

impl SetSamplingPeriod {
    /// Encode the message body.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(self.period);
        w.into_bytes()
    }

    /// Decode a message body.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(body);
        let msg = SetSamplingPeriod {
            period: r.get_u64()?,
        };
        r.finish()?;
        Ok(msg)
    }
}
