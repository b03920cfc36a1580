//! Agent-wide error type.
//!
//! Leaves return structured errors; the monitor decides which are fatal to
//! the agent thread and which are logged and survived. Every variant carries
//! enough context (slot id, function name, module name) to make the log line
//! actionable without a debugger.

use halo_wire::WireError;

/// Errors produced by the agent's subsystems.
#[derive(Debug, thiserror::Error)]
pub enum HaloError {
    /// An OS call failed.
    #[error("{op} failed: {source}")]
    Os {
        /// The operation attempted, e.g. `perf_event_open` or `signalfd`.
        op: &'static str,
        /// Errno captured at the failure site.
        #[source]
        source: std::io::Error,
    },

    /// Object-file parsing failed.
    #[error("object parse error in {context}: {source}")]
    Object {
        /// What was being parsed.
        context: String,
        #[source]
        source: object::read::Error,
    },

    /// The embedded bitcode could not be read.
    #[error("bitcode: {0}")]
    Bitcode(String),

    /// A module's VA range could not be determined from the process map.
    #[error("no process mapping found for {path}")]
    NoMapping {
        /// Backing path searched for in /proc/self/maps.
        path: String,
    },

    /// A function interval overlaps one already present in the inventory.
    #[error("overlapping symbol range [{start:#x}, {end:#x}) in module {module}")]
    OverlappingRange {
        module: String,
        start: u64,
        end: u64,
    },

    /// The sampler could not be constructed or controlled.
    #[error("sampler: {0}")]
    Sampler(String),

    /// A patch request referenced a function address with no slot id.
    #[error("function address {addr:#x} has no patch slot")]
    UnknownFunction { addr: u64 },

    /// A redirection target address is not owned by any loaded module.
    #[error("no loaded module owns target address {addr:#x}")]
    NoOwningModule { addr: u64 },

    /// The compiler runtime refused the redirection table base.
    #[error("redirection table publish rejected by compiler runtime")]
    TablePublishFailed,

    /// A patch request referenced a module that was never admitted.
    #[error("no dylib named {name}")]
    UnknownLibrary { name: String },

    /// A symbol lookup failed within a loaded module.
    #[error("dylib {module} has no symbol {symbol}")]
    UnknownSymbol { module: String, symbol: String },

    /// A patch request asked for a transition the state machine rejects.
    #[error("invalid transition for slot {slot}: {reason}")]
    InvalidTransition { slot: u32, reason: String },

    /// A module name was already taken (or is the reserved `<original>`).
    #[error("module name {name} already registered")]
    DuplicateModule { name: String },

    /// The JIT linker rejected an object.
    #[error("link {module}: {reason}")]
    Link { module: String, reason: String },

    /// The compiler-side patchable list disagrees with the patch runtime.
    #[error("function {name} marked patchable but unknown to the patcher")]
    PatchableMismatch { name: String },

    /// A wire message failed to encode or decode.
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Socket-level failure talking to the server.
    #[error("server connection: {0}")]
    Connection(#[source] std::io::Error),
}

impl HaloError {
    /// Capture the current errno for a failed OS call.
    pub fn os(op: &'static str) -> Self {
        HaloError::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Result alias used throughout the agent.
pub type Result<T> = std::result::Result<T, HaloError>;
