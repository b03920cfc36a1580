//! Wire protocol between the halo monitor agent and the optimization server.
//!
//! The transport is a framed byte stream: each message is a fixed 8-byte
//! header (4-byte little-endian message kind, 4-byte little-endian body
//! length) followed by the body. Bodies are encoded field-by-field in
//! little-endian with length-prefixed strings and vectors, so the same bytes
//! are produced for the same message on every platform.
//!
//! This crate is self-contained: a server implementation can depend on it
//! without pulling in the agent.

pub mod codec;
pub mod messages;

pub use codec::{FrameHeader, WireReader, WireWriter, FRAME_HEADER_LEN, MAX_BODY_LEN};
pub use messages::{
    BranchInfo, CallCountData, ClientEnroll, DyLibInfo, FunctionInfo, FunctionState, LoadDyLib,
    MessageKind, ModifyFunction, ModuleInfo, RawSample, SetSamplingPeriod, SymbolInfo,
};

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The reader ran out of bytes mid-field.
    #[error("truncated message: needed {needed} more bytes at offset {offset}")]
    Truncated {
        /// Bytes still required by the field being decoded.
        needed: usize,
        /// Reader position where the shortfall was discovered.
        offset: usize,
    },

    /// A length prefix exceeded the frame's sanity bound.
    #[error("declared length {len} exceeds limit {limit}")]
    LengthOutOfBounds {
        /// The declared length.
        len: u64,
        /// The enforced limit.
        limit: u64,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// An enum field held a value outside its defined range.
    #[error("invalid value {value} for {field}")]
    InvalidEnum {
        /// Field name, for diagnostics.
        field: &'static str,
        /// The offending raw value.
        value: u64,
    },

    /// Bytes were left over after a complete message was decoded.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
}

/// Result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;
