//! Error types for the streaming agent.
//!
//! All fallible operations return `Result<T, AgentError>`. Protocol errors
//! are always fatal: the stream has no delimiter, so no resync is attempted
//! after a malformed message. The one recoverable case is a device write
//! failure on the frame path, which the capture loop demotes to a dropped
//! stream (see [`AgentError::is_device_io`]).

use thiserror::Error;

use crate::wire::{VideoCodec, PROTOCOL_VERSION};

/// The canonical error type for the streaming agent.
#[derive(Debug, Error)]
pub enum AgentError {
    // ── Device errors ────────────────────────────────────────────
    /// The stream device reported a read or write failure.
    #[error("stream device i/o error: {0}")]
    Io(#[from] std::io::Error),

    // ── Protocol errors ──────────────────────────────────────────
    /// An inbound header carried a protocol version we do not speak.
    #[error("bad protocol version {0} (expected {})", PROTOCOL_VERSION)]
    BadVersion(u8),

    /// An inbound header carried a message type we do not handle.
    #[error("unknown message type {0:#06x}")]
    UnknownMessage(u16),

    /// An inbound body exceeds the cap for its message type.
    #[error("{kind} message too large: {size} bytes (max {max})")]
    Oversize {
        kind: &'static str,
        size: u32,
        max: usize,
    },

    /// An inbound body violated its layout.
    #[error("malformed {kind} message: {reason}")]
    Malformed {
        kind: &'static str,
        reason: String,
    },

    // ── Configuration errors ─────────────────────────────────────
    /// A recognized plugin option was given a value outside its range.
    #[error("invalid value {value:?} for option {name:?}")]
    InvalidOption { name: String, value: String },

    // ── Capture errors ───────────────────────────────────────────
    /// No registered plugin can serve any of the client's codecs.
    #[error("no capture plugin available for client codecs {codecs:?}")]
    NoCaptureAvailable { codecs: Vec<VideoCodec> },

    /// A capture provider failed while producing a frame.
    #[error("capture failed: {0}")]
    Capture(String),

    // ── Task errors ──────────────────────────────────────────────
    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

impl AgentError {
    /// Whether this is a device-level I/O failure.
    ///
    /// The capture loop uses this at the frame-send boundary: a frame that
    /// cannot be written drops the stream back to idle instead of
    /// terminating the session, since the control channel may still
    /// deliver a new start request.
    pub fn is_device_io(&self) -> bool {
        matches!(self, AgentError::Io(_))
    }
}
