//! Streaming-agent engine for SPICE guests.
//!
//! Captures the guest display through a pluggable codec and streams the
//! encoded frames to the host over a duplex stream device, reacting to
//! host control messages (capabilities, start/stop, error reports) and
//! reporting cursor-shape changes out-of-band.
//!
//! The engine is generic over the device so it can run against the real
//! virtio-serial port or an in-memory duplex stream in tests; the
//! `spicecast` binary supplies the CLI, signal handling, and device
//! plumbing around [`run_session`].

pub mod agent;
pub mod control;
pub mod cursor;
pub mod error;
pub mod frame_log;
pub mod mjpeg;
pub mod port;
pub mod registry;
pub mod session;
pub mod wire;

pub use agent::run_session;
pub use cursor::{CursorShape, CursorSource};
pub use error::AgentError;
pub use frame_log::FrameLog;
pub use mjpeg::MjpegPlugin;
pub use registry::{ConfigOption, FrameCapture, FrameInfo, Plugin, PluginRegistry};
pub use wire::{StartStop, VideoCodec};
