//! Codec plugin registry and capture selection.
//!
//! A plugin contributes one capture provider per codec and advertises a
//! rank; for a given set of client-accepted codecs the registry picks the
//! highest-ranked plugin whose codec the client accepts, falling through
//! to the next candidate when a plugin declines to construct a capture.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::wire::VideoCodec;

// ── Ranks ────────────────────────────────────────────────────────

/// Well-known plugin ranks. A rank of [`DONT_USE`](rank::DONT_USE)
/// disqualifies a plugin from selection entirely.
pub mod rank {
    pub const DONT_USE: u32 = 0;
    pub const FALLBACK: u32 = 1;
    pub const SOFTWARE: u32 = 100;
    pub const HARDWARE: u32 = 200;
}

// ── Contracts ────────────────────────────────────────────────────

/// One encoded frame handed from a capture provider to the pipeline.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// The encoded frame bytes, owned.
    pub buffer: Vec<u8>,
    /// Frame width in pixels (meaningful when `stream_start` is set).
    pub width: u32,
    /// Frame height in pixels (meaningful when `stream_start` is set).
    pub height: u32,
    /// Set on the first frame of a capture session and whenever the
    /// format changed, requiring a Format message before the Data.
    pub stream_start: bool,
}

/// An active capture provider yielding encoded frames on demand.
pub trait FrameCapture: Send {
    /// Block until the next encoded frame is available.
    ///
    /// Invoked on a blocking thread, never on an async worker, so
    /// implementations are free to wait as long as a frame takes.
    fn capture_frame(&mut self) -> Result<FrameInfo, AgentError>;

    /// The codec this capture encodes with.
    fn codec_type(&self) -> VideoCodec;
}

/// A registered codec plugin.
pub trait Plugin: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Try to construct a capture; `None` means the plugin cannot run in
    /// this environment and the next candidate should be tried.
    fn create_capture(&self) -> Option<Box<dyn FrameCapture>>;

    /// Selection priority; highest wins.
    fn rank(&self) -> u32;

    /// Apply operator options. Plugins ignore option names they do not
    /// recognize; an out-of-range value for a recognized option is a
    /// fatal configuration error.
    fn parse_options(&mut self, options: &[ConfigOption]) -> Result<(), AgentError>;

    /// The codec this plugin's captures encode with.
    fn codec_type(&self) -> VideoCodec;
}

// ── ConfigOption ─────────────────────────────────────────────────

/// An operator-supplied `variable=value` plugin option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub name: String,
    pub value: String,
}

impl ConfigOption {
    /// Parse a `variable=value` argument; a missing `=` is a usage error.
    pub fn parse(arg: &str) -> Result<Self, String> {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok(ConfigOption {
                name: name.to_owned(),
                value: value.to_owned(),
            }),
            _ => Err(format!("expected variable=value, got {arg:?}")),
        }
    }
}

// ── PluginRegistry ───────────────────────────────────────────────

/// Holds every registered plugin in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Registration order breaks rank ties.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        info!(
            "registered plugin {} (codec {}, rank {})",
            plugin.name(),
            plugin.codec_type(),
            plugin.rank()
        );
        self.plugins.push(plugin);
    }

    /// Offer the operator options to every plugin.
    pub fn set_options(&mut self, options: &[ConfigOption]) -> Result<(), AgentError> {
        for plugin in &mut self.plugins {
            plugin.parse_options(options)?;
        }
        Ok(())
    }

    /// Select the best capture for the client's accepted codecs.
    ///
    /// Candidates are the plugins whose codec the client accepts, tried
    /// in descending rank (registration order within a rank). A plugin
    /// that declines to construct a capture is skipped.
    pub fn best_capture(
        &self,
        client_codecs: &HashSet<VideoCodec>,
    ) -> Result<Box<dyn FrameCapture>, AgentError> {
        let mut candidates: Vec<&dyn Plugin> = self
            .plugins
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| p.rank() > rank::DONT_USE && client_codecs.contains(&p.codec_type()))
            .collect();
        // Stable sort keeps registration order within equal ranks.
        candidates.sort_by_key(|p| std::cmp::Reverse(p.rank()));

        for plugin in candidates {
            match plugin.create_capture() {
                Some(capture) => {
                    info!(
                        "selected plugin {} (codec {})",
                        plugin.name(),
                        plugin.codec_type()
                    );
                    return Ok(capture);
                }
                None => debug!("plugin {} declined to start", plugin.name()),
            }
        }

        let mut codecs: Vec<VideoCodec> = client_codecs.iter().copied().collect();
        codecs.sort();
        Err(AgentError::NoCaptureAvailable { codecs })
    }

    /// Scan the plugin discovery directory.
    ///
    /// Plugins in this build register statically; native objects found
    /// here are reported and skipped so operators notice.
    pub fn load_plugins(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("no plugins directory at {}: {e}", dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "so") {
                warn!(
                    "ignoring native plugin {}: dynamic loading is not supported by this build",
                    path.display()
                );
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
