//! Append-only diagnostic log of capture activity.
//!
//! Records timestamped stat lines and, when the `frames` category is
//! enabled, the frame payloads themselves — hexdumped by default, raw
//! with `--log-binary`. Purely diagnostic: write failures are reported
//! and otherwise ignored, and the format carries no stability guarantee.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::AgentError;

/// Diagnostic sink for stat lines and frame payloads.
pub struct FrameLog {
    out: Option<BufWriter<File>>,
    binary: bool,
    frames: bool,
}

impl FrameLog {
    /// Open the log file, or a no-op log when `path` is `None`.
    pub fn open(path: Option<&Path>, binary: bool, frames: bool) -> Result<Self, AgentError> {
        let out = match path {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        Ok(FrameLog { out, binary, frames })
    }

    /// A frame log that drops everything.
    pub fn disabled() -> Self {
        FrameLog {
            out: None,
            binary: false,
            frames: false,
        }
    }

    /// Append one timestamped stat line.
    pub fn stat(&mut self, args: fmt::Arguments<'_>) {
        let Some(out) = &mut self.out else { return };
        let result = writeln!(out, "{}: {}", timestamp_us(), args).and_then(|_| out.flush());
        if let Err(e) = result {
            warn!("frame log write failed: {e}");
        }
    }

    /// Append one frame payload, if the `frames` category is enabled.
    pub fn frame(&mut self, data: &[u8]) {
        if !self.frames {
            return;
        }
        let Some(out) = &mut self.out else { return };
        let result = if self.binary {
            out.write_all(data)
        } else {
            hexdump(&mut *out, data)
        }
        .and_then(|_| out.flush());
        if let Err(e) = result {
            warn!("frame log write failed: {e}");
        }
    }
}

/// Microseconds since the epoch; the timestamp base for stat lines.
fn timestamp_us() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}

/// Classic 16-bytes-per-line hexdump with offset and ASCII columns.
fn hexdump(out: &mut impl Write, data: &[u8]) -> io::Result<()> {
    for (line, chunk) in data.chunks(16).enumerate() {
        write!(out, "{:08x}:", line * 16)?;
        for byte in chunk {
            write!(out, " {byte:02x}")?;
        }
        for _ in chunk.len()..16 {
            write!(out, "   ")?;
        }
        write!(out, "  ")?;
        for &byte in chunk {
            let c = if (0x20..0x7f).contains(&byte) {
                byte as char
            } else {
                '.'
            };
            write!(out, "{c}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_lines_are_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");
        let mut log = FrameLog::open(Some(&path), false, false).unwrap();
        log.stat(format_args!("Frame of {} bytes", 512));
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        let line = text.lines().next().unwrap();
        let (timestamp, message) = line.split_once(": ").unwrap();
        assert!(timestamp.parse::<u128>().is_ok());
        assert_eq!(message, "Frame of 512 bytes");
    }

    #[test]
    fn frames_are_gated_on_the_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");
        let mut log = FrameLog::open(Some(&path), false, false).unwrap();
        log.frame(&[1, 2, 3]);
        drop(log);
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
    }

    #[test]
    fn binary_frames_are_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.log");
        let mut log = FrameLog::open(Some(&path), true, true).unwrap();
        log.frame(&[0xDE, 0xAD, 0xBE, 0xEF]);
        drop(log);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn hexdump_shape() {
        let mut out = Vec::new();
        let mut data: Vec<u8> = (b'A'..=b'Z').collect();
        data.push(0x00);
        hexdump(&mut out, &data).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000: 41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert!(lines[1].starts_with("00000010:"));
        // Non-printable bytes render as dots.
        assert!(lines[1].ends_with("QRSTUVWXYZ."));
    }

    #[test]
    fn disabled_log_swallows_everything() {
        let mut log = FrameLog::disabled();
        log.stat(format_args!("nothing"));
        log.frame(&[0; 16]);
    }
}
