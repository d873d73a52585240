//! Session supervisor.
//!
//! Wires the engine together over an already-opened device: splits the
//! stream port, spawns the control reader and the cursor updater, runs
//! the capture loop on the caller's task, and tears everything down once
//! the quit token fires. Generic over the device so tests can run a whole
//! session over an in-memory duplex stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control::ControlReader;
use crate::cursor::{run_cursor_updater, CursorSource};
use crate::error::AgentError;
use crate::frame_log::FrameLog;
use crate::port::StreamPort;
use crate::registry::PluginRegistry;
use crate::session::run_capture_loop;

/// Pending start/stop requests queued between control reader and capture
/// loop; the reader backpressures if the loop falls this far behind.
const CONTROL_QUEUE_DEPTH: usize = 16;

/// Run one streaming session over `device` until the quit token fires or
/// a fatal error ends it.
///
/// Returns `Ok(())` on a clean quit (signal or host disconnecting the
/// session cleanly is a quit, not an error). The first fatal error among
/// the capture loop and the control reader is returned for the caller to
/// report.
pub async fn run_session<D>(
    device: D,
    registry: PluginRegistry,
    mut frame_log: FrameLog,
    cursor_source: Option<Box<dyn CursorSource>>,
    quit: CancellationToken,
) -> Result<(), AgentError>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (port, read_half) = StreamPort::split(device);
    let port = Arc::new(port);

    let (events_tx, mut events_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let reader = ControlReader::new(read_half, Arc::clone(&port), events_tx, quit.clone());
    let reader_task = tokio::spawn(reader.run());

    let cursor_task = cursor_source.map(|source| {
        tokio::spawn(run_cursor_updater(Arc::clone(&port), source, quit.clone()))
    });

    let capture_result =
        run_capture_loop(&port, &registry, &mut frame_log, &mut events_rx, &quit).await;

    // Wind the background tasks down; both observe the token.
    quit.cancel();
    drop(events_rx);
    if let Some(task) = cursor_task {
        let _ = task.await;
    }
    let reader_result = match reader_task.await {
        Ok(result) => result,
        Err(e) => Err(AgentError::Task(format!("control reader: {e}"))),
    };

    // The capture loop's error wins; otherwise surface the reader's.
    capture_result.and(reader_result)
}
