//! Out-of-band cursor-shape reporting.
//!
//! The cursor updater is an independent producer on the shared stream
//! port: it polls a [`CursorSource`] for shape changes and writes a
//! CursorSet message for each one, interleaving freely with Format/Data
//! messages on the wire (the header framing lets the host demultiplex).
//! The windowing-system watcher behind the source is a platform concern;
//! anything that can answer "did the cursor change, and to what" fits.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::port::StreamPort;
use crate::wire;

/// A cursor bitmap reported by the windowing system.
#[derive(Debug, Clone)]
pub struct CursorShape {
    pub width: u16,
    pub height: u16,
    pub hot_x: u16,
    pub hot_y: u16,
    /// RGBA pixels, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

/// Source of cursor-shape change events.
pub trait CursorSource: Send {
    /// Poll for a shape change; `None` while the cursor is unchanged.
    fn poll_change(&mut self) -> Result<Option<CursorShape>, AgentError>;
}

/// How long the updater sleeps between polls while the cursor is still.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the cursor updater until the quit token fires.
///
/// A write failure is reported and the loop carries on: if the device is
/// truly gone the control reader will fail and end the session. A source
/// failure ends cursor reporting but not the session.
pub async fn run_cursor_updater<D>(
    port: Arc<StreamPort<D>>,
    mut source: Box<dyn CursorSource>,
    quit: CancellationToken,
) where
    D: AsyncRead + AsyncWrite,
{
    while !quit.is_cancelled() {
        match source.poll_change() {
            Ok(Some(shape)) => {
                debug!(
                    "cursor changed: {}x{} hot spot ({}, {})",
                    shape.width, shape.height, shape.hot_x, shape.hot_y
                );
                let message = wire::encode_cursor_set(
                    shape.width,
                    shape.height,
                    shape.hot_x,
                    shape.hot_y,
                    &shape.data,
                );
                if let Err(e) = port.write_message(&message, &[]).await {
                    warn!("cursor update failed: {e}");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = quit.cancelled() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Err(e) => {
                warn!("cursor source failed, cursor reporting stops: {e}");
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_header, MessageType};
    use tokio::io::AsyncReadExt;

    /// Emits a fixed number of shapes, then reports no change forever.
    struct ScriptedSource {
        remaining: u32,
    }

    impl CursorSource for ScriptedSource {
        fn poll_change(&mut self) -> Result<Option<CursorShape>, AgentError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(CursorShape {
                width: 4,
                height: 4,
                hot_x: 1,
                hot_y: 2,
                data: vec![0xCD; 4 * 4 * 4],
            }))
        }
    }

    #[tokio::test]
    async fn emits_one_message_per_change() {
        let (device, mut host) = tokio::io::duplex(4096);
        let (port, _read) = StreamPort::split(device);
        let port = Arc::new(port);
        let quit = CancellationToken::new();

        let updater = tokio::spawn(run_cursor_updater(
            Arc::clone(&port),
            Box::new(ScriptedSource { remaining: 3 }),
            quit.clone(),
        ));

        for _ in 0..3 {
            let mut header = [0u8; 8];
            host.read_exact(&mut header).await.unwrap();
            let header = decode_header(&header).unwrap();
            assert_eq!(header.ty, MessageType::CursorSet as u16);
            let mut body = vec![0u8; header.size as usize];
            host.read_exact(&mut body).await.unwrap();
            assert_eq!(&body[..2], &4u16.to_le_bytes());
            assert_eq!(&body[4..6], &1u16.to_le_bytes());
            assert!(body[12..].iter().all(|&b| b == 0xCD));
        }

        quit.cancel();
        updater.await.unwrap();
    }

    #[tokio::test]
    async fn source_failure_ends_the_updater_quietly() {
        struct FailingSource;
        impl CursorSource for FailingSource {
            fn poll_change(&mut self) -> Result<Option<CursorShape>, AgentError> {
                Err(AgentError::Capture("watcher died".into()))
            }
        }

        let (device, _host) = tokio::io::duplex(256);
        let (port, _read) = StreamPort::split(device);
        let quit = CancellationToken::new();
        run_cursor_updater(Arc::new(port), Box::new(FailingSource), quit).await;
    }
}
