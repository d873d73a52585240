//! Exclusive framed access to the stream device.
//!
//! One `StreamPort` exists per process. Three producers share its write
//! half (the capture loop, the cursor updater, and the control reader's
//! capability replies); the write mutex is held for the entire
//! header+body of a message, so messages from different producers never
//! interleave on the wire. The read half is owned exclusively by the
//! control reader — ownership replaces a read-side lock.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::AgentError;
use crate::wire::{self, MessageType, VideoCodec};

/// Stream dimensions and codec announced ahead of a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub codec: VideoCodec,
}

/// The write side of the stream device.
pub struct StreamPort<D> {
    writer: Mutex<WriteHalf<D>>,
}

impl<D: AsyncRead + AsyncWrite> StreamPort<D> {
    /// Split the device into the shared write side and the read half
    /// handed to the control reader.
    pub fn split(device: D) -> (Self, ReadHalf<D>) {
        let (read, write) = tokio::io::split(device);
        (
            StreamPort {
                writer: Mutex::new(write),
            },
            read,
        )
    }

    /// Write one complete message under a single mutex hold.
    ///
    /// `message` must already carry its header; `body` is appended
    /// verbatim (pass an empty slice when the message is self-contained).
    pub async fn write_message(&self, message: &[u8], body: &[u8]) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(message).await?;
        if !body.is_empty() {
            writer.write_all(body).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Lock the port for one frame.
    ///
    /// The guard keeps the write mutex held until it is dropped, so a
    /// Format message and the Data message of its frame go out
    /// back-to-back with no other producer in between. Each send on the
    /// guard reports its own failure, keeping a lost format announcement
    /// distinguishable from a lost frame.
    pub async fn frame_writer(&self) -> FrameWriter<'_, D> {
        FrameWriter {
            writer: self.writer.lock().await,
        }
    }

    /// Reply to a capability announcement with an empty capability set.
    pub async fn send_capabilities_reply(&self) -> Result<(), AgentError> {
        self.write_message(&wire::encode_header(MessageType::Capabilities, 0), &[])
            .await
    }
}

/// Exclusive access to the write half for the duration of one frame.
pub struct FrameWriter<'a, D> {
    writer: MutexGuard<'a, WriteHalf<D>>,
}

impl<D: AsyncRead + AsyncWrite> FrameWriter<'_, D> {
    /// Announce the stream format ahead of the frame.
    pub async fn send_format(&mut self, format: FrameFormat) -> Result<(), AgentError> {
        debug!(
            "writing format {}x{} codec={}",
            format.width, format.height, format.codec
        );
        self.writer
            .write_all(&wire::encode_format(
                format.width,
                format.height,
                format.codec,
            ))
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send one encoded frame as a Data message.
    pub async fn send_data(&mut self, payload: &[u8]) -> Result<(), AgentError> {
        self.writer
            .write_all(&wire::encode_data_header(payload.len() as u32))
            .await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        debug!("sent a frame of {} bytes", payload.len());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
