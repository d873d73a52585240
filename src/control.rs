//! Inbound control-message handling.
//!
//! [`ControlCodec`] turns the raw device byte stream into typed control
//! messages, enforcing the protocol-version check and the per-type body
//! caps before a body is buffered. [`ControlReader`] runs as a background
//! task and performs the side effects: capability echo, error-report
//! logging, and forwarding start/stop requests to the capture loop over
//! an mpsc channel.
//!
//! Protocol violations are fatal — the stream has no delimiter, so there
//! is nothing to resync to. On any fatal error the reader cancels the
//! session's quit token before surfacing the error to the supervisor.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::AgentError;
use crate::port::StreamPort;
use crate::wire::{
    decode_header, MessageType, StartStop, HEADER_SIZE, MAX_CAPABILITIES_BYTES,
    MAX_NOTIFY_ERROR_BYTES, MAX_START_STOP_BYTES, NOTIFY_ERROR_PREFIX,
};

// ── ControlMessage ───────────────────────────────────────────────

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Capability announcement; the body is opaque to us and discarded.
    Capabilities,
    /// Error report from the host.
    ///
    /// `oversize` carries the declared body length when it exceeded the
    /// cap: the truncated text is still logged before the connection is
    /// failed.
    NotifyError {
        error_code: u32,
        message: String,
        oversize: Option<u32>,
    },
    /// Start or stop request with the client's accepted codecs.
    StartStop(StartStop),
}

// ── ControlCodec ─────────────────────────────────────────────────

/// Frames the inbound byte stream into [`ControlMessage`]s.
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = AgentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlMessage>, AgentError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = decode_header(&src[..HEADER_SIZE].try_into().unwrap())?;
        let size = header.size as usize;

        match MessageType::try_from(header.ty)? {
            MessageType::Capabilities => {
                if size > MAX_CAPABILITIES_BYTES {
                    return Err(AgentError::Oversize {
                        kind: "capabilities",
                        size: header.size,
                        max: MAX_CAPABILITIES_BYTES,
                    });
                }
                if src.len() < HEADER_SIZE + size {
                    return Ok(None);
                }
                src.advance(HEADER_SIZE + size);
                Ok(Some(ControlMessage::Capabilities))
            }
            MessageType::NotifyError => {
                if size < NOTIFY_ERROR_PREFIX {
                    return Err(AgentError::Malformed {
                        kind: "notify-error",
                        reason: format!(
                            "body of {size} bytes is smaller than the \
                             {NOTIFY_ERROR_PREFIX}-byte error code"
                        ),
                    });
                }
                // An oversize body is still read up to the cap so the
                // truncated text can be logged before the stream fails.
                let take = size.min(MAX_NOTIFY_ERROR_BYTES);
                if src.len() < HEADER_SIZE + take {
                    return Ok(None);
                }
                src.advance(HEADER_SIZE);
                let body = src.split_to(take);
                let error_code = u32::from_le_bytes(body[..NOTIFY_ERROR_PREFIX].try_into().unwrap());
                let text = &body[NOTIFY_ERROR_PREFIX..];
                let text = match text.iter().position(|&b| b == 0) {
                    Some(nul) => &text[..nul],
                    None => text,
                };
                Ok(Some(ControlMessage::NotifyError {
                    error_code,
                    message: String::from_utf8_lossy(text).into_owned(),
                    oversize: (size > take).then_some(header.size),
                }))
            }
            MessageType::StartStop => {
                if size > MAX_START_STOP_BYTES {
                    return Err(AgentError::Oversize {
                        kind: "start/stop",
                        size: header.size,
                        max: MAX_START_STOP_BYTES,
                    });
                }
                if src.len() < HEADER_SIZE + size {
                    return Ok(None);
                }
                src.advance(HEADER_SIZE);
                let body = src.split_to(size);
                Ok(Some(ControlMessage::StartStop(StartStop::parse(&body)?)))
            }
            // Agent-to-host types are never valid inbound.
            MessageType::Format | MessageType::Data | MessageType::CursorSet => {
                Err(AgentError::UnknownMessage(header.ty))
            }
        }
    }
}

// ── ControlReader ────────────────────────────────────────────────

/// Background task reading and reacting to host control messages.
pub struct ControlReader<D> {
    framed: FramedRead<ReadHalf<D>, ControlCodec>,
    port: Arc<StreamPort<D>>,
    events: mpsc::Sender<StartStop>,
    quit: CancellationToken,
}

impl<D: AsyncRead + AsyncWrite> ControlReader<D> {
    pub fn new(
        read: ReadHalf<D>,
        port: Arc<StreamPort<D>>,
        events: mpsc::Sender<StartStop>,
        quit: CancellationToken,
    ) -> Self {
        ControlReader {
            framed: FramedRead::new(read, ControlCodec),
            port,
            events,
            quit,
        }
    }

    /// Run until the quit token fires or the control path fails.
    ///
    /// A control-path failure (device I/O or protocol violation) is
    /// irrecoverable: the quit token is cancelled so every other loop
    /// winds down, and the error is returned for the supervisor to
    /// report.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let result = self.read_loop().await;
        if result.is_err() {
            self.quit.cancel();
        }
        result
    }

    async fn read_loop(&mut self) -> Result<(), AgentError> {
        loop {
            let next = tokio::select! {
                _ = self.quit.cancelled() => return Ok(()),
                next = self.framed.next() => next,
            };
            let message = match next {
                Some(message) => message?,
                None => {
                    return Err(AgentError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream device closed",
                    )))
                }
            };
            match message {
                ControlMessage::Capabilities => {
                    // No extensions supported yet; reply with an empty set.
                    self.port.send_capabilities_reply().await?;
                }
                ControlMessage::NotifyError {
                    error_code,
                    message,
                    oversize,
                } => {
                    error!("server reported error {error_code}: {message}");
                    if let Some(size) = oversize {
                        return Err(AgentError::Oversize {
                            kind: "notify-error",
                            size,
                            max: MAX_NOTIFY_ERROR_BYTES,
                        });
                    }
                }
                ControlMessage::StartStop(request) => {
                    info!(
                        "got start/stop: request to {} streaming",
                        if request.streaming_requested() {
                            "start"
                        } else {
                            "stop"
                        }
                    );
                    if self.events.send(request).await.is_err() {
                        // Capture loop is gone; nothing left to drive.
                        return Ok(());
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
