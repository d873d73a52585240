//! Wire format of the stream-device protocol.
//!
//! Every message on the device is a fixed 8-byte header followed by `size`
//! body bytes. There is no other framing.
//!
//! ## Header (8 bytes)
//!
//! ```text
//! protocol_version: u8   (always 1)
//! padding:          u8   (zero on send, ignored on receive)
//! type:             u16
//! size:             u32  (body length; the header is not counted)
//! ```
//!
//! ## Bodies
//!
//! **Format** (agent → host, 12 bytes):
//! ```text
//! width:   u32
//! height:  u32
//! codec:   u8
//! padding: u8 × 3
//! ```
//!
//! **CursorSet** (agent → host, 12 bytes + pixel data):
//! ```text
//! width:      u16
//! height:     u16
//! hot_spot_x: u16
//! hot_spot_y: u16
//! type:       u8   (1 = alpha-blended RGBA)
//! padding:    u8 × 3
//! data:       [u8] (width × height × 4 RGBA bytes)
//! ```
//!
//! **StartStop** (host → agent): `num_codecs` byte, then `num_codecs`
//! codec-id bytes.
//!
//! **NotifyError** (host → agent): `error_code` u32, then message text.
//!
//! **Data** (agent → host): raw encoded frame bytes.
//!
//! All multi-byte fields are little-endian. No variable-length encoding.

use std::fmt;

use crate::error::AgentError;

// ── Constants ────────────────────────────────────────────────────

/// The protocol version this agent speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest capability announcement body we accept.
pub const MAX_CAPABILITIES_BYTES: usize = 1024;

/// Size of the `error_code` prefix of a NotifyError body.
pub const NOTIFY_ERROR_PREFIX: usize = 4;

/// Largest NotifyError body we accept: the code plus 1024 text bytes.
pub const MAX_NOTIFY_ERROR_BYTES: usize = NOTIFY_ERROR_PREFIX + 1024;

/// Largest StartStop body we accept.
pub const MAX_START_STOP_BYTES: usize = 255;

/// Body size of a Format message.
pub const FORMAT_BODY_SIZE: usize = 12;

/// Fixed prefix of a CursorSet body, before the pixel data.
pub const CURSOR_SET_PREFIX: usize = 12;

/// Cursor pixel layout: alpha-blended RGBA.
pub const CURSOR_TYPE_ALPHA: u8 = 1;

// ── MessageType ──────────────────────────────────────────────────

/// Message kinds carried in the header `type` field.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Capability announcement; sent by both ends.
    Capabilities = 1,
    /// Error report from the host.
    NotifyError = 2,
    /// Host request to start or stop streaming.
    StartStop = 3,
    /// Stream format announcement (agent → host).
    Format = 4,
    /// One encoded frame (agent → host).
    Data = 5,
    /// Cursor shape update (agent → host).
    CursorSet = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = AgentError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Capabilities),
            2 => Ok(MessageType::NotifyError),
            3 => Ok(MessageType::StartStop),
            4 => Ok(MessageType::Format),
            5 => Ok(MessageType::Data),
            6 => Ok(MessageType::CursorSet),
            _ => Err(AgentError::UnknownMessage(value)),
        }
    }
}

// ── VideoCodec ───────────────────────────────────────────────────

/// A video codec id as used on the wire.
///
/// A newtype rather than an enum so that codec ids we do not know about
/// still round-trip intact through a client's accepted-codec list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoCodec(pub u8);

impl VideoCodec {
    pub const MJPEG: VideoCodec = VideoCodec(1);
    pub const VP8: VideoCodec = VideoCodec(2);
    pub const H264: VideoCodec = VideoCodec(3);
    pub const VP9: VideoCodec = VideoCodec(4);
    pub const H265: VideoCodec = VideoCodec(5);
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            VideoCodec::MJPEG => write!(f, "mjpeg"),
            VideoCodec::VP8 => write!(f, "vp8"),
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::VP9 => write!(f, "vp9"),
            VideoCodec::H265 => write!(f, "h265"),
            VideoCodec(other) => write!(f, "codec({other})"),
        }
    }
}

impl fmt::Debug for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ── Header ───────────────────────────────────────────────────────

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw message type; may be a value we do not handle.
    pub ty: u16,
    /// Body length in bytes, header excluded.
    pub size: u32,
}

/// Serialize a header (little-endian, padding zeroed).
pub fn encode_header(ty: MessageType, body_len: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = PROTOCOL_VERSION;
    buf[2..4].copy_from_slice(&(ty as u16).to_le_bytes());
    buf[4..8].copy_from_slice(&body_len.to_le_bytes());
    buf
}

/// Deserialize a header, rejecting unknown protocol versions.
pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<Header, AgentError> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(AgentError::BadVersion(buf[0]));
    }
    Ok(Header {
        ty: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
        size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
    })
}

// ── Outbound bodies ──────────────────────────────────────────────

/// Build a complete Format message (header + body).
pub fn encode_format(
    width: u32,
    height: u32,
    codec: VideoCodec,
) -> [u8; HEADER_SIZE + FORMAT_BODY_SIZE] {
    let mut buf = [0u8; HEADER_SIZE + FORMAT_BODY_SIZE];
    buf[..HEADER_SIZE].copy_from_slice(&encode_header(MessageType::Format, FORMAT_BODY_SIZE as u32));
    buf[8..12].copy_from_slice(&width.to_le_bytes());
    buf[12..16].copy_from_slice(&height.to_le_bytes());
    buf[16] = codec.0;
    buf
}

/// Build the header of a Data message; the frame bytes follow verbatim.
pub fn encode_data_header(body_len: u32) -> [u8; HEADER_SIZE] {
    encode_header(MessageType::Data, body_len)
}

/// Build a complete CursorSet message (header + body).
pub fn encode_cursor_set(
    width: u16,
    height: u16,
    hot_x: u16,
    hot_y: u16,
    data: &[u8],
) -> Vec<u8> {
    let body_len = CURSOR_SET_PREFIX + data.len();
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&encode_header(MessageType::CursorSet, body_len as u32));
    buf.extend_from_slice(&width.to_le_bytes());
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&hot_x.to_le_bytes());
    buf.extend_from_slice(&hot_y.to_le_bytes());
    buf.push(CURSOR_TYPE_ALPHA);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(data);
    buf
}

// ── StartStop ────────────────────────────────────────────────────

/// A parsed StartStop request.
///
/// `codecs` preserves the order the client listed them in; an empty list
/// is a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartStop {
    pub codecs: Vec<VideoCodec>,
}

impl StartStop {
    /// Whether the host asked streaming to be on.
    pub fn streaming_requested(&self) -> bool {
        !self.codecs.is_empty()
    }

    /// Parse a StartStop body: `num_codecs` byte, then the codec ids.
    pub fn parse(body: &[u8]) -> Result<Self, AgentError> {
        let num_codecs = *body.first().ok_or(AgentError::Malformed {
            kind: "start/stop",
            reason: "empty body".into(),
        })? as usize;
        if num_codecs > body.len() - 1 {
            return Err(AgentError::Malformed {
                kind: "start/stop",
                reason: format!(
                    "num_codecs={num_codecs} but the body only carries {}",
                    body.len() - 1
                ),
            });
        }
        Ok(StartStop {
            codecs: body[1..=num_codecs].iter().map(|&b| VideoCodec(b)).collect(),
        })
    }

    /// Re-emit the body this request was parsed from.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.codecs.len());
        buf.push(self.codecs.len() as u8);
        buf.extend(self.codecs.iter().map(|c| c.0));
        buf
    }
}

// ── Tests ────────────────────────────────────────────────────────
