//! Frame types and the fixed-size header codec.
//!
//! ## Wire Format
//!
//! Every frame is a 9-byte header followed by an optional payload:
//!
//! ```text
//! ┌───────────────┬─────────────────┬─────────────────────┬──────────────┐
//! │ Code (1B)     │ Channel (4B BE) │ Payload len (4B BE) │ Payload      │
//! └───────────────┴─────────────────┴─────────────────────┴──────────────┘
//! ```
//!
//! Only `Offer` and `Content` frames carry a payload; the payload of an
//! `Offer` is the UTF-8 channel name (empty for anonymous channels) and the
//! payload of `Content` is application bytes. The payload length is capped
//! at [`MAX_PAYLOAD_SIZE`]; larger writes are split across frames.

use crate::error::MuxError;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 9;

/// Maximum payload length of a single frame.
pub const MAX_PAYLOAD_SIZE: usize = 20480;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Offer a new channel (payload: UTF-8 channel name, may be empty).
    Offer = 1,
    /// Accept a previously offered channel.
    OfferAccepted = 2,
    /// Application bytes for an accepted channel.
    Content = 3,
    /// The sender will write no further content on this channel.
    ContentWritingCompleted = 4,
    /// The channel is terminated (offer withdrawn, rejected, or disposed).
    ChannelTerminated = 5,
}

impl ControlCode {
    /// Map a wire byte to a control code. Unknown values return `None` and
    /// are skipped by the reader for forward compatibility.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ControlCode::Offer),
            2 => Some(ControlCode::OfferAccepted),
            3 => Some(ControlCode::Content),
            4 => Some(ControlCode::ContentWritingCompleted),
            5 => Some(ControlCode::ChannelTerminated),
            _ => None,
        }
    }

    /// Whether frames of this code may carry a payload.
    pub fn allows_payload(self) -> bool {
        matches!(self, ControlCode::Offer | ControlCode::Content)
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw control code byte. Decoded with [`ControlCode::from_u8`] at
    /// dispatch so unknown codes survive decoding.
    pub code: u8,
    /// Channel the frame belongs to.
    pub channel_id: u32,
    /// Number of payload bytes following the header.
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(code: ControlCode, channel_id: u32, payload_length: u32) -> Self {
        Self {
            code: code as u8,
            channel_id,
            payload_length,
        }
    }

    /// The control code, if it is one this implementation knows.
    pub fn control_code(&self) -> Option<ControlCode> {
        ControlCode::from_u8(self.code)
    }
}

/// Encode a frame header into its 9-byte wire form.
pub fn encode_header(code: ControlCode, channel_id: u32, payload_length: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = code as u8;
    buf[1..5].copy_from_slice(&channel_id.to_be_bytes());
    buf[5..9].copy_from_slice(&payload_length.to_be_bytes());
    buf
}

/// Decode and validate a frame header.
///
/// Rejects payload lengths above [`MAX_PAYLOAD_SIZE`] and non-zero payload
/// lengths on known codes that forbid payloads. Both are protocol errors
/// that dispose the stream.
pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<FrameHeader, MuxError> {
    let code = buf[0];
    let channel_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let payload_length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

    if payload_length as usize > MAX_PAYLOAD_SIZE {
        return Err(MuxError::MalformedFrame(format!(
            "payload length {} exceeds maximum {}",
            payload_length, MAX_PAYLOAD_SIZE
        )));
    }

    if let Some(known) = ControlCode::from_u8(code) {
        if payload_length != 0 && !known.allows_payload() {
            return Err(MuxError::MalformedFrame(format!(
                "control code {:?} must not carry a payload (got {} bytes)",
                known, payload_length
            )));
        }
    }

    Ok(FrameHeader {
        code,
        channel_id,
        payload_length,
    })
}
