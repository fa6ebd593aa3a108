//! Wire framing for the TCP transport.
//!
//! Each frame is a JSON document inside a 4-byte big-endian length prefix.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::TransportError;
use crate::storage::DatabaseSnapshot;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Discovery request from a scanner.
    Probe { service_id: String },
    /// Discovery answer from an advertiser.
    Announce {
        service_id: String,
        device_id: String,
        display_name: String,
    },
    /// Link request.
    Hello {
        service_id: String,
        device_id: String,
        display_name: String,
    },
    /// Link accepted.
    Welcome { device_id: String },
    /// Full database payload.
    Snapshot { snapshot: DatabaseSnapshot },
    /// Payload stored by the receiver.
    Ack,
    /// Request refused, with the reason.
    Reject { reason: String },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Probe { .. } => "probe",
            Frame::Announce { .. } => "announce",
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Snapshot { .. } => "snapshot",
            Frame::Ack => "ack",
            Frame::Reject { .. } => "reject",
        }
    }
}

#[derive(Debug)]
pub struct FrameCodec {
    length_codec: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self
            .length_codec
            .decode(src)
            .map_err(|e| TransportError::Protocol(e.to_string()))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| TransportError::Protocol(format!("malformed frame: {}", e)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| TransportError::Protocol(format!("unencodable frame: {}", e)))?;

        self.length_codec
            .encode(Bytes::from(json), dst)
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}
