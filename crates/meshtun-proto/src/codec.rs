//! Codec for encoding/decoding tunnel frames
//!
//! Format: `[length: u32 BE][command: u8][payload]`. The length covers the
//! payload only, so an empty heartbeat is exactly [`HEADER_SIZE`] bytes.

use crate::{HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream ended in the middle of a frame")]
    Truncated,

    #[error("Stream closed")]
    Closed,

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Command identifiers carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ClientAuthorize,
    ServerAuthorize,
    ClientHeartbeat,
    ServerHeartbeat,
    TunnelData,
    /// Accepted by the framing layer, left to callers to reject
    Unknown(u8),
}

impl Command {
    pub fn as_u8(self) -> u8 {
        match self {
            Command::ClientAuthorize => 0x01,
            Command::ServerAuthorize => 0x02,
            Command::ClientHeartbeat => 0x03,
            Command::ServerHeartbeat => 0x04,
            Command::TunnelData => 0x05,
            Command::Unknown(value) => value,
        }
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Command::ClientAuthorize,
            0x02 => Command::ServerAuthorize,
            0x03 => Command::ClientHeartbeat,
            0x04 => Command::ServerHeartbeat,
            0x05 => Command::TunnelData,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command.as_u8()
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn data(packet: impl Into<Bytes>) -> Self {
        Self::new(Command::TunnelData, packet)
    }

    pub fn client_heartbeat() -> Self {
        Self::new(Command::ClientHeartbeat, Bytes::new())
    }

    pub fn server_heartbeat() -> Self {
        Self::new(Command::ServerHeartbeat, Bytes::new())
    }

    /// Build a frame whose payload is the JSON encoding of `value`
    pub fn json<T: Serialize>(command: Command, value: &T) -> Result<Self, CodecError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(command, payload))
    }

    /// Parse the payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(self.command, &self.payload)
    }
}

/// Encode a frame to bytes
pub fn encode(command: Command, payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(command.as_u8());
    buf.extend_from_slice(payload);

    Ok(buf.freeze())
}

/// Decode a frame from a buffer
///
/// Returns Ok(Some(frame)) if a complete frame was decoded,
/// Ok(None) if more data is needed,
/// Err on an oversized frame
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&buf[..4]);
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }

    if buf.len() < HEADER_SIZE + length {
        buf.reserve(HEADER_SIZE + length - buf.len());
        return Ok(None);
    }

    buf.advance(4);
    let command = Command::from(buf.get_u8());
    let payload = buf.split_to(length).freeze();

    Ok(Some(Frame { command, payload }))
}

/// Read exactly one frame from an ordered byte stream
///
/// Blocks until the frame is complete. A stream that ends cleanly between
/// frames yields [`CodecError::Closed`]; one that ends inside a frame yields
/// [`CodecError::Truncated`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                CodecError::Closed
            } else {
                CodecError::Truncated
            });
        }
        filled += n;
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }
    let command = Command::from(header[4]);

    let mut payload = BytesMut::zeroed(length);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CodecError::Truncated,
            _ => CodecError::Io(e),
        })?;

    Ok(Frame {
        command,
        payload: payload.freeze(),
    })
}

/// `tokio_util` adapter so frames can be used with `Framed`
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::FrameTooLarge(frame.payload.len()));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_u8(frame.command.as_u8());
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
