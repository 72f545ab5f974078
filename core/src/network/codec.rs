//! Replication frame codec
//!
//! Frame layout: `u32 big-endian payload length | u8 flags | payload`.
//! The payload is a CBOR message, LZ4-compressed when flag bit 0 is set.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use lz4::{Decoder, EncoderBuilder};
use std::io::{Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Payloads at least this large are compressed
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;

/// Largest payload accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const FLAG_LZ4: u8 = 0b0000_0001;
const HEADER_LEN: usize = 5;

/// Compress data using LZ4
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = EncoderBuilder::new()
        .level(4)
        .build(Vec::new())
        .map_err(|e| Error::Serialization(format!("Failed to create LZ4 encoder: {}", e)))?;

    encoder
        .write_all(data)
        .map_err(|e| Error::Serialization(format!("Failed to compress frame: {}", e)))?;

    let (compressed, result) = encoder.finish();
    result.map_err(|e| Error::Serialization(format!("Failed to finish compression: {}", e)))?;

    Ok(compressed)
}

/// Decompress LZ4-compressed data, refusing output larger than `MAX_FRAME_LEN`
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    decompress_bounded(compressed, MAX_FRAME_LEN)
}

fn decompress_bounded(compressed: &[u8], limit: usize) -> Result<Vec<u8>> {
    let decoder = Decoder::new(compressed)
        .map_err(|e| Error::Serialization(format!("Failed to create LZ4 decoder: {}", e)))?;

    let mut decompressed = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::Serialization(format!("Failed to decompress frame: {}", e)))?;

    if decompressed.len() > limit {
        return Err(Error::Serialization(format!(
            "decompressed frame exceeds {} bytes",
            limit
        )));
    }
    Ok(decompressed)
}

/// Encode a message into a complete frame
pub fn encode_frame<T: minicbor::Encode<()>>(message: &T) -> Result<Bytes> {
    let body = minicbor::to_vec(message)?;
    let (flags, payload) = if body.len() >= COMPRESSION_THRESHOLD {
        (FLAG_LZ4, compress(&body)?)
    } else {
        (0, body)
    };

    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_u8(flags);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Decode a frame payload given its flags byte
pub fn decode_payload<T>(flags: u8, payload: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    if flags & !FLAG_LZ4 != 0 {
        return Err(Error::Serialization(format!("unknown frame flags {:#04x}", flags)));
    }
    if flags & FLAG_LZ4 != 0 {
        let body = decompress(payload)?;
        Ok(minicbor::decode(&body)?)
    } else {
        Ok(minicbor::decode(payload)?)
    }
}

/// Decode one complete frame held in memory
pub fn decode_frame<T>(frame: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    if frame.len() < HEADER_LEN {
        return Err(Error::Serialization("truncated frame header".into()));
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Serialization(format!(
            "frame length {} does not match payload of {} bytes",
            len,
            payload.len()
        )));
    }
    decode_payload(frame[4], payload)
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: minicbor::Encode<()>,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// A frame read off the stream, not yet decoded
#[derive(Debug)]
pub enum Frame {
    Payload { flags: u8, payload: Vec<u8> },
    /// Header announced more than `MAX_FRAME_LEN`; the payload was left unread
    Oversized(usize),
}

impl Frame {
    pub fn decode<T>(&self) -> Result<T>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self {
            Frame::Payload { flags, payload } => decode_payload(*flags, payload),
            Frame::Oversized(len) => Err(Error::Serialization(format!(
                "frame of {} bytes exceeds limit",
                len
            ))),
        }
    }
}

/// Read one raw frame; `None` when the peer closed the stream between frames
///
/// Only I/O failures are errors here, so callers can tell a broken stream
/// from a frame that arrived intact but does not decode.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Some(Frame::Oversized(len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame::Payload {
        flags: header[4],
        payload,
    }))
}

/// Read and decode one message; `None` when the peer closed the stream
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: tokio::io::AsyncRead + Unpin,
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match read_frame(reader).await? {
        Some(frame) => frame.decode().map(Some),
        None => Ok(None),
    }
}
