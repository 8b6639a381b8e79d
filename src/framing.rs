//! Wire framing: a fixed `{signature, length}` header in front of every
//! payload.
//!
//! The decoder and encoder plug into `tokio_util`'s framed halves. Any
//! violation of the frame grammar is fatal for the connection: a wrong
//! signature, a zero or oversized length, or a stream that ends in the middle
//! of a frame.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::pipe::SocketBuffer;

/// Signature expected at offset 0 of every frame, little-endian.
pub const FRAME_SIGNATURE: u32 = 0x5356_434F;

/// Header size: signature plus payload length, both `u32` little-endian.
pub const HEADER_SIZE: usize = 8;

/// Maximum frame payload size (1 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// Splits the inbound byte stream into frame payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..HEADER_SIZE];
        let signature = header.get_u32_le();
        let len = header.get_u32_le() as usize;

        if signature != FRAME_SIGNATURE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad frame signature {signature:#010x}"),
            ));
        }
        if len == 0 || len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} out of bounds"),
            ));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )),
        }
    }
}

/// Wraps an ordered fragment batch into one frame.
///
/// The fragments (envelope prefix, then opaque payload) are written
/// back-to-back after a single header; the framed writer loops until the
/// whole frame is flushed.
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl Encoder<SocketBuffer> for FrameEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: SocketBuffer, dst: &mut BytesMut) -> io::Result<()> {
        let len = item.total_len();
        if len == 0 || len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} out of bounds"),
            ));
        }

        dst.reserve(HEADER_SIZE + len);
        dst.put_u32_le(FRAME_SIGNATURE);
        dst.put_u32_le(len as u32);
        for fragment in item.fragments() {
            dst.put_slice(fragment);
        }
        Ok(())
    }
}
