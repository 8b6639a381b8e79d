//! Routing envelope codec.
//!
//! Every frame starts with a serialized [`RouteEnvelope`]; the remainder of
//! the frame is the opaque service payload. The decoder reports how many
//! bytes the envelope consumed so the caller can split the two.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RouteError};

/// Routing protocol version sent in `Connect`.
pub const VERSION_MAJOR: u16 = 1;
/// Routing protocol minor version.
pub const VERSION_MINOR: u16 = 0;

const KIND_EMPTY: u8 = 0;
const KIND_CONNECT: u8 = 1;
const KIND_CHANNEL_MSG: u8 = 2;
const KIND_CHANNEL_END: u8 = 3;

/// Routing metadata prefixed to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEnvelope {
    /// Placeholder decoded from unknown envelope kinds; always ignored.
    Empty,
    /// Version handshake, sent by the client once the pipe connects and
    /// echoed back by the server.
    Connect {
        major: u16,
        minor: u16,
    },
    /// Channel payload prefix; the service payload follows the envelope.
    ChannelMsg {
        service_id: u64,
        tag: u64,
        sequence: u64,
    },
    /// Final frame for an endpoint. `error_code == 0` means a graceful close.
    ChannelEnd {
        tag: u64,
        error_code: i32,
    },
}

impl RouteEnvelope {
    /// Serialize into a standalone prefix buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match *self {
            Self::Empty => buf.put_u8(KIND_EMPTY),
            Self::Connect { major, minor } => {
                buf.put_u8(KIND_CONNECT);
                buf.put_u16_le(major);
                buf.put_u16_le(minor);
            }
            Self::ChannelMsg {
                service_id,
                tag,
                sequence,
            } => {
                buf.put_u8(KIND_CHANNEL_MSG);
                buf.put_u64_le(service_id);
                buf.put_u64_le(tag);
                buf.put_u64_le(sequence);
            }
            Self::ChannelEnd { tag, error_code } => {
                buf.put_u8(KIND_CHANNEL_END);
                buf.put_u64_le(tag);
                buf.put_i32_le(error_code);
            }
        }
        buf.freeze()
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Empty => 0,
            Self::Connect { .. } => 4,
            Self::ChannelMsg { .. } => 24,
            Self::ChannelEnd { .. } => 12,
        }
    }

    /// Decode an envelope from the front of `frame`.
    ///
    /// Returns the envelope and the number of bytes it consumed; the service
    /// payload is `frame[consumed..]`. Unknown envelope kinds decode to
    /// [`RouteEnvelope::Empty`] consuming the whole frame, so newer peers can
    /// introduce envelope kinds without breaking older ones.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidArgument`] if the frame is empty or a
    /// known envelope kind is truncated.
    pub fn decode(frame: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = frame;
        if !cursor.has_remaining() {
            return Err(RouteError::InvalidArgument);
        }

        let envelope = match cursor.get_u8() {
            KIND_EMPTY => Self::Empty,
            KIND_CONNECT => {
                if cursor.remaining() < 4 {
                    return Err(RouteError::InvalidArgument);
                }
                Self::Connect {
                    major: cursor.get_u16_le(),
                    minor: cursor.get_u16_le(),
                }
            }
            KIND_CHANNEL_MSG => {
                if cursor.remaining() < 24 {
                    return Err(RouteError::InvalidArgument);
                }
                Self::ChannelMsg {
                    service_id: cursor.get_u64_le(),
                    tag: cursor.get_u64_le(),
                    sequence: cursor.get_u64_le(),
                }
            }
            KIND_CHANNEL_END => {
                if cursor.remaining() < 12 {
                    return Err(RouteError::InvalidArgument);
                }
                Self::ChannelEnd {
                    tag: cursor.get_u64_le(),
                    error_code: cursor.get_i32_le(),
                }
            }
            _ => return Ok((Self::Empty, frame.len())),
        };
        Ok((envelope, frame.len() - cursor.remaining()))
    }
}
