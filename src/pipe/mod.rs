//! Byte-level transport over a non-blocking socket.
//!
//! A pipe owns one socket (client) or a listener plus its accepted sockets
//! (server) and surfaces *Connected / Message / Disconnected* events to a
//! handler installed at [`ClientPipe::start`] / [`ServerPipe::start`]. All
//! handlers run on the executor thread; a handler may call back into `send`
//! while an event is being delivered.

mod client;
mod server;

pub use client::ClientPipe;
pub use server::ServerPipe;

use bytes::Bytes;

use crate::error::RouteError;

/// Identifier the server pipe assigns to each accepted connection. Unique
/// within one server process lifetime; numbering starts at 1.
pub type ClientId = u64;

/// Ordered list of byte fragments written back-to-back as one frame.
///
/// Callers queue the routing envelope and the opaque payload as separate
/// fragments; the framing layer emits a single header for the batch.
#[derive(Debug, Clone, Default)]
pub struct SocketBuffer {
    fragments: Vec<Bytes>,
}

impl SocketBuffer {
    /// Append one fragment to the batch.
    pub fn push(&mut self, fragment: Bytes) {
        self.fragments.push(fragment);
    }

    /// Total payload size across all fragments.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }

    pub(crate) fn fragments(&self) -> impl Iterator<Item = &Bytes> {
        self.fragments.iter()
    }
}

impl From<Bytes> for SocketBuffer {
    fn from(fragment: Bytes) -> Self {
        Self {
            fragments: vec![fragment],
        }
    }
}

/// Events emitted by a [`ClientPipe`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The socket finished connecting.
    Connected,
    /// One complete frame payload arrived.
    Message { payload: Bytes },
    /// The pipe terminated; emitted at most once. `None` means the peer
    /// closed cleanly.
    Disconnected { error: Option<RouteError> },
}

/// Events emitted by a [`ServerPipe`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new client connection was accepted.
    Connected { client_id: ClientId },
    /// One complete frame payload arrived from a client.
    Message { client_id: ClientId, payload: Bytes },
    /// A client connection terminated; emitted at most once per client.
    Disconnected {
        client_id: ClientId,
        error: Option<RouteError>,
    },
}

/// Handler invoked for every [`ClientEvent`].
pub type ClientEventHandler = Box<dyn FnMut(ClientEvent)>;

/// Handler invoked for every [`ServerEvent`].
pub type ServerEventHandler = Box<dyn FnMut(ServerEvent)>;

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::SocketBuffer;

    #[rstest]
    fn batches_accumulate_fragments_in_order() {
        let mut buffer = SocketBuffer::from(Bytes::from_static(b"prefix"));
        buffer.push(Bytes::from_static(b"payload"));

        assert_eq!(buffer.total_len(), 13);
        let joined: Vec<u8> = buffer.fragments().flat_map(|f| f.iter().copied()).collect();
        assert_eq!(joined, b"prefixpayload");
    }
}
