//! Raw per-endpoint capability.
//!
//! A gateway is the envelope-level handle for one logical channel: it sends
//! opaque payloads, observes events, and releases its tag when completed or
//! dropped. [`crate::channel::Channel`] layers typed encode/decode on top.

use bytes::Bytes;

use crate::error::{Result, RouteError};
use crate::service::ServiceId;

/// Channel tag allocated by the client router. Unique within one client
/// process lifetime; tag `0` is reserved for the handshake slot.
pub type Tag = u64;

/// Events delivered to a gateway, in per-endpoint order: `Connected`, then
/// `Message`s with strictly increasing sequences, then one terminal
/// `Completed`.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The routing handshake completed.
    Connected,
    /// One inbound channel message.
    Message { sequence: u64, payload: Bytes },
    /// Terminal event; nothing follows it. `None` means a graceful close.
    Completed { error: Option<RouteError> },
}

/// Handler installed on a gateway.
pub type GatewayEventHandler = Box<dyn FnMut(GatewayEvent)>;

/// Capability interface of a per-endpoint handle.
pub trait Gateway {
    /// Send one opaque payload, prefixed with the channel envelope carrying
    /// `service_id`, this gateway's tag, and the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotConnected`] when the router is not connected
    /// to its peer.
    fn send(&self, service_id: ServiceId, payload: Bytes) -> Result<()>;

    /// Install the event handler and register the endpoint with the router.
    ///
    /// On the client side a registration made while the router is already
    /// connected is told `Connected` immediately.
    fn subscribe(&self, handler: GatewayEventHandler);

    /// Terminate the endpoint: notify the peer with a `ChannelEnd` when
    /// connected, remove the endpoint from the router, and deliver the
    /// terminal `Completed` locally.
    fn complete(&self, error: Option<RouteError>);

    /// Tag of this endpoint.
    fn tag(&self) -> Tag;
}
