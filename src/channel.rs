//! Typed channel over a raw gateway.

use std::marker::PhantomData;
use std::rc::Rc;

use bincode::{config, decode_from_slice, encode_to_vec};
use bytes::Bytes;
use log::debug;

use crate::error::{Result, RouteError};
use crate::gateway::{Gateway, GatewayEvent, Tag};
use crate::service::ServiceId;

/// Message type usable as a channel input or output.
///
/// `TYPE_NAME` is the stable schema identity hashed into the [`ServiceId`];
/// renaming it is a wire-breaking change. Payload bytes use bincode's
/// standard configuration.
pub trait ServiceMessage: bincode::Encode + bincode::Decode<()> + 'static {
    /// Stable fully qualified schema name.
    const TYPE_NAME: &'static str;

    /// Serialize with the standard configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidArgument`] when encoding fails.
    fn encode(&self) -> Result<Vec<u8>> {
        encode_to_vec(self, config::standard()).map_err(|err| {
            debug!("failed to encode {}: {err}", Self::TYPE_NAME);
            RouteError::InvalidArgument
        })
    }

    /// Deserialize from a payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidArgument`] when decoding fails.
    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_from_slice(bytes, config::standard())
            .map(|(message, _)| message)
            .map_err(|err| {
                debug!("failed to decode {}: {err}", Self::TYPE_NAME);
                RouteError::InvalidArgument
            })
    }
}

/// Typed per-channel events, in delivery order: `Connected`, zero or more
/// `Input`s, then one terminal `Completed`.
#[derive(Debug)]
pub enum ChannelEvent<I> {
    /// The routing handshake completed (client side; implicit on the
    /// server, where the factory is invoked with the first input instead).
    Connected,
    /// One decoded inbound message.
    Input(I),
    /// Terminal event. `None` means a graceful close.
    Completed(Option<RouteError>),
}

/// Typed wrapper over a [`Gateway`]: encodes `O` outbound and decodes `I`
/// inbound.
///
/// Clones share the underlying endpoint; when the last handle drops, the tag
/// is released and, while connected, a graceful `ChannelEnd` is sent to the
/// peer.
pub struct Channel<I, O> {
    gateway: Rc<dyn Gateway>,
    service_id: ServiceId,
    _types: PhantomData<(I, O)>,
}

impl<I, O> Clone for Channel<I, O> {
    fn clone(&self) -> Self {
        Self {
            gateway: Rc::clone(&self.gateway),
            service_id: self.service_id,
            _types: PhantomData,
        }
    }
}

impl<I, O> Channel<I, O>
where
    I: ServiceMessage,
    O: ServiceMessage,
{
    pub(crate) fn new(gateway: Rc<dyn Gateway>, service_id: ServiceId) -> Self {
        Self {
            gateway,
            service_id,
            _types: PhantomData,
        }
    }

    /// Encode and send one outbound message.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotConnected`] when the router is disconnected
    /// and [`RouteError::InvalidArgument`] when encoding fails.
    pub fn send(&self, message: &O) -> Result<()> {
        let payload = ServiceMessage::encode(message)?;
        self.gateway.send(self.service_id, Bytes::from(payload))
    }

    /// Install the event handler for this channel.
    ///
    /// The handler receives each event together with a channel borrow so it
    /// can reply or complete without capturing its own handle. An inbound
    /// payload that fails to decode completes the channel with
    /// `InvalidArgument`.
    pub fn subscribe<F>(&self, mut handler: F)
    where
        F: FnMut(ChannelEvent<I>, &Channel<I, O>) + 'static,
    {
        let weak = Rc::downgrade(&self.gateway);
        let service_id = self.service_id;
        self.gateway.subscribe(Box::new(move |event| {
            let Some(gateway) = weak.upgrade() else { return };
            let channel = Channel::<I, O>::new(gateway, service_id);
            let typed = match event {
                GatewayEvent::Connected => ChannelEvent::Connected,
                GatewayEvent::Message { payload, .. } => match <I as ServiceMessage>::decode(&payload) {
                    Ok(input) => ChannelEvent::Input(input),
                    Err(err) => {
                        debug!(
                            "completing channel on undecodable input (tag={})",
                            channel.tag()
                        );
                        handler(ChannelEvent::Completed(Some(err)), &channel);
                        channel.complete(Some(err));
                        return;
                    }
                },
                GatewayEvent::Completed { error } => ChannelEvent::Completed(error),
            };
            handler(typed, &channel);
        }));
    }

    /// Terminate the channel, notifying the peer when connected.
    ///
    /// Cancellation is `complete(Some(RouteError::Canceled))`.
    pub fn complete(&self, error: Option<RouteError>) {
        self.gateway.complete(error);
    }

    /// Tag of the underlying endpoint.
    #[must_use]
    pub fn tag(&self) -> Tag {
        self.gateway.tag()
    }
}
