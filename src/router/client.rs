//! Client-side router: allocates tags, drives the handshake, and
//! demultiplexes envelopes to per-endpoint gateways.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use log::{debug, warn};

use crate::channel::{Channel, ServiceMessage};
use crate::envelope::{RouteEnvelope, VERSION_MAJOR, VERSION_MINOR};
use crate::error::{Result, RouteError};
use crate::gateway::{Gateway, GatewayEvent, GatewayEventHandler, Tag};
use crate::pipe::{ClientEvent, ClientPipe, SocketBuffer};
use crate::service::{self, ServiceId};

/// Client end of the routing layer.
///
/// Cheap to clone; all clones share one pipe and one endpoint map. The
/// router is *connected* once the pipe is up **and** the server has answered
/// the `Connect` handshake.
#[derive(Clone)]
pub struct ClientRouter {
    inner: Rc<RouterInner>,
}

struct RouterInner {
    pipe: ClientPipe,
    last_tag: Cell<Tag>,
    connected: Cell<bool>,
    endpoints: RefCell<HashMap<Tag, Weak<GatewayState>>>,
}

impl ClientRouter {
    /// Create a router over an idle pipe.
    #[must_use]
    pub fn new(pipe: ClientPipe) -> Self {
        Self {
            inner: Rc::new(RouterInner {
                pipe,
                last_tag: Cell::new(0),
                connected: Cell::new(false),
                endpoints: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Start the pipe; on pipe connect the router sends the version
    /// handshake and waits for the server's reply before reporting
    /// `Connected` to gateways.
    ///
    /// # Errors
    ///
    /// Propagates pipe start failures.
    pub fn start(&self) -> Result<()> {
        let weak = Rc::downgrade(&self.inner);
        self.inner.pipe.start(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_pipe_event(event);
            }
        }))
    }

    /// Allocate the next tag and return a raw endpoint handle bound to this
    /// router.
    #[must_use]
    pub fn make_gateway(&self) -> Rc<dyn Gateway> {
        let tag = self.inner.last_tag.get() + 1;
        self.inner.last_tag.set(tag);
        debug!("gateway created (tag={tag})");
        GatewayState::create(Rc::clone(&self.inner), tag)
    }

    /// Allocate a typed channel for `service_name`.
    ///
    /// The service identity is derived from the name and the outbound
    /// message type, which is the server's input type.
    #[must_use]
    pub fn make_channel<I, O>(&self, service_name: &str) -> Channel<I, O>
    where
        I: ServiceMessage,
        O: ServiceMessage,
    {
        let service_id = service::service_id(service_name, O::TYPE_NAME);
        Channel::new(self.make_gateway(), service_id)
    }

    /// Whether the routing handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.borrow().len()
    }
}

impl RouterInner {
    fn handle_pipe_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => self.send_connect(),
            ClientEvent::Message { payload } => self.handle_message(payload),
            ClientEvent::Disconnected { error } => self.handle_disconnected(error),
        }
    }

    fn send_connect(&self) {
        let envelope = RouteEnvelope::Connect {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        };
        if let Err(err) = self.pipe.send(SocketBuffer::from(envelope.encode())) {
            warn!("failed to send handshake: {err}");
        }
    }

    fn handle_message(&self, payload: Bytes) {
        let (envelope, consumed) = match RouteEnvelope::decode(&payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("closing pipe on undecodable envelope");
                self.pipe.close();
                self.handle_disconnected(Some(err));
                return;
            }
        };
        match envelope {
            RouteEnvelope::Empty => {}
            RouteEnvelope::Connect { major, minor } => self.handle_connect(major, minor),
            RouteEnvelope::ChannelMsg { tag, sequence, .. } => {
                self.handle_channel_msg(tag, sequence, payload.slice(consumed..));
            }
            RouteEnvelope::ChannelEnd { tag, error_code } => {
                self.handle_channel_end(tag, error_code);
            }
        }
    }

    fn handle_connect(&self, major: u16, minor: u16) {
        if self.connected.replace(true) {
            return;
        }
        debug!("routing connection established (peer version {major}.{minor})");
        for gateway in self.snapshot() {
            gateway.emit(GatewayEvent::Connected);
        }
    }

    fn handle_channel_msg(&self, tag: Tag, sequence: u64, payload: Bytes) {
        match self.lookup(tag) {
            Some(gateway) => gateway.emit(GatewayEvent::Message { sequence, payload }),
            None => debug!("dropping unsolicited channel message (tag={tag}, sequence={sequence})"),
        }
    }

    fn handle_channel_end(&self, tag: Tag, error_code: i32) {
        let removed = self.endpoints.borrow_mut().remove(&tag);
        match removed.and_then(|weak| weak.upgrade()) {
            Some(gateway) => gateway.finish(RouteError::from_wire(error_code)),
            None => debug!("dropping channel end for unknown endpoint (tag={tag})"),
        }
    }

    fn handle_disconnected(&self, error: Option<RouteError>) {
        if !self.connected.replace(false) {
            debug!("pipe disconnected before routing connection");
            return;
        }
        let error = Some(error.unwrap_or(RouteError::Canceled));
        let gateways: Vec<Rc<GatewayState>> = self
            .endpoints
            .borrow_mut()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        debug!("pipe disconnected; completing {} endpoint(s)", gateways.len());
        for gateway in gateways {
            gateway.finish(error);
        }
    }

    /// Strong handles to every live gateway. Taken before delivery so a
    /// handler may mutate the map.
    fn snapshot(&self) -> Vec<Rc<GatewayState>> {
        self.endpoints
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Live gateway for `tag`, pruning a dead entry on the way.
    fn lookup(&self, tag: Tag) -> Option<Rc<GatewayState>> {
        let mut endpoints = self.endpoints.borrow_mut();
        match endpoints.get(&tag).map(Weak::upgrade) {
            Some(Some(gateway)) => Some(gateway),
            Some(None) => {
                endpoints.remove(&tag);
                None
            }
            None => None,
        }
    }

    fn send_channel_end(&self, tag: Tag, error: Option<RouteError>) {
        let envelope = RouteEnvelope::ChannelEnd {
            tag,
            error_code: error.map_or(0, RouteError::to_wire),
        };
        if let Err(err) = self.pipe.send(SocketBuffer::from(envelope.encode())) {
            debug!("failed to send channel end (tag={tag}): {err}");
        }
    }
}

/// Endpoint state shared between the user handle and the router's weak map
/// entry.
struct GatewayState {
    router: Rc<RouterInner>,
    tag: Tag,
    sequence: Cell<u64>,
    handler: RefCell<Option<GatewayEventHandler>>,
    /// Set once the terminal `Completed` was delivered (or the endpoint was
    /// completed locally); suppresses the `ChannelEnd` normally sent on
    /// drop.
    closed: Cell<bool>,
    weak_self: Weak<GatewayState>,
}

impl GatewayState {
    fn create(router: Rc<RouterInner>, tag: Tag) -> Rc<dyn Gateway> {
        Rc::new_cyclic(|weak_self| Self {
            router,
            tag,
            sequence: Cell::new(0),
            handler: RefCell::new(None),
            closed: Cell::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Invoke the handler with `event`, tolerating reentrant `complete` or
    /// re-`subscribe` from inside the handler.
    fn emit(&self, event: GatewayEvent) {
        let Some(mut handler) = self.handler.borrow_mut().take() else {
            return;
        };
        handler(event);
        let mut slot = self.handler.borrow_mut();
        if slot.is_none() && !self.closed.get() {
            *slot = Some(handler);
        }
    }

    /// Deliver the terminal `Completed` and drop the handler: nothing may
    /// follow it.
    fn finish(&self, error: Option<RouteError>) {
        if self.closed.replace(true) {
            return;
        }
        let handler = self.handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            handler(GatewayEvent::Completed { error });
        }
    }
}

impl Gateway for GatewayState {
    fn send(&self, service_id: ServiceId, payload: Bytes) -> Result<()> {
        if !self.router.connected.get() {
            return Err(RouteError::NotConnected);
        }
        let envelope = RouteEnvelope::ChannelMsg {
            service_id,
            tag: self.tag,
            sequence: self.sequence.get(),
        };
        let mut buffer = SocketBuffer::from(envelope.encode());
        buffer.push(payload);
        self.router.pipe.send(buffer)?;
        self.sequence.set(self.sequence.get() + 1);
        Ok(())
    }

    fn subscribe(&self, handler: GatewayEventHandler) {
        *self.handler.borrow_mut() = Some(handler);
        self.router
            .endpoints
            .borrow_mut()
            .insert(self.tag, self.weak_self.clone());
        if self.router.connected.get() {
            self.emit(GatewayEvent::Connected);
        }
    }

    fn complete(&self, error: Option<RouteError>) {
        if self.closed.get() {
            return;
        }
        self.router.endpoints.borrow_mut().remove(&self.tag);
        if self.router.connected.get() {
            self.router.send_channel_end(self.tag, error);
        }
        self.finish(error);
    }

    fn tag(&self) -> Tag {
        self.tag
    }
}

impl Drop for GatewayState {
    fn drop(&mut self) {
        self.router.endpoints.borrow_mut().remove(&self.tag);
        if !self.closed.get() && self.router.connected.get() {
            self.router.send_channel_end(self.tag, None);
        }
        debug!("gateway dropped (tag={})", self.tag);
    }
}
