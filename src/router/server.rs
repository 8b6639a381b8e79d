//! Server-side router: registers channel factories and dispatches the first
//! message of every channel to the matching factory.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::channel::{Channel, ServiceMessage};
use crate::envelope::{RouteEnvelope, VERSION_MAJOR, VERSION_MINOR};
use crate::error::{Result, RouteError};
use crate::gateway::{Gateway, GatewayEvent, GatewayEventHandler, Tag};
use crate::pipe::{ClientId, ServerEvent, ServerPipe, SocketBuffer};
use crate::service::{self, ServiceId};

/// Server-side endpoint identity: which client, which tag.
type Endpoint = (ClientId, Tag);

/// Type-erased channel factory invoked with a fresh gateway and the first
/// input payload. Shared so a factory may register further services while it
/// runs.
type ChannelFactory = Rc<RefCell<dyn FnMut(Rc<dyn Gateway>, Bytes)>>;

/// Server end of the routing layer.
///
/// Cheap to clone; all clones share one pipe, one endpoint map, and one
/// factory registry.
#[derive(Clone)]
pub struct ServerRouter {
    inner: Rc<RouterInner>,
}

struct RouterInner {
    pipe: ServerPipe,
    endpoints: RefCell<HashMap<Endpoint, Weak<GatewayState>>>,
    factories: RefCell<HashMap<ServiceId, ChannelFactory>>,
    weak_self: Weak<RouterInner>,
}

impl ServerRouter {
    /// Create a router over an idle pipe.
    #[must_use]
    pub fn new(pipe: ServerPipe) -> Self {
        Self {
            inner: Rc::new_cyclic(|weak_self| RouterInner {
                pipe,
                endpoints: RefCell::new(HashMap::new()),
                factories: RefCell::new(HashMap::new()),
                weak_self: weak_self.clone(),
            }),
        }
    }

    /// Register the handler invoked for every new channel of `service_name`.
    ///
    /// The service identity is derived from the name and the input type.
    /// When the first message of an unknown `(client, tag)` endpoint names
    /// this service, the payload is decoded as `I` and the handler receives
    /// a fresh typed channel together with that first input. Dropping the
    /// channel without subscribing closes the endpoint again.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::AlreadyExists`] if the service is already
    /// registered.
    pub fn register_channel<I, O, H>(&self, service_name: &str, mut handler: H) -> Result<()>
    where
        I: ServiceMessage,
        O: ServiceMessage,
        H: FnMut(Channel<I, O>, I) + 'static,
    {
        let service_id = service::service_id(service_name, I::TYPE_NAME);
        let name = service_name.to_owned();
        let factory = Rc::new(RefCell::new(move |gateway: Rc<dyn Gateway>, payload: Bytes| {
            match <I as ServiceMessage>::decode(&payload) {
                Ok(input) => handler(Channel::new(gateway, service_id), input),
                Err(_) => debug!("dropping channel request with undecodable input (service={name})"),
            }
        }));

        let mut factories = self.inner.factories.borrow_mut();
        if factories.contains_key(&service_id) {
            warn!("service '{service_name}' is already registered");
            return Err(RouteError::AlreadyExists);
        }
        factories.insert(service_id, factory);
        debug!("service '{service_name}' registered (id={service_id:#018x})");
        Ok(())
    }

    /// Bind, listen, and start serving clients.
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

    /// Number of currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.pipe.client_count()
    }

    /// Number of registered endpoints across all clients.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.borrow().len()
    }
}

impl RouterInner {
    fn handle_pipe_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { client_id } => {
                // The routing connection is established lazily, by the
                // client's `Connect` envelope.
                info!("client pipe connected (id={client_id})");
            }
            ServerEvent::Message { client_id, payload } => self.handle_message(client_id, payload),
            ServerEvent::Disconnected { client_id, error } => {
                info!("client pipe disconnected (id={client_id})");
                self.complete_client(client_id, Some(error.unwrap_or(RouteError::Canceled)));
            }
        }
    }

    fn handle_message(&self, client_id: ClientId, payload: Bytes) {
        let (envelope, consumed) = match RouteEnvelope::decode(&payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("dropping client on undecodable envelope (id={client_id})");
                self.pipe.close_client(client_id);
                self.complete_client(client_id, Some(err));
                return;
            }
        };
        match envelope {
            RouteEnvelope::Empty => {}
            RouteEnvelope::Connect { major, minor } => self.handle_connect(client_id, major, minor),
            RouteEnvelope::ChannelMsg {
                service_id,
                tag,
                sequence,
            } => {
                self.handle_channel_msg(client_id, service_id, tag, sequence, payload.slice(consumed..));
            }
            RouteEnvelope::ChannelEnd { tag, error_code } => {
                self.handle_channel_end(client_id, tag, error_code);
            }
        }
    }

    fn handle_connect(&self, client_id: ClientId, major: u16, minor: u16) {
        debug!("routing connection from client (id={client_id}, version {major}.{minor})");
        let envelope = RouteEnvelope::Connect {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        };
        if let Err(err) = self
            .pipe
            .send(client_id, SocketBuffer::from(envelope.encode()))
        {
            warn!("failed to answer handshake (id={client_id}): {err}");
        }
    }

    fn handle_channel_msg(
        &self,
        client_id: ClientId,
        service_id: ServiceId,
        tag: Tag,
        sequence: u64,
        payload: Bytes,
    ) {
        let endpoint = (client_id, tag);
        if let Some(gateway) = self.lookup(endpoint) {
            gateway.emit(GatewayEvent::Message { sequence, payload });
            return;
        }

        let factory = self.factories.borrow().get(&service_id).map(Rc::clone);
        match factory {
            Some(factory) => {
                let Some(router) = self.weak_self.upgrade() else {
                    return;
                };
                let gateway = GatewayState::create(router, endpoint);
                (&mut *factory.borrow_mut())(gateway, payload);
                // A factory that declined to keep the gateway has already
                // removed the endpoint again through its drop.
            }
            None => debug!(
                "dropping unsolicited channel message (client={client_id}, tag={tag}, \
                 service={service_id:#018x})"
            ),
        }
    }

    fn handle_channel_end(&self, client_id: ClientId, tag: Tag, error_code: i32) {
        let removed = self.endpoints.borrow_mut().remove(&(client_id, tag));
        match removed.and_then(|weak| weak.upgrade()) {
            Some(gateway) => gateway.finish(RouteError::from_wire(error_code)),
            None => debug!("dropping channel end for unknown endpoint (client={client_id}, tag={tag})"),
        }
    }

    /// Complete and remove every endpoint belonging to `client_id`.
    fn complete_client(&self, client_id: ClientId, error: Option<RouteError>) {
        let gateways: Vec<Rc<GatewayState>> = {
            let mut endpoints = self.endpoints.borrow_mut();
            let keys: Vec<Endpoint> = endpoints
                .keys()
                .filter(|(owner, _)| *owner == client_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| endpoints.remove(&key).and_then(|weak| weak.upgrade()))
                .collect()
        };
        debug!(
            "completing {} endpoint(s) of client (id={client_id})",
            gateways.len()
        );
        for gateway in gateways {
            gateway.finish(error);
        }
    }

    /// Live gateway for `endpoint`, pruning a dead entry on the way.
    fn lookup(&self, endpoint: Endpoint) -> Option<Rc<GatewayState>> {
        let mut endpoints = self.endpoints.borrow_mut();
        match endpoints.get(&endpoint).map(Weak::upgrade) {
            Some(Some(gateway)) => Some(gateway),
            Some(None) => {
                endpoints.remove(&endpoint);
                None
            }
            None => None,
        }
    }

    fn send_channel_end(&self, endpoint: Endpoint, error: Option<RouteError>) {
        let (client_id, tag) = endpoint;
        let envelope = RouteEnvelope::ChannelEnd {
            tag,
            error_code: error.map_or(0, RouteError::to_wire),
        };
        if let Err(err) = self
            .pipe
            .send(client_id, SocketBuffer::from(envelope.encode()))
        {
            debug!("failed to send channel end (client={client_id}, tag={tag}): {err}");
        }
    }
}

/// Endpoint state shared between the factory-made handle and the router's
/// weak map entry.
struct GatewayState {
    router: Rc<RouterInner>,
    endpoint: Endpoint,
    sequence: Cell<u64>,
    handler: RefCell<Option<GatewayEventHandler>>,
    closed: Cell<bool>,
}

impl GatewayState {
    /// Create the gateway and insert it into the endpoint map; the caller
    /// hands the strong reference to the factory.
    fn create(router: Rc<RouterInner>, endpoint: Endpoint) -> Rc<dyn Gateway> {
        let gateway = Rc::new_cyclic(|weak_self: &Weak<GatewayState>| {
            router
                .endpoints
                .borrow_mut()
                .insert(endpoint, weak_self.clone());
            Self {
                router,
                endpoint,
                sequence: Cell::new(0),
                handler: RefCell::new(None),
                closed: Cell::new(false),
            }
        });
        debug!(
            "gateway created (client={}, tag={})",
            gateway.endpoint.0, gateway.endpoint.1
        );
        gateway
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
        let envelope = RouteEnvelope::ChannelMsg {
            service_id,
            tag: self.endpoint.1,
            sequence: self.sequence.get(),
        };
        let mut buffer = SocketBuffer::from(envelope.encode());
        buffer.push(payload);
        self.router.pipe.send(self.endpoint.0, buffer)?;
        self.sequence.set(self.sequence.get() + 1);
        Ok(())
    }

    fn subscribe(&self, handler: GatewayEventHandler) {
        // The endpoint is already in the map; `Connected` is implicit on the
        // server side, where the factory runs with the first input instead.
        *self.handler.borrow_mut() = Some(handler);
    }

    fn complete(&self, error: Option<RouteError>) {
        if self.closed.get() {
            return;
        }
        self.router.endpoints.borrow_mut().remove(&self.endpoint);
        self.router.send_channel_end(self.endpoint, error);
        self.finish(error);
    }

    fn tag(&self) -> Tag {
        self.endpoint.1
    }
}

impl Drop for GatewayState {
    fn drop(&mut self) {
        self.router.endpoints.borrow_mut().remove(&self.endpoint);
        if !self.closed.get() {
            self.router.send_channel_end(self.endpoint, None);
        }
        debug!(
            "gateway dropped (client={}, tag={})",
            self.endpoint.0, self.endpoint.1
        );
    }
}
