//! Server end of the byte pipe: a listener plus its accepted connections.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::spawn_local;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{ClientId, ServerEvent, ServerEventHandler, SocketBuffer};
use crate::addr::{IpcListener, IpcStream, SocketAddress};
use crate::error::{Result, RouteError};
use crate::framing::{FrameDecoder, FrameEncoder};

/// Listen backlog for the daemon socket.
const BACKLOG: i32 = 5;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

// Linux errno values treated as temporary network failures on accept.
const EINTR: i32 = 4;
const EPROTO: i32 = 71;
const ENETDOWN: i32 = 100;
const ENETUNREACH: i32 = 101;
const ECONNABORTED: i32 = 103;
const ETIMEDOUT: i32 = 110;
const EHOSTDOWN: i32 = 112;
const EHOSTUNREACH: i32 = 113;

const TRANSIENT_ACCEPT_ERRNOS: [i32; 8] = [
    EINTR,
    EPROTO,
    ENETDOWN,
    ENETUNREACH,
    ECONNABORTED,
    ETIMEDOUT,
    EHOSTDOWN,
    EHOSTUNREACH,
];

/// One listening socket fanning out to per-client reader and writer tasks.
///
/// `start` binds, listens, and spawns the accept loop on the current
/// `LocalSet`; dropping the pipe cancels every task and releases all
/// descriptors.
pub struct ServerPipe {
    address: SocketAddress,
    shared: Rc<Shared>,
}

struct Shared {
    clients: RefCell<HashMap<ClientId, ClientContext>>,
    next_client_id: Cell<ClientId>,
    cancel: CancellationToken,
    started: Cell<bool>,
}

struct ClientContext {
    outbound: mpsc::UnboundedSender<SocketBuffer>,
    cancel: CancellationToken,
}

type SharedHandler = Rc<RefCell<ServerEventHandler>>;

impl ServerPipe {
    /// Create an idle pipe that will listen on `address`.
    #[must_use]
    pub fn new(address: SocketAddress) -> Self {
        Self {
            address,
            shared: Rc::new(Shared {
                clients: RefCell::new(HashMap::new()),
                next_client_id: Cell::new(0),
                cancel: CancellationToken::new(),
                started: Cell::new(false),
            }),
        }
    }

    /// Bind, listen, and install the event handler.
    ///
    /// Must be called from within a `LocalSet`. Each accepted connection is
    /// assigned the next [`ClientId`] and announced with
    /// `Connected{client_id}`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::AlreadyExists`] if the pipe was already started
    /// and propagates bind/listen failures.
    pub fn start(&self, handler: ServerEventHandler) -> Result<()> {
        if self.shared.started.replace(true) {
            return Err(RouteError::AlreadyExists);
        }
        let listener = self.address.listen(BACKLOG)?;
        info!("listening on {}", self.address);

        let shared = Rc::clone(&self.shared);
        let handler = Rc::new(RefCell::new(handler));
        spawn_local(accept_loop(listener, shared, handler));
        Ok(())
    }

    /// Queue one frame for transmission to `client_id`.
    ///
    /// Frames are written in `send` call order per client. Safe to call from
    /// inside the event handler.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotConnected`] for unknown or closed clients.
    pub fn send(&self, client_id: ClientId, buffer: SocketBuffer) -> Result<()> {
        let clients = self.shared.clients.borrow();
        let Some(context) = clients.get(&client_id) else {
            return Err(RouteError::NotConnected);
        };
        context
            .outbound
            .send(buffer)
            .map_err(|_| RouteError::NotConnected)
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.borrow().len()
    }

    /// Drop one client connection without emitting `Disconnected`. Used when
    /// the layer above detected a protocol violation and reports it itself.
    pub(crate) fn close_client(&self, client_id: ClientId) {
        if let Some(context) = self.shared.clients.borrow_mut().remove(&client_id) {
            info!("dropping client connection (id={client_id})");
            context.cancel.cancel();
        }
    }
}

impl Drop for ServerPipe {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.clients.borrow_mut().clear();
    }
}

async fn accept_loop(listener: IpcListener, shared: Rc<Shared>, handler: SharedHandler) {
    let mut retry_delay = INITIAL_RETRY_DELAY;
    loop {
        let accepted = tokio::select! {
            () = shared.cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                retry_delay = INITIAL_RETRY_DELAY;
                register_client(stream, &shared, &handler);
            }
            Err(err) if is_transient_accept_error(&err) => {
                debug!("transient accept failure; retrying: {err}");
            }
            Err(err) => {
                warn!("accept failed; retrying after {retry_delay:?}: {err}");
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    err.raw_os_error()
        .is_some_and(|errno| TRANSIENT_ACCEPT_ERRNOS.contains(&errno))
}

fn register_client(stream: IpcStream, shared: &Rc<Shared>, handler: &SharedHandler) {
    let client_id = shared.next_client_id.get() + 1;
    shared.next_client_id.set(client_id);

    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = shared.cancel.child_token();
    shared.clients.borrow_mut().insert(
        client_id,
        ClientContext {
            outbound: tx,
            cancel: cancel.clone(),
        },
    );
    info!("accepted client connection (id={client_id})");

    spawn_local(client_read_loop(
        client_id,
        read_half,
        Rc::clone(shared),
        Rc::clone(handler),
        cancel.clone(),
    ));
    spawn_local(client_write_loop(
        client_id,
        write_half,
        rx,
        Rc::clone(shared),
        Rc::clone(handler),
        cancel,
    ));

    (*handler.borrow_mut())(ServerEvent::Connected { client_id });
}

async fn client_read_loop(
    client_id: ClientId,
    read_half: ReadHalf<IpcStream>,
    shared: Rc<Shared>,
    handler: SharedHandler,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, FrameDecoder);
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(payload)) => {
                (*handler.borrow_mut())(ServerEvent::Message { client_id, payload });
            }
            Some(Err(err)) => {
                warn!("read failed; closing client connection (id={client_id}): {err}");
                drop_client(&shared, &handler, client_id, Some(RouteError::from(err)));
                return;
            }
            None => {
                debug!("end of client stream; closing connection (id={client_id})");
                drop_client(&shared, &handler, client_id, None);
                return;
            }
        }
    }
}

async fn client_write_loop(
    client_id: ClientId,
    write_half: WriteHalf<IpcStream>,
    mut rx: mpsc::UnboundedReceiver<SocketBuffer>,
    shared: Rc<Shared>,
    handler: SharedHandler,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, FrameEncoder);
    loop {
        let buffer = tokio::select! {
            () = cancel.cancelled() => return,
            buffer = rx.recv() => buffer,
        };
        let Some(buffer) = buffer else { return };
        if let Err(err) = sink.send(buffer).await {
            warn!("write failed; closing client connection (id={client_id}): {err}");
            drop_client(&shared, &handler, client_id, Some(RouteError::from(err)));
            return;
        }
    }
}

/// Remove the client and emit `Disconnected`. Whichever task removes the
/// context first is the one that emits.
fn drop_client(
    shared: &Shared,
    handler: &SharedHandler,
    client_id: ClientId,
    error: Option<RouteError>,
) {
    let removed = shared.clients.borrow_mut().remove(&client_id);
    if let Some(context) = removed {
        context.cancel.cancel();
        info!("client connection closed (id={client_id})");
        (*handler.borrow_mut())(ServerEvent::Disconnected { client_id, error });
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn send_to_unknown_client_is_not_connected() {
        let pipe = ServerPipe::new(SocketAddress::UnixAbstract(b"pipemux-srv-idle".to_vec()));
        let result = pipe.send(1, SocketBuffer::from(Bytes::from_static(b"x")));
        assert_eq!(result, Err(RouteError::NotConnected));
    }

    #[rstest]
    #[case(EINTR, true)]
    #[case(ECONNABORTED, true)]
    #[case(EPROTO, true)]
    #[case(13, false)] // EACCES
    #[case(24, false)] // EMFILE
    fn accept_errors_are_classified(#[case] errno: i32, #[case] transient: bool) {
        let err = io::Error::from_raw_os_error(errno);
        assert_eq!(is_transient_accept_error(&err), transient);
    }

    #[rstest]
    fn non_os_errors_are_not_transient() {
        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert!(!is_transient_accept_error(&err));
    }
}
