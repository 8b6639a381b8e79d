//! Client end of the byte pipe: one outbound connection driven by the
//! executor.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio::task::spawn_local;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{ClientEvent, ClientEventHandler, SocketBuffer};
use crate::addr::{IpcStream, SocketAddress};
use crate::error::{Result, RouteError};
use crate::framing::{FrameDecoder, FrameEncoder};

/// One outbound connection, multiplexing all channels of a client router.
///
/// `start` spawns a connect-then-read task plus a writer task on the current
/// `LocalSet`; dropping the pipe cancels both and releases the socket.
pub struct ClientPipe {
    address: SocketAddress,
    shared: Rc<Shared>,
}

struct Shared {
    outbound: RefCell<Option<mpsc::UnboundedSender<SocketBuffer>>>,
    cancel: CancellationToken,
    started: Cell<bool>,
    /// Set once `Disconnected` has been emitted or the pipe was closed
    /// locally; nothing is delivered afterwards.
    finished: Cell<bool>,
}

type SharedHandler = Rc<RefCell<ClientEventHandler>>;

impl ClientPipe {
    /// Create an idle pipe for `address`.
    #[must_use]
    pub fn new(address: SocketAddress) -> Self {
        Self {
            address,
            shared: Rc::new(Shared {
                outbound: RefCell::new(None),
                cancel: CancellationToken::new(),
                started: Cell::new(false),
                finished: Cell::new(false),
            }),
        }
    }

    /// Initiate the connection and install the event handler.
    ///
    /// Must be called from within a `LocalSet`. Once the socket reports
    /// connect completion the handler sees `Connected`, then one `Message`
    /// per inbound frame, then at most one `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::AlreadyExists`] if the pipe was already started.
    pub fn start(&self, handler: ClientEventHandler) -> Result<()> {
        if self.shared.started.replace(true) {
            return Err(RouteError::AlreadyExists);
        }
        let address = self.address.clone();
        let shared = Rc::clone(&self.shared);
        let handler = Rc::new(RefCell::new(handler));
        spawn_local(run_client(address, shared, handler));
        Ok(())
    }

    /// Queue one frame for transmission.
    ///
    /// Frames are written in `send` call order. Safe to call from inside the
    /// event handler.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotConnected`] before the socket connects or
    /// after the pipe terminated.
    pub fn send(&self, buffer: SocketBuffer) -> Result<()> {
        let outbound = self.shared.outbound.borrow();
        let Some(tx) = outbound.as_ref() else {
            return Err(RouteError::NotConnected);
        };
        tx.send(buffer).map_err(|_| RouteError::NotConnected)
    }

    /// Tear the pipe down without emitting `Disconnected`. Used when the
    /// layer above detected a protocol violation and reports it itself.
    pub(crate) fn close(&self) {
        self.shared.finished.set(true);
        self.shared.outbound.borrow_mut().take();
        self.shared.cancel.cancel();
    }
}

impl Drop for ClientPipe {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_client(address: SocketAddress, shared: Rc<Shared>, handler: SharedHandler) {
    let connect = tokio::select! {
        () = shared.cancel.cancelled() => return,
        connect = address.connect() => connect,
    };
    let stream = match connect {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to connect to {address}: {err}");
            emit_disconnected(&shared, &handler, Some(RouteError::from(err)));
            return;
        }
    };
    info!("connected to {address}");

    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    *shared.outbound.borrow_mut() = Some(tx);

    spawn_local(write_loop(
        write_half,
        rx,
        Rc::clone(&shared),
        Rc::clone(&handler),
    ));

    (*handler.borrow_mut())(ClientEvent::Connected);

    let mut frames = FramedRead::new(read_half, FrameDecoder);
    loop {
        let frame = tokio::select! {
            () = shared.cancel.cancelled() => return,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(payload)) => (*handler.borrow_mut())(ClientEvent::Message { payload }),
            Some(Err(err)) => {
                warn!("read failed on {address}: {err}");
                emit_disconnected(&shared, &handler, Some(RouteError::from(err)));
                return;
            }
            None => {
                debug!("peer closed {address}");
                emit_disconnected(&shared, &handler, None);
                return;
            }
        }
    }
}

async fn write_loop(
    write_half: WriteHalf<IpcStream>,
    mut rx: mpsc::UnboundedReceiver<SocketBuffer>,
    shared: Rc<Shared>,
    handler: SharedHandler,
) {
    let mut sink = FramedWrite::new(write_half, FrameEncoder);
    loop {
        let buffer = tokio::select! {
            () = shared.cancel.cancelled() => return,
            buffer = rx.recv() => buffer,
        };
        let Some(buffer) = buffer else { return };
        if let Err(err) = sink.send(buffer).await {
            warn!("write failed: {err}");
            emit_disconnected(&shared, &handler, Some(RouteError::from(err)));
            return;
        }
    }
}

fn emit_disconnected(shared: &Shared, handler: &SharedHandler, error: Option<RouteError>) {
    shared.outbound.borrow_mut().take();
    shared.cancel.cancel();
    if !shared.finished.replace(true) {
        (*handler.borrow_mut())(ClientEvent::Disconnected { error });
    }
}
