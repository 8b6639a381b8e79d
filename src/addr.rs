//! Connection-string parsing and non-blocking socket setup.
//!
//! Three connection-string forms are accepted:
//!
//! | Prefix | Meaning |
//! |--------|---------|
//! | `unix:<path>` | Filesystem Unix domain socket. |
//! | `unix-abstract:<name>` | Linux abstract namespace. |
//! | `tcp://<host>[:port]` | IPv4/IPv6, `*` for the dual-stack wildcard. |
//!
//! All sockets are opened non-blocking; TCP streams disable Nagle so small
//! IPC packets leave immediately, and the wildcard listener clears
//! `IPV6_V6ONLY` so IPv4-mapped peers reach the same socket.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use log::{error, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::{Result, RouteError};

/// `connect(2)` in-progress errno on Linux.
const EINPROGRESS: i32 = 115;

/// Maximum abstract-namespace name length: `sockaddr_un.sun_path` is 108
/// bytes on Linux and the leading NUL consumes one.
const MAX_ABSTRACT_NAME: usize = 107;

/// Maximum filesystem socket path length, one byte reserved for the NUL
/// terminator.
const MAX_UNIX_PATH: usize = 107;

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// `unix:<path>`: filesystem Unix domain socket.
    Unix(PathBuf),
    /// `unix-abstract:<name>`: Linux abstract namespace. The name may
    /// contain interior NUL bytes.
    UnixAbstract(Vec<u8>),
    /// `tcp://host[:port]`: concrete IPv4/IPv6 endpoint.
    Tcp(SocketAddr),
    /// `tcp://*:port`: dual-stack wildcard listener address.
    TcpWildcard(u16),
}

impl SocketAddress {
    /// Parse a connection string.
    ///
    /// `port_hint` supplies the TCP port when the string carries none.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidArgument`] for unsupported prefixes,
    /// overlong Unix paths or abstract names, unparsable hosts, and ports
    /// outside `0..=65535`.
    pub fn parse(conn_str: &str, port_hint: u16) -> Result<Self> {
        if let Some(path) = conn_str.strip_prefix("unix:") {
            if path.len() > MAX_UNIX_PATH {
                error!("unix domain path is too long ({} bytes)", path.len());
                return Err(RouteError::InvalidArgument);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(name) = conn_str.strip_prefix("unix-abstract:") {
            if name.len() > MAX_ABSTRACT_NAME {
                error!("abstract socket name is too long ({} bytes)", name.len());
                return Err(RouteError::InvalidArgument);
            }
            return Ok(Self::UnixAbstract(name.as_bytes().to_vec()));
        }
        if let Some(rest) = conn_str.strip_prefix("tcp://") {
            return Self::parse_tcp(rest, port_hint);
        }

        error!("unsupported connection string format: '{conn_str}'");
        Err(RouteError::InvalidArgument)
    }

    fn parse_tcp(addr: &str, port_hint: u16) -> Result<Self> {
        let (host, port) = split_host_port(addr, port_hint)?;
        if host == "*" {
            return Ok(Self::TcpWildcard(port));
        }
        let ip: IpAddr = host.parse().map_err(|_| {
            error!("unsupported ip address format: '{host}'");
            RouteError::InvalidArgument
        })?;
        Ok(Self::Tcp(SocketAddr::new(ip, port)))
    }

    /// Open a non-blocking connection to this address.
    ///
    /// # Errors
    ///
    /// Propagates socket creation and connect failures. Connecting to a
    /// wildcard address is an `InvalidInput` error.
    pub async fn connect(&self) -> io::Result<IpcStream> {
        match self {
            Self::Unix(path) => Ok(IpcStream::Unix(UnixStream::connect(path).await?)),
            Self::UnixAbstract(name) => connect_abstract(name).await.map(IpcStream::Unix),
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(*addr).await?;
                configure_nodelay(&stream);
                Ok(IpcStream::Tcp(stream))
            }
            Self::TcpWildcard(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot connect to a wildcard address",
            )),
        }
    }

    /// Bind this address and start listening.
    ///
    /// # Errors
    ///
    /// Propagates socket creation, bind, and listen failures.
    pub fn listen(&self, backlog: i32) -> io::Result<IpcListener> {
        match self {
            Self::Unix(path) => listen_unix(&SockAddr::unix(path)?, backlog),
            Self::UnixAbstract(name) => listen_unix(&abstract_sockaddr(name)?, backlog),
            Self::Tcp(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                socket.bind(&SockAddr::from(*addr))?;
                socket.listen(backlog)?;
                Ok(IpcListener::Tcp(TcpListener::from_std(socket.into())?))
            }
            Self::TcpWildcard(port) => {
                let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                // Dual-stack: accept IPv4-mapped peers on the same listener.
                socket.set_only_v6(false)?;
                let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), *port);
                socket.bind(&SockAddr::from(addr))?;
                socket.listen(backlog)?;
                Ok(IpcListener::Tcp(TcpListener::from_std(socket.into())?))
            }
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::UnixAbstract(name) => {
                write!(f, "unix-abstract:{}", String::from_utf8_lossy(name))
            }
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::TcpWildcard(port) => write!(f, "tcp://*:{port}"),
        }
    }
}

/// Split `addr` into host and port parts.
///
/// A leading `[` begins a bracketed IPv6 host; otherwise a single `:` splits
/// host and port, and two or more unbracketed colons indicate an IPv6 host
/// without a port.
fn split_host_port(addr: &str, port_hint: u16) -> Result<(&str, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            error!("invalid IPv6 address; unclosed '[' in '{addr}'");
            return Err(RouteError::InvalidArgument);
        };
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, port_hint));
        }
        let Some(port_part) = tail.strip_prefix(':') else {
            error!("invalid IPv6 address; expected port suffix after ']' in '{addr}'");
            return Err(RouteError::InvalidArgument);
        };
        return Ok((host, parse_port(port_part)?));
    }

    match addr.matches(':').count() {
        0 => Ok((addr, port_hint)),
        1 => {
            let (host, port_part) = addr.split_once(':').unwrap_or((addr, ""));
            Ok((host, parse_port(port_part)?))
        }
        // At least two colons without brackets: an IPv6 host without a port.
        _ => Ok((addr, port_hint)),
    }
}

fn parse_port(port_part: &str) -> Result<u16> {
    let value: u64 = port_part.parse().map_err(|_| {
        error!("invalid port number: '{port_part}'");
        RouteError::InvalidArgument
    })?;
    u16::try_from(value).map_err(|_| {
        error!("port number is too large: {value}");
        RouteError::InvalidArgument
    })
}

/// Build a `SockAddr` for a Linux abstract-namespace name.
///
/// `socket2` has no direct constructor for this; `SockAddr::unix` treats a
/// path whose first byte is NUL as an abstract name, so we prepend it here.
fn abstract_sockaddr(name: &[u8]) -> io::Result<SockAddr> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.push(0u8);
    bytes.extend_from_slice(name);
    SockAddr::unix(std::ffi::OsStr::from_bytes(&bytes))
}

fn listen_unix(addr: &SockAddr, backlog: i32) -> io::Result<IpcListener> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)?;
    Ok(IpcListener::Unix(UnixListener::from_std(socket.into())?))
}

/// Non-blocking connect to an abstract-namespace socket: issue the connect,
/// wait for writability, then surface any pending socket error.
async fn connect_abstract(name: &[u8]) -> io::Result<UnixStream> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&abstract_sockaddr(name)?) {
        Ok(()) => {}
        Err(err)
            if err.raw_os_error() == Some(EINPROGRESS)
                || err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => return Err(err),
    }

    let stream = UnixStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    Ok(stream)
}

fn configure_nodelay(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {err}");
    }
}

/// Connected byte stream, Unix or TCP.
#[derive(Debug)]
pub enum IpcStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            Self::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Unix(stream) => stream.is_write_vectored(),
            Self::Tcp(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Listening socket, Unix or TCP.
#[derive(Debug)]
pub enum IpcListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl IpcListener {
    /// Accept one connection, applying per-stream socket options.
    ///
    /// # Errors
    ///
    /// Propagates accept failures; the caller decides which are transient.
    pub async fn accept(&self) -> io::Result<IpcStream> {
        match self {
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(IpcStream::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                configure_nodelay(&stream);
                Ok(IpcStream::Tcp(stream))
            }
        }
    }
}
