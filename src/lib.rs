//! Public API for the `pipemux` library.
//!
//! This crate provides the IPC routing core of a daemon–client system: many
//! independent logical channels multiplexed over a single byte pipe (Unix
//! domain socket, filesystem or abstract, or TCP), with typed per-channel
//! messaging layered on top.
//!
//! The layers, bottom-up:
//!
//! - [`addr`] parses connection strings and opens non-blocking sockets.
//! - [`framing`] splits the byte stream into length-prefixed frames.
//! - [`pipe`] drives one socket (client) or a listener plus its accepted
//!   sockets (server) and surfaces byte-level events.
//! - [`envelope`] encodes the routing metadata in front of every payload.
//! - [`router`] multiplexes tagged endpoints over one pipe and runs the
//!   version handshake.
//! - [`channel`] wraps a raw [`gateway::Gateway`] with typed encode/decode.
//!
//! Everything runs on one executor thread; see [`runtime`] for the hosting
//! boilerplate.
//!
//! # Example
//!
//! ```no_run
//! use pipemux::{
//!     ChannelEvent, ClientPipe, ClientRouter, ServerPipe, ServerRouter, ServiceMessage,
//!     SocketAddress,
//! };
//!
//! #[derive(bincode::Encode, bincode::Decode)]
//! struct Ping {
//!     n: u32,
//! }
//!
//! impl ServiceMessage for Ping {
//!     const TYPE_NAME: &'static str = "demo.Ping";
//! }
//!
//! #[derive(bincode::Encode, bincode::Decode)]
//! struct Pong {
//!     n: u32,
//! }
//!
//! impl ServiceMessage for Pong {
//!     const TYPE_NAME: &'static str = "demo.Pong";
//! }
//!
//! fn main() -> pipemux::Result<()> {
//!     let address = SocketAddress::parse("unix-abstract:demo", 0)?;
//!     pipemux::runtime::run(async move {
//!         let server = ServerRouter::new(ServerPipe::new(address.clone()));
//!         server.register_channel::<Ping, Pong, _>("echo", |channel, input| {
//!             let _ = channel.send(&Pong { n: input.n });
//!         })?;
//!         server.start()?;
//!
//!         let client = ClientRouter::new(ClientPipe::new(address));
//!         let channel = client.make_channel::<Pong, Ping>("echo");
//!         channel.subscribe(|event, channel| {
//!             if let ChannelEvent::Connected = event {
//!                 let _ = channel.send(&Ping { n: 7 });
//!             }
//!         });
//!         client.start()?;
//!
//!         std::future::pending::<()>().await;
//!         Ok(())
//!     })
//! }
//! ```

pub mod addr;
pub mod channel;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod pipe;
pub mod router;
pub mod runtime;
pub mod service;

pub use addr::SocketAddress;
pub use channel::{Channel, ChannelEvent, ServiceMessage};
pub use error::{Result, RouteError};
pub use gateway::{Gateway, GatewayEvent, Tag};
pub use pipe::{ClientId, ClientPipe, ServerPipe, SocketBuffer};
pub use router::{ClientRouter, ServerRouter};
pub use service::ServiceId;
