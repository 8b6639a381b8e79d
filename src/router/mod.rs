//! Per-pipe multiplexers translating envelopes to endpoint events.
//!
//! A router owns its pipe and an endpoint map holding weak references to
//! live gateways. Inbound frames are split into a routing envelope and an
//! opaque payload; the envelope selects the endpoint, the payload is handed
//! to it untouched. Broadcasts snapshot strong references first because a
//! gateway's event handler may register or drop other gateways.

mod client;
mod server;

pub use client::ClientRouter;
pub use server::ServerRouter;
