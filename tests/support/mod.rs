//! Shared fixtures for the end-to-end scenario tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pipemux::framing::FRAME_SIGNATURE;
use pipemux::{RouteError, ServiceMessage, SocketAddress};

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

/// Initialise the test logging sink once.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Abstract-namespace address unique to this process and call site.
pub fn unique_address(label: &str) -> SocketAddress {
    let n = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
    let name = format!("pipemux-{label}-{}-{n}", std::process::id());
    SocketAddress::parse(&format!("unix-abstract:{name}"), 0).expect("valid test address")
}

/// Poll `condition` until it holds or the one-second deadline elapses.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Shared event recorder usable from inside non-`Send` handlers.
pub type Events<T> = Rc<RefCell<Vec<T>>>;

pub fn events<T>() -> Events<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Simplified channel event, comparable in assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected,
    Input(u32),
    Completed(Option<RouteError>),
}

/// Wrap `payload` in one wire frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = FRAME_SIGNATURE.to_le_bytes().to_vec();
    wire.extend_from_slice(&u32::try_from(payload.len()).expect("test payload").to_le_bytes());
    wire.extend_from_slice(payload);
    wire
}

/// A frame header announcing an oversized payload.
pub fn oversize_frame_header() -> Vec<u8> {
    let mut wire = FRAME_SIGNATURE.to_le_bytes().to_vec();
    wire.extend_from_slice(&2_000_000u32.to_le_bytes());
    wire
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub n: u32,
}

impl ServiceMessage for Ping {
    const TYPE_NAME: &'static str = "pipemux.test.Ping";
}

#[derive(bincode::Encode, bincode::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub n: u32,
}

impl ServiceMessage for Pong {
    const TYPE_NAME: &'static str = "pipemux.test.Pong";
}
