//! Executor glue: a current-thread runtime driving `LocalSet` tasks.
//!
//! Routers and pipes spawn non-`Send` tasks, so they must run inside a
//! [`tokio::task::LocalSet`]. [`run`] wraps the boilerplate for hosting
//! processes; tests typically call it directly around a scenario future.

use std::future::Future;

use tokio::runtime::Builder;
use tokio::task::{JoinHandle, LocalSet, spawn_local};

/// Build a current-thread runtime and drive `future` to completion inside a
/// `LocalSet`.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
pub fn run<F: Future>(future: F) -> F::Output {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build current-thread runtime");
    LocalSet::new().block_on(&runtime, future)
}

/// Spawn a task on the current `LocalSet`.
///
/// # Panics
///
/// Panics when called outside a `LocalSet` context.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    spawn_local(future)
}
