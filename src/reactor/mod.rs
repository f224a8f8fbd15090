//! Event loop and readiness handling.
//!
//! The event loop owns every socket. It is responsible for:
//! - issuing connects and retrying them according to each connection's policy,
//! - reading and decoding incoming bytes,
//! - draining outbound queues when sockets become writable.
//!
//! It runs on a single thread and communicates with producer threads through
//! commands and a poller waker. [`LoopHandle`] is the sending side.

mod core;
mod timer;

pub(crate) mod command;
pub(crate) mod event;
pub(crate) mod poller;

pub use core::{EventLoop, LoopHandle, Turn};
