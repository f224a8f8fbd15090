//! Error types.
//!
//! Failures inside the event loop are logged and never surface here; these
//! types only cover what a caller can act on: starting the loop, resolving an
//! address, and handing a message to a connection.

use std::io;

use thiserror::Error;

/// Errors returned by the loop handle and the client facade.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating the poller or another OS resource failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configured address did not resolve to any socket address.
    #[error("could not resolve address: {0}")]
    Resolve(String),

    /// The event loop has shut down and no longer accepts commands.
    #[error("event loop is no longer running")]
    LoopClosed,

    /// The event loop thread could not be spawned.
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Why a message was not accepted by [`Outbox::send`](crate::Outbox::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection is closed; nothing can be written to it anymore.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue already holds `limit` messages.
    #[error("outbound queue full ({limit} messages pending)")]
    QueueFull { limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
