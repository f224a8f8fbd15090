//! # Tideline
//!
//! **Tideline** is a non-blocking TCP text client. One thread owns every socket
//! and drives connection establishment, reads and writes off a single
//! readiness-event demultiplexer (epoll on Linux, kqueue on macOS and the BSDs),
//! while any number of producer threads hand it outbound messages.
//!
//! Incoming bytes are turned into text by a streaming UTF-8 decoder that keeps
//! the tail of a read ending in the middle of a multi-byte character until the
//! next read completes it, so no byte is ever lost or decoded twice.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tideline::ClientBuilder;
//!
//! let client = ClientBuilder::new()
//!     .address("127.0.0.1:9000")
//!     .start(|text: &str| print!("{text}"))?;
//!
//! client.send("hello\n")?;
//! client.shutdown()?;
//! client.join();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: UTF-8 encode/decode with remainder retention
//! - [`net`]: connections, outbound queues and the inbound callback
//! - [`reactor`]: the event loop and its handle
//!
//! ## Wire format
//!
//! Tideline writes raw UTF-8 bytes with no framing. A peer may see the bytes of
//! two `send` calls merged, or one call split over several reads, and the text
//! chunks delivered to [`Inbound`] follow socket reads, not message boundaries.

pub mod codec;
pub mod net;
pub mod reactor;

mod client;
mod config;
mod error;
mod utils;

pub use client::{Client, ClientBuilder};
pub use codec::{MalformedPolicy, StreamDecoder, decode, encode};
pub use config::{ConnectOptions, ConnectPolicy, LoopConfig};
pub use error::{Error, Result, SendError};
pub use net::{ConnectionState, Inbound, Outbox, SendStatus};
pub use reactor::{EventLoop, LoopHandle, Turn};
