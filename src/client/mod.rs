//! Single-connection client facade.
//!
//! Bundles an [`EventLoop`](crate::EventLoop) running on its own thread with
//! one connection to a fixed address. Use [`ClientBuilder`] to configure and
//! start it; use the raw loop through [`LoopHandle`](crate::LoopHandle) to drive
//! several connections from one thread.

mod builder;
mod core;

pub use builder::ClientBuilder;
pub use core::Client;
