//! Connections and the per-connection plumbing around them.
//!
//! - [`Outbox`]: the producer-facing half of a connection; `send` never blocks
//!   on the network.
//! - [`Inbound`]: the callback receiving decoded text and state changes on the
//!   event loop thread.
//! - [`ConnectionState`]: `Disconnected → Connecting → Connected → Closed`.
//!
//! The socket itself and the state machine driving it live on the event loop
//! thread and are not exposed.

pub(crate) mod connection;
pub(crate) mod outbound;
pub(crate) mod socket;

mod inbound;

pub use connection::ConnectionState;
pub use inbound::Inbound;
pub use outbound::{Outbox, SendStatus};
