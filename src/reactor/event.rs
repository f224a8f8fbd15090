/// A readiness event reported by the poller.
///
/// Produced by the platform backend and consumed by the event loop, which
/// routes it to the connection registered under `token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Event {
    /// Slab token the socket was registered with.
    pub(crate) token: usize,

    /// The socket can be read without blocking, or has hung up.
    pub(crate) readable: bool,

    /// The socket can be written without blocking; for a socket still
    /// connecting, the connect has finished (successfully or not).
    pub(crate) writable: bool,

    /// The peer hung up or the socket carries a pending error.
    pub(crate) hangup: bool,
}
