use super::Client;
use crate::codec::MalformedPolicy;
use crate::config::{ConnectOptions, ConnectPolicy, LoopConfig};
use crate::error::{Error, Result};
use crate::net::Inbound;
use crate::reactor::EventLoop;

use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Builder for configuring and starting a [`Client`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tideline::{ClientBuilder, ConnectPolicy};
///
/// let _client = ClientBuilder::new()
///     .address("localhost:7000")
///     .poll_timeout(Duration::from_millis(250))
///     .connect_policy(ConnectPolicy::default().with_max_attempts(5))
///     .start(|text: &str| print!("{text}"))?;
/// # Ok::<(), tideline::Error>(())
/// ```
pub struct ClientBuilder {
    /// First resolved address, or why resolution failed.
    address: Option<Result<SocketAddr>>,

    loop_config: LoopConfig,

    options: ConnectOptions,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default configuration and no
    /// address.
    pub fn new() -> Self {
        Self {
            address: None,
            loop_config: LoopConfig::default(),
            options: ConnectOptions::default(),
        }
    }

    /// Sets the address to connect to.
    ///
    /// The address is resolved right away and the first result is used; a
    /// resolution failure is reported by [`start`](Self::start).
    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Self {
        let resolved = match address.to_socket_addrs() {
            Ok(mut addrs) => addrs
                .next()
                .ok_or_else(|| Error::Resolve("no address found".to_string())),
            Err(err) => Err(Error::Resolve(err.to_string())),
        };

        self.address = Some(resolved);
        self
    }

    /// Sets the heartbeat: the longest the loop blocks waiting for readiness.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.loop_config.poll_timeout = timeout;
        self
    }

    /// Sets how long a shutdown keeps writing queued messages.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.loop_config.shutdown_grace = grace;
        self
    }

    /// Sets how many readiness events one wait collects.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn event_capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "event_capacity must be > 0");

        self.loop_config.event_capacity = n;
        self
    }

    /// Sets the size of the buffer each socket read fills.
    ///
    /// # Panics
    ///
    /// Panics if `size == 0`.
    pub fn read_chunk(mut self, size: usize) -> Self {
        assert!(size > 0, "read_chunk must be > 0");

        self.options.read_chunk = size;
        self
    }

    pub fn connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.options.connect_policy = policy;
        self
    }

    pub fn malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.options.malformed_policy = policy;
        self
    }

    /// Bounds the outbound queue; sends beyond it fail with
    /// [`SendError::QueueFull`](crate::SendError::QueueFull).
    pub fn max_pending(mut self, limit: usize) -> Self {
        self.options.max_pending = Some(limit);
        self
    }

    /// Starts the event loop thread and the connection.
    ///
    /// `inbound` receives decoded text and state changes on the loop thread.
    pub fn start<I>(self, inbound: I) -> Result<Client>
    where
        I: Inbound + 'static,
    {
        let addr = match self.address {
            Some(resolved) => resolved?,
            None => return Err(Error::Resolve("no address configured".to_string())),
        };

        let event_loop = EventLoop::new(self.loop_config)?;
        let handle = event_loop.handle();
        let outbox = handle.connect(addr, inbound, self.options)?;

        let thread = thread::Builder::new()
            .name("tideline-loop".to_string())
            .spawn(move || event_loop.run())
            .map_err(Error::Spawn)?;

        debug!(%addr, "client started");

        Ok(Client::new(outbox, handle, thread))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_without_address_fails() {
        let result = ClientBuilder::new().start(|_: &str| {});
        assert!(matches!(result, Err(Error::Resolve(_))));
    }

    #[test]
    fn unresolvable_address_fails() {
        let result = ClientBuilder::new()
            .address("not an address")
            .start(|_: &str| {});
        assert!(matches!(result, Err(Error::Resolve(_))));
    }

    #[test]
    fn options_are_collected() {
        let builder = ClientBuilder::new()
            .address("127.0.0.1:9")
            .read_chunk(16)
            .max_pending(8)
            .malformed_policy(MalformedPolicy::Replace)
            .connect_policy(ConnectPolicy::immediate())
            .shutdown_grace(Duration::from_millis(300));

        assert_eq!(builder.options.read_chunk, 16);
        assert_eq!(builder.options.max_pending, Some(8));
        assert_eq!(builder.options.malformed_policy, MalformedPolicy::Replace);
        assert_eq!(builder.options.connect_policy, ConnectPolicy::immediate());
        assert_eq!(builder.loop_config.shutdown_grace, Duration::from_millis(300));
        assert!(matches!(builder.address, Some(Ok(_))));
    }

    #[test]
    #[should_panic(expected = "read_chunk must be > 0")]
    fn zero_read_chunk_panics() {
        let _ = ClientBuilder::new().read_chunk(0);
    }
}
