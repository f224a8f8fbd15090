use super::command::Command;
use super::event::Event;
use super::poller::{Poller, Waker};
use super::timer::RetryEntry;
use crate::config::{ConnectOptions, LoopConfig};
use crate::error::{Error, Result};
use crate::net::connection::{Connection, Progress};
use crate::net::outbound::OutboundQueue;
use crate::net::{Inbound, Outbox};
use crate::utils::Slab;

use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// What [`EventLoop::turn`] asks its caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Continue,

    /// A shutdown was requested; stop turning.
    Shutdown,
}

/// The event loop.
///
/// Runs on one thread and is responsible for:
/// - processing commands sent through [`LoopHandle`]s,
/// - firing connect retries whose backoff has expired,
/// - polling the OS for readiness, at most for the configured heartbeat,
/// - dispatching every ready event to its connection.
///
/// An I/O error while handling one event is logged and skipped; it never
/// stops the loop or the other connections.
pub struct EventLoop {
    /// Channel receiving commands from producer threads.
    receiver: Receiver<Command>,

    handle: LoopHandle,

    /// Platform-specific poller (epoll or kqueue).
    poller: Poller,

    /// Buffer used to collect readiness events from the poller.
    events: Vec<Event>,

    /// Min-heap of pending connect retries ordered by deadline.
    retries: BinaryHeap<RetryEntry>,

    /// Connections indexed by poller token.
    connections: Slab<Connection>,

    config: LoopConfig,
}

/// A handle used to talk to the event loop from any thread.
///
/// Cloning this handle allows multiple threads to open connections and to
/// stop the loop. Every command wakes the loop out of its poll wait.
#[derive(Clone)]
pub struct LoopHandle {
    /// Sender side of the command channel.
    sender: Sender<Command>,

    /// Waker used to interrupt the poller.
    waker: Arc<Waker>,
}

impl LoopHandle {
    /// Sends a command to the event loop and wakes it.
    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).map_err(|_| Error::LoopClosed)?;
        self.waker.wake();
        Ok(())
    }

    /// Opens a connection to `addr`.
    ///
    /// Returns at once; the connect happens on the loop thread. Messages sent
    /// through the returned [`Outbox`] before the connection is established
    /// are queued and written once it is.
    pub fn connect<I>(
        &self,
        addr: SocketAddr,
        inbound: I,
        options: ConnectOptions,
    ) -> Result<Outbox>
    where
        I: Inbound + 'static,
    {
        let outbound = Arc::new(OutboundQueue::new(options.max_pending));

        self.send(Command::Connect {
            addr,
            outbound: outbound.clone(),
            inbound: Box::new(inbound),
            options,
        })?;

        Ok(Outbox::new(outbound, self.clone()))
    }

    /// Asks the loop to stop.
    ///
    /// Messages already accepted by an [`Outbox`] are still written, for at
    /// most [`LoopConfig::shutdown_grace`]; then every connection is closed.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Creates the poller and the command channel.
    pub fn new(config: LoopConfig) -> Result<Self> {
        let poller = Poller::new(config.event_capacity)?;
        let (sender, receiver) = channel();

        let handle = LoopHandle {
            sender,
            waker: poller.waker(),
        };

        Ok(Self {
            receiver,
            handle,
            poller,
            events: Vec::with_capacity(config.event_capacity),
            retries: BinaryHeap::new(),
            connections: Slab::new(16),
            config,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Number of connections the loop still owns.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Turns the loop until a shutdown is requested, drains the outbound
    /// queues, then closes every connection.
    pub fn run(mut self) {
        info!(
            poll_timeout = ?self.config.poll_timeout,
            "event loop started"
        );

        while self.turn() == Turn::Continue {}

        self.drain();
        self.close_all();
        info!("event loop stopped");
    }

    /// Runs one iteration of the loop.
    ///
    /// 1. Process pending commands
    /// 2. Fire expired connect retries
    /// 3. Poll the OS for readiness, bounded by the heartbeat
    /// 4. Dispatch the events collected
    pub fn turn(&mut self) -> Turn {
        if self.process_commands() == Turn::Shutdown {
            return Turn::Shutdown;
        }

        self.fire_retries(Instant::now());

        let timeout = self.poll_timeout(Instant::now());
        if let Err(err) = self.poller.poll(&mut self.events, Some(timeout)) {
            error!(%err, "poll failed");
            return Turn::Continue;
        }

        self.dispatch(Instant::now());
        Turn::Continue
    }

    /// Keeps connecting, reading and writing until no open connection has
    /// queued output or the shutdown grace period is over.
    ///
    /// Write interest is re-armed every round, since flush requests sent
    /// after the shutdown are never processed.
    fn drain(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_grace;

        loop {
            let now = Instant::now();
            let pending = self.pending_output();

            if pending == 0 {
                break;
            }
            if now >= deadline {
                warn!(connections = pending, "shutdown grace expired with unsent messages");
                break;
            }

            trace!(connections = pending, "draining before shutdown");
            for token in self.connections.keys().collect::<Vec<_>>() {
                let Some(connection) = self.connections.get_mut(token) else {
                    continue;
                };
                if let Err(err) = connection.rearm(&self.poller) {
                    warn!(token, %err, "failed to arm write interest");
                }
            }

            self.fire_retries(now);

            let timeout = self.poll_timeout(now).min(deadline - now);
            if let Err(err) = self.poller.poll(&mut self.events, Some(timeout)) {
                error!(%err, "poll failed");
                continue;
            }

            self.dispatch(Instant::now());
        }
    }

    /// Number of open connections with messages still queued.
    fn pending_output(&self) -> usize {
        self.connections
            .values()
            .filter(|connection| connection.has_pending_output())
            .count()
    }

    fn process_commands(&mut self) -> Turn {
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Connect {
                    addr,
                    outbound,
                    inbound,
                    options,
                } => {
                    self.open(addr, outbound, inbound, &options);
                }
                Command::Flush { outbound } => {
                    let Some(connection) = find(&mut self.connections, &outbound) else {
                        continue;
                    };

                    if let Err(err) = connection.rearm(&self.poller) {
                        warn!(token = ?outbound.token(), %err, "failed to arm write interest");
                    }
                }
                Command::Close { outbound } => {
                    let Some(connection) = find(&mut self.connections, &outbound) else {
                        continue;
                    };

                    connection.close(&self.poller);
                    if let Some(token) = outbound.token() {
                        self.connections.remove(token);
                    }
                }
                Command::Shutdown => {
                    debug!("shutdown requested");
                    return Turn::Shutdown;
                }
            }
        }

        Turn::Continue
    }

    fn open(
        &mut self,
        addr: SocketAddr,
        outbound: Arc<OutboundQueue>,
        inbound: Box<dyn Inbound>,
        options: &ConnectOptions,
    ) {
        let token = self.connections.insert_with(|token| {
            Connection::new(token, addr, outbound.clone(), inbound, options)
        });
        outbound.bind(token);

        info!(token, %addr, "opening connection");

        let Some(connection) = self.connections.get_mut(token) else {
            return;
        };
        let progress = connection.connect(&self.poller, Instant::now());
        self.apply(token, progress);
    }

    /// Re-issues the connects whose backoff expired by `now`.
    ///
    /// Retries scheduled while firing wait for the next turn, so a zero
    /// backoff cannot spin inside a single turn.
    fn fire_retries(&mut self, now: Instant) {
        let mut due = Vec::new();
        while self.retries.peek().is_some_and(|entry| entry.deadline <= now) {
            due.extend(self.retries.pop());
        }

        for entry in due {
            let Some(connection) = self.connections.get_mut(entry.token) else {
                continue;
            };

            // Stale entry: the connection was replaced or already moved on.
            if connection.retry_at() != Some(entry.deadline) {
                continue;
            }

            trace!(
                token = entry.token,
                attempt = connection.attempts() + 1,
                "retrying connect"
            );
            let progress = connection.connect(&self.poller, now);
            self.apply(entry.token, progress);
        }
    }

    /// The heartbeat, shortened to the next retry deadline.
    fn poll_timeout(&self, now: Instant) -> Duration {
        self.retries
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
            .map_or(self.config.poll_timeout, |until| {
                until.min(self.config.poll_timeout)
            })
    }

    fn dispatch(&mut self, now: Instant) {
        let events = std::mem::take(&mut self.events);

        for event in &events {
            let Some(connection) = self.connections.get_mut(event.token) else {
                trace!(token = event.token, "event for unknown token");
                continue;
            };

            match connection.handle_event(&self.poller, event, now) {
                Ok(progress) => self.apply(event.token, progress),
                Err(err) => {
                    warn!(token = event.token, %err, "I/O error, event skipped");
                }
            }
        }

        self.events = events;
    }

    fn apply(&mut self, token: usize, progress: Progress) {
        match progress {
            Progress::Open => {}
            Progress::Retry(deadline) => self.retries.push(RetryEntry { deadline, token }),
            Progress::Closed => {
                self.connections.remove(token);
                debug!(token, remaining = self.connections.len(), "connection removed");
            }
        }
    }

    /// Closes every connection and fails connects that never reached the loop.
    fn close_all(&mut self) {
        let tokens: Vec<usize> = self.connections.keys().collect();
        for token in tokens {
            if let Some(mut connection) = self.connections.remove(token) {
                connection.close(&self.poller);
            }
        }
        self.retries.clear();

        while let Ok(command) = self.receiver.try_recv() {
            if let Command::Connect { outbound, addr, .. } = command {
                debug!(%addr, "dropping connect received during shutdown");
                outbound.close();
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if !self.connections.is_empty() {
            self.close_all();
        }
    }
}

/// Looks up the connection an outbound queue belongs to.
///
/// Tokens are reused, so the entry under the queue's token must still own it.
fn find<'a>(
    connections: &'a mut Slab<Connection>,
    outbound: &Arc<OutboundQueue>,
) -> Option<&'a mut Connection> {
    let token = outbound.token()?;
    connections.get_mut(token).filter(|c| c.owns(outbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectPolicy;
    use crate::net::ConnectionState;

    use crate::net::socket::Socket;

    use std::fs::File;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::fd::OwnedFd;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn quick_loop() -> EventLoop {
        EventLoop::new(LoopConfig {
            poll_timeout: Duration::from_millis(20),
            ..LoopConfig::default()
        })
        .expect("event loop")
    }

    fn collector() -> (Arc<Mutex<String>>, impl FnMut(&str) + Send + 'static) {
        let text = Arc::new(Mutex::new(String::new()));
        let sink = text.clone();
        (text, move |chunk: &str| sink.lock().unwrap().push_str(chunk))
    }

    fn connect(
        handle: &LoopHandle,
        listener: &TcpListener,
        inbound: impl Inbound + 'static,
    ) -> Outbox {
        let addr = listener.local_addr().expect("local addr");
        handle
            .connect(addr, inbound, ConnectOptions::default())
            .expect("connect")
    }

    fn turn_until(event_loop: &mut EventLoop, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            event_loop.turn();
        }
        panic!("condition not reached");
    }

    #[test]
    #[traced_test]
    fn refused_port_never_connects() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("local addr")
        };

        let mut event_loop = quick_loop();
        let options = ConnectOptions {
            connect_policy: ConnectPolicy::immediate(),
            ..ConnectOptions::default()
        };
        let outbox = event_loop
            .handle()
            .connect(addr, |_: &str| {}, options)
            .expect("connect");

        for _ in 0..3 {
            assert_eq!(event_loop.turn(), Turn::Continue);
            assert_ne!(outbox.state(), ConnectionState::Connected);
        }

        assert!(logs_contain("connect failed, retrying"));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("local addr")
        };

        let mut event_loop = quick_loop();
        let options = ConnectOptions {
            connect_policy: ConnectPolicy::immediate().with_max_attempts(2),
            ..ConnectOptions::default()
        };
        let outbox = event_loop
            .handle()
            .connect(addr, |_: &str| {}, options)
            .expect("connect");

        turn_until(&mut event_loop, || outbox.state() == ConnectionState::Closed);
        assert_eq!(event_loop.connection_count(), 0);
    }

    #[test]
    fn reset_connection_does_not_stop_the_other() {
        let listener_a = TcpListener::bind("127.0.0.1:0").expect("bind a");
        let listener_b = TcpListener::bind("127.0.0.1:0").expect("bind b");

        let mut event_loop = quick_loop();
        let handle = event_loop.handle();

        let (_, inbound_a) = collector();
        let (text_b, inbound_b) = collector();
        let a = connect(&handle, &listener_a, inbound_a);
        let b = connect(&handle, &listener_b, inbound_b);

        turn_until(&mut event_loop, || {
            a.state() == ConnectionState::Connected && b.state() == ConnectionState::Connected
        });

        let (peer_a, _) = listener_a.accept().expect("accept a");
        let (mut peer_b, _) = listener_b.accept().expect("accept b");

        socket2::SockRef::from(&peer_a)
            .set_linger(Some(Duration::ZERO))
            .expect("linger");
        drop(peer_a);
        peer_b.write_all(b"still here").expect("write b");

        turn_until(&mut event_loop, || {
            a.state() == ConnectionState::Closed && *text_b.lock().unwrap() == "still here"
        });

        assert_eq!(b.state(), ConnectionState::Connected);
        assert_eq!(b.send("ack"), Ok(crate::SendStatus::Written));
    }

    #[test]
    fn shutdown_closes_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");

        let mut event_loop = quick_loop();
        let handle = event_loop.handle();
        let outbox = connect(&handle, &listener, |_: &str| {});

        turn_until(&mut event_loop, || outbox.state() == ConnectionState::Connected);

        handle.shutdown().expect("shutdown");
        event_loop.run();

        assert_eq!(outbox.state(), ConnectionState::Closed);
        assert!(matches!(handle.shutdown(), Err(Error::LoopClosed)));
    }

    #[test]
    fn queued_messages_are_written_before_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");

        let event_loop = quick_loop();
        let handle = event_loop.handle();
        let outbox = connect(&handle, &listener, |_: &str| {});

        assert_eq!(outbox.send("last line\n"), Ok(crate::SendStatus::Queued));
        handle.shutdown().expect("shutdown");
        event_loop.run();

        assert_eq!(outbox.state(), ConnectionState::Closed);

        let (mut peer, _) = listener.accept().expect("accept");
        let mut received = Vec::new();
        peer.read_to_end(&mut received).expect("read");
        assert_eq!(received, b"last line\n");
    }

    #[test]
    fn shutdown_grace_bounds_the_drain() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("local addr")
        };

        let event_loop = EventLoop::new(LoopConfig {
            poll_timeout: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(100),
            ..LoopConfig::default()
        })
        .expect("event loop");
        let options = ConnectOptions {
            connect_policy: ConnectPolicy::immediate(),
            ..ConnectOptions::default()
        };
        let outbox = event_loop
            .handle()
            .connect(addr, |_: &str| {}, options)
            .expect("connect");
        outbox.send("nobody listens").expect("send");

        let started = Instant::now();
        event_loop.handle().shutdown().expect("shutdown");
        event_loop.run();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outbox.state(), ConnectionState::Closed);
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    #[traced_test]
    fn read_error_skips_the_event_and_keeps_the_connection() {
        let listener_a = TcpListener::bind("127.0.0.1:0").expect("bind a");
        let listener_b = TcpListener::bind("127.0.0.1:0").expect("bind b");

        let mut event_loop = quick_loop();
        let handle = event_loop.handle();

        let (text_b, inbound_b) = collector();
        let a = connect(&handle, &listener_a, |_: &str| {});
        let b = connect(&handle, &listener_b, inbound_b);

        turn_until(&mut event_loop, || {
            a.state() == ConnectionState::Connected && b.state() == ConnectionState::Connected
        });

        let (mut peer_a, _) = listener_a.accept().expect("accept a");
        let (mut peer_b, _) = listener_b.accept().expect("accept b");

        // Reads on a non-socket fail with an error that is not a disconnect.
        let not_a_socket = OwnedFd::from(File::open("/dev/null").expect("open /dev/null"));
        let token = a.token().expect("token");
        let _registered = event_loop
            .connections
            .get_mut(token)
            .and_then(|connection| connection.replace_socket(Socket::from_fd(not_a_socket)))
            .expect("socket");

        peer_a.write_all(b"unread").expect("write a");
        peer_b.write_all(b"still here").expect("write b");

        turn_until(&mut event_loop, || {
            *text_b.lock().unwrap() == "still here" && logs_contain("I/O error, event skipped")
        });

        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(event_loop.connection_count(), 2);
        assert_eq!(a.send("after"), Ok(crate::SendStatus::Written));

        let mut after = [0; 5];
        peer_a.read_exact(&mut after).expect("read a");
        assert_eq!(&after, b"after");
    }
}
