use super::Inbound;
use super::outbound::OutboundQueue;
use super::socket::{Socket, SocketWriter, is_disconnect};
use crate::codec::StreamDecoder;
use crate::config::{ConnectOptions, ConnectPolicy};
use crate::reactor::event::Event;
use crate::reactor::poller::{Interest, Poller};

use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Requested, not yet picked up by the event loop.
    Disconnected,

    /// A connect is in flight or waiting for its retry delay.
    Connecting,

    Connected,

    /// Terminal: the peer closed the stream, the socket failed, the connect
    /// policy gave up, or a close was requested.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the event loop has to do after a connection handled something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Open,

    /// A connect failed; call [`Connection::connect`] again at this instant.
    Retry(Instant),

    /// The connection is closed and can be removed.
    Closed,
}

/// One outbound TCP connection, owned by the event loop thread.
pub(crate) struct Connection {
    token: usize,
    addr: SocketAddr,
    state: ConnectionState,

    socket: Option<Arc<Socket>>,

    /// Interest currently registered with the poller, if any.
    registered: Option<Interest>,

    decoder: StreamDecoder,
    scratch: Box<[u8]>,
    stalled: bool,

    outbound: Arc<OutboundQueue>,
    inbound: Box<dyn Inbound>,

    policy: ConnectPolicy,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(
        token: usize,
        addr: SocketAddr,
        outbound: Arc<OutboundQueue>,
        inbound: Box<dyn Inbound>,
        options: &ConnectOptions,
    ) -> Self {
        Self {
            token,
            addr,
            state: ConnectionState::Disconnected,
            socket: None,
            registered: None,
            decoder: StreamDecoder::new(options.malformed_policy),
            scratch: vec![0; options.read_chunk.max(1)].into_boxed_slice(),
            stalled: false,
            outbound,
            inbound,
            policy: options.connect_policy,
            attempts: 0,
            retry_at: None,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Whether messages still wait for a connection that can deliver them.
    pub(crate) fn has_pending_output(&self) -> bool {
        self.state != ConnectionState::Closed && self.outbound.has_pending()
    }

    /// Swaps the socket reads go through, keeping the registration and the
    /// writer.
    #[cfg(test)]
    pub(crate) fn replace_socket(&mut self, socket: Socket) -> Option<Arc<Socket>> {
        self.socket.replace(Arc::new(socket))
    }

    pub(crate) fn owns(&self, outbound: &Arc<OutboundQueue>) -> bool {
        Arc::ptr_eq(&self.outbound, outbound)
    }

    /// Issues a non-blocking connect.
    ///
    /// Completes on the spot when the OS says so; otherwise waits for
    /// writability. A connect that fails right away counts as a failed attempt.
    pub(crate) fn connect(&mut self, poller: &Poller, now: Instant) -> Progress {
        if self.state == ConnectionState::Closed {
            return Progress::Closed;
        }

        self.retry_at = None;
        self.attempts = self.attempts.saturating_add(1);
        self.outbound.connecting();
        self.set_state(ConnectionState::Connecting);

        debug!(token = self.token, addr = %self.addr, attempt = self.attempts, "connecting");

        let (socket, done) = match Socket::connect(&self.addr) {
            Ok(connect) => connect,
            Err(err) => return self.connect_failed(poller, err, now),
        };
        self.socket = Some(Arc::new(socket));

        let armed = if done {
            self.established(poller)
        } else {
            self.arm(poller, Interest::WRITE)
        };

        match armed {
            Ok(()) => Progress::Open,
            Err(err) => self.connect_failed(poller, err, now),
        }
    }

    /// Handles one readiness event.
    ///
    /// An `Err` means this event's handling was cut short by a transient I/O
    /// error; the connection stays open and queued messages stay queued.
    pub(crate) fn handle_event(
        &mut self,
        poller: &Poller,
        event: &Event,
        now: Instant,
    ) -> io::Result<Progress> {
        match self.state {
            ConnectionState::Connecting => Ok(self.finish_connect(poller, event, now)),
            ConnectionState::Connected => self.service(poller, event),
            ConnectionState::Disconnected | ConnectionState::Closed => {
                trace!(token = self.token, "ignoring event for idle connection");
                Ok(Progress::Open)
            }
        }
    }

    /// Re-arms write interest after producers queued messages.
    pub(crate) fn rearm(&mut self, poller: &Poller) -> io::Result<()> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }

        self.arm(poller, Interest::reading(self.outbound.has_pending()))
    }

    /// Closes the connection: deregisters and drops the socket, drops queued
    /// messages and reports bytes that never became text.
    pub(crate) fn close(&mut self, poller: &Poller) {
        if self.state == ConnectionState::Closed {
            return;
        }

        self.release(poller);
        self.retry_at = None;

        let dropped = self.outbound.close();
        if dropped > 0 {
            warn!(token = self.token, dropped, "closing with unsent messages");
        }

        let leftover = std::mem::take(&mut self.decoder).finish();
        if !leftover.is_empty() {
            warn!(
                token = self.token,
                bytes = leftover.len(),
                "stream ended with undecodable bytes"
            );
        }

        self.set_state(ConnectionState::Closed);
        info!(token = self.token, addr = %self.addr, "connection closed");
    }

    fn finish_connect(&mut self, poller: &Poller, event: &Event, now: Instant) -> Progress {
        let Some(socket) = self.socket.as_ref() else {
            // Waiting for a retry deadline; a stray event from the old socket.
            return Progress::Open;
        };

        let outcome = match socket.take_error() {
            Ok(None) if event.hangup && !event.writable => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket hung up during connect",
            )),
            Ok(None) => Ok(()),
            Ok(Some(err)) | Err(err) => Err(err),
        };

        match outcome.and_then(|()| self.established(poller)) {
            Ok(()) => Progress::Open,
            Err(err) => self.connect_failed(poller, err, now),
        }
    }

    fn established(&mut self, poller: &Poller) -> io::Result<()> {
        let Some(socket) = self.socket.clone() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        self.outbound.connected(Box::new(SocketWriter(socket)));
        self.arm(poller, Interest::reading(self.outbound.has_pending()))?;

        info!(token = self.token, addr = %self.addr, attempt = self.attempts, "connected");
        self.set_state(ConnectionState::Connected);

        Ok(())
    }

    /// Drops the failed socket and either schedules the next attempt or gives
    /// up, according to the connect policy.
    fn connect_failed(&mut self, poller: &Poller, err: io::Error, now: Instant) -> Progress {
        self.release(poller);
        self.outbound.connecting();

        if !self.policy.allows_retry(self.attempts) {
            warn!(
                token = self.token,
                addr = %self.addr,
                attempts = self.attempts,
                %err,
                "giving up connecting"
            );
            self.close(poller);
            return Progress::Closed;
        }

        let deadline = now + self.policy.backoff(self.attempts);
        debug!(
            token = self.token,
            addr = %self.addr,
            attempt = self.attempts,
            %err,
            "connect failed, retrying"
        );

        self.retry_at = Some(deadline);
        Progress::Retry(deadline)
    }

    /// Services a connected socket: read first, then flush.
    fn service(&mut self, poller: &Poller, event: &Event) -> io::Result<Progress> {
        if event.readable && !self.read_ready()? {
            self.close(poller);
            return Ok(Progress::Closed);
        }

        if event.writable {
            match self.outbound.flush() {
                Ok(_) => {}
                Err(err) if is_disconnect(&err) => {
                    debug!(token = self.token, %err, "peer gone while writing");
                    self.close(poller);
                    return Ok(Progress::Closed);
                }
                Err(err) => return Err(err),
            }
        }

        self.rearm(poller)?;
        Ok(Progress::Open)
    }

    /// Reads until the socket would block, surfacing decoded text.
    ///
    /// Returns `false` once the stream has ended.
    fn read_ready(&mut self) -> io::Result<bool> {
        let Some(socket) = self.socket.clone() else {
            return Ok(false);
        };

        loop {
            match (&*socket).read(&mut self.scratch) {
                Ok(0) => {
                    debug!(token = self.token, "end of stream");
                    return Ok(false);
                }
                Ok(n) => {
                    let text = self.decoder.feed(&self.scratch[..n]);
                    trace!(token = self.token, bytes = n, chars = text.len(), "read");

                    if !text.is_empty() {
                        self.inbound.on_text(&text);
                    }

                    if !self.stalled && self.decoder.is_stalled() {
                        self.stalled = true;
                        warn!(
                            token = self.token,
                            "malformed input; no further text will be decoded"
                        );
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_disconnect(&err) => {
                    debug!(token = self.token, %err, "connection lost");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Registers or updates the poller interest, skipping no-op updates.
    fn arm(&mut self, poller: &Poller, interest: Interest) -> io::Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        let fd = socket.as_raw_fd();

        match self.registered {
            Some(current) if current == interest => return Ok(()),
            Some(_) => poller.reregister(fd, self.token, interest)?,
            None => poller.register(fd, self.token, interest)?,
        }

        self.registered = Some(interest);
        Ok(())
    }

    /// Deregisters and drops the socket, if any.
    fn release(&mut self, poller: &Poller) {
        if let Some(socket) = self.socket.take() {
            if self.registered.take().is_some() {
                if let Err(err) = poller.deregister(socket.as_raw_fd()) {
                    trace!(token = self.token, %err, "deregister failed");
                }
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }

        trace!(token = self.token, from = %self.state, to = %state, "state change");
        self.state = state;
        self.inbound.on_state(state);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.outbound.close();
        }
    }
}
