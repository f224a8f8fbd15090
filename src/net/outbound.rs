use super::ConnectionState;
use crate::codec;
use crate::error::SendError;
use crate::reactor::LoopHandle;
use crate::reactor::command::Command;

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace, warn};

/// Outcome of an accepted [`Outbox::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every byte was handed to the socket during the call.
    Written,

    /// The message (or its unwritten rest) waits in the queue for the event
    /// loop to flush it.
    Queued,
}

/// What [`OutboundQueue::push`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    Written,

    /// `arm` is set when the queue of a connected socket went from empty to
    /// non-empty: the loop must start watching for writability.
    Queued { arm: bool },
}

/// How far [`OutboundQueue::flush`] got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    /// The queue is empty.
    Drained,

    /// The socket stopped accepting bytes; the head message stays queued.
    Blocked,
}

/// FIFO of messages waiting for one connection's socket.
///
/// Producers append through [`push`](Self::push); the event loop drains it
/// through [`flush`](Self::flush). Both write while holding the queue lock, so
/// the bytes of two messages never interleave on the wire and a message leaves
/// the queue only once its last byte has been written.
pub(crate) struct OutboundQueue {
    inner: Mutex<Inner>,

    /// Slab token of the connection, set once the loop has created it.
    token: OnceLock<usize>,

    limit: Option<usize>,
}

struct Inner {
    state: ConnectionState,

    /// Present while connected.
    writer: Option<Box<dyn Write + Send>>,

    /// Pending messages; the head is advanced past bytes already written.
    pending: VecDeque<Bytes>,

    /// Bytes of the head message already on the wire.
    head_sent: usize,

    /// Messages dropped half-written by a write error.
    discarded: u64,
}

impl OutboundQueue {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                writer: None,
                pending: VecDeque::new(),
                head_sent: 0,
                discarded: 0,
            }),
            token: OnceLock::new(),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bind(&self, token: usize) {
        let _ = self.token.set(token);
    }

    pub(crate) fn token(&self) -> Option<usize> {
        self.token.get().copied()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    pub(crate) fn discarded(&self) -> u64 {
        self.lock().discarded
    }

    /// Offers `message` for sending.
    ///
    /// On a connected socket with nothing queued, one non-blocking write is
    /// attempted right away; whatever it could not take is queued.
    pub(crate) fn push(&self, mut message: Bytes) -> Result<Push, SendError> {
        let mut inner = self.lock();

        if inner.state == ConnectionState::Closed {
            return Err(SendError::NotConnected);
        }

        if let Some(limit) = self.limit {
            if inner.pending.len() >= limit {
                return Err(SendError::QueueFull { limit });
            }
        }

        if message.is_empty() {
            return Ok(Push::Written);
        }

        let connected = inner.state == ConnectionState::Connected;

        if connected && inner.pending.is_empty() {
            if let Some(writer) = inner.writer.as_mut() {
                match write_once(writer.as_mut(), &message) {
                    Ok(n) if n == message.len() => {
                        trace!(bytes = n, "message written immediately");
                        return Ok(Push::Written);
                    }
                    Ok(n) => {
                        message.advance(n);
                        inner.head_sent = n;
                    }
                    Err(err) => {
                        debug!(%err, "immediate write failed, queueing message");
                    }
                }
            }
        }

        let arm = connected && inner.pending.is_empty();
        inner.pending.push_back(message);

        Ok(Push::Queued { arm })
    }

    /// Writes queued messages in order until the queue is empty or the socket
    /// stops accepting bytes. Event loop only.
    ///
    /// Each message gets one write attempt per call: a short write advances
    /// the head and stops. A hard error keeps a message that had no byte
    /// written; a message already partly on the wire is discarded, since
    /// resending it would duplicate its first bytes.
    pub(crate) fn flush(&self) -> io::Result<Flush> {
        let mut guard = self.lock();
        let Inner {
            writer,
            pending,
            head_sent,
            discarded,
            ..
        } = &mut *guard;

        let Some(writer) = writer.as_mut() else {
            return Ok(if pending.is_empty() {
                Flush::Drained
            } else {
                Flush::Blocked
            });
        };

        while let Some(head) = pending.front_mut() {
            match write_once(writer.as_mut(), head) {
                Ok(0) => return Ok(Flush::Blocked),
                Ok(n) if n == head.len() => {
                    pending.pop_front();
                    *head_sent = 0;
                }
                Ok(n) => {
                    head.advance(n);
                    *head_sent += n;
                    return Ok(Flush::Blocked);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Flush::Blocked);
                }
                Err(err) => {
                    if *head_sent > 0 {
                        warn!(
                            sent = *head_sent,
                            unsent = head.len(),
                            "discarding partially written message"
                        );
                        pending.pop_front();
                        *head_sent = 0;
                        *discarded += 1;
                    }
                    return Err(err);
                }
            }
        }

        Ok(Flush::Drained)
    }

    /// Moves to `Connecting` and detaches any writer left by a failed
    /// attempt; sends queue up until a new writer is attached.
    ///
    /// A head message already partly written to the old socket is discarded.
    pub(crate) fn connecting(&self) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }

        inner.state = ConnectionState::Connecting;
        inner.writer = None;

        if inner.head_sent > 0 {
            warn!(sent = inner.head_sent, "discarding message torn by a failed connect");
            inner.pending.pop_front();
            inner.head_sent = 0;
            inner.discarded += 1;
        }
    }

    /// Attaches the socket's write half and moves to `Connected`.
    pub(crate) fn connected(&self, writer: Box<dyn Write + Send>) {
        let mut inner = self.lock();
        inner.writer = Some(writer);
        inner.state = ConnectionState::Connected;
    }

    /// Moves to `Closed`, dropping the writer and every pending message.
    ///
    /// Returns how many messages were dropped unsent.
    pub(crate) fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.state = ConnectionState::Closed;
        inner.writer = None;
        inner.head_sent = 0;

        let dropped = inner.pending.len();
        inner.pending.clear();
        dropped
    }
}

/// One write attempt, retried only when interrupted by a signal.
fn write_once(writer: &mut (dyn Write + Send), bytes: &[u8]) -> io::Result<usize> {
    loop {
        match writer.write(bytes) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Producer-side handle of one connection.
///
/// `Outbox` is cheap to clone and can be moved to any thread. Sending never
/// blocks on the network: a message is either written on the spot without
/// blocking, or queued for the event loop.
#[derive(Clone)]
pub struct Outbox {
    queue: Arc<OutboundQueue>,
    handle: LoopHandle,
}

impl Outbox {
    pub(crate) fn new(queue: Arc<OutboundQueue>, handle: LoopHandle) -> Self {
        Self { queue, handle }
    }

    /// Sends `text` encoded as UTF-8.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] once the connection is closed, and
    /// [`SendError::QueueFull`] when a queue bound is configured and reached.
    pub fn send(&self, text: &str) -> Result<SendStatus, SendError> {
        self.send_bytes(codec::encode(text))
    }

    /// Sends raw bytes.
    pub fn send_bytes(&self, bytes: Bytes) -> Result<SendStatus, SendError> {
        match self.queue.push(bytes)? {
            Push::Written => Ok(SendStatus::Written),
            Push::Queued { arm } => {
                if arm {
                    let flush = Command::Flush {
                        outbound: self.queue.clone(),
                    };
                    if let Err(err) = self.handle.send(flush) {
                        warn!(%err, "queued a message but the event loop is gone");
                    }
                }
                Ok(SendStatus::Queued)
            }
        }
    }

    /// Number of messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Messages dropped because a write failed halfway through them.
    pub fn discarded(&self) -> u64 {
        self.queue.discarded()
    }

    pub fn state(&self) -> ConnectionState {
        self.queue.state()
    }

    #[cfg(test)]
    pub(crate) fn token(&self) -> Option<usize> {
        self.queue.token()
    }

    /// Asks the event loop to close the connection.
    ///
    /// Messages still queued when the loop handles the request are dropped.
    pub fn close(&self) -> crate::Result<()> {
        self.handle.send(Command::Close {
            outbound: self.queue.clone(),
        })
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("token", &self.queue.token())
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory socket accepting at most `budget` bytes until refilled.
    #[derive(Default)]
    pub(crate) struct Budget {
        pub(crate) wire: Vec<u8>,
        pub(crate) budget: usize,
        pub(crate) fail: Option<io::ErrorKind>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct BudgetWriter(pub(crate) Arc<Mutex<Budget>>);

    impl BudgetWriter {
        pub(crate) fn refill(&self, budget: usize) {
            self.0.lock().unwrap().budget = budget;
        }

        pub(crate) fn fail_with(&self, kind: io::ErrorKind) {
            self.0.lock().unwrap().fail = Some(kind);
        }

        pub(crate) fn wire(&self) -> Vec<u8> {
            self.0.lock().unwrap().wire.clone()
        }
    }

    impl Write for BudgetWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.0.lock().unwrap();

            if let Some(kind) = state.fail {
                return Err(kind.into());
            }
            if state.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let n = buf.len().min(state.budget);
            state.budget -= n;
            state.wire.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connected_queue(budget: usize) -> (OutboundQueue, BudgetWriter) {
        let writer = BudgetWriter::default();
        writer.refill(budget);

        let queue = OutboundQueue::new(None);
        queue.connected(Box::new(writer.clone()));
        (queue, writer)
    }

    #[test]
    fn immediate_write_skips_the_queue() {
        let (queue, writer) = connected_queue(64);

        assert_eq!(queue.push(Bytes::from_static(b"hello")), Ok(Push::Written));
        assert_eq!(queue.len(), 0);
        assert_eq!(writer.wire(), b"hello");
    }

    #[test]
    fn partial_immediate_write_queues_the_rest() {
        let (queue, writer) = connected_queue(3);

        assert_eq!(
            queue.push(Bytes::from_static(b"hello")),
            Ok(Push::Queued { arm: true })
        );
        assert_eq!(writer.wire(), b"hel");

        writer.refill(64);
        assert_eq!(queue.flush().unwrap(), Flush::Drained);
        assert_eq!(writer.wire(), b"hello");
    }

    #[test]
    fn messages_queue_while_connecting() {
        let queue = OutboundQueue::new(None);
        queue.connecting();

        assert_eq!(
            queue.push(Bytes::from_static(b"a")),
            Ok(Push::Queued { arm: false })
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state(), ConnectionState::Connecting);
    }

    #[test]
    fn ping_pong_with_room_for_one_message() {
        let queue = OutboundQueue::new(None);
        queue.connecting();
        queue.push(Bytes::from_static(b"ping")).unwrap();
        queue.push(Bytes::from_static(b"pong")).unwrap();

        let writer = BudgetWriter::default();
        queue.connected(Box::new(writer.clone()));

        writer.refill(4);
        assert_eq!(queue.flush().unwrap(), Flush::Blocked);
        assert_eq!(writer.wire(), b"ping");
        assert_eq!(queue.len(), 1);

        writer.refill(4);
        assert_eq!(queue.flush().unwrap(), Flush::Drained);
        assert_eq!(writer.wire(), b"pingpong");
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn drains_in_fifo_order_one_message_per_event() {
        let queue = OutboundQueue::new(None);
        queue.connecting();

        let messages: Vec<String> = (0..10).map(|i| format!("m{i:02};")).collect();
        for message in &messages {
            queue.push(codec::encode(message)).unwrap();
        }

        let writer = BudgetWriter::default();
        queue.connected(Box::new(writer.clone()));

        for remaining in (0..messages.len()).rev() {
            writer.refill(4);
            queue.flush().unwrap();
            assert_eq!(queue.len(), remaining);
        }

        assert_eq!(writer.wire(), messages.concat().as_bytes());
    }

    #[test]
    fn push_on_non_empty_queue_never_writes_ahead() {
        let (queue, writer) = connected_queue(0);

        queue.push(Bytes::from_static(b"first")).unwrap();
        writer.refill(64);
        assert_eq!(
            queue.push(Bytes::from_static(b"second")),
            Ok(Push::Queued { arm: false })
        );
        assert!(writer.wire().is_empty());

        queue.flush().unwrap();
        assert_eq!(writer.wire(), b"firstsecond");
    }

    #[test]
    fn closed_queue_rejects_messages() {
        let (queue, _writer) = connected_queue(0);
        queue.push(Bytes::from_static(b"lost")).unwrap();

        assert_eq!(queue.close(), 1);
        assert_eq!(
            queue.push(Bytes::from_static(b"late")),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn reconnecting_detaches_the_old_writer() {
        let (queue, old) = connected_queue(2);
        queue.push(Bytes::from_static(b"torn")).unwrap();
        queue.push(Bytes::from_static(b"kept")).unwrap();

        queue.connecting();
        assert_eq!(queue.state(), ConnectionState::Connecting);
        assert_eq!(queue.discarded(), 1);

        old.refill(64);
        assert_eq!(
            queue.push(Bytes::from_static(b"late")),
            Ok(Push::Queued { arm: false })
        );
        assert_eq!(queue.flush().unwrap(), Flush::Blocked);
        assert_eq!(old.wire(), b"to");

        let new = BudgetWriter::default();
        new.refill(64);
        queue.connected(Box::new(new.clone()));
        assert_eq!(queue.flush().unwrap(), Flush::Drained);
        assert_eq!(new.wire(), b"keptlate");
    }

    #[test]
    fn bounded_queue_reports_full() {
        let queue = OutboundQueue::new(Some(2));
        queue.connecting();

        queue.push(Bytes::from_static(b"a")).unwrap();
        queue.push(Bytes::from_static(b"b")).unwrap();
        assert_eq!(
            queue.push(Bytes::from_static(b"c")),
            Err(SendError::QueueFull { limit: 2 })
        );
    }

    #[test]
    fn hard_error_keeps_untouched_head() {
        let (queue, writer) = connected_queue(0);
        queue.push(Bytes::from_static(b"keep")).unwrap();

        writer.fail_with(io::ErrorKind::Other);
        assert!(queue.flush().is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.discarded(), 0);
    }

    #[test]
    fn hard_error_discards_partially_written_head() {
        let (queue, writer) = connected_queue(2);
        queue.push(Bytes::from_static(b"torn")).unwrap();
        queue.push(Bytes::from_static(b"next")).unwrap();
        assert_eq!(writer.wire(), b"to");

        writer.fail_with(io::ErrorKind::Other);
        assert!(queue.flush().is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.discarded(), 1);

        writer.0.lock().unwrap().fail = None;
        writer.refill(64);
        queue.flush().unwrap();
        assert_eq!(writer.wire(), b"tonext");
    }
}
