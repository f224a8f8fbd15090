use crate::error::{Result, SendError};
use crate::net::{ConnectionState, Outbox, SendStatus};
use crate::reactor::LoopHandle;

use bytes::Bytes;
use std::thread::JoinHandle;
use tracing::error;

/// A running client: one event loop thread serving one connection.
///
/// Dropping the client shuts the loop down and waits for its thread.
pub struct Client {
    outbox: Outbox,
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    pub(crate) fn new(outbox: Outbox, handle: LoopHandle, thread: JoinHandle<()>) -> Self {
        Self {
            outbox,
            handle,
            thread: Some(thread),
        }
    }

    /// Sends `text`; see [`Outbox::send`].
    pub fn send(&self, text: &str) -> std::result::Result<SendStatus, SendError> {
        self.outbox.send(text)
    }

    pub fn send_bytes(&self, bytes: Bytes) -> std::result::Result<SendStatus, SendError> {
        self.outbox.send_bytes(bytes)
    }

    pub fn state(&self) -> ConnectionState {
        self.outbox.state()
    }

    /// Producer handle that can be cloned to other threads.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Handle to the client's event loop, for opening more connections on it.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Asks the event loop to stop.
    ///
    /// Messages already accepted by [`send`](Self::send) are still written,
    /// within the builder's shutdown grace period. Returns immediately; use
    /// [`join`](Self::join) to wait for the loop.
    pub fn shutdown(&self) -> Result<()> {
        self.handle.shutdown()
    }

    /// Waits for the event loop thread to finish.
    pub fn join(mut self) {
        self.wait();
    }

    fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.handle.shutdown();
            self.wait();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("outbox", &self.outbox)
            .field("running", &self.thread.is_some())
            .finish()
    }
}
