use super::ConnectionState;

/// Receives what the event loop reads from a connection.
///
/// Both methods run on the event loop thread, so they should return quickly:
/// a slow handler delays every connection served by the loop.
///
/// Any `FnMut(&str) + Send` closure is an `Inbound` that ignores state changes.
pub trait Inbound: Send {
    /// Called once per non-empty chunk of decoded text.
    ///
    /// Chunks follow socket reads, not the peer's message boundaries.
    fn on_text(&mut self, text: &str);

    /// Called after every state transition.
    fn on_state(&mut self, state: ConnectionState) {
        let _ = state;
    }
}

impl<F> Inbound for F
where
    F: FnMut(&str) + Send,
{
    fn on_text(&mut self, text: &str) {
        self(text)
    }
}
