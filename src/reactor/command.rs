use crate::config::ConnectOptions;
use crate::net::Inbound;
use crate::net::outbound::OutboundQueue;

use std::net::SocketAddr;
use std::sync::Arc;

/// Requests sent from producer threads to the event loop.
///
/// Per-connection commands identify their target by its outbound queue; the
/// loop looks up the token the queue was bound to when the connection was
/// created.
pub(crate) enum Command {
    Connect {
        addr: SocketAddr,
        outbound: Arc<OutboundQueue>,
        inbound: Box<dyn Inbound>,
        options: ConnectOptions,
    },
    /// Messages were queued on an idle connection; re-arm write interest.
    Flush {
        outbound: Arc<OutboundQueue>,
    },
    Close {
        outbound: Arc<OutboundQueue>,
    },
    Shutdown,
}
