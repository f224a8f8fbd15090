use crate::reactor::poller::platform::{
    sys_connect, sys_recv, sys_send, sys_socket, sys_take_socket_error,
};

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// A non-blocking TCP socket.
///
/// The descriptor is closed when the last owner drops it. The event loop reads
/// through `&Socket`; the outbound queue writes through a [`SocketWriter`]
/// sharing the same socket.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a socket and starts connecting it to `addr`.
    ///
    /// Returns the socket and whether the connect already completed.
    pub(crate) fn connect(addr: &SocketAddr) -> io::Result<(Socket, bool)> {
        let fd = sys_socket(addr)?;
        let done = sys_connect(fd.as_raw_fd(), addr)?;

        Ok((Socket { fd }, done))
    }

    #[cfg(test)]
    pub(crate) fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    /// Outcome of the last connect: `None` when it succeeded.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        sys_take_socket_error(self.fd.as_raw_fd())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        sys_recv(self.fd.as_raw_fd(), buf)
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        sys_send(self.fd.as_raw_fd(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owned write half handed to the outbound queue.
pub(crate) struct SocketWriter(pub(crate) Arc<Socket>);

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Errors after which the socket is unusable and the connection must close.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
