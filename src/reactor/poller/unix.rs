use libc::{
    AF_INET, AF_INET6, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, SO_ERROR,
    SOCK_STREAM, SOL_SOCKET, c_int, c_void, connect, fcntl, getsockopt, recv, send, sockaddr,
    sockaddr_in, sockaddr_in6, sockaddr_storage, socket, socklen_t,
};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::{io, mem};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

/// Receives into `buffer` from a non-blocking socket.
pub(crate) fn sys_recv(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { recv(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len(), 0) };

    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Sends `buffer` on a non-blocking socket.
///
/// Writing to a socket the peer has reset reports `EPIPE` instead of raising
/// `SIGPIPE` (`MSG_NOSIGNAL` on Linux, `SO_NOSIGPIPE` set at creation elsewhere).
pub(crate) fn sys_send(fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
    let n = unsafe { send(fd, buffer.as_ptr() as *const c_void, buffer.len(), SEND_FLAGS) };

    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Sets a file descriptor to non-blocking, close-on-exec mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = unsafe { fcntl(fd, F_GETFD) };
    if flags < 0 || unsafe { fcntl(fd, F_SETFD, flags | FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Creates a non-blocking stream socket for `addr`'s family.
pub(crate) fn sys_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    };

    let fd = unsafe { socket(domain, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // Closed on every early return below.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    sys_set_nonblocking(fd)?;

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    sys_set_nosigpipe(fd)?;

    Ok(owned)
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn sys_set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let yes: c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &yes as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Starts a connect on a non-blocking socket.
///
/// `Ok(true)` means the connection completed immediately, `Ok(false)` that it
/// is in progress and completion will be reported as writability.
pub(crate) fn sys_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe { connect(fd, &storage as *const _ as *const sockaddr, len) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

/// Reads and clears the pending error of a socket (`SO_ERROR`).
///
/// Used to learn how a non-blocking connect ended.
pub(crate) fn sys_take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else if err != 0 {
        Ok(Some(io::Error::from_raw_os_error(err)))
    } else {
        Ok(None)
    }
}

/// Converts a `SocketAddr` to a `sockaddr_storage`.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}
