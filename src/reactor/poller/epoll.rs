//! Linux `epoll`-based poller.
//!
//! Responsibilities:
//! - Register sockets with read/write interests
//! - Block waiting for readiness, at most for the given timeout
//! - Wake the event loop when a producer submits a command
//!
//! Registrations are level-triggered: a socket stays reported as long as it is
//! ready, so the loop never has to drain a socket completely in one go.

use super::common::{Interest, Waker};
use crate::reactor::event::Event;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event,
    epoll_wait,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// Reserved token of the wake-up eventfd.
///
/// Connection tokens come from the slab and never reach `u64::MAX`.
const WAKE_TOKEN: u64 = u64::MAX;

/// Linux `epoll` poller.
pub(crate) struct EpollPoller {
    epoll: OwnedFd,

    /// Reusable buffer the kernel fills on each wait.
    events: Vec<epoll_event>,

    /// Wraps the eventfd registered under [`WAKE_TOKEN`].
    waker: Arc<Waker>,
}

impl Waker {
    /// Interrupts a blocking `epoll_wait` on the owning poller.
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0.as_raw_fd(), &buf as *const u64 as *const _, 8);
        }
    }
}

/// Converts a wait timeout to `epoll_wait` milliseconds.
///
/// Rounds up, so a deadline less than a millisecond away is waited for
/// instead of polled for in a loop. `None` waits forever.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    timeout
        .map(|t| t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32)
        .unwrap_or(-1)
}

impl EpollPoller {
    /// Creates the epoll instance and its wake-up eventfd.
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let eventfd = unsafe { libc::eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if eventfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let eventfd = unsafe { OwnedFd::from_raw_fd(eventfd) };

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe {
            epoll_ctl(
                epoll.as_raw_fd(),
                EPOLL_CTL_ADD,
                eventfd.as_raw_fd(),
                &mut event,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            events: Vec::with_capacity(capacity.max(1)),
            waker: Arc::new(Waker(eventfd)),
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_ADD, fd, token, interest)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.control(EPOLL_CTL_MOD, fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };

        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn control(&self, op: i32, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut flags = EPOLLRDHUP;

        if interest.read {
            flags |= EPOLLIN;
        }
        if interest.write {
            flags |= EPOLLOUT;
        }

        let mut event = epoll_event {
            events: flags as u32,
            u64: token as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Waits for readiness and fills `events`.
    ///
    /// Returns when a socket is ready, the waker fires, the timeout expires or
    /// a signal interrupts the wait. `events` is cleared first in every case.
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        let timeout_ms = timeout_ms(timeout);

        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        // SAFETY: the kernel initialized the first `n` entries.
        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            if ev.u64 == WAKE_TOKEN {
                let mut buf = 0u64;
                unsafe {
                    libc::read(self.waker.0.as_raw_fd(), &mut buf as *mut u64 as *mut _, 8);
                }
                continue;
            }

            let flags = ev.events;
            let hangup = flags & ((EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32) != 0;

            events.push(Event {
                token: ev.u64 as usize,
                readable: hangup || flags & (EPOLLIN as u32) != 0,
                writable: flags & (EPOLLOUT as u32) != 0,
                hangup,
            });
        }

        unsafe {
            self.events.set_len(0);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up_to_whole_milliseconds() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(300))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1500))), 2);
        assert_eq!(timeout_ms(Some(Duration::from_secs(1))), 1000);
        assert_eq!(timeout_ms(Some(Duration::MAX)), i32::MAX);
    }

    #[test]
    fn waker_interrupts_a_blocking_wait() {
        let mut poller = EpollPoller::new(4).expect("poller");
        let mut events = Vec::new();

        poller.waker().wake();
        poller
            .poll(&mut events, Some(Duration::from_secs(5)))
            .expect("poll");

        assert!(events.is_empty());
    }
}
