//! `kqueue`-based poller for macOS and the BSDs.
//!
//! Exposes the same interface as the epoll backend. Read and write interests
//! map to separate `EVFILT_READ`/`EVFILT_WRITE` filters on the same ident, and
//! cross-thread wake-ups use an `EVFILT_USER` event.

use super::common::{Interest, Waker};
use crate::reactor::event::Event;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_USER,
    EVFILT_WRITE, NOTE_TRIGGER, kevent, kqueue, timespec,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use std::{mem, ptr};

/// Ident of the `EVFILT_USER` wake-up event.
const WAKE_IDENT: usize = usize::MAX;

/// kqueue poller.
///
/// The kqueue descriptor itself is owned by the shared [`Waker`], since
/// triggering the user event needs it from other threads.
pub(crate) struct KqueuePoller {
    waker: Arc<Waker>,
    events: Vec<kevent>,
}

// SAFETY: `udata` only ever carries a token, never a pointer that is
// dereferenced, so the event buffer can move to the loop thread.
unsafe impl Send for KqueuePoller {}

impl Waker {
    /// Triggers the user event, interrupting a blocking `kevent` wait.
    pub(crate) fn wake(&self) {
        let change = change(WAKE_IDENT, EVFILT_USER, 0, NOTE_TRIGGER, 0);
        unsafe {
            kevent(
                self.0.as_raw_fd(),
                &change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            );
        }
    }
}

/// Builds a change record; other fields stay zeroed so the layout differences
/// between BSD flavours do not matter.
fn change(ident: usize, filter: i16, flags: u16, fflags: u32, token: usize) -> kevent {
    let mut event: kevent = unsafe { mem::zeroed() };
    event.ident = ident as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event.fflags = fflags as _;
    event.udata = token as _;
    event
}

impl KqueuePoller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let kq = unsafe { kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };

        let poller = Self {
            waker: Arc::new(Waker(kq)),
            events: Vec::with_capacity(capacity.max(1)),
        };

        poller.apply(&[change(
            WAKE_IDENT,
            EVFILT_USER,
            EV_ADD | EV_ENABLE | EV_CLEAR,
            0,
            0,
        )])?;

        Ok(poller)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    fn kq(&self) -> RawFd {
        self.waker.0.as_raw_fd()
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.reregister(fd, token, interest)
    }

    /// Adds the wanted filters and deletes the others.
    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let read = if interest.read { EV_ADD | EV_ENABLE } else { EV_DELETE };
        let write = if interest.write { EV_ADD | EV_ENABLE } else { EV_DELETE };

        self.apply(&[
            change(fd as usize, EVFILT_READ, read, 0, token),
            change(fd as usize, EVFILT_WRITE, write, 0, token),
        ])
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.apply(&[
            change(fd as usize, EVFILT_READ, EV_DELETE, 0, 0),
            change(fd as usize, EVFILT_WRITE, EV_DELETE, 0, 0),
        ])
    }

    /// Submits `changes` with `EV_RECEIPT` so each change reports its own
    /// status. Deleting a filter that was never added (`ENOENT`) is fine.
    fn apply(&self, changes: &[kevent]) -> io::Result<()> {
        let mut receipts: Vec<kevent> = Vec::with_capacity(changes.len());
        let mut changes = changes.to_vec();
        for change in &mut changes {
            change.flags |= libc::EV_RECEIPT as _;
        }

        let n = unsafe {
            kevent(
                self.kq(),
                changes.as_ptr(),
                changes.len() as _,
                receipts.as_mut_ptr(),
                changes.len() as _,
                ptr::null(),
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the kernel wrote `n` receipts.
        unsafe {
            receipts.set_len(n as usize);
        }

        for receipt in &receipts {
            let errno = receipt.data as i32;
            if receipt.flags as u16 & EV_ERROR as u16 != 0
                && errno != 0
                && errno != libc::ENOENT
            {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }

        Ok(())
    }

    /// Waits for readiness and fills `events`, merging the read and write
    /// filters of one socket into a single [`Event`].
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        let ts = timeout.map(|t| timespec {
            tv_sec: t.as_secs().min(i64::MAX as u64) as _,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

        let n = unsafe {
            kevent(
                self.kq(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.capacity() as _,
                ts_ptr,
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
            if ev.filter == EVFILT_USER {
                continue;
            }

            let token = ev.udata as usize;
            let hangup = ev.flags & (EV_EOF | EV_ERROR) != 0;
            let readable = ev.filter == EVFILT_READ;
            let writable = ev.filter == EVFILT_WRITE;

            if let Some(e) = events.iter_mut().find(|e| e.token == token) {
                e.readable |= readable || hangup;
                e.writable |= writable;
                e.hangup |= hangup;
            } else {
                events.push(Event {
                    token,
                    readable: readable || hangup,
                    writable,
                    hangup,
                });
            }
        }

        unsafe {
            self.events.set_len(0);
        }

        Ok(())
    }
}
