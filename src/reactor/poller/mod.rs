//! Platform-specific readiness poller.
//!
//! This module puts one interface over the OS readiness facilities:
//! `epoll` on Linux and Android, `kqueue` on macOS and the BSDs.
//!
//! The event loop uses the poller to:
//! - register sockets with a read and/or write interest,
//! - block until one of them is ready or the heartbeat expires,
//! - be woken from another thread when a producer submits a command.
//!
//! The backend is selected at compile time.

pub(crate) mod common;

pub(crate) use common::{Interest, Waker};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) type Poller = epoll::EpollPoller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) type Poller = kqueue::KqueuePoller;

pub(crate) mod unix;

pub(crate) use unix as platform;
