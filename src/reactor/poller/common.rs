use std::os::fd::OwnedFd;

/// Readiness a registration asks to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };

    /// Used while a connect is in flight: completion shows up as writability.
    pub(crate) const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    pub(crate) const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    /// Read interest, plus write interest when output is waiting.
    pub(crate) fn reading(has_output: bool) -> Interest {
        if has_output { Self::BOTH } else { Self::READ }
    }
}

/// Cross-thread wake-up source of a poller.
///
/// Owns the descriptor the backend signals (an `eventfd` for epoll, the kqueue
/// itself for kqueue), so waking stays sound for as long as any handle holds it.
pub(crate) struct Waker(pub(crate) OwnedFd);
