//! Loop and connection configuration.

use crate::codec::MalformedPolicy;

use std::time::Duration;

/// Settings of the event loop itself.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Upper bound on a single demultiplexer wait.
    ///
    /// This is a heartbeat: the loop wakes at least this often to notice
    /// shutdown, even when no socket is ready. It is not an I/O deadline.
    pub poll_timeout: Duration,

    /// Number of readiness events collected per wait.
    pub event_capacity: usize,

    /// How long a shutdown keeps writing queued messages before closing the
    /// connections that still have some.
    pub shutdown_grace: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            event_capacity: 64,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// How a connection retries a failed connect.
///
/// The delay before attempt `n + 1` is `initial_backoff * 2^(n - 1)`, capped at
/// `max_backoff`. With `max_attempts` left at `None` the connection keeps trying
/// forever and stays in `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ConnectPolicy {
    /// Retry forever with no delay between attempts.
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Returns a copy limited to `attempts` connects in total.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether another connect may follow `failed` failed attempts.
    pub fn allows_retry(&self, failed: u32) -> bool {
        self.max_attempts.is_none_or(|max| failed < max)
    }

    /// Delay to wait after `failed` failed attempts.
    pub fn backoff(&self, failed: u32) -> Duration {
        if failed == 0 {
            return Duration::ZERO;
        }

        let shift = (failed - 1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Per-connection settings passed along with a connect request.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Size of the scratch buffer each socket read fills.
    pub read_chunk: usize,

    pub connect_policy: ConnectPolicy,

    pub malformed_policy: MalformedPolicy,

    /// Maximum number of queued messages; `None` leaves the queue unbounded.
    pub max_pending: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            read_chunk: 4096,
            connect_policy: ConnectPolicy::default(),
            malformed_policy: MalformedPolicy::default(),
            max_pending: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ConnectPolicy {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn attempt_limit() {
        let unlimited = ConnectPolicy::immediate();
        assert!(unlimited.allows_retry(u32::MAX - 1));

        let limited = ConnectPolicy::immediate().with_max_attempts(3);
        assert!(limited.allows_retry(2));
        assert!(!limited.allows_retry(3));
    }
}
