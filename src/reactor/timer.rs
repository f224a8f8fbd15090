use std::cmp::Ordering;
use std::time::Instant;

/// A pending connect retry in the event loop's timer queue.
///
/// Entries are never removed early. When one fires, the loop checks that the
/// connection under `token` still expects a retry at `deadline` and drops the
/// entry otherwise.
pub(crate) struct RetryEntry {
    pub(crate) deadline: Instant,
    pub(crate) token: usize,
}

impl Eq for RetryEntry {}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline) && self.token == other.token
    }
}

impl Ord for RetryEntry {
    /// Reversed, so a `BinaryHeap<RetryEntry>` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.token.cmp(&self.token))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BinaryHeap;
    use std::time::Duration;

    #[test]
    fn earliest_deadline_pops_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();

        heap.push(RetryEntry {
            deadline: now + Duration::from_millis(30),
            token: 1,
        });
        heap.push(RetryEntry {
            deadline: now + Duration::from_millis(10),
            token: 2,
        });
        heap.push(RetryEntry {
            deadline: now + Duration::from_millis(20),
            token: 3,
        });

        let order: Vec<usize> = std::iter::from_fn(|| heap.pop().map(|e| e.token)).collect();
        assert_eq!(order, [2, 3, 1]);
    }
}
