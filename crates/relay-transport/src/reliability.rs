//! # relay-transport: Reliability Logic
//!
//! Per-correlation deadlines and the coordinator's running counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_core::Request;

/// Decides how long a correlation may stay in flight before the supervisor
/// answers it with a fallback.
pub trait DeadlinePolicy: Send + Sync {
    fn deadline_for(&self, request: &Request) -> Duration;
}

/// Same deadline for every request.
pub struct FixedDeadline {
    deadline: Duration,
}

impl FixedDeadline {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl DeadlinePolicy for FixedDeadline {
    fn deadline_for(&self, _request: &Request) -> Duration {
        self.deadline
    }
}

impl<F> DeadlinePolicy for F
where
    F: Fn(&Request) -> Duration + Send + Sync,
{
    fn deadline_for(&self, request: &Request) -> Duration {
        self(request)
    }
}

/// Lock-free counters updated on the hot path.
#[derive(Default)]
pub struct RelayStats {
    published: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
    unmatched: AtomicU64,
    replies: AtomicU64,
    fallbacks: AtomicU64,
    stage_faults: AtomicU64,
    duplicate_terminals: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub unmatched: u64,
    pub replies: u64,
    pub fallbacks: u64,
    pub stage_faults: u64,
    pub duplicate_terminals: u64,
}

impl RelayStats {
    pub fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.stage_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_terminal(&self) {
        self.duplicate_terminals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            stage_faults: self.stage_faults.load(Ordering::Relaxed),
            duplicate_terminals: self.duplicate_terminals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_act_as_deadline_policies() {
        let policy = |r: &Request| {
            if r.path.starts_with("/slow") {
                Duration::from_secs(5)
            } else {
                Duration::from_millis(100)
            }
        };
        assert_eq!(policy.deadline_for(&Request::new("GET", "/slow/x")), Duration::from_secs(5));
        assert_eq!(policy.deadline_for(&Request::new("GET", "/")), Duration::from_millis(100));
        assert_eq!(
            FixedDeadline::new(Duration::from_secs(1)).deadline_for(&Request::default()),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RelayStats::default();
        stats.record_publish();
        stats.record_publish();
        stats.record_fault();
        stats.record_fallback();
        let snap = stats.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.stage_faults, 1);
        assert_eq!(snap.fallbacks, 1);
        assert_eq!(snap.replies, 0);
    }
}
