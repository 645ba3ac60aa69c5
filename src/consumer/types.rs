//! Consumer state and counters.
//!
//! # State Transitions
//!
//! ```text
//!                 run()
//! Disconnected ─────────→ Connecting ──(setup failed)──→ Retrying
//!                             │  ↑                          │
//!                  (subscribed)  └──────(retry delay)───────┘
//!                             ↓                             ↑
//!                        Subscribed ──(first delivery)──→ Consuming
//!                             │                             │
//!                             │        (session lost) ──────┘
//!                    cancel   ↓              cancel
//!                          Draining ←───────────────────────┘
//!                             │
//!                             ↓
//!                           Closed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dispatcher::HandleOutcome;

/// Lifecycle state of a [`StreamConsumer`](super::StreamConsumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not started.
    Disconnected,

    /// Connecting, resolving the start offset and subscribing.
    Connecting,

    /// Waiting out the retry delay after a failed or lost session.
    Retrying,

    /// Subscription open, nothing delivered yet.
    Subscribed,

    /// Processing deliveries.
    Consuming,

    /// Cancelled; letting the in-flight delivery finish.
    Draining,

    /// Handles released. Terminal.
    Closed,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Retrying => "Retrying",
            Self::Subscribed => "Subscribed",
            Self::Consuming => "Consuming",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Running totals for one consumer, across sessions.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    dispatched: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    sessions: AtomicU64,
    setup_failures: AtomicU64,
}

impl ConsumerStats {
    pub(crate) fn record_outcome(&self, outcome: HandleOutcome) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            HandleOutcome::Dispatched => &self.dispatched,
            HandleOutcome::Ignored => &self.ignored,
            HandleOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, ok: bool) {
        let counter = if ok { &self.commits } else { &self.commit_failures };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_setup_failure(&self) {
        self.setup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            setup_failures: self.setup_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub delivered: u64,
    pub dispatched: u64,
    pub ignored: u64,
    pub failed: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub sessions: u64,
    pub setup_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConsumerState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConsumerState::Retrying.to_string(), "Retrying");
        assert_eq!(ConsumerState::Draining.to_string(), "Draining");
        assert_eq!(ConsumerState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(ConsumerState::Closed.is_terminal());
        assert!(!ConsumerState::Draining.is_terminal());
        assert!(!ConsumerState::Retrying.is_terminal());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = ConsumerStats::default();
        stats.record_outcome(HandleOutcome::Dispatched);
        stats.record_outcome(HandleOutcome::Ignored);
        stats.record_outcome(HandleOutcome::Failed);
        stats.record_commit(true);
        stats.record_commit(false);

        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 3);
        assert_eq!(snap.dispatched, 1);
        assert_eq!(snap.ignored, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.commit_failures, 1);
    }
}
