//! Process-wide protocol counters.
//!
//! There is one [`METRICS`] per process. Counters add up across every
//! engine the process runs, and the gauges (`last_applied_scn`,
//! `next_scn`, `proposals_in_flight`, `pending_values`) hold whatever the
//! last engine to touch them wrote. Per-engine positions are read from
//! the engine handle instead.
//!
//! ```ignore
//! use paxlog_consensus::instrumentation::METRICS;
//!
//! METRICS.increment_rounds_opened();
//! let snapshot = METRICS.snapshot();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ============================================================================
// Production Metrics (Always Available)
// ============================================================================

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Atomic counters and gauges for the consensus engine.
#[derive(Debug)]
pub struct Metrics {
    // === Proposer ===
    rounds_opened: AtomicU64,
    rounds_retried: AtomicU64,
    rounds_superseded: AtomicU64,
    rounds_timed_out: AtomicU64,
    rounds_decided: AtomicU64,
    values_requeued: AtomicU64,
    gap_fills: AtomicU64,
    decides_resent: AtomicU64,
    promises_received: AtomicU64,
    rejects_received: AtomicU64,
    acks_received: AtomicU64,

    // === Follower ===
    promises_sent: AtomicU64,
    accepts_sent: AtomicU64,
    rejects_sent: AtomicU64,
    values_applied: AtomicU64,
    conflicting_decides: AtomicU64,

    // === Transport ===
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    checksum_failures: AtomicU64,
    reconnects: AtomicU64,
    submissions_rejected: AtomicU64,

    // === Gauges ===
    last_applied_scn: AtomicU64,
    next_scn: AtomicU64,
    proposals_in_flight: AtomicU64,
    pending_values: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    /// This is a const function for static initialization.
    pub const fn new() -> Self {
        Self {
            rounds_opened: AtomicU64::new(0),
            rounds_retried: AtomicU64::new(0),
            rounds_superseded: AtomicU64::new(0),
            rounds_timed_out: AtomicU64::new(0),
            rounds_decided: AtomicU64::new(0),
            values_requeued: AtomicU64::new(0),
            gap_fills: AtomicU64::new(0),
            decides_resent: AtomicU64::new(0),
            promises_received: AtomicU64::new(0),
            rejects_received: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            promises_sent: AtomicU64::new(0),
            accepts_sent: AtomicU64::new(0),
            rejects_sent: AtomicU64::new(0),
            values_applied: AtomicU64::new(0),
            conflicting_decides: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            submissions_rejected: AtomicU64::new(0),
            last_applied_scn: AtomicU64::new(0),
            next_scn: AtomicU64::new(0),
            proposals_in_flight: AtomicU64::new(0),
            pending_values: AtomicU64::new(0),
        }
    }

    counter! {
        increment_rounds_opened => rounds_opened,
        increment_rounds_retried => rounds_retried,
        increment_rounds_superseded => rounds_superseded,
        increment_rounds_timed_out => rounds_timed_out,
        increment_rounds_decided => rounds_decided,
        increment_values_requeued => values_requeued,
        increment_gap_fills => gap_fills,
        increment_decides_resent => decides_resent,
        increment_promises_received => promises_received,
        increment_rejects_received => rejects_received,
        increment_acks_received => acks_received,
        increment_promises_sent => promises_sent,
        increment_accepts_sent => accepts_sent,
        increment_rejects_sent => rejects_sent,
        increment_values_applied => values_applied,
        increment_conflicting_decides => conflicting_decides,
        increment_messages_sent => messages_sent,
        increment_messages_received => messages_received,
        increment_messages_dropped => messages_dropped,
        increment_checksum_failures => checksum_failures,
        increment_reconnects => reconnects,
        increment_submissions_rejected => submissions_rejected,
    }

    pub fn set_last_applied_scn(&self, scn: u64) {
        self.last_applied_scn.store(scn, Ordering::Relaxed);
    }

    pub fn set_next_scn(&self, scn: u64) {
        self.next_scn.store(scn, Ordering::Relaxed);
    }

    pub fn set_proposals_in_flight(&self, n: u64) {
        self.proposals_in_flight.store(n, Ordering::Relaxed);
    }

    pub fn set_pending_values(&self, n: u64) {
        self.pending_values.store(n, Ordering::Relaxed);
    }

    /// Reads every metric into a plain struct.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            rounds_opened: load(&self.rounds_opened),
            rounds_retried: load(&self.rounds_retried),
            rounds_superseded: load(&self.rounds_superseded),
            rounds_timed_out: load(&self.rounds_timed_out),
            rounds_decided: load(&self.rounds_decided),
            values_requeued: load(&self.values_requeued),
            gap_fills: load(&self.gap_fills),
            decides_resent: load(&self.decides_resent),
            promises_received: load(&self.promises_received),
            rejects_received: load(&self.rejects_received),
            acks_received: load(&self.acks_received),
            promises_sent: load(&self.promises_sent),
            accepts_sent: load(&self.accepts_sent),
            rejects_sent: load(&self.rejects_sent),
            values_applied: load(&self.values_applied),
            conflicting_decides: load(&self.conflicting_decides),
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
            messages_dropped: load(&self.messages_dropped),
            checksum_failures: load(&self.checksum_failures),
            reconnects: load(&self.reconnects),
            submissions_rejected: load(&self.submissions_rejected),
            last_applied_scn: load(&self.last_applied_scn),
            next_scn: load(&self.next_scn),
            proposals_in_flight: load(&self.proposals_in_flight),
            pending_values: load(&self.pending_values),
        }
    }
}

/// Plain copy of [`Metrics`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct MetricsSnapshot {
    pub rounds_opened: u64,
    pub rounds_retried: u64,
    pub rounds_superseded: u64,
    pub rounds_timed_out: u64,
    pub rounds_decided: u64,
    pub values_requeued: u64,
    pub gap_fills: u64,
    pub decides_resent: u64,
    pub promises_received: u64,
    pub rejects_received: u64,
    pub acks_received: u64,
    pub promises_sent: u64,
    pub accepts_sent: u64,
    pub rejects_sent: u64,
    pub values_applied: u64,
    pub conflicting_decides: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub checksum_failures: u64,
    pub reconnects: u64,
    pub submissions_rejected: u64,
    pub last_applied_scn: u64,
    pub next_scn: u64,
    pub proposals_in_flight: u64,
    pub pending_values: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.increment_rounds_opened();
        m.increment_rounds_opened();
        m.increment_rounds_decided();
        m.set_last_applied_scn(17);

        let s = m.snapshot();
        assert_eq!(s.rounds_opened, 2);
        assert_eq!(s.rounds_decided, 1);
        assert_eq!(s.last_applied_scn, 17);
        assert_eq!(s.rejects_sent, 0);
    }
}
