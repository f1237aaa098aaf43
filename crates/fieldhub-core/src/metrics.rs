//! Lightweight process metrics.
//!
//! A handful of atomic counters shared between tasks. These are cheap
//! enough to bump on every message and are reported in the shutdown log;
//! exporting them to an external collector can hang off this struct later.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by the daemon.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_recorded: AtomicU64,
    record_failures: AtomicU64,
    messages_dropped: AtomicU64,
    datagrams_rejected: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A message was durably written to the log store.
    pub fn incr_messages_recorded(&self) {
        self.messages_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// A store write failed; the message was lost but the daemon lives on.
    pub fn incr_record_failures(&self) {
        self.record_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A bus subscriber's queue overflowed and a message was dropped.
    pub fn incr_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// An untrusted datagram failed signature verification.
    pub fn incr_datagrams_rejected(&self) {
        self.datagrams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_recorded(&self) -> u64 {
        self.messages_recorded.load(Ordering::Relaxed)
    }

    pub fn record_failures(&self) -> u64 {
        self.record_failures.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn datagrams_rejected(&self) -> u64 {
        self.datagrams_rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.record_failures(), 0);
        metrics.incr_record_failures();
        metrics.incr_record_failures();
        assert_eq!(metrics.record_failures(), 2);
        assert_eq!(metrics.messages_recorded(), 0);
    }
}
