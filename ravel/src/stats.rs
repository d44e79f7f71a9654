// src/stats.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Service-wide counters. Gauges (`active_connections`, `pending_requests`)
/// move both ways; the remaining counters only grow.
#[derive(Default)]
pub struct Statistics {
    active_connections: AtomicUsize,
    pending_requests: AtomicUsize,
    total_requests_processed: AtomicU64,
    connection_timeouts: AtomicU64,
    request_timeouts: AtomicU64,
}

impl Statistics {
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn connection_timed_out(&self) {
        self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_enqueued(&self) {
        self.pending_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        let _ = self
            .pending_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.total_requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        let _ = self
            .pending_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the gauges after a shutdown sweep has torn everything down.
    pub fn reset_gauges(&self) {
        self.active_connections.store(0, Ordering::Release);
        self.pending_requests.store(0, Ordering::Release);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, max_connections: usize, max_requests: usize) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections(),
            max_connections,
            pending_requests: self.pending_requests(),
            max_requests,
            total_requests_processed: self.total_requests_processed.load(Ordering::Acquire),
            connection_timeouts: self.connection_timeouts.load(Ordering::Acquire),
            request_timeouts: self.request_timeouts.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of the counters, serializable for embedders.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub max_connections: usize,
    pub pending_requests: usize,
    pub max_requests: usize,
    pub total_requests_processed: u64,
    pub connection_timeouts: u64,
    pub request_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_flow() {
        let stats = Statistics::default();

        stats.connection_opened();
        stats.connection_opened();
        stats.request_enqueued();
        stats.request_completed();
        stats.connection_closed();

        let snapshot = stats.snapshot(100, 1000);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.pending_requests, 0);
        assert_eq!(snapshot.total_requests_processed, 1);
        assert_eq!(snapshot.max_connections, 100);
        assert_eq!(snapshot.max_requests, 1000);
    }

    #[test]
    fn test_gauges_never_underflow() {
        let stats = Statistics::default();
        stats.connection_closed();
        stats.request_completed();
        stats.request_timed_out();

        let snapshot = stats.snapshot(10, 10);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.pending_requests, 0);
        assert_eq!(snapshot.request_timeouts, 1);
    }

    #[test]
    fn test_timeout_counters_accumulate() {
        let stats = Statistics::default();
        stats.request_enqueued();
        stats.request_timed_out();
        stats.connection_timed_out();

        let snapshot = stats.snapshot(10, 10);
        assert_eq!(snapshot.request_timeouts, 1);
        assert_eq!(snapshot.connection_timeouts, 1);
        assert_eq!(snapshot.total_requests_processed, 0);
    }
}
