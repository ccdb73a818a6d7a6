//! Shared health counters for the /health probe. Workers heartbeat READY on
//! every loop pass; the router and workers bump delivery/scan counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// Unix seconds of the most recent worker READY heartbeat (0 = never).
    worker_ready_at: AtomicI64,
    scans_completed: AtomicU64,
    scans_aborted: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_dropped: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_worker_ready(&self, now_secs: i64) {
        self.worker_ready_at.fetch_max(now_secs, Ordering::Relaxed);
    }

    /// True when some worker heartbeated within the last `window_secs`.
    pub fn worker_ready_within(&self, window_secs: i64, now_secs: i64) -> bool {
        let last = self.worker_ready_at.load(Ordering::Relaxed);
        last > 0 && now_secs - last <= window_secs
    }

    pub fn inc_scans_completed(&self) {
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scans_aborted(&self) {
        self.scans_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scans_completed(&self) -> u64 {
        self.scans_completed.load(Ordering::Relaxed)
    }

    pub fn scans_aborted(&self) -> u64 {
        self.scans_aborted.load(Ordering::Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.load(Ordering::Relaxed)
    }
}
