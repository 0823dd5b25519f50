//! Observability counters for the protocol engine.
//!
//! Atomic counters, snapshotted on demand and periodically logged. One
//! instance is owned by the server context and shared by reference; there is
//! no process-wide global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Frames decoded from peers
    pub frames_in: AtomicU64,
    /// Frames written to peers
    pub frames_out: AtomicU64,
    /// Bytes received
    pub bytes_in: AtomicU64,
    /// Bytes sent
    pub bytes_out: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Successful logins
    pub logins_success: AtomicU64,
    /// Failed logins (bad credentials, lockout, suspension)
    pub logins_failed: AtomicU64,
    /// Accounts created
    pub registrations: AtomicU64,
    /// Frames rejected by the token bucket or handler windows
    pub rate_limited: AtomicU64,
    /// Frames rejected by the concurrency gate
    pub concurrency_rejected: AtomicU64,
    /// Frames dropped by dispatch-queue overflow
    pub dispatch_dropped: AtomicU64,
    /// Handler executions that hit their deadline
    pub handler_timeouts: AtomicU64,
    /// Directives written to peers
    pub directives_sent: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            logins_success: AtomicU64::new(0),
            logins_failed: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            concurrency_rejected: AtomicU64::new(0),
            dispatch_dropped: AtomicU64::new(0),
            handler_timeouts: AtomicU64::new(0),
            directives_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            logins_success: self.logins_success.load(Ordering::Relaxed),
            logins_failed: self.logins_failed.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            concurrency_rejected: self.concurrency_rejected.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            directives_sent: self.directives_sent.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            frames_in = snapshot.frames_in,
            frames_out = snapshot.frames_out,
            bytes_in = snapshot.bytes_in,
            bytes_out = snapshot.bytes_out,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            logins_success = snapshot.logins_success,
            logins_failed = snapshot.logins_failed,
            registrations = snapshot.registrations,
            rate_limited = snapshot.rate_limited,
            concurrency_rejected = snapshot.concurrency_rejected,
            dispatch_dropped = snapshot.dispatch_dropped,
            handler_timeouts = snapshot.handler_timeouts,
            directives_sent = snapshot.directives_sent,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub logins_success: u64,
    pub logins_failed: u64,
    pub registrations: u64,
    pub rate_limited: u64,
    pub concurrency_rejected: u64,
    pub dispatch_dropped: u64,
    pub handler_timeouts: u64,
    pub directives_sent: u64,
    pub uptime_seconds: u64,
}
