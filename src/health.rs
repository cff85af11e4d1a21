//! Scheduler liveness tracking behind the health endpoint.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cycle accounting for the polling worker.
///
/// Written by the poller at the end of every cycle, read by the health
/// handler. Reflects the worker itself, not individual silo status.
#[derive(Debug)]
pub struct MonitorHealth {
    started: Instant,
    stall_after: Duration,
    cycles_completed: AtomicU64,
    bus_connected: AtomicBool,
    last_cycle_end: Mutex<Option<Instant>>,
}

/// Shared handle to a [`MonitorHealth`].
pub type SharedHealth = Arc<MonitorHealth>;

/// Point-in-time health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// "ok", "starting", "stalled", or "degraded".
    pub status: &'static str,
    /// Seconds since process start.
    pub uptime_secs: u64,
    /// Completed poll cycles.
    pub cycles_completed: u64,
    /// Whether the serial bus is currently connected.
    pub bus_connected: bool,
}

impl MonitorHealth {
    /// Create a tracker. `stall_after` is the maximum age of the last
    /// completed cycle before the scheduler counts as stuck.
    pub fn new(stall_after: Duration) -> Self {
        Self {
            started: Instant::now(),
            stall_after,
            cycles_completed: AtomicU64::new(0),
            bus_connected: AtomicBool::new(false),
            last_cycle_end: Mutex::new(None),
        }
    }

    /// Record a completed poll cycle.
    pub fn record_cycle(&self, bus_connected: bool) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(bus_connected, Ordering::Relaxed);
        *self.last_cycle_end.lock() = Some(Instant::now());
    }

    /// Completed poll cycles since startup.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    fn status(&self) -> &'static str {
        if self.cycles_completed() == 0 {
            return "starting";
        }

        let stalled = match *self.last_cycle_end.lock() {
            Some(at) => at.elapsed() > self.stall_after,
            None => true,
        };

        if stalled {
            "stalled"
        } else if !self.bus_connected.load(Ordering::Relaxed) {
            "degraded"
        } else {
            "ok"
        }
    }

    /// True when the scheduler has completed at least one cycle, is not
    /// stuck, and the bus is up.
    pub fn is_ok(&self) -> bool {
        self.status() == "ok"
    }

    /// Build a report for the health endpoint.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(),
            uptime_secs: self.started.elapsed().as_secs(),
            cycles_completed: self.cycles_completed(),
            bus_connected: self.bus_connected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_until_first_cycle() {
        let health = MonitorHealth::new(Duration::from_secs(60));
        assert_eq!(health.snapshot().status, "starting");
        assert!(!health.is_ok());

        health.record_cycle(true);
        assert_eq!(health.snapshot().status, "ok");
        assert!(health.is_ok());
        assert_eq!(health.cycles_completed(), 1);
    }

    #[test]
    fn test_degraded_while_bus_down() {
        let health = MonitorHealth::new(Duration::from_secs(60));
        health.record_cycle(false);

        assert_eq!(health.snapshot().status, "degraded");
        assert!(!health.is_ok());

        health.record_cycle(true);
        assert_eq!(health.snapshot().status, "ok");
    }

    #[test]
    fn test_stalled_when_last_cycle_too_old() {
        let health = MonitorHealth::new(Duration::ZERO);
        health.record_cycle(true);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(health.snapshot().status, "stalled");
        assert!(!health.is_ok());
    }

    #[test]
    fn test_snapshot_counts() {
        let health = MonitorHealth::new(Duration::from_secs(60));
        health.record_cycle(true);
        health.record_cycle(true);
        health.record_cycle(false);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.cycles_completed, 3);
        assert!(!snapshot.bus_connected);
    }
}
