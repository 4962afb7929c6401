//! Self-health types shared between the daemon and the HTTP surface.
//!
//! The self-health driver assembles a `HealthSnapshot` every reporting
//! interval, pushes it to the sink's health stream, and publishes it for
//! the `/health` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Overall service status, derived from the sink's delivery health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Store reachable, no failed batches observed.
    Healthy,
    /// Store reachable but batches have failed since startup.
    Degraded,
    /// Last store health check failed.
    Unhealthy,
}

/// Complete self-health snapshot, serialized both as the `/health` JSON
/// body and (field-wise) as the `health_metrics` measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Unix timestamp in milliseconds
    pub timestamp_ms: u64,
    pub status: ServiceStatus,
    /// Devices currently in the registry
    pub device_count: u64,
    /// Registry suspended counts (repaired truth, not the cached fast path)
    pub icmp_suspended: u64,
    pub snmp_suspended: u64,
    /// Live per-device task counts from the orchestrator tables
    pub monitor_tasks: u64,
    pub snmp_tasks: u64,
    /// Echoes issued since startup
    pub pings_total: u64,
    /// Echoes currently on the wire
    pub pings_in_flight: u64,
    /// Sink delivery counters
    pub sink_ok_batches: u64,
    pub sink_failed_batches: u64,
    pub sink_dropped_points: u64,
    /// OS threads in this process
    pub threads: u64,
    /// Resident set size in megabytes
    pub rss_mb: f64,
    /// Virtual memory size in megabytes
    pub vm_mb: f64,
    /// Result of the latest synchronous store health check
    pub store_ok: bool,
    pub uptime_secs: u64,
}

/// Atomic fleet counters incremented on the per-device hot paths.
pub struct FleetCounters {
    pub start_time: Instant,
    /// Total echoes issued since startup (monotonic)
    pub pings_total: AtomicU64,
    /// Echoes currently awaiting a reply
    pub pings_in_flight: AtomicU64,
    /// Per-device tasks that exited via the panic guard
    pub task_panics: AtomicU64,
}

impl FleetCounters {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            pings_total: AtomicU64::new(0),
            pings_in_flight: AtomicU64::new(0),
            task_panics: AtomicU64::new(0),
        }
    }

    pub fn pings_total(&self) -> u64 {
        self.pings_total.load(Ordering::Relaxed)
    }

    pub fn pings_in_flight(&self) -> u64 {
        self.pings_in_flight.load(Ordering::Relaxed)
    }
}

impl Default for FleetCounters {
    fn default() -> Self {
        Self::new()
    }
}
