//! Self-health snapshot collection.
//!
//! Runs on the D5 driver cadence, well off the per-device hot paths. Pulls
//! process memory from sysinfo, the thread count from procfs, repairs the
//! registry's suspended caches (this is the designated slow-path caller),
//! and folds in the fleet and sink counters.

use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::warn;

use netpulse_core::health::{FleetCounters, HealthSnapshot, ServiceStatus};
use netpulse_core::registry::Registry;
use netpulse_core::sink::Sink;

pub struct Collector {
    sys: System,
    pid: Pid,
    memory_limit_mb: u64,
}

impl Collector {
    pub fn new(memory_limit_mb: u64) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );
        Self {
            sys,
            pid: Pid::from_u32(std::process::id()),
            memory_limit_mb,
        }
    }

    pub fn collect(
        &mut self,
        registry: &Registry,
        sink: &Sink,
        counters: &FleetCounters,
        monitor_tasks: u64,
        snmp_tasks: u64,
        store_ok: bool,
    ) -> HealthSnapshot {
        self.sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        let (rss_mb, vm_mb) = self
            .sys
            .process(self.pid)
            .map(|p| {
                (
                    p.memory() as f64 / (1024.0 * 1024.0),
                    p.virtual_memory() as f64 / (1024.0 * 1024.0),
                )
            })
            .unwrap_or((0.0, 0.0));

        if rss_mb > self.memory_limit_mb as f64 {
            warn!(
                rss_mb = rss_mb,
                limit_mb = self.memory_limit_mb,
                "process memory exceeds configured limit"
            );
        }

        let threads = procfs::process::Process::myself()
            .and_then(|p| p.stat())
            .map(|stat| stat.num_threads.max(0) as u64)
            .unwrap_or(0);

        // Slow-path repair: this driver is the designated reader of the
        // authoritative suspended counts.
        let (icmp_suspended, snmp_suspended) = registry.repair_suspended_counts();

        let failed_batches = sink.failed_batches();
        let status = if !store_ok {
            ServiceStatus::Unhealthy
        } else if failed_batches > 0 {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Healthy
        };

        HealthSnapshot {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            status,
            device_count: registry.len() as u64,
            icmp_suspended,
            snmp_suspended,
            monitor_tasks,
            snmp_tasks,
            pings_total: counters.pings_total(),
            pings_in_flight: counters.pings_in_flight(),
            sink_ok_batches: sink.successful_batches(),
            sink_failed_batches: failed_batches,
            sink_dropped_points: sink.dropped_points(),
            threads,
            rss_mb,
            vm_mb,
            store_ok,
            uptime_secs: counters.start_time.elapsed().as_secs(),
        }
    }
}
