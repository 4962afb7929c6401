//! Periodic drivers and task reconciliation.
//!
//! Five independent drivers share one root cancel token:
//!   D1 discovery sweep, D2 daily SNMP refresh, D3 reconciliation,
//!   D4 prune, D5 self-health.
//!
//! Reconciliation converges the monitor and SNMP task tables to the
//! registry's device set. A task may only start when its table slot is
//! absent; stopping tasks keep their slot until their completion callback
//! fires, so a pruned-then-rediscovered device can never hold two tasks.
//! Every per-device task runs behind a join guard: a panic is logged and
//! frees the slot, and the next cycle restarts the task if the device
//! still exists.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use ipnetwork::Ipv4Network;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use netpulse_core::health::FleetCounters;
use netpulse_core::limiter::TokenBucket;
use netpulse_core::probe::Prober;
use netpulse_core::registry::Registry;
use netpulse_core::sink::Sink;
use netpulse_core::snmp::{self, SnmpParams};
use netpulse_core::sweep;
use netpulse_core::tasktable::TaskTable;

use crate::health_server::HealthState;
use crate::monitor::{self, MonitorDeps};
use crate::self_health::Collector;
use crate::snmp_task::{self, SnmpTaskDeps};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Orchestrator {
    pub registry: Arc<Registry>,
    pub sink: Arc<Sink>,
    pub counters: Arc<FleetCounters>,
    pub monitor_table: Arc<TaskTable>,
    pub snmp_table: Arc<TaskTable>,
    pub health_state: Arc<HealthState>,
    monitor_deps: Arc<MonitorDeps>,
    snmp_deps: Arc<SnmpTaskDeps>,
    ping_limiter: Arc<TokenBucket>,
    prober: Arc<dyn Prober>,
    networks: Vec<Ipv4Network>,
    snmp_params: SnmpParams,
    icmp_workers: usize,
    snmp_workers: usize,
    discovery_interval: Duration,
    daily_schedule: Option<NaiveTime>,
    health_report_interval: Duration,
    memory_limit_mb: u64,
    max_concurrent_pingers: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Everything `main` assembles before handing control over.
pub struct OrchestratorParts {
    pub registry: Arc<Registry>,
    pub sink: Arc<Sink>,
    pub counters: Arc<FleetCounters>,
    pub health_state: Arc<HealthState>,
    pub ping_limiter: Arc<TokenBucket>,
    pub snmp_limiter: Arc<TokenBucket>,
    pub prober: Arc<dyn Prober>,
    pub networks: Vec<Ipv4Network>,
    pub snmp_params: SnmpParams,
    pub icmp_workers: usize,
    pub snmp_workers: usize,
    pub discovery_interval: Duration,
    pub daily_schedule: Option<NaiveTime>,
    pub health_report_interval: Duration,
    pub memory_limit_mb: u64,
    pub max_concurrent_pingers: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub snmp_interval: Duration,
    pub fail_threshold: u32,
    pub backoff: Duration,
    pub cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Arc<Self> {
        let monitor_deps = Arc::new(MonitorDeps {
            registry: Arc::clone(&parts.registry),
            sink: Arc::clone(&parts.sink),
            limiter: Arc::clone(&parts.ping_limiter),
            prober: Arc::clone(&parts.prober),
            counters: Arc::clone(&parts.counters),
            ping_interval: parts.ping_interval,
            ping_timeout: parts.ping_timeout,
            fail_threshold: parts.fail_threshold,
            backoff: parts.backoff,
        });
        let snmp_deps = Arc::new(SnmpTaskDeps {
            registry: Arc::clone(&parts.registry),
            sink: Arc::clone(&parts.sink),
            limiter: parts.snmp_limiter,
            params: parts.snmp_params.clone(),
            snmp_interval: parts.snmp_interval,
            fail_threshold: parts.fail_threshold,
            backoff: parts.backoff,
        });
        Arc::new(Self {
            registry: parts.registry,
            sink: parts.sink,
            counters: parts.counters,
            monitor_table: Arc::new(TaskTable::new("monitor")),
            snmp_table: Arc::new(TaskTable::new("snmp")),
            health_state: parts.health_state,
            monitor_deps,
            snmp_deps,
            ping_limiter: parts.ping_limiter,
            prober: parts.prober,
            networks: parts.networks,
            snmp_params: parts.snmp_params,
            icmp_workers: parts.icmp_workers,
            snmp_workers: parts.snmp_workers,
            discovery_interval: parts.discovery_interval,
            daily_schedule: parts.daily_schedule,
            health_report_interval: parts.health_report_interval,
            memory_limit_mb: parts.memory_limit_mb,
            max_concurrent_pingers: parts.max_concurrent_pingers,
            cancel: parts.cancel,
            tracker: TaskTracker::new(),
        })
    }

    /// Spawn all five drivers. Returns immediately; the drivers run until
    /// the root token is cancelled.
    pub fn start(self: &Arc<Self>) {
        self.spawn_driver("discovery", Arc::clone(self), Self::discovery_driver);
        self.spawn_driver("daily-snmp", Arc::clone(self), Self::daily_snmp_driver);
        self.spawn_driver("reconcile", Arc::clone(self), Self::reconcile_driver);
        self.spawn_driver("prune", Arc::clone(self), Self::prune_driver);
        self.spawn_driver("self-health", Arc::clone(self), Self::health_driver);
        info!("orchestrator drivers started");
    }

    fn spawn_driver<F, Fut>(&self, name: &'static str, this: Arc<Self>, f: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            let inner = tokio::spawn(f(this));
            if let Err(e) = inner.await {
                if e.is_panic() {
                    error!(driver = name, "driver panicked");
                }
            }
        });
    }

    // ── D1: discovery sweep ─────────────────────────────────────────────

    async fn discovery_driver(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.discovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The initial sweep already ran during startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            if let Err(e) = self.run_discovery().await {
                error!(error = %e, "discovery sweep failed");
            }
        }
    }

    /// One discovery pass: sweep, register responders, and enrich the new
    /// ones in the background.
    pub async fn run_discovery(self: &Arc<Self>) -> anyhow::Result<()> {
        let responsive = sweep::run(
            self.cancel.clone(),
            &self.networks,
            self.icmp_workers,
            Arc::clone(&self.ping_limiter),
            Arc::clone(&self.prober),
        )
        .await?;

        let mut newly = Vec::new();
        for ip in responsive {
            if self.registry.add_ip(ip) {
                newly.push(ip);
            }
        }
        info!(
            new_devices = newly.len(),
            total_devices = self.registry.len(),
            "discovery pass complete"
        );

        if !newly.is_empty() {
            let this = Arc::clone(self);
            self.tracker.spawn(async move {
                this.enrich(newly).await;
            });
        }
        Ok(())
    }

    /// One-shot SNMP enrichment for a set of addresses.
    async fn enrich(&self, ips: Vec<Ipv4Addr>) {
        let found = snmp::query_many(
            ips,
            self.snmp_params.clone(),
            self.snmp_workers,
            self.cancel.clone(),
        )
        .await;
        for info in found {
            self.registry.update_snmp(info.ip, &info.hostname, &info.descr);
            self.sink
                .write_device_info(info.ip, &info.hostname, &info.descr);
        }
    }

    // ── D2: daily SNMP refresh ──────────────────────────────────────────

    async fn daily_snmp_driver(self: Arc<Self>) {
        let Some(at) = self.daily_schedule else {
            return;
        };
        loop {
            let wait = until_next_occurrence(Local::now().naive_local(), at);
            info!(wait_secs = wait.as_secs(), "next daily snmp refresh scheduled");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => break,
            }
            let all = self.registry.all_ips();
            info!(devices = all.len(), "running daily snmp refresh");
            self.enrich(all).await;
        }
    }

    // ── D3: reconciliation ──────────────────────────────────────────────

    async fn reconcile_driver(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            self.reconcile();
        }
    }

    /// Converge both task tables to the registry's device set.
    pub fn reconcile(self: &Arc<Self>) {
        let known: HashSet<Ipv4Addr> = self.registry.all_ips().into_iter().collect();

        for &ip in &known {
            if self.monitor_table.len() >= self.max_concurrent_pingers {
                warn!(
                    cap = self.max_concurrent_pingers,
                    devices = known.len(),
                    "monitor task cap reached, remaining devices deferred"
                );
                break;
            }
            if let Some(token) = self.monitor_table.try_begin(ip, &self.cancel) {
                self.spawn_monitor(ip, token);
            }
        }
        for ip in self.monitor_table.running_ips() {
            if !known.contains(&ip) {
                self.monitor_table.request_stop(ip);
            }
        }

        for &ip in &known {
            if let Some(token) = self.snmp_table.try_begin(ip, &self.cancel) {
                self.spawn_snmp(ip, token);
            }
        }
        for ip in self.snmp_table.running_ips() {
            if !known.contains(&ip) {
                self.snmp_table.request_stop(ip);
            }
        }
    }

    fn spawn_monitor(&self, ip: Ipv4Addr, token: CancellationToken) {
        let deps = Arc::clone(&self.monitor_deps);
        let table = Arc::clone(&self.monitor_table);
        let counters = Arc::clone(&self.counters);
        self.tracker.spawn(async move {
            let inner = tokio::spawn(monitor::run(deps, ip, token));
            if let Err(e) = inner.await {
                if e.is_panic() {
                    counters.task_panics.fetch_add(1, Ordering::Relaxed);
                    error!(ip = %ip, "monitor task panicked");
                }
            }
            table.finished(ip);
        });
    }

    fn spawn_snmp(&self, ip: Ipv4Addr, token: CancellationToken) {
        let deps = Arc::clone(&self.snmp_deps);
        let table = Arc::clone(&self.snmp_table);
        let counters = Arc::clone(&self.counters);
        self.tracker.spawn(async move {
            let inner = tokio::spawn(snmp_task::run(deps, ip, token));
            if let Err(e) = inner.await {
                if e.is_panic() {
                    counters.task_panics.fetch_add(1, Ordering::Relaxed);
                    error!(ip = %ip, "snmp task panicked");
                }
            }
            table.finished(ip);
        });
    }

    // ── D4: prune ───────────────────────────────────────────────────────

    async fn prune_driver(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            let max_age = Duration::from_secs(netpulse_core::STALE_DEVICE_MAX_AGE_SECS);
            let removed = self.registry.prune_stale(max_age);
            if !removed.is_empty() {
                info!(
                    removed = removed.len(),
                    "pruned stale devices; reconciliation will stop their tasks"
                );
            }
        }
    }

    // ── D5: self-health ─────────────────────────────────────────────────

    async fn health_driver(self: Arc<Self>) {
        let mut collector = Collector::new(self.memory_limit_mb);
        let mut ticker = tokio::time::interval(self.health_report_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            let store_ok = self.sink.health_check().await.is_ok();
            let snapshot = collector.collect(
                &self.registry,
                &self.sink,
                &self.counters,
                self.monitor_table.len() as u64,
                self.snmp_table.len() as u64,
                store_ok,
            );
            self.sink.write_health(&snapshot);
            self.health_state.publish(snapshot);
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Ordered shutdown: cancel every per-device task, then wait for the
    /// whole task group (drivers included) to exit.
    pub async fn shutdown(&self) {
        self.monitor_table.stop_all();
        self.snmp_table.stop_all();
        self.tracker.close();
        self.tracker.wait().await;
        info!("all tasks and drivers exited");
    }
}

/// Duration until the next local occurrence of `at`.
fn until_next_occurrence(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let today = now.date().and_time(at);
    let next = if now < today {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}
