//! Per-device continuous SNMP enrichment.
//!
//! Mirrors the monitor loop with SNMP semantics: its own rate limiter, its
//! own breaker counters, a 5-second initial offset so SNMP startup does
//! not collide with the ICMP stagger, and `snmp_interval` cadence. A
//! successful query refreshes the registry enrichment and emits a
//! `device_info` sample.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use netpulse_core::limiter::TokenBucket;
use netpulse_core::registry::{ProbeKind, Registry};
use netpulse_core::sink::Sink;
use netpulse_core::snmp::{self, SnmpParams};

const INITIAL_OFFSET: Duration = Duration::from_secs(5);

pub struct SnmpTaskDeps {
    pub registry: Arc<Registry>,
    pub sink: Arc<Sink>,
    pub limiter: Arc<TokenBucket>,
    pub params: SnmpParams,
    pub snmp_interval: Duration,
    pub fail_threshold: u32,
    pub backoff: Duration,
}

/// Run the SNMP loop for one device until cancelled.
pub async fn run(deps: Arc<SnmpTaskDeps>, ip: Ipv4Addr, cancel: CancellationToken) {
    debug!(ip = %ip, "snmp task started");
    let mut delay = INITIAL_OFFSET;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
        delay = deps.snmp_interval;

        // Breaker before limiter, as with the monitor loop.
        if deps.registry.is_suspended(ip, ProbeKind::Snmp) {
            continue;
        }

        tokio::select! {
            _ = deps.limiter.until_ready() => {}
            _ = cancel.cancelled() => break,
        }

        let params = deps.params.clone();
        let query = tokio::task::spawn_blocking(move || snmp::query_device(ip, &params));
        let outcome = tokio::select! {
            res = query => res.unwrap_or(None),
            _ = cancel.cancelled() => break,
        };

        match outcome {
            Some(info) => {
                deps.registry.report_success(ip, ProbeKind::Snmp);
                deps.registry.update_snmp(ip, &info.hostname, &info.descr);
                deps.sink
                    .write_device_info(ip, &info.hostname, &info.descr);
            }
            None => {
                let newly_suspended = deps.registry.report_fail(
                    ip,
                    ProbeKind::Snmp,
                    deps.fail_threshold,
                    deps.backoff,
                );
                if newly_suspended {
                    warn!(
                        ip = %ip,
                        backoff_secs = deps.backoff.as_secs(),
                        "device snmp-suspended after consecutive failures"
                    );
                }
            }
        }
    }

    debug!(ip = %ip, "snmp task exited");
}
