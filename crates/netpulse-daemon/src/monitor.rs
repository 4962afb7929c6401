//! Per-device continuous ICMP monitoring.
//!
//! One task per registered device, started and stopped by reconciliation.
//! Each iteration: wait out the interval, honor the circuit breaker
//! *before* touching the global rate limiter (a suspended device must not
//! burn a token), acquire a token, probe once, and report the outcome to
//! the registry and the sink. The interval is measured between pings, not
//! on a wall schedule, so a slow probe or a long limiter wait never builds
//! a backlog of overdue iterations.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use netpulse_core::health::FleetCounters;
use netpulse_core::limiter::TokenBucket;
use netpulse_core::probe::{is_probe_safe, Prober};
use netpulse_core::registry::{ProbeKind, Registry};
use netpulse_core::sink::Sink;

/// Offset before the first probe, staggering tasks that reconciliation
/// starts in one burst.
const INITIAL_OFFSET: Duration = Duration::from_secs(1);

/// Everything a monitor task touches, shared across the fleet.
pub struct MonitorDeps {
    pub registry: Arc<Registry>,
    pub sink: Arc<Sink>,
    pub limiter: Arc<TokenBucket>,
    pub prober: Arc<dyn Prober>,
    pub counters: Arc<FleetCounters>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub fail_threshold: u32,
    pub backoff: Duration,
}

/// Run the monitoring loop for one device until cancelled.
pub async fn run(deps: Arc<MonitorDeps>, ip: Ipv4Addr, cancel: CancellationToken) {
    debug!(ip = %ip, "monitor task started");
    let mut delay = INITIAL_OFFSET;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
        delay = deps.ping_interval;

        // Breaker first: a suspended device still produces a sample but
        // must not consume a global token.
        if deps.registry.is_suspended(ip, ProbeKind::Icmp) {
            deps.sink.write_ping(ip, 0.0, false, true);
            continue;
        }

        tokio::select! {
            _ = deps.limiter.until_ready() => {}
            _ = cancel.cancelled() => break,
        }

        // The registry only ever holds validated addresses, but it is the
        // last gate before a raw socket write.
        if !is_probe_safe(ip) {
            warn!(ip = %ip, "refusing to probe unsafe address from registry");
            continue;
        }

        deps.counters.pings_in_flight.fetch_add(1, Ordering::Relaxed);
        let rtt = tokio::select! {
            rtt = deps.prober.probe(ip, deps.ping_timeout) => rtt,
            _ = cancel.cancelled() => {
                deps.counters.pings_in_flight.fetch_sub(1, Ordering::Relaxed);
                break;
            }
        };
        deps.counters.pings_in_flight.fetch_sub(1, Ordering::Relaxed);
        deps.counters.pings_total.fetch_add(1, Ordering::Relaxed);

        match rtt {
            Some(rtt) => {
                deps.registry.update_last_seen(ip);
                deps.registry.report_success(ip, ProbeKind::Icmp);
                deps.sink
                    .write_ping(ip, rtt.as_secs_f64() * 1000.0, true, false);
            }
            None => {
                let newly_suspended = deps.registry.report_fail(
                    ip,
                    ProbeKind::Icmp,
                    deps.fail_threshold,
                    deps.backoff,
                );
                if newly_suspended {
                    warn!(
                        ip = %ip,
                        fails = deps.fail_threshold,
                        backoff_secs = deps.backoff.as_secs(),
                        "device suspended after consecutive ping failures"
                    );
                }
                deps.sink.write_ping(ip, 0.0, false, false);
            }
        }
    }

    debug!(ip = %ip, "monitor task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use netpulse_core::limiter::token_bucket;
    use netpulse_core::sink::{Delivery, SinkConfig};

    /// Prober double driven by a script of outcomes; repeats the last
    /// entry once the script is exhausted.
    struct ScriptedProber {
        script: Mutex<Vec<Option<Duration>>>,
    }

    impl ScriptedProber {
        fn new(mut outcomes: Vec<Option<Duration>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                script: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _ip: Ipv4Addr, _timeout: Duration) -> Option<Duration> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                *script.last().unwrap_or(&None)
            }
        }
    }

    struct CapturingDelivery {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Delivery for CapturingDelivery {
        async fn write_lines(&self, _bucket: &str, lines: &[String]) -> anyhow::Result<()> {
            self.lines.lock().unwrap().extend(lines.iter().cloned());
            Ok(())
        }

        async fn health_check(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_sink() -> (Arc<Sink>, Arc<CapturingDelivery>) {
        let delivery = Arc::new(CapturingDelivery {
            lines: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(Sink::new(
            delivery.clone() as Arc<dyn Delivery>,
            SinkConfig {
                bucket: "netmon".into(),
                health_bucket: "health".into(),
                batch_size: 1,
                flush_interval: Duration::from_millis(50),
            },
        ));
        (sink, delivery)
    }

    fn deps(prober: Arc<dyn Prober>, sink: Arc<Sink>, threshold: u32, backoff: Duration) -> Arc<MonitorDeps> {
        Arc::new(MonitorDeps {
            registry: Arc::new(Registry::new(64)),
            sink,
            limiter: Arc::new(token_bucket(1_000_000.0, 1_000_000)),
            prober,
            counters: Arc::new(FleetCounters::new()),
            ping_interval: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(100),
            fail_threshold: threshold,
            backoff,
        })
    }

    // Real time on purpose: breaker deadlines live on std Instants, which
    // tokio's paused clock does not advance.
    #[tokio::test]
    async fn discovery_breaker_and_recovery_cycle() {
        let target = Ipv4Addr::new(203, 0, 113, 1);
        // Responds once, fails three times, then recovers.
        let prober = ScriptedProber::new(vec![
            Some(Duration::from_millis(8)),
            None,
            None,
            None,
            Some(Duration::from_millis(9)),
        ]);
        let (sink, delivery) = test_sink();
        let deps = deps(prober, sink.clone(), 3, Duration::from_millis(1200));
        deps.registry.add_ip(target);
        let baseline = deps.registry.suspended_count(ProbeKind::Icmp);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(deps.clone(), target, cancel.clone()));

        // Initial offset (1s) then the first probe, a success.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!deps.registry.is_suspended(target, ProbeKind::Icmp));
        assert!(deps.counters.pings_total() >= 1);

        // Three failures at 200ms spacing trip the breaker around t=1.6s.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(deps.registry.is_suspended(target, ProbeKind::Icmp));
        assert_eq!(deps.registry.suspended_count(ProbeKind::Icmp), baseline + 1);

        // During suspension, samples continue but no tokens are spent:
        // pings_total must not advance.
        let pings_at_suspend = deps.counters.pings_total();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(deps.registry.is_suspended(target, ProbeKind::Icmp));
        assert_eq!(deps.counters.pings_total(), pings_at_suspend);

        // After the backoff expires, the next probe succeeds and clears
        // the suspension.
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(!deps.registry.is_suspended(target, ProbeKind::Icmp));
        assert_eq!(deps.registry.suspended_count(ProbeKind::Icmp), baseline);
        assert_eq!(deps.registry.get(target).unwrap().icmp.fails, 0);

        cancel.cancel();
        task.await.unwrap();
        sink.close().await;

        let lines = delivery.lines.lock().unwrap().clone();
        assert!(
            lines.iter().any(|l| l.contains("success=true")),
            "success samples expected"
        );
        assert!(
            lines
                .iter()
                .any(|l| l.contains("success=false,suspended=true")),
            "suspension samples expected: {lines:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_updates_last_seen() {
        let target = Ipv4Addr::new(203, 0, 113, 2);
        let prober = ScriptedProber::new(vec![Some(Duration::from_millis(5))]);
        let (sink, _delivery) = test_sink();
        let deps = deps(prober, sink.clone(), 3, Duration::from_secs(60));
        deps.registry.add_ip(target);
        let before = deps.registry.get(target).unwrap().last_seen;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(deps.clone(), target, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        task.await.unwrap();
        sink.close().await;

        let after = deps.registry.get(target).unwrap().last_seen;
        assert!(after > before, "last_seen must strictly increase on success");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_initial_offset_is_prompt() {
        let target = Ipv4Addr::new(203, 0, 113, 3);
        let prober = ScriptedProber::new(vec![None]);
        let (sink, _delivery) = test_sink();
        let deps = deps(prober, sink.clone(), 3, Duration::from_secs(60));
        deps.registry.add_ip(target);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(deps.clone(), target, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(deps.counters.pings_total(), 0, "no probe before the offset");
        sink.close().await;
    }
}
