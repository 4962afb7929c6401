//! Discovery sweep: expand CIDR ranges, shuffle, and probe with a worker
//! pool.
//!
//! The global shuffle matters: scanning a /16 in address order hammers one
//! subnet at a time and looks exactly like a hostile sweep to an IDS.
//! Workers draw tokens from the same global limiter as the per-device
//! monitors, so a sweep can never burst the fleet past its safe packet
//! rate.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::limiter::TokenBucket;
use crate::probe::{is_probe_safe, Prober};

/// Expand the configured ranges into candidate addresses.
///
/// Network and broadcast addresses are excluded except for /31 and /32
/// (RFC 3021 point-to-point links have no such addresses). Ranges wider
/// than /8 are refused; wider than /16 draws a warning because a sweep of
/// that size takes serious wall-clock time at fleet-safe rates.
pub fn expand_targets(networks: &[Ipv4Network]) -> anyhow::Result<Vec<Ipv4Addr>> {
    let mut targets = Vec::new();
    for net in networks {
        if net.prefix() < 8 {
            anyhow::bail!("network {} is wider than /8, refusing to sweep", net);
        }
        if net.prefix() < 16 {
            warn!(network = %net, "network wider than /16, sweep will be slow");
        }
        let network = net.network();
        let broadcast = net.broadcast();
        for ip in net.iter() {
            if net.prefix() < 31 && (ip == network || ip == broadcast) {
                continue;
            }
            if is_probe_safe(ip) {
                targets.push(ip);
            }
        }
    }
    Ok(targets)
}

/// Shuffle candidates in place. Split out from [`run`] so tests can drive
/// it with a seeded RNG.
pub fn shuffle_targets<R: Rng>(targets: &mut [Ipv4Addr], rng: &mut R) {
    targets.shuffle(rng);
}

/// Sweep the configured ranges and return every responsive address.
///
/// Emission order is unspecified. Under cancellation the partial result
/// gathered so far is returned.
pub async fn run(
    cancel: CancellationToken,
    networks: &[Ipv4Network],
    workers: usize,
    limiter: Arc<TokenBucket>,
    prober: Arc<dyn Prober>,
) -> anyhow::Result<Vec<Ipv4Addr>> {
    let mut targets = expand_targets(networks)?;
    shuffle_targets(&mut targets, &mut StdRng::from_entropy());
    let total = targets.len();
    let workers = workers.max(1);
    info!(targets = total, workers = workers, "starting discovery sweep");

    let (ip_tx, ip_rx) = mpsc::channel::<Ipv4Addr>(workers * 2);
    let ip_rx = Arc::new(tokio::sync::Mutex::new(ip_rx));
    let (found_tx, mut found_rx) = mpsc::channel::<Ipv4Addr>(workers * 2);

    // Producer feeds the bounded channel until done or cancelled.
    let producer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for ip in targets {
                tokio::select! {
                    res = ip_tx.send(ip) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    };

    // Workers: take an address, wait for a global token, probe.
    let mut worker_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let ip_rx = Arc::clone(&ip_rx);
        let found_tx = found_tx.clone();
        let limiter = Arc::clone(&limiter);
        let prober = Arc::clone(&prober);
        let cancel = cancel.clone();
        worker_handles.push(tokio::spawn(async move {
            loop {
                let ip = { ip_rx.lock().await.recv().await };
                let Some(ip) = ip else { break };
                tokio::select! {
                    _ = limiter.until_ready() => {}
                    _ = cancel.cancelled() => break,
                }
                let timeout = Duration::from_millis(crate::SWEEP_PING_TIMEOUT_MS);
                let responded = tokio::select! {
                    rtt = prober.probe(ip, timeout) => rtt.is_some(),
                    _ = cancel.cancelled() => break,
                };
                if responded && found_tx.send(ip).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(found_tx);

    // Collector: the results channel closes once every worker has exited.
    let mut responsive = Vec::new();
    while let Some(ip) = found_rx.recv().await {
        responsive.push(ip);
    }

    let _ = producer.await;
    for handle in worker_handles {
        let _ = handle.await;
    }

    debug!(
        responsive = responsive.len(),
        swept = total,
        "discovery sweep finished"
    );
    Ok(responsive)
}
