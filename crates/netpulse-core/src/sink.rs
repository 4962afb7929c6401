//! Batching observation sink.
//!
//! Three observation classes (ping samples, device info, self-health) are
//! encoded as InfluxDB line protocol at enqueue time and fed through two
//! bounded queues — monitoring data and self-health go to different
//! buckets — each drained by a single background flusher. A flush happens
//! when the local batch reaches `batch_size` or when `flush_interval`
//! elapses, whichever comes first. Enqueue never blocks: a full queue drops
//! the point and counts it.
//!
//! Delivery is best-effort: a batch is retried up to three times with
//! exponential backoff and then abandoned, so a dead store degrades a
//! counter instead of back-pressuring the fleet.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::health::HealthSnapshot;
use crate::snmp::sanitize;

/// Retries after the initial attempt, with 1s/2s/4s backoff.
const FLUSH_MAX_RETRIES: u32 = 3;

// ── Line protocol encoding ──────────────────────────────────────────────

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Escape a tag key or value: line protocol reserves comma, equals, space.
fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Escape a string field value: backslash and double quote.
fn escape_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn ping_line(ip: Ipv4Addr, rtt_ms: f64, success: bool, suspended: bool, t_ms: u64) -> String {
    format!(
        "ping,ip={} rtt_ms={},success={},suspended={} {}",
        ip, rtt_ms, success, suspended, t_ms
    )
}

fn device_info_line(ip: Ipv4Addr, hostname: &str, descr: &str, t_ms: u64) -> String {
    format!(
        "device_info,ip={} hostname=\"{}\",snmp_description=\"{}\" {}",
        ip,
        escape_field(&sanitize(hostname)),
        escape_field(&sanitize(descr)),
        t_ms
    )
}

fn health_line(s: &HealthSnapshot) -> String {
    format!(
        "health_metrics status=\"{}\",device_count={}u,icmp_suspended={}u,snmp_suspended={}u,\
         monitor_tasks={}u,snmp_tasks={}u,pings_total={}u,pings_in_flight={}u,\
         sink_ok_batches={}u,sink_failed_batches={}u,sink_dropped_points={}u,\
         threads={}u,rss_mb={},vm_mb={},store_ok={},uptime_secs={}u {}",
        format!("{:?}", s.status).to_lowercase(),
        s.device_count,
        s.icmp_suspended,
        s.snmp_suspended,
        s.monitor_tasks,
        s.snmp_tasks,
        s.pings_total,
        s.pings_in_flight,
        s.sink_ok_batches,
        s.sink_failed_batches,
        s.sink_dropped_points,
        s.threads,
        s.rss_mb,
        s.vm_mb,
        s.store_ok,
        s.uptime_secs,
        s.timestamp_ms
    )
}

// ── Delivery seam ───────────────────────────────────────────────────────

/// Transport to the time-series store. Tests substitute a recording double.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn write_lines(&self, bucket: &str, lines: &[String]) -> anyhow::Result<()>;
    async fn health_check(&self) -> anyhow::Result<()>;
}

/// InfluxDB v2 HTTP API transport.
pub struct InfluxDelivery {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
}

impl InfluxDelivery {
    pub fn new(url: &str, token: &str, org: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(crate::STORE_HEALTH_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
        })
    }
}

#[async_trait]
impl Delivery for InfluxDelivery {
    async fn write_lines(&self, bucket: &str, lines: &[String]) -> anyhow::Result<()> {
        let endpoint = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.url, self.org, bucket
        );
        let resp = self
            .http
            .post(endpoint)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("store write returned {}", resp.status());
        }
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.url))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("store health endpoint returned {}", resp.status());
        }
        Ok(())
    }
}

// ── Sink ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub bucket: String,
    pub health_bucket: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Shared counters between the sink facade and its flushers.
struct SinkCounters {
    ok_batches: AtomicU64,
    failed_batches: AtomicU64,
    dropped_points: AtomicU64,
}

pub struct Sink {
    data_tx: mpsc::Sender<String>,
    health_tx: mpsc::Sender<String>,
    delivery: Arc<dyn Delivery>,
    counters: Arc<SinkCounters>,
    cancel: CancellationToken,
    flushers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Sink {
    /// Construct the sink and spawn one flusher per stream.
    pub fn new(delivery: Arc<dyn Delivery>, cfg: SinkConfig) -> Self {
        let batch_size = cfg.batch_size.max(1);
        let (data_tx, data_rx) = mpsc::channel(batch_size * 2);
        let (health_tx, health_rx) = mpsc::channel(batch_size * 2);
        let counters = Arc::new(SinkCounters {
            ok_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            dropped_points: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let mut flushers = Vec::with_capacity(2);
        for (rx, bucket) in [(data_rx, cfg.bucket.clone()), (health_rx, cfg.health_bucket.clone())] {
            flushers.push(tokio::spawn(run_flusher(
                rx,
                Arc::clone(&delivery),
                bucket,
                batch_size,
                cfg.flush_interval,
                Arc::clone(&counters),
                cancel.clone(),
            )));
        }

        Self {
            data_tx,
            health_tx,
            delivery,
            counters,
            cancel,
            flushers: Mutex::new(flushers),
            closed: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, tx: &mpsc::Sender<String>, line: String) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if tx.try_send(line).is_err() {
            self.counters.dropped_points.fetch_add(1, Ordering::Relaxed);
            debug!("sink queue full, dropping point");
        }
    }

    pub fn write_ping(&self, ip: Ipv4Addr, rtt_ms: f64, success: bool, suspended: bool) {
        self.enqueue(
            &self.data_tx,
            ping_line(ip, rtt_ms.max(0.0), success, suspended, epoch_ms()),
        );
    }

    pub fn write_device_info(&self, ip: Ipv4Addr, hostname: &str, descr: &str) {
        self.enqueue(
            &self.data_tx,
            device_info_line(ip, hostname, descr, epoch_ms()),
        );
    }

    pub fn write_health(&self, snapshot: &HealthSnapshot) {
        self.enqueue(&self.health_tx, health_line(snapshot));
    }

    /// Synchronous RTT-bounded probe of the store.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.delivery.health_check().await
    }

    pub fn successful_batches(&self) -> u64 {
        self.counters.ok_batches.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.counters.failed_batches.load(Ordering::Relaxed)
    }

    pub fn dropped_points(&self) -> u64 {
        self.counters.dropped_points.load(Ordering::Relaxed)
    }

    /// Stop the flushers, drain both queues, and perform the final flushes.
    /// Idempotent; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.flushers.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "sink flusher did not exit cleanly");
            }
        }
    }
}

/// Single-consumer flusher loop for one stream.
async fn run_flusher(
    mut rx: mpsc::Receiver<String>,
    delivery: Arc<dyn Delivery>,
    bucket: String,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<SinkCounters>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately; swallow it.
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(line) => {
                    batch.push(line);
                    if batch.len() >= batch_size {
                        flush(&*delivery, &bucket, &mut batch, &counters).await;
                        ticker.reset();
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                flush(&*delivery, &bucket, &mut batch, &counters).await;
            }
            _ = cancel.cancelled() => break,
        }
    }

    // Shutdown: drain whatever producers managed to enqueue, then flush.
    while let Ok(line) = rx.try_recv() {
        batch.push(line);
        if batch.len() >= batch_size {
            flush(&*delivery, &bucket, &mut batch, &counters).await;
        }
    }
    flush(&*delivery, &bucket, &mut batch, &counters).await;
    debug!(bucket = %bucket, "sink flusher exited");
}

/// Deliver the accumulated batch, retrying with exponential backoff. The
/// batch is consumed either way: points lost to a dead store are counted,
/// not re-enqueued.
async fn flush(
    delivery: &dyn Delivery,
    bucket: &str,
    batch: &mut Vec<String>,
    counters: &SinkCounters,
) {
    if batch.is_empty() {
        return;
    }
    let lines = std::mem::take(batch);
    for attempt in 0..=FLUSH_MAX_RETRIES {
        match delivery.write_lines(bucket, &lines).await {
            Ok(()) => {
                counters.ok_batches.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if attempt < FLUSH_MAX_RETRIES => {
                let backoff = Duration::from_secs(1 << attempt);
                warn!(
                    bucket = %bucket,
                    attempt = attempt + 1,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "batch write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(
                    bucket = %bucket,
                    points = lines.len(),
                    error = %e,
                    "batch write failed after retries, dropping batch"
                );
            }
        }
    }
}
