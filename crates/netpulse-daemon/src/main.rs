mod config;
mod health_server;
mod monitor;
mod orchestrator;
mod self_health;
mod snmp_task;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use netpulse_core::health::FleetCounters;
use netpulse_core::limiter::token_bucket;
use netpulse_core::probe::{IcmpProber, Prober};
use netpulse_core::registry::Registry;
use netpulse_core::sink::{InfluxDelivery, Sink, SinkConfig};
use netpulse_core::snmp::SnmpParams;

use crate::config::Config;
use crate::health_server::HealthState;
use crate::orchestrator::{Orchestrator, OrchestratorParts};

#[derive(Parser, Debug)]
#[command(name = "netpulse-daemon", about = "Network liveness monitoring daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/netpulse.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    let networks = config.networks()?;
    let daily_schedule = config.daily_schedule()?;
    let static_ips = config.static_device_ips()?;

    info!(
        networks = networks.len(),
        max_devices = config.max_devices,
        discovery_interval_secs = config.icmp_discovery_interval.as_secs(),
        "netpulse daemon starting"
    );

    let registry = Arc::new(Registry::new(config.max_devices));
    for ip in static_ips {
        registry.add_ip(ip);
    }

    // The store must be reachable before anything is monitored; a daemon
    // that cannot deliver observations has nothing to offer.
    let delivery = Arc::new(InfluxDelivery::new(
        &config.influxdb.url,
        &config.influxdb.token,
        &config.influxdb.org,
    )?);
    let sink = Arc::new(Sink::new(
        delivery,
        SinkConfig {
            bucket: config.influxdb.bucket.clone(),
            health_bucket: config.influxdb.health_bucket.clone(),
            batch_size: config.influxdb.batch_size,
            flush_interval: config.influxdb.flush_interval,
        },
    ));
    sink.health_check()
        .await
        .context("time-series store health check failed")?;
    info!(url = %config.influxdb.url, "store health check passed");

    let prober: Arc<dyn Prober> = Arc::new(IcmpProber::new()?);
    let ping_limiter = Arc::new(token_bucket(
        config.ping_rate_limit,
        config.ping_burst_limit,
    ));
    let snmp_limiter = Arc::new(token_bucket(
        config.ping_rate_limit,
        config.ping_burst_limit,
    ));
    let counters = Arc::new(FleetCounters::new());
    let health_state = HealthState::new();
    let cancel = CancellationToken::new();

    let snmp_params = SnmpParams {
        community: config.snmp.community.clone(),
        port: config.snmp.port,
        timeout: config.snmp.timeout,
        retries: config.snmp.retries,
    };

    let orchestrator = Orchestrator::new(OrchestratorParts {
        registry: Arc::clone(&registry),
        sink: Arc::clone(&sink),
        counters: Arc::clone(&counters),
        health_state: Arc::clone(&health_state),
        ping_limiter,
        snmp_limiter,
        prober,
        networks,
        snmp_params,
        icmp_workers: config.icmp_workers,
        snmp_workers: config.snmp_workers,
        discovery_interval: config.icmp_discovery_interval,
        daily_schedule,
        health_report_interval: config.health_report_interval,
        memory_limit_mb: config.memory_limit_mb,
        max_concurrent_pingers: config.max_concurrent_pingers,
        ping_interval: config.ping_interval,
        ping_timeout: config.ping_timeout,
        snmp_interval: config.snmp_interval,
        fail_threshold: config.ping_max_consecutive_fails,
        backoff: config.ping_backoff_duration,
        cancel: cancel.clone(),
    });

    // Initial sweep before the main loop so the first pingers start
    // promptly instead of waiting a full discovery interval.
    orchestrator.run_discovery().await?;

    health_state.attach_live(
        Arc::clone(&orchestrator.monitor_table),
        Arc::clone(&orchestrator.snmp_table),
        Arc::clone(&counters),
    );
    health_state.set_ready(true);
    let health_server_handle = tokio::spawn(health_server::run(
        Arc::clone(&health_state),
        config.health_check_port,
    ));

    // Signal streams must exist before the drivers run; a stream only
    // observes signals delivered after its construction.
    let shutdown_signal = install_signal_handlers()?;

    orchestrator.start();
    info!("netpulse daemon running");

    shutdown_signal.await;

    info!("shutting down");
    cancel.cancel();
    orchestrator.shutdown().await;
    sink.close().await;
    health_server_handle.abort();
    info!("shutdown complete");

    Ok(())
}

/// Register interrupt/terminate handlers, returning the future that
/// resolves on the first signal.
#[cfg(unix)]
fn install_signal_handlers() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("interrupt received"),
            _ = sigterm.recv() => info!("terminate received"),
        }
    })
}

#[cfg(not(unix))]
fn install_signal_handlers() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
        }
    })
}
