use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod capture;
mod classify;
mod config;
mod error;
mod pipeline;
mod state;
mod storage;

use capture::{CaptureReader, RawPacket};
use config::{CliArgs, Config};
use pipeline::Pipeline;
use storage::{ElasticStore, ResilientWriter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))
            .with_context(|| format!("failed to load config {}", config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── Capture source ────────────────────────────────────────────────
    tracing::info!("Using capture file {}", config.pcap_path);
    let reader = CaptureReader::open(&config.pcap_path)
        .with_context(|| format!("cannot open capture {}", config.pcap_path))?;

    // ── Document store ────────────────────────────────────────────────
    let store = ElasticStore::new(&config).context("failed to build document store client")?;
    let info = store
        .ping()
        .await
        .with_context(|| format!("document store unreachable at {}", config.elastic_url))?;
    tracing::info!(
        "Connected to document store {} (cluster {:?}, version {}), index {}",
        config.elastic_url,
        info.cluster_name,
        info.version.number,
        store.index_name()
    );

    // ── State & Metrics API ───────────────────────────────────────────
    let traffic_state = Arc::new(state::TrafficState::new());
    let app_state = Arc::new(api::AppState::new(traffic_state.clone()));
    let app = api::router(app_state.clone(), &config.allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.metrics_port))
        .await
        .with_context(|| format!("cannot bind metrics port {}", config.metrics_port))?;
    tracing::info!("Metrics on http://0.0.0.0:{}/metrics", config.metrics_port);
    let server = api::spawn_server(listener, app);

    // ── Capture Reader Thread ─────────────────────────────────────────
    let (tx, rx) = mpsc::channel::<RawPacket>(1024);
    let reader_thread = std::thread::spawn(move || capture::forward(reader, tx));

    // ── Pipeline ──────────────────────────────────────────────────────
    let writer = ResilientWriter::new(
        store,
        traffic_state.clone(),
        config.max_retries,
        Duration::from_millis(config.retry_delay_ms),
        config.failure_log_limit,
    );
    let pipeline = Pipeline::new(writer, traffic_state.clone(), config.verbose_packets);
    let summary = pipeline.run(rx).await;
    app_state.drained.store(true, Ordering::Relaxed);

    if reader_thread.join().is_err() {
        tracing::error!("capture reader thread panicked");
    }

    tracing::info!(
        "Drained {} packets ({} bytes) in {:.2?}: {} stored, {} failed",
        summary.packets,
        summary.bytes,
        summary.elapsed,
        summary.written,
        summary.failed
    );

    if server.is_finished() {
        server.await.context("metrics server task failed")??;
        anyhow::bail!("metrics server exited while the capture was draining");
    }

    if config.exit_on_complete {
        return Ok(());
    }

    tracing::info!("Capture drained; serving metrics until Ctrl-C");
    tokio::select! {
        result = server => {
            result.context("metrics server task failed")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
