use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and serve `/metrics` on `bind_addr`.
pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid metrics bind address '{bind_addr}'"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    // Ignore error if the handle was already set; this should only be called once.
    let _ = PROM_HANDLE.set(handle);
    describe_metrics();

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(address = %addr, "metrics listener started");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("metering_ingest_requests_total", "Inbound on_metering requests");
    metrics::describe_counter!(
        "metering_ingest_rejected_total",
        "Inbound messages rejected for a missing or bad signature"
    );
    metrics::describe_counter!("metering_validation_rejected_total", "Readings failing validation, by reason");
    metrics::describe_counter!("metering_records_appended_total", "Ledger appends, by source");
    metrics::describe_counter!("metering_emission_attempts_total", "Outbound delivery attempts");
    metrics::describe_counter!(
        "metering_emission_failures_total",
        "Outbound deliveries that ended without a successful response"
    );
    metrics::describe_histogram!(
        "metering_emission_latency_seconds",
        "Wall time of a single outbound delivery attempt"
    );
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}
