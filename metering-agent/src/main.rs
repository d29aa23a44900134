use std::sync::Arc;

use anyhow::Result;
use ledger_client::{LedgerStore, MemoryLedger, SqliteLedger};
use metering_agent::{
    config::{AppConfig, LedgerKind},
    http::{self, AppState},
    metrics_server, observability,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    if cfg.uses_default_secret() {
        tracing::warn!("using the development shared secret; set METERING_SHARED_SECRET before deploying");
    }

    let store: Arc<dyn LedgerStore> = match cfg.ledger.kind {
        LedgerKind::Sqlite => Arc::new(SqliteLedger::open(&cfg.ledger.path, cfg.ledger.max_connections).await?),
        LedgerKind::Memory => {
            tracing::warn!("ledger kind is 'memory'; records will not survive a restart");
            Arc::new(MemoryLedger::new())
        }
    };

    let state = AppState::from_config(&cfg, store)?;

    let listener = TcpListener::bind(cfg.bind_socket_addr()?).await?;
    tracing::info!(address = %listener.local_addr()?, "metering agent listening");

    http::serve(listener, state).await
}
