use anyhow::{bail, Context, Result};
use ledger_client::SqliteLedger;
use metering_agent::{
    config::{AppConfig, LedgerKind},
    observability,
    report::{build_daily_report, resolve_date, write_csv},
};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        bail!("usage: daily_report [YYYY-MM-DD]");
    }
    let date = resolve_date(args.get(1).map(String::as_str))?;

    // Same config resolution as the agent (METERING_CONFIG / METER_DB).
    let cfg = AppConfig::load()?;
    if cfg.ledger.kind != LedgerKind::Sqlite {
        bail!("daily_report reads a sqlite ledger; ledger.kind is {:?}", cfg.ledger.kind);
    }

    let ledger = SqliteLedger::open(&cfg.ledger.path, 1)
        .await
        .with_context(|| format!("failed to open ledger {}", cfg.ledger.path))?;

    let report = build_daily_report(&ledger, date).await?;
    tracing::info!(date = %report.date, windows = report.aggregates.len(), "daily aggregates computed");

    write_csv(std::io::stdout().lock(), &report.aggregates)?;
    ledger.close().await;

    Ok(())
}
