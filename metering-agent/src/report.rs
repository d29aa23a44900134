use std::io;

use ledger_client::{
    db::daily_aggregates,
    domain::timestamp::{parse_date, TimestampError},
    LedgerStore, StorageError, WindowAggregate,
};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, Date, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub date: String,
    pub aggregates: Vec<WindowAggregate>,
}

/// `None` or a blank string means today in UTC.
pub fn resolve_date(raw: Option<&str>) -> Result<Date, TimestampError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => parse_date(s),
        None => Ok(OffsetDateTime::now_utc().date()),
    }
}

pub async fn build_daily_report(store: &dyn LedgerStore, date: Date) -> Result<DailyReport, StorageError> {
    let aggregates = daily_aggregates(store, date).await?;
    Ok(DailyReport {
        date: date.to_string(),
        aggregates,
    })
}

/// Write aggregates as CSV: `meter_id,window_start,sum_kwh,samples,obp_ids`,
/// with obp ids joined by `;`.
pub fn write_csv<W: io::Write>(out: W, aggregates: &[WindowAggregate]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(["meter_id", "window_start", "sum_kwh", "samples", "obp_ids"])?;

    for agg in aggregates {
        writer.write_record([
            agg.meter_id.clone(),
            agg.window_start.format(&Rfc3339)?,
            agg.sum_kwh.to_string(),
            agg.samples.to_string(),
            agg.obp_ids.join(";"),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
