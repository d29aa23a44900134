use time::Date;

use super::{LedgerStore, StorageError};
use crate::domain::{aggregate_half_hourly, timestamp::day_bounds, WindowAggregate};

/// Half-hourly sums per meter for one UTC calendar day.
pub async fn daily_aggregates(
    store: &dyn LedgerStore,
    date: Date,
) -> Result<Vec<WindowAggregate>, StorageError> {
    let (start, end) = day_bounds(date);
    let records = store.query_range(start, end).await?;

    tracing::debug!(%date, records = records.len(), "aggregating daily ledger records");
    Ok(aggregate_half_hourly(&records))
}
