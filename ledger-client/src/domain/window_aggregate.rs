use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::{timestamp::half_hour_floor, MeteringRecord};

/// Sum of readings for one meter over one 30-minute UTC window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    pub sum_kwh: f64,
    pub samples: u64,
    pub obp_ids: Vec<String>,
}

#[derive(Default)]
struct WindowAccumulator {
    sum_kwh: f64,
    samples: u64,
    obp_ids: BTreeSet<String>,
}

/// Group records by `(meter_id, half-hour window)`.
///
/// Output is ordered by meter then window; windows without samples never
/// appear. Records without an `obp_id` still count towards the sums.
pub fn aggregate_half_hourly<'a, I>(records: I) -> Vec<WindowAggregate>
where
    I: IntoIterator<Item = &'a MeteringRecord>,
{
    let mut windows: BTreeMap<(String, OffsetDateTime), WindowAccumulator> = BTreeMap::new();

    for record in records {
        let key = (record.meter_id.clone(), half_hour_floor(record.timestamp_utc));
        let acc = windows.entry(key).or_default();
        acc.sum_kwh += record.value_kwh;
        acc.samples += 1;
        if let Some(obp_id) = &record.obp_id {
            acc.obp_ids.insert(obp_id.clone());
        }
    }

    windows
        .into_iter()
        .map(|((meter_id, window_start), acc)| WindowAggregate {
            meter_id,
            window_start,
            sum_kwh: acc.sum_kwh,
            samples: acc.samples,
            obp_ids: acc.obp_ids.into_iter().collect(),
        })
        .collect()
}
