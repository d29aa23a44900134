pub mod metering_record;
pub mod timestamp;
pub mod window_aggregate;

pub use metering_record::{MeteringRecord, NewRecord, RecordSource, Trust, UnknownTag};
pub use window_aggregate::{aggregate_half_hourly, WindowAggregate};
