//! Metering ledger data access: domain types, the append-only store and
//! the half-hourly aggregation query.

pub mod db;
pub mod domain;

pub use db::{LedgerStore, MemoryLedger, SqliteLedger, StorageError};
pub use domain::{MeteringRecord, NewRecord, RecordSource, Trust, WindowAggregate};
