pub mod aggregate_queries;
pub mod memory_ledger;
pub mod sqlite_ledger;

use time::OffsetDateTime;

use crate::domain::{MeteringRecord, NewRecord};

pub use aggregate_queries::daily_aggregates;
pub use memory_ledger::MemoryLedger;
pub use sqlite_ledger::SqliteLedger;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("corrupt ledger row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

/// Append-only metering ledger.
///
/// There is no update or delete: a record is written once by
/// `insert` and only ever read back afterwards.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a record and return its freshly generated id.
    async fn insert(&self, record: NewRecord) -> Result<String, StorageError>;

    /// Records with `start <= timestamp_utc <= end`, in insertion order.
    async fn query_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<MeteringRecord>, StorageError>;
}
