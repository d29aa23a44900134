use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LedgerStore, StorageError};
use crate::domain::{timestamp::normalize, MeteringRecord, NewRecord};

/// Ledger held in process memory.
///
/// Not durable: everything is lost when the process exits. Useful for tests
/// and throwaway deployments.
#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<Vec<MeteringRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedger {
    async fn insert(&self, record: NewRecord) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let record = record.into_record(id.clone());

        self.records.write().await.push(record);
        Ok(id)
    }

    async fn query_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<MeteringRecord>, StorageError> {
        let (start, end) = (normalize(start), normalize(end));
        let guard = self.records.read().await;
        Ok(guard
            .iter()
            .filter(|r| r.timestamp_utc >= start && r.timestamp_utc <= end)
            .cloned()
            .collect())
    }
}
