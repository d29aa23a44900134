use std::{path::Path, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerStore, StorageError};
use crate::domain::{timestamp, MeteringRecord, NewRecord, RecordSource, Trust};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS metering_records (
        id            TEXT PRIMARY KEY,
        obp_id        TEXT,
        meter_id      TEXT NOT NULL,
        timestamp_utc TEXT NOT NULL,
        value_kwh     REAL NOT NULL,
        source        TEXT NOT NULL,
        trust         TEXT NOT NULL,
        signature     TEXT NOT NULL,
        raw_payload   TEXT NOT NULL
    )
"#;

const CREATE_TIMESTAMP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS metering_records_timestamp_idx ON metering_records (timestamp_utc)";

// The table is append-only; refuse mutation even from ad-hoc SQL clients.
const FORBID_UPDATE: &str = r#"
    CREATE TRIGGER IF NOT EXISTS metering_records_no_update
    BEFORE UPDATE ON metering_records
    BEGIN
        SELECT RAISE(ABORT, 'metering_records is append-only');
    END
"#;

const FORBID_DELETE: &str = r#"
    CREATE TRIGGER IF NOT EXISTS metering_records_no_delete
    BEFORE DELETE ON metering_records
    BEGIN
        SELECT RAISE(ABORT, 'metering_records is append-only');
    END
"#;

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    obp_id: Option<String>,
    meter_id: String,
    timestamp_utc: String,
    value_kwh: f64,
    source: String,
    trust: String,
    signature: String,
    raw_payload: String,
}

impl TryFrom<RecordRow> for MeteringRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt {
            id: row.id.clone(),
            reason,
        };

        let timestamp_utc =
            timestamp::parse_timestamp(&row.timestamp_utc).map_err(|e| corrupt(e.to_string()))?;
        let source = row.source.parse::<RecordSource>().map_err(|e| corrupt(e.to_string()))?;
        let trust = row.trust.parse::<Trust>().map_err(|e| corrupt(e.to_string()))?;
        let raw_payload =
            serde_json::from_str(&row.raw_payload).map_err(|e| corrupt(format!("raw_payload: {e}")))?;

        Ok(MeteringRecord {
            id: row.id,
            obp_id: row.obp_id,
            meter_id: row.meter_id,
            timestamp_utc,
            value_kwh: row.value_kwh,
            source,
            trust,
            signature: row.signature,
            raw_payload,
        })
    }
}

/// File-backed ledger on SQLite.
///
/// Appends are funnelled through a single async mutex so that concurrent
/// requests never contend for the database write lock.
pub struct SqliteLedger {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger file at `path`.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        tracing::info!(path = %path.as_ref().display(), "opened sqlite ledger");
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema if it is missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        for statement in [CREATE_TABLE, CREATE_TIMESTAMP_INDEX, FORBID_UPDATE, FORBID_DELETE] {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl LedgerStore for SqliteLedger {
    async fn insert(&self, record: NewRecord) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let raw_payload = serde_json::to_string(&record.raw_payload)
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        let ts = timestamp::to_storage_string(record.timestamp_utc);

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO metering_records
                (id, obp_id, meter_id, timestamp_utc, value_kwh, source, trust, signature, raw_payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&record.obp_id)
        .bind(&record.meter_id)
        .bind(&ts)
        .bind(record.value_kwh)
        .bind(record.source.as_str())
        .bind(record.trust.as_str())
        .bind(&record.signature)
        .bind(&raw_payload)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, record_id = %id, "ledger insert failed");
            StorageError::from(e)
        })?;

        Ok(id)
    }

    async fn query_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<MeteringRecord>, StorageError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT
                id,
                obp_id,
                meter_id,
                timestamp_utc,
                value_kwh,
                source,
                trust,
                signature,
                raw_payload
            FROM metering_records
            WHERE timestamp_utc >= ?
              AND timestamp_utc <= ?
            ORDER BY rowid
            "#,
        )
        .bind(timestamp::to_storage_string(start))
        .bind(timestamp::to_storage_string(end))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MeteringRecord::try_from).collect()
    }
}
