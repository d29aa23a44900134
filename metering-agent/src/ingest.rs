use std::sync::Arc;

use ledger_client::{
    domain::timestamp::{self, now_utc},
    LedgerStore, NewRecord, RecordSource, Trust,
};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    config::ValidationConfig,
    error::ApiError,
    signing::Signer,
    validation::{validate_reading, ValidationError},
};

pub const UNKNOWN_METER: &str = "unknown";

/// Fields pulled out of an inbound `message.metering` block.
#[derive(Debug, Clone, PartialEq)]
pub struct MeteringReading {
    pub obp_id: Option<String>,
    pub meter_id: String,
    pub timestamp: OffsetDateTime,
    pub value_kwh: f64,
}

/// Extract the reading from a `{context, message}` payload.
///
/// - `obp_id`: `metering.obp_id`, else `context.transaction_id`, else none.
/// - `meter_id`: defaults to `"unknown"`.
/// - `value_kwh`: defaults to 0.0; must be a JSON number when present.
/// - `timestamp`: defaults to `received_at`.
pub fn extract_reading(payload: &Value, received_at: OffsetDateTime) -> Result<MeteringReading, ValidationError> {
    let empty = Map::new();
    let metering = match payload.pointer("/message/metering") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(m)) => m,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "message.metering",
                expected: "an object",
            })
        }
    };

    let obp_id = non_empty_text(metering.get("obp_id"))
        .or_else(|| non_empty_text(payload.pointer("/context/transaction_id")));

    let meter_id = match metering.get("meter_id") {
        None | Some(Value::Null) => UNKNOWN_METER.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "meter_id",
                expected: "a string",
            })
        }
    };

    let value_kwh = match metering.get("value_kwh") {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().ok_or(ValidationError::NonFinite)?,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "value_kwh",
                expected: "a number",
            })
        }
    };

    let timestamp = match metering.get("timestamp") {
        None | Some(Value::Null) => received_at,
        Some(Value::String(s)) if s.trim().is_empty() => received_at,
        Some(Value::String(s)) => {
            timestamp::parse_timestamp(s).map_err(|e| ValidationError::Timestamp(e.to_string()))?
        }
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "timestamp",
                expected: "an ISO-8601 string",
            })
        }
    };

    Ok(MeteringReading {
        obp_id,
        meter_id,
        timestamp,
        value_kwh,
    })
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Count and log a signature that fails verification or cannot be read.
pub fn reject_invalid_signature() -> ApiError {
    tracing::warn!("rejecting metering message with invalid signature");
    metrics::counter!("metering_ingest_rejected_total", "reason" => "invalid_signature").increment(1);
    ApiError::InvalidSignature
}

/// Verifies inbound messages and appends them to the ledger.
pub struct Ingestor {
    store: Arc<dyn LedgerStore>,
    signer: Signer,
    policy: ValidationConfig,
}

impl Ingestor {
    pub fn new(store: Arc<dyn LedgerStore>, signer: Signer, policy: ValidationConfig) -> Self {
        Self { store, signer, policy }
    }

    /// Record one inbound message and return the new record id.
    ///
    /// A present signature must verify against the canonical payload or
    /// nothing is written. An absent one is tolerated unless the policy
    /// requires signatures; the record then carries a locally computed
    /// digest and `Trust::Unverified`.
    pub async fn ingest(&self, payload: Value, signature: Option<&str>) -> Result<String, ApiError> {
        metrics::counter!("metering_ingest_requests_total").increment(1);

        let signature = signature.map(str::trim).filter(|s| !s.is_empty());
        let (signature, trust) = match signature {
            Some(sig) if self.signer.verify(&payload, sig) => (sig.to_string(), Trust::Verified),
            Some(_) => return Err(reject_invalid_signature()),
            None if self.policy.require_signature => {
                tracing::warn!("rejecting unsigned metering message");
                metrics::counter!("metering_ingest_rejected_total", "reason" => "missing_signature").increment(1);
                return Err(ApiError::MissingSignature);
            }
            None => (self.signer.sign(&payload), Trust::Unverified),
        };

        let reading = extract_reading(&payload, now_utc()).map_err(|e| {
            metrics::counter!("metering_validation_rejected_total", "reason" => e.reason()).increment(1);
            e
        })?;
        validate_reading(reading.value_kwh, reading.timestamp, &self.policy)?;

        let record_id = self
            .store
            .insert(NewRecord {
                obp_id: reading.obp_id,
                meter_id: reading.meter_id.clone(),
                timestamp_utc: reading.timestamp,
                value_kwh: reading.value_kwh,
                source: RecordSource::Received,
                trust,
                signature,
                raw_payload: payload,
            })
            .await?;

        metrics::counter!("metering_records_appended_total", "source" => "received").increment(1);
        tracing::info!(
            record_id = %record_id,
            meter_id = %reading.meter_id,
            value_kwh = reading.value_kwh,
            trust = %trust,
            "metering record ingested"
        );

        Ok(record_id)
    }
}
