use ledger_client::domain::timestamp;
use time::OffsetDateTime;

use crate::config::ValidationConfig;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("value_kwh must be finite")]
    NonFinite,
    #[error("value_kwh must be non-negative, got {0}")]
    Negative(f64),
    #[error("{0}")]
    Timestamp(String),
    #[error("timestamp {0} outside supported years 1970..=9999")]
    TimestampOutOfRange(OffsetDateTime),
    #[error("invalid target_url: {0}")]
    TargetUrl(String),
}

impl ValidationError {
    /// Short label used as a metrics tag.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::WrongType { .. } => "wrong_type",
            Self::NonFinite => "non_finite",
            Self::Negative(_) => "negative",
            Self::Timestamp(_) | Self::TimestampOutOfRange(_) => "timestamp",
            Self::TargetUrl(_) => "target_url",
        }
    }
}

/// Numeric and time checks applied to every reading before it is appended.
///
/// Rules:
/// - kWh must be finite.
/// - kWh must be non-negative only when the policy asks for it.
/// - ts must fall in a year the ledger can order.
pub fn validate_reading(
    value_kwh: f64,
    ts: OffsetDateTime,
    policy: &ValidationConfig,
) -> Result<(), ValidationError> {
    let res = check_reading(value_kwh, ts, policy);
    if let Err(e) = &res {
        metrics::counter!("metering_validation_rejected_total", "reason" => e.reason()).increment(1);
    }
    res
}

fn check_reading(value_kwh: f64, ts: OffsetDateTime, policy: &ValidationConfig) -> Result<(), ValidationError> {
    if !value_kwh.is_finite() {
        return Err(ValidationError::NonFinite);
    }

    if policy.reject_negative_kwh && value_kwh < 0.0 {
        return Err(ValidationError::Negative(value_kwh));
    }

    if !timestamp::is_storable(ts) {
        return Err(ValidationError::TimestampOutOfRange(ts));
    }

    Ok(())
}
