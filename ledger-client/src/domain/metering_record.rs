use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How a record entered the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Received,
    Sent,
}

/// Provenance of the stored signature.
///
/// - `Verified`: inbound, the sender's signature checked out.
/// - `Unverified`: inbound without a signature; the stored value is a local
///   audit digest and says nothing about who sent the message.
/// - `Local`: emitted and signed by this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    Verified,
    Unverified,
    Local,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} tag '{value}'")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
        }
    }
}

impl Trust {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Trust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSource {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "sent" => Ok(Self::Sent),
            other => Err(UnknownTag {
                kind: "source",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for Trust {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(Self::Verified),
            "unverified" => Ok(Self::Unverified),
            "local" => Ok(Self::Local),
            other => Err(UnknownTag {
                kind: "trust",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted ledger entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringRecord {
    pub id: String,
    pub obp_id: Option<String>,
    pub meter_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp_utc: OffsetDateTime,
    pub value_kwh: f64,
    pub source: RecordSource,
    pub trust: Trust,
    pub signature: String,
    pub raw_payload: serde_json::Value,
}

/// Everything a caller supplies for an append; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub obp_id: Option<String>,
    pub meter_id: String,
    pub timestamp_utc: OffsetDateTime,
    pub value_kwh: f64,
    pub source: RecordSource,
    pub trust: Trust,
    pub signature: String,
    pub raw_payload: serde_json::Value,
}

impl NewRecord {
    pub fn into_record(self, id: String) -> MeteringRecord {
        MeteringRecord {
            id,
            obp_id: self.obp_id,
            meter_id: self.meter_id,
            timestamp_utc: crate::domain::timestamp::normalize(self.timestamp_utc),
            value_kwh: self.value_kwh,
            source: self.source,
            trust: self.trust,
            signature: self.signature,
            raw_payload: self.raw_payload,
        }
    }
}
