use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a logical payload reached the delivery layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverySource {
    /// Unbatched request, delivered as soon as it arrived.
    Single,
    /// Every chunk of the batch arrived.
    Batch,
    /// Flushed after a timeout, sweep or shutdown with chunks still missing.
    BatchPartial,
}

impl DeliverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverySource::Single => "single",
            DeliverySource::Batch => "batch",
            DeliverySource::BatchPartial => "batch-partial",
        }
    }
}

impl std::fmt::Display for DeliverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retained logical payload. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Sequence number assigned at append time; pull clients use it as a cursor.
    pub id: u64,
    #[serde(rename = "data")]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub source: DeliverySource,
}

/// Push wire format: `{data, timestamp, requestId, source}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFrame<'a> {
    pub data: &'a Value,
    pub timestamp: DateTime<Utc>,
    pub request_id: &'a str,
    pub source: DeliverySource,
}

impl<'a> From<&'a HistoryEntry> for DeliveryFrame<'a> {
    fn from(entry: &'a HistoryEntry) -> Self {
        Self {
            data: &entry.payload,
            timestamp: entry.timestamp,
            request_id: &entry.request_id,
            source: entry.source,
        }
    }
}
