// In-flight batch state
//
// Collects indexed chunks of one logical payload and assembles them in index
// order once the batch completes or is force-flushed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{AssembledBatch, BatchStatus, Progress, MISSING_REPORT_LIMIT};

#[derive(Debug)]
pub(crate) struct PendingBatch {
    total: usize,
    // BTreeMap keeps chunks ordered by declared index, never by arrival.
    chunks: BTreeMap<usize, Value>,
    generation: u64,
    created_at: Instant,
    last_update_at: Instant,
    deadline: Instant,
}

impl PendingBatch {
    pub fn new(total: usize, generation: u64, now: Instant, timeout: Duration) -> Self {
        Self {
            total,
            chunks: BTreeMap::new(),
            generation,
            created_at: now,
            last_update_at: now,
            deadline: now + timeout,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Store a chunk. Returns true when it replaced an earlier chunk at the same index.
    pub fn record(&mut self, index: usize, payload: Value, now: Instant) -> bool {
        self.last_update_at = now;
        self.chunks.insert(index, payload).is_some()
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total
    }

    /// Up to `limit` absent indices, ascending. Walks the gaps between stored
    /// indices, so the cost follows what was received rather than `total`.
    pub fn missing(&self, limit: usize) -> Vec<usize> {
        let mut missing = Vec::new();
        let mut expected = 0;
        for index in self.chunks.keys().copied().chain(std::iter::once(self.total)) {
            for gap in expected..index {
                if missing.len() >= limit {
                    return missing;
                }
                missing.push(gap);
            }
            expected = index.saturating_add(1);
        }
        missing
    }

    pub fn progress(&self) -> Progress {
        Progress {
            received: self.received(),
            total: self.total,
            missing: self.missing(MISSING_REPORT_LIMIT),
        }
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_update_at) >= stale_after
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn status(&self, id: &str, now: Instant) -> BatchStatus {
        let received = self.received();
        BatchStatus {
            id: id.to_string(),
            total: self.total,
            received,
            progress: (received * 100 / self.total) as u32,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
        }
    }

    pub fn finalize(self, batch_id: String) -> AssembledBatch {
        let missing = self.missing(MISSING_REPORT_LIMIT);
        let received = self.chunks.len();
        let complete = self.is_complete();
        let items = assemble(self.chunks.into_values());

        AssembledBatch {
            batch_id,
            items,
            total: self.total,
            received,
            missing,
            complete,
            unbatched: false,
        }
    }
}

/// Concatenate payloads already in index order. Arrays contribute their
/// elements (one level), anything else is a single item.
pub(crate) fn assemble(payloads: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut items = Vec::new();
    for payload in payloads {
        match payload {
            Value::Array(elements) => items.extend(elements),
            other => items.push(other),
        }
    }
    items
}
