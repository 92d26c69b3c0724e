//! Fixed-capacity buffer of recently delivered payloads.
//!
//! Entries get a monotonically increasing sequence number at append time.
//! Pull clients remember the last number they saw and ask for everything
//! after it, which avoids relying on timestamps that collide under bursts.

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::types::{DeliverySource, HistoryEntry};

/// Result of an incremental read.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySlice {
    pub entries: Vec<HistoryEntry>,
    /// Cursor to send on the next poll.
    pub latest_id: u64,
}

#[derive(Debug)]
pub struct BoundedHistory {
    inner: Mutex<HistoryState>,
}

#[derive(Debug)]
struct HistoryState {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    last_id: u64,
}

impl BoundedHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(HistoryState {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                last_id: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Store a payload at the tail, evicting from the head when full.
    pub fn append(
        &self,
        payload: Value,
        request_id: impl Into<String>,
        source: DeliverySource,
    ) -> HistoryEntry {
        let mut state = self.inner.lock();
        state.last_id += 1;
        let entry = HistoryEntry {
            id: state.last_id,
            payload,
            timestamp: Utc::now(),
            request_id: request_id.into(),
            source,
        };

        state.entries.push_back(entry.clone());
        while state.entries.len() > state.capacity {
            state.entries.pop_front();
        }

        entry
    }

    /// Full buffer, oldest first.
    pub fn all(&self) -> Vec<HistoryEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        self.inner.lock().entries.back().cloned()
    }

    /// Entries appended after `cursor`.
    ///
    /// A cursor ahead of the counter means the buffer was cleared since the
    /// client last polled; it then receives the whole (new) buffer.
    pub fn since(&self, cursor: u64) -> HistorySlice {
        let state = self.inner.lock();
        let cursor = if cursor > state.last_id { 0 } else { cursor };
        let start = state.entries.partition_point(|entry| entry.id <= cursor);

        HistorySlice {
            entries: state.entries.range(start..).cloned().collect(),
            latest_id: state.last_id,
        }
    }

    /// Empty the buffer and restart numbering. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let previous = state.entries.len();
        state.entries.clear();
        state.last_id = 0;
        previous
    }
}

impl Default for BoundedHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fill(history: &BoundedHistory, count: usize) {
        for i in 0..count {
            history.append(json!({ "n": i }), format!("req_{}", i), DeliverySource::Single);
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let history = BoundedHistory::new(100);
        fill(&history, 105);

        let all = history.all();
        assert_eq!(all.len(), 100);
        // the 6th appended entry (n = 5) is now the oldest
        assert_eq!(all[0].payload, json!({ "n": 5 }));
        assert_eq!(all[99].payload, json!({ "n": 104 }));
        assert_eq!(all[0].id, 6);
    }

    #[test]
    fn bound_holds_for_any_overflow() {
        for extra in [1_usize, 3, 10, 57] {
            let history = BoundedHistory::new(10);
            fill(&history, 10 + extra);

            let all = history.all();
            assert_eq!(all.len(), 10);
            let ns: Vec<_> = all.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
            let expected: Vec<_> = (extra as u64..extra as u64 + 10).collect();
            assert_eq!(ns, expected);
        }
    }

    #[test]
    fn since_returns_only_newer_entries() {
        let history = BoundedHistory::new(10);
        fill(&history, 3);

        let first = history.since(0);
        assert_eq!(first.entries.len(), 3);
        assert_eq!(first.latest_id, 3);

        fill(&history, 2);
        let second = history.since(first.latest_id);
        assert_eq!(second.entries.len(), 2);
        assert_eq!(second.entries[0].id, 4);
        assert_eq!(second.latest_id, 5);

        let nothing = history.since(second.latest_id);
        assert!(nothing.entries.is_empty());
        assert_eq!(nothing.latest_id, 5);
    }

    #[test]
    fn since_skips_evicted_entries() {
        let history = BoundedHistory::new(3);
        fill(&history, 8);

        let slice = history.since(2);
        let ids: Vec<_> = slice.entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![6, 7, 8]);
    }

    #[test]
    fn clear_resets_counter() {
        let history = BoundedHistory::new(10);
        fill(&history, 4);

        assert_eq!(history.clear(), 4);
        assert!(history.is_empty());
        assert!(history.latest().is_none());

        let entry = history.append(json!(1), "req_x", DeliverySource::Batch);
        assert_eq!(entry.id, 1);
    }

    #[test]
    fn stale_cursor_after_clear_gets_everything() {
        let history = BoundedHistory::new(10);
        fill(&history, 6);
        history.clear();
        fill(&history, 2);

        let slice = history.since(6);
        assert_eq!(slice.entries.len(), 2);
        assert_eq!(slice.latest_id, 2);
    }
}
