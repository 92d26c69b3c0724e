// adrelay-batch - Reassembly of chunked payloads
//
// Callers deliver one logical payload as `total` numbered chunks that may arrive
// in any order, more than once, or not at all. The accumulator collects them per
// batch id and hands back the ordered payload exactly once: when every index has
// arrived, or when the batch is force-flushed after its timeout.
//
// The accumulator is synchronous and runtime-agnostic. Timers live with the
// caller: a new batch yields a `TimeoutTicket`, and when it fires the caller
// passes it back to `expire`. Tickets carry the batch generation, so a timer
// that outlives its batch is a no-op even if the id has been reused since.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

mod pending;

use pending::PendingBatch;

/// Batch id meaning "not batched": the chunk is the whole payload.
pub const SINGLE_BATCH_ID: &str = "single";

/// Most absent indices listed in a `Progress` or `AssembledBatch`.
pub const MISSING_REPORT_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// Wait for missing chunks before force-flushing.
    pub timeout: Duration,
    /// Sweep threshold for batches whose timer was lost.
    pub stale_after: Duration,
    /// New batches beyond this many in flight are rejected.
    pub max_active_batches: usize,
    /// Largest chunk count a batch may declare.
    pub max_total: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
            max_active_batches: 1_000,
            max_total: 10_000,
        }
    }
}

/// One delivery unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub batch_id: String,
    pub index: usize,
    pub total: usize,
    pub payload: Value,
}

impl Chunk {
    pub fn single(payload: Value) -> Self {
        Self {
            batch_id: SINGLE_BATCH_ID.to_string(),
            index: 0,
            total: 1,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("batch total must be at least 1")]
    ZeroTotal,
    #[error("batch total {total} exceeds the limit of {limit} chunks")]
    TotalTooLarge { total: usize, limit: usize },
    #[error("batch index {index} is out of range for total {total}")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("batch '{batch_id}' was opened with total {expected} but this chunk declares {declared}")]
    TotalMismatch {
        batch_id: String,
        expected: usize,
        declared: usize,
    },
    #[error("too many batches in flight (limit {limit})")]
    TooManyBatches { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub received: usize,
    pub total: usize,
    /// Absent indices, ascending, at most `MISSING_REPORT_LIMIT` of them.
    pub missing: Vec<usize>,
}

/// Handle for the timeout armed when a batch is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutTicket {
    pub batch_id: String,
    pub generation: u64,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Stored; the batch is still waiting. `timer` is set when this chunk opened the batch.
    Partial {
        progress: Progress,
        timer: Option<TimeoutTicket>,
    },
    Complete(AssembledBatch),
}

/// A logical payload ready for storage and broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledBatch {
    pub batch_id: String,
    pub items: Vec<Value>,
    pub total: usize,
    pub received: usize,
    pub missing: Vec<usize>,
    /// False for force-flushed batches with missing chunks.
    pub complete: bool,
    /// True for the sentinel batch id; the payload is kept as sent.
    pub unbatched: bool,
}

impl AssembledBatch {
    fn unbatched(payload: Value) -> Self {
        Self {
            batch_id: SINGLE_BATCH_ID.to_string(),
            items: vec![payload],
            total: 1,
            received: 1,
            missing: Vec::new(),
            complete: true,
            unbatched: true,
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// The value to store/broadcast: the raw payload when unbatched, otherwise
    /// the assembled items as an array.
    pub fn into_payload(mut self) -> Value {
        if self.unbatched {
            self.items.pop().unwrap_or(Value::Null)
        } else {
            Value::Array(self.items)
        }
    }
}

/// In-flight batch summary for operational endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub id: String,
    pub total: usize,
    pub received: usize,
    /// Percentage of chunks received.
    pub progress: u32,
    /// Milliseconds since the first chunk arrived.
    #[serde(rename = "age")]
    pub age_ms: u64,
}

/// Thread-safe batch table shared across handlers.
#[derive(Debug)]
pub struct BatchAccumulator {
    config: AccumulatorConfig,
    inner: Mutex<AccumulatorState>,
}

#[derive(Debug)]
struct AccumulatorState {
    batches: HashMap<String, PendingBatch>,
    next_generation: u64,
}

impl BatchAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AccumulatorState {
                batches: HashMap::new(),
                next_generation: 1,
            }),
        }
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().batches.is_empty()
    }

    pub fn contains(&self, batch_id: &str) -> bool {
        self.inner.lock().batches.contains_key(batch_id)
    }

    pub fn submit(&self, chunk: Chunk) -> Result<SubmitOutcome, ChunkError> {
        self.submit_at(chunk, Instant::now())
    }

    pub fn submit_at(&self, chunk: Chunk, now: Instant) -> Result<SubmitOutcome, ChunkError> {
        let Chunk {
            batch_id,
            index,
            total,
            payload,
        } = chunk;

        if batch_id == SINGLE_BATCH_ID {
            return Ok(SubmitOutcome::Complete(AssembledBatch::unbatched(payload)));
        }

        if total == 0 {
            return Err(ChunkError::ZeroTotal);
        }
        if total > self.config.max_total {
            return Err(ChunkError::TotalTooLarge {
                total,
                limit: self.config.max_total,
            });
        }
        if index >= total {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }

        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let at_capacity = state.batches.len() >= self.config.max_active_batches;

        let mut timer = None;
        let batch = match state.batches.entry(batch_id.clone()) {
            Entry::Occupied(occupied) => {
                let existing = occupied.into_mut();
                if existing.total() != total {
                    return Err(ChunkError::TotalMismatch {
                        batch_id,
                        expected: existing.total(),
                        declared: total,
                    });
                }
                existing
            }
            Entry::Vacant(vacant) => {
                if at_capacity {
                    return Err(ChunkError::TooManyBatches {
                        limit: self.config.max_active_batches,
                    });
                }

                let generation = state.next_generation;
                state.next_generation += 1;
                let created = PendingBatch::new(total, generation, now, self.config.timeout);
                timer = Some(TimeoutTicket {
                    batch_id: batch_id.clone(),
                    generation,
                    deadline: created.deadline(),
                });
                debug!(batch_id = %batch_id, total, generation, "Opened batch");
                vacant.insert(created)
            }
        };

        if batch.record(index, payload, now) {
            warn!(
                batch_id = %batch_id,
                index,
                "Duplicate chunk index; keeping the latest payload"
            );
        }

        let progress = batch.progress();
        if !batch.is_complete() {
            return Ok(SubmitOutcome::Partial { progress, timer });
        }

        // A single-chunk batch completes on creation; its ticket is simply never armed.
        match state.batches.remove(&batch_id) {
            Some(batch) => {
                debug!(batch_id = %batch_id, total, "Batch complete");
                Ok(SubmitOutcome::Complete(batch.finalize(batch_id)))
            }
            None => Ok(SubmitOutcome::Partial { progress, timer }),
        }
    }

    /// Assemble whatever arrived and drop the batch. `None` when it is already gone.
    pub fn force_flush(&self, batch_id: &str) -> Option<AssembledBatch> {
        let batch = self.inner.lock().batches.remove(batch_id)?;
        Some(flushed(batch_id.to_string(), batch))
    }

    /// Timer entry point; only flushes the batch instance the ticket was issued for.
    pub fn expire(&self, ticket: &TimeoutTicket) -> Option<AssembledBatch> {
        let mut guard = self.inner.lock();
        let current = guard.batches.get(&ticket.batch_id)?;
        if current.generation() != ticket.generation {
            debug!(
                batch_id = %ticket.batch_id,
                ticket_generation = ticket.generation,
                current_generation = current.generation(),
                "Ignoring timeout for a batch that was already replaced"
            );
            return None;
        }
        let batch = guard.batches.remove(&ticket.batch_id)?;
        drop(guard);

        Some(flushed(ticket.batch_id.clone(), batch))
    }

    pub fn sweep_stale(&self) -> Vec<AssembledBatch> {
        self.sweep_stale_at(Instant::now())
    }

    /// Flush batches that have been idle past the staleness threshold or whose
    /// deadline passed without their timer firing.
    pub fn sweep_stale_at(&self, now: Instant) -> Vec<AssembledBatch> {
        let mut guard = self.inner.lock();
        let ids: Vec<String> = guard
            .batches
            .iter()
            .filter(|(_, batch)| {
                batch.is_stale(now, self.config.stale_after) || batch.is_expired(now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut flushed_batches = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(batch) = guard.batches.remove(&id) {
                flushed_batches.push(flushed(id, batch));
            }
        }

        flushed_batches
    }

    /// Flush everything (shutdown).
    pub fn drain_all(&self) -> Vec<AssembledBatch> {
        let drained: Vec<_> = self.inner.lock().batches.drain().collect();

        drained
            .into_iter()
            .map(|(id, batch)| flushed(id, batch))
            .collect()
    }

    pub fn active_batches(&self) -> Vec<BatchStatus> {
        self.active_batches_at(Instant::now())
    }

    pub fn active_batches_at(&self, now: Instant) -> Vec<BatchStatus> {
        let guard = self.inner.lock();
        let mut statuses: Vec<_> = guard
            .batches
            .iter()
            .map(|(id, batch)| batch.status(id, now))
            .collect();
        statuses.sort_by(|a, b| b.age_ms.cmp(&a.age_ms).then_with(|| a.id.cmp(&b.id)));
        statuses
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(AccumulatorConfig::default())
    }
}

fn flushed(batch_id: String, batch: PendingBatch) -> AssembledBatch {
    let assembled = batch.finalize(batch_id);
    if !assembled.complete {
        warn!(
            batch_id = %assembled.batch_id,
            received = assembled.received,
            total = assembled.total,
            missing = ?assembled.missing,
            "Force-flushing incomplete batch"
        );
    }
    assembled
}

#[cfg(test)]
mod tests {
    use super::pending::assemble;
    use super::*;
    use serde_json::json;

    fn chunk(batch_id: &str, index: usize, total: usize, payload: Value) -> Chunk {
        Chunk {
            batch_id: batch_id.to_string(),
            index,
            total,
            payload,
        }
    }

    fn expect_partial(outcome: SubmitOutcome) -> (Progress, Option<TimeoutTicket>) {
        match outcome {
            SubmitOutcome::Partial { progress, timer } => (progress, timer),
            SubmitOutcome::Complete(batch) => panic!("unexpected completion: {:?}", batch),
        }
    }

    fn expect_complete(outcome: SubmitOutcome) -> AssembledBatch {
        match outcome {
            SubmitOutcome::Complete(batch) => batch,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn out_of_order_chunks_assemble_by_index() {
        let acc = BatchAccumulator::default();

        let (progress, timer) =
            expect_partial(acc.submit(chunk("b1", 2, 3, json!({"i": 2}))).unwrap());
        assert_eq!(progress.missing, vec![0, 1]);
        assert!(timer.is_some());

        let (progress, timer) =
            expect_partial(acc.submit(chunk("b1", 0, 3, json!({"i": 0}))).unwrap());
        assert_eq!(progress.received, 2);
        assert_eq!(progress.missing, vec![1]);
        assert!(timer.is_none(), "only the opening chunk arms a timer");

        let batch = expect_complete(acc.submit(chunk("b1", 1, 3, json!({"i": 1}))).unwrap());
        assert!(batch.complete);
        assert_eq!(
            batch.items,
            vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})]
        );
        assert!(!acc.contains("b1"));
    }

    #[test]
    fn every_arrival_order_yields_the_same_payload() {
        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [3, 0, 1, 2],
            [1, 0, 2, 3],
        ];
        let payload = |i: usize| {
            if i % 2 == 0 {
                json!([{"i": i, "part": 0}, {"i": i, "part": 1}])
            } else {
                json!({"i": i})
            }
        };

        let expected = assemble((0..4).map(payload));
        for order in orders {
            let acc = BatchAccumulator::default();
            let mut result = None;
            for index in order {
                if let SubmitOutcome::Complete(batch) =
                    acc.submit(chunk("perm", index, 4, payload(index))).unwrap()
                {
                    result = Some(batch);
                }
            }
            assert_eq!(result.expect("batch completes").items, expected);
        }
    }

    #[test]
    fn fewer_distinct_indices_never_complete() {
        let acc = BatchAccumulator::default();
        for _ in 0..3 {
            for index in [0, 2] {
                let outcome = acc.submit(chunk("gap", index, 3, json!(index))).unwrap();
                assert!(matches!(outcome, SubmitOutcome::Partial { .. }));
            }
        }
        assert!(acc.contains("gap"));
        assert_eq!(acc.active_batches()[0].received, 2);
    }

    #[test]
    fn unbatched_chunk_completes_without_state() {
        let acc = BatchAccumulator::default();
        let batch = expect_complete(acc.submit(Chunk::single(json!([1, 2]))).unwrap());

        assert!(batch.unbatched);
        assert_eq!(batch.item_count(), 1);
        // kept as sent, not flattened
        assert_eq!(batch.into_payload(), json!([1, 2]));
        assert!(acc.is_empty());
    }

    #[test]
    fn sentinel_ignores_declared_index_and_total() {
        let acc = BatchAccumulator::default();
        let outcome = acc
            .submit(chunk(SINGLE_BATCH_ID, 4, 2, json!({"x": 1})))
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Complete(_)));
    }

    #[test]
    fn single_chunk_batch_completes_immediately() {
        let acc = BatchAccumulator::default();
        let batch = expect_complete(acc.submit(chunk("one", 0, 1, json!([1, 2]))).unwrap());
        assert!(!batch.unbatched);
        assert_eq!(batch.into_payload(), json!([1, 2]));
        assert!(acc.is_empty());
    }

    #[test]
    fn malformed_chunks_do_not_touch_state() {
        let acc = BatchAccumulator::default();

        assert_eq!(
            acc.submit(chunk("m", 0, 0, json!(1))).unwrap_err(),
            ChunkError::ZeroTotal
        );
        assert_eq!(
            acc.submit(chunk("m", 3, 3, json!(1))).unwrap_err(),
            ChunkError::IndexOutOfRange { index: 3, total: 3 }
        );
        assert!(acc.is_empty());

        acc.submit(chunk("m", 0, 3, json!(1))).unwrap();
        let err = acc.submit(chunk("m", 1, 4, json!(2))).unwrap_err();
        assert!(matches!(err, ChunkError::TotalMismatch { expected: 3, declared: 4, .. }));
        assert_eq!(acc.active_batches()[0].received, 1);
    }

    #[test]
    fn oversized_total_is_rejected_before_allocation() {
        let acc = BatchAccumulator::new(AccumulatorConfig {
            max_total: 100,
            ..AccumulatorConfig::default()
        });

        let err = acc
            .submit(chunk("big", 0, 200_000_000, json!(0)))
            .unwrap_err();
        assert_eq!(
            err,
            ChunkError::TotalTooLarge {
                total: 200_000_000,
                limit: 100
            }
        );
        assert!(acc.submit(chunk("huge", 0, usize::MAX, json!(0))).is_err());
        assert!(acc.is_empty());

        let (progress, _) = expect_partial(acc.submit(chunk("edge", 99, 100, json!(0))).unwrap());
        assert_eq!(progress.missing.len(), 99);
    }

    #[test]
    fn batch_limit_applies_to_new_batches_only() {
        let acc = BatchAccumulator::new(AccumulatorConfig {
            max_active_batches: 1,
            ..AccumulatorConfig::default()
        });
        acc.submit(chunk("a", 0, 2, json!(0))).unwrap();

        let err = acc.submit(chunk("b", 0, 2, json!(0))).unwrap_err();
        assert_eq!(err, ChunkError::TooManyBatches { limit: 1 });

        // the open batch can still finish
        let outcome = acc.submit(chunk("a", 1, 2, json!(1))).unwrap();
        assert!(matches!(outcome, SubmitOutcome::Complete(_)));
    }

    #[test]
    fn expire_flushes_partial_batch_once() {
        let acc = BatchAccumulator::default();
        let (_, timer) = expect_partial(acc.submit(chunk("b2", 0, 2, json!({"i": 0}))).unwrap());
        let ticket = timer.unwrap();

        let flushed = acc.expire(&ticket).expect("batch flushed");
        assert!(!flushed.complete);
        assert_eq!(flushed.items, vec![json!({"i": 0})]);
        assert_eq!(flushed.missing, vec![1]);
        assert!(acc.active_batches().is_empty());

        assert!(acc.expire(&ticket).is_none());
        assert!(acc.force_flush("b2").is_none());
    }

    #[test]
    fn expire_after_completion_is_a_no_op() {
        let acc = BatchAccumulator::default();
        let (_, timer) = expect_partial(acc.submit(chunk("race", 0, 2, json!(0))).unwrap());
        expect_complete(acc.submit(chunk("race", 1, 2, json!(1))).unwrap());

        assert!(acc.expire(&timer.unwrap()).is_none());
    }

    #[test]
    fn stale_ticket_does_not_flush_reopened_batch() {
        let acc = BatchAccumulator::default();
        let (_, old) = expect_partial(acc.submit(chunk("reuse", 0, 2, json!(0))).unwrap());
        expect_complete(acc.submit(chunk("reuse", 1, 2, json!(1))).unwrap());

        let (_, new) = expect_partial(acc.submit(chunk("reuse", 0, 2, json!(0))).unwrap());
        assert!(acc.expire(&old.unwrap()).is_none());
        assert!(acc.contains("reuse"));
        assert!(acc.expire(&new.unwrap()).is_some());
    }

    #[test]
    fn sweep_flushes_idle_and_overdue_batches() {
        let acc = BatchAccumulator::new(AccumulatorConfig {
            timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
            max_active_batches: 10,
            max_total: 100,
        });
        let start = Instant::now();
        acc.submit_at(chunk("idle", 0, 2, json!(0)), start).unwrap();
        acc.submit_at(chunk("fresh", 0, 2, json!(0)), start + Duration::from_secs(100))
            .unwrap();

        // neither is idle yet, but "idle" is past its deadline
        let swept = acc.sweep_stale_at(start + Duration::from_secs(31));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].batch_id, "idle");

        let swept = acc.sweep_stale_at(start + Duration::from_secs(131));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].batch_id, "fresh");
        assert!(acc.is_empty());
    }

    #[test]
    fn drain_all_empties_table() {
        let acc = BatchAccumulator::default();
        acc.submit(chunk("x", 0, 2, json!("x0"))).unwrap();
        acc.submit(chunk("y", 1, 3, json!(["y1a", "y1b"]))).unwrap();

        let mut drained = acc.drain_all();
        drained.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].items, vec![json!("y1a"), json!("y1b")]);
        assert!(acc.is_empty());
    }

    #[test]
    fn active_batches_oldest_first() {
        let acc = BatchAccumulator::default();
        let start = Instant::now();
        acc.submit_at(chunk("old", 0, 4, json!(0)), start).unwrap();
        acc.submit_at(chunk("new", 0, 2, json!(0)), start + Duration::from_secs(5))
            .unwrap();

        let statuses = acc.active_batches_at(start + Duration::from_secs(10));
        assert_eq!(statuses[0].id, "old");
        assert_eq!(statuses[0].age_ms, 10_000);
        assert_eq!(statuses[0].progress, 25);
        assert_eq!(statuses[1].id, "new");
        assert_eq!(statuses[1].progress, 50);
    }
}
