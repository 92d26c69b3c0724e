// Ingestion pipeline shared by every transport
//
// Chunks go through the accumulator; whatever comes out (complete batches,
// timed-out partials, swept or drained leftovers) is appended to history and
// broadcast to live consumers under one delivery lock. Registering a consumer
// takes the same lock, so a new consumer sees each entry exactly once: either
// as the courtesy replay or as a live frame.

use std::sync::{Arc, Weak};

use adrelay_batch::{
    AccumulatorConfig, AssembledBatch, BatchAccumulator, BatchStatus, Progress, SubmitOutcome,
    TimeoutTicket,
};
use adrelay_config::RuntimeConfig;
use adrelay_core::{
    BoundedHistory, ConsumerId, DeliveryFanout, DeliveryFrame, DeliverySource, HistoryEntry,
    HistorySlice, Subscription,
};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::chunk::{generate_request_id, ChunkHeaders};
use crate::error::IngestError;
use crate::scheduler::TimeoutScheduler;

/// Acknowledgement returned for every accepted chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkAck {
    /// Unbatched payload stored and broadcast.
    Single {
        request_id: String,
        item_id: String,
        total_items: usize,
    },
    /// Chunk stored; the batch is still waiting for others.
    Partial {
        request_id: String,
        item_id: String,
        batch_id: String,
        progress: Progress,
    },
    /// This chunk completed its batch.
    Complete {
        request_id: String,
        item_id: String,
        batch_id: String,
        total_items: usize,
    },
}

impl ChunkAck {
    pub fn message(&self) -> String {
        match self {
            Self::Single { .. } => "Data received and broadcast".to_string(),
            Self::Partial { progress, .. } => format!(
                "partial, {}/{} received",
                progress.received, progress.total
            ),
            Self::Complete {
                batch_id,
                total_items,
                ..
            } => format!(
                "complete, batch {} assembled with {} items",
                batch_id, total_items
            ),
        }
    }

    /// JSON body sent back to the caller.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Single {
                request_id,
                item_id,
                total_items,
            } => json!({
                "success": true,
                "message": self.message(),
                "requestId": request_id,
                "itemId": item_id,
                "totalItems": total_items,
            }),
            Self::Partial {
                request_id,
                item_id,
                batch_id,
                progress,
            } => json!({
                "success": true,
                "message": self.message(),
                "requestId": request_id,
                "itemId": item_id,
                "batchId": batch_id,
                "progress": {
                    "received": progress.received,
                    "total": progress.total,
                },
                "missing": progress.missing,
            }),
            Self::Complete {
                request_id,
                item_id,
                batch_id,
                total_items,
            } => json!({
                "success": true,
                "message": self.message(),
                "requestId": request_id,
                "itemId": item_id,
                "batchId": batch_id,
                "totalItems": total_items,
            }),
        }
    }
}

/// Result of storing and broadcasting one payload.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub entry: HistoryEntry,
    /// History length right after the append, read under the delivery lock.
    pub history_len: usize,
}

/// A freshly registered push consumer.
#[derive(Debug)]
pub struct Subscriber {
    pub subscription: Subscription,
    /// Encoded most recent entry, sent before any live frame.
    pub replay: Option<Arc<str>>,
}

#[derive(Debug)]
pub struct IngestProcessor {
    accumulator: BatchAccumulator,
    history: BoundedHistory,
    fanout: DeliveryFanout,
    scheduler: TimeoutScheduler,
    delivery: Mutex<()>,
    max_payload_bytes: usize,
    // Handed to timer tasks so they don't keep the processor alive.
    this: Weak<IngestProcessor>,
}

impl IngestProcessor {
    pub fn new(
        accumulator: AccumulatorConfig,
        history_capacity: usize,
        max_payload_bytes: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            accumulator: BatchAccumulator::new(accumulator),
            history: BoundedHistory::new(history_capacity),
            fanout: DeliveryFanout::new(),
            scheduler: TimeoutScheduler::new(),
            delivery: Mutex::new(()),
            max_payload_bytes,
            this: this.clone(),
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Arc<Self> {
        let accumulator = AccumulatorConfig {
            timeout: config.batch.timeout(),
            stale_after: config.batch.stale_after(),
            max_active_batches: config.batch.max_active_batches,
            max_total: config.batch.max_total,
        };
        Self::new(
            accumulator,
            config.history.capacity,
            config.request.max_payload_bytes,
        )
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Largest chunk count a batch may declare.
    pub fn max_batch_total(&self) -> usize {
        self.accumulator.config().max_total
    }

    pub fn history(&self) -> &BoundedHistory {
        &self.history
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }

    pub fn scheduler(&self) -> &TimeoutScheduler {
        &self.scheduler
    }

    /// Accept one chunk. Arms the batch timeout when the chunk opens a batch.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ingest(&self, headers: ChunkHeaders, payload: Value) -> Result<ChunkAck, IngestError> {
        counter!("adrelay.ingest.requests", 1);

        let chunk = headers.to_chunk(payload);
        let outcome = self.accumulator.submit(chunk).map_err(|e| {
            counter!("adrelay.ingest.rejected", 1);
            warn!(
                request_id = %headers.request_id,
                batch_id = %headers.batch_id,
                index = headers.index,
                error = %e,
                "Rejected chunk"
            );
            IngestError::from(e)
        })?;

        let ChunkHeaders {
            request_id,
            batch_id,
            item_id,
            ..
        } = headers;

        match outcome {
            SubmitOutcome::Partial { progress, timer } => {
                if let Some(ticket) = timer {
                    self.arm_timeout(ticket);
                }
                debug!(
                    request_id = %request_id,
                    batch_id = %batch_id,
                    received = progress.received,
                    total = progress.total,
                    "Stored chunk"
                );
                Ok(ChunkAck::Partial {
                    request_id,
                    item_id,
                    batch_id,
                    progress,
                })
            }
            SubmitOutcome::Complete(assembled) if assembled.unbatched => {
                let delivered = self.deliver(assembled, &request_id)?;
                Ok(ChunkAck::Single {
                    request_id,
                    item_id,
                    total_items: delivered.history_len,
                })
            }
            SubmitOutcome::Complete(assembled) => {
                self.scheduler.cancel(&batch_id);
                let total_items = assembled.item_count();
                self.deliver(assembled, &request_id)?;
                Ok(ChunkAck::Complete {
                    request_id,
                    item_id,
                    batch_id,
                    total_items,
                })
            }
        }
    }

    fn arm_timeout(&self, ticket: TimeoutTicket) {
        let this = self.this.clone();
        self.scheduler.arm(ticket, move |ticket| {
            if let Some(processor) = this.upgrade() {
                processor.expire(&ticket);
            }
        });
    }

    /// Store an assembled payload and push it to every live consumer.
    pub fn deliver(
        &self,
        assembled: AssembledBatch,
        request_id: &str,
    ) -> Result<Delivered, IngestError> {
        let source = if assembled.unbatched {
            DeliverySource::Single
        } else if assembled.complete {
            DeliverySource::Batch
        } else {
            DeliverySource::BatchPartial
        };

        match source {
            DeliverySource::Single => {}
            DeliverySource::Batch => {
                counter!("adrelay.batch.completed", 1);
            }
            DeliverySource::BatchPartial => {
                counter!("adrelay.batch.flushed", 1);
            }
        }

        let _delivery = self.delivery.lock();
        let entry = self
            .history
            .append(assembled.into_payload(), request_id, source);
        let history_len = self.history.len();
        let report = self
            .fanout
            .broadcast(&DeliveryFrame::from(&entry))
            .map_err(|e| IngestError::Internal {
                message: e.to_string(),
            })?;

        debug!(
            request_id = %request_id,
            entry_id = entry.id,
            source = %source,
            delivered = report.delivered,
            dropped = report.dropped,
            "Delivered payload"
        );

        Ok(Delivered { entry, history_len })
    }

    /// Timer callback: flush the batch the ticket was issued for, if it is still open.
    pub fn expire(&self, ticket: &TimeoutTicket) -> Option<HistoryEntry> {
        let assembled = self.accumulator.expire(ticket)?;
        info!(
            batch_id = %assembled.batch_id,
            received = assembled.received,
            total = assembled.total,
            "Batch timed out"
        );
        self.deliver_flushed(assembled)
    }

    /// Flush batches whose timers were lost or that have gone idle.
    pub fn sweep_stale(&self) -> usize {
        let swept = self.accumulator.sweep_stale();
        let count = swept.len();
        for assembled in swept {
            self.scheduler.cancel(&assembled.batch_id);
            self.deliver_flushed(assembled);
        }
        if count > 0 {
            info!(batch_count = count, "Swept stale batches");
        }
        count
    }

    /// Deliver everything still buffered (shutdown).
    pub fn drain_all(&self) -> usize {
        self.scheduler.cancel_all();
        let drained = self.accumulator.drain_all();
        let count = drained.len();
        for assembled in drained {
            self.deliver_flushed(assembled);
        }
        count
    }

    fn deliver_flushed(&self, assembled: AssembledBatch) -> Option<HistoryEntry> {
        let batch_id = assembled.batch_id.clone();
        match self.deliver(assembled, &generate_request_id()) {
            Ok(delivered) => Some(delivered.entry),
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Failed to deliver flushed batch");
                None
            }
        }
    }

    /// Register a push consumer along with the latest entry as a replay frame.
    pub fn subscribe(&self) -> Subscriber {
        let _delivery = self.delivery.lock();
        let replay = self.history.latest().and_then(|entry| {
            match serde_json::to_string(&DeliveryFrame::from(&entry)) {
                Ok(text) => Some(Arc::from(text)),
                Err(e) => {
                    warn!(error = %e, "Failed to encode replay frame");
                    None
                }
            }
        });
        let subscription = self.fanout.register();

        Subscriber {
            subscription,
            replay,
        }
    }

    pub fn unsubscribe(&self, id: ConsumerId) -> bool {
        self.fanout.unregister(id)
    }

    pub fn client_count(&self) -> usize {
        self.fanout.len()
    }

    pub fn history_since(&self, cursor: u64) -> HistorySlice {
        self.history.since(cursor)
    }

    pub fn clear_history(&self) -> usize {
        let _delivery = self.delivery.lock();
        self.history.clear()
    }

    pub fn active_batches(&self) -> Vec<BatchStatus> {
        self.accumulator.active_batches()
    }
}
