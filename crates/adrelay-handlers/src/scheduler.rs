// Batch timeout timers
//
// One tokio sleep task per open batch. The abort handle is kept per batch id
// so natural completion can cancel it. Cancellation and firing may still race;
// the accumulator's ticket check makes a late firing harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use adrelay_batch::TimeoutTicket;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Debug, Clone, Default)]
pub struct TimeoutScheduler {
    timers: Arc<Mutex<HashMap<String, ArmedTimer>>>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` once the ticket's deadline passes, unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&self, ticket: TimeoutTicket, on_fire: F)
    where
        F: FnOnce(TimeoutTicket) + Send + 'static,
    {
        let mut timers = self.timers.lock();

        if let Some(existing) = timers.get(&ticket.batch_id) {
            if existing.generation > ticket.generation {
                // The batch this ticket belongs to is already gone.
                return;
            }
            existing.handle.abort();
        }

        let delay = ticket.deadline.saturating_duration_since(Instant::now());
        let registry = Arc::clone(&self.timers);
        let batch_id = ticket.batch_id.clone();
        let generation = ticket.generation;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut timers = registry.lock();
                if timers
                    .get(&ticket.batch_id)
                    .is_some_and(|armed| armed.generation == ticket.generation)
                {
                    timers.remove(&ticket.batch_id);
                }
            }

            debug!(batch_id = %ticket.batch_id, "Batch timeout fired");
            on_fire(ticket);
        });

        debug!(batch_id = %batch_id, delay_ms = delay.as_millis() as u64, "Armed batch timeout");
        timers.insert(
            batch_id,
            ArmedTimer {
                generation,
                handle: task.abort_handle(),
            },
        );
    }

    /// Cancel the timer for a batch. Returns false when none was armed.
    pub fn cancel(&self, batch_id: &str) -> bool {
        match self.timers.lock().remove(batch_id) {
            Some(armed) => {
                armed.handle.abort();
                debug!(batch_id = %batch_id, "Cancelled batch timeout");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.timers.lock().drain().collect();
        for (_, armed) in &drained {
            armed.handle.abort();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }
}
