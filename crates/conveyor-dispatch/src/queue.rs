//! Dispatch queue state and admission.
//!
//! The processing loop lives in [`crate::processor`], fan-out/fan-in in
//! [`crate::fan`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use conveyor_config::DispatchConfig;
use conveyor_protocols::{
    Clock, CoreEvent, EventPublisher, NoopPublisher, ProtocolError, QueueEvent, StepRecorder,
    SystemClock, WorkItem, WorkSink,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backpressure::{Admission, admission};
use crate::breaker::{CircuitBreakers, CircuitState};
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore, MemoryDeadLetterStore};
use crate::error::DispatchError;
use crate::handler::WorkHandler;
use crate::heap::ItemHeap;
use crate::rate_limit::RateLimiter;

/// Handle returned by [`DispatchQueue::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    /// Mean over the rolling processing-time window.
    pub average_processing_ms: Option<f64>,
    /// `queued / max_queue_size`.
    pub utilization: f64,
    /// Destinations whose circuit is open or half-open.
    pub open_circuits: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) in_flight: AtomicUsize,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.retried.store(0, Ordering::SeqCst);
        self.dead_lettered.store(0, Ordering::SeqCst);
        self.dropped.store(0, Ordering::SeqCst);
    }
}

type Subscriptions = HashMap<String, Vec<(SubscriptionId, Arc<dyn WorkHandler>)>>;

/// Priority dispatch queue.
///
/// Owns every pending [`WorkItem`] until it is handed to the destination's
/// handlers. All state is scoped to the instance; [`DispatchQueue::reset`]
/// clears it.
pub struct DispatchQueue {
    pub(crate) config: DispatchConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) dead_letters: Arc<dyn DeadLetterStore>,
    pub(crate) recorder: Option<Arc<dyn StepRecorder>>,
    pub(crate) heap: Mutex<ItemHeap>,
    handlers: RwLock<Subscriptions>,
    pub(crate) breakers: Mutex<CircuitBreakers>,
    pub(crate) rate_limiter: Mutex<RateLimiter>,
    samples: Mutex<VecDeque<u64>>,
    pub(crate) counters: Counters,
    pub(crate) permits: Arc<Semaphore>,
    next_subscription: AtomicU64,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

impl DispatchQueue {
    /// Create a queue with the system clock, no event transport and an
    /// in-memory dead-letter store.
    pub fn new(config: DispatchConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            breakers: Mutex::new(CircuitBreakers::new(config.circuit_breaker.clone())),
            rate_limiter: Mutex::new(RateLimiter::new(config.rate_limit_per_sec)),
            samples: Mutex::new(VecDeque::with_capacity(config.processing_sample_size)),
            permits: Arc::new(Semaphore::new(permits)),
            config,
            clock: Arc::new(SystemClock),
            publisher: Arc::new(NoopPublisher),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
            recorder: None,
            heap: Mutex::new(ItemHeap::new()),
            handlers: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            next_subscription: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Use a durable dead-letter store.
    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = store;
        self
    }

    /// Record dead-letter and drop steps on an observability sink.
    pub fn with_recorder(mut self, recorder: Arc<dyn StepRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Submit an item.
    ///
    /// Rejects synchronously when saturated or shed; otherwise may delay
    /// the caller proportionally to utilization before admitting.
    pub async fn submit(&self, mut item: WorkItem) -> Result<Uuid, DispatchError> {
        self.ensure_accepting()?;
        self.admit(1).await?;

        item.enqueued_at = self.clock.now();
        let (id, destination, priority) = (item.id, item.destination.clone(), item.priority);
        {
            let mut heap = self.heap.lock();
            let max = self.config.max_queue_size;
            if heap.len() >= max {
                return Err(DispatchError::QueueSaturated {
                    size: heap.len(),
                    max,
                });
            }
            heap.push(item);
        }

        debug!("Queued item {} for '{}' (priority {})", id, destination, priority);
        self.publish(QueueEvent::Queued {
            item_id: id,
            destination,
            priority,
        });
        Ok(id)
    }

    /// Capacity and back-pressure check for `incoming` new items.
    pub(crate) async fn admit(&self, incoming: usize) -> Result<(), DispatchError> {
        let max = self.config.max_queue_size;
        let size = self.len();
        if size + incoming > max {
            return Err(DispatchError::QueueSaturated { size, max });
        }

        let utilization = size as f64 / max as f64;
        match admission(utilization, &self.config.back_pressure) {
            Admission::Admit => Ok(()),
            Admission::Shed => {
                warn!("Shedding submission at {:.0}% utilization", utilization * 100.0);
                self.publish(QueueEvent::LoadShed { utilization });
                Err(DispatchError::Shed { utilization })
            }
            Admission::Delay(delay) => {
                let delay_ms = delay.as_millis() as u64;
                debug!(
                    "Back-pressure: delaying submission {}ms at {:.0}% utilization",
                    delay_ms,
                    utilization * 100.0
                );
                self.publish(QueueEvent::BackPressureApplied {
                    utilization,
                    delay_ms,
                });
                self.clock.sleep(delay).await;
                Ok(())
            }
        }
    }

    pub(crate) fn ensure_accepting(&self) -> Result<(), DispatchError> {
        if self.is_shutting_down() {
            Err(DispatchError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Register a handler for a destination. Handlers of one destination
    /// run concurrently for every item.
    pub fn subscribe(&self, destination: &str, handler: Arc<dyn WorkHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .write()
            .entry(destination.to_string())
            .or_default()
            .push((id, handler));
        debug!("Subscribed {} to '{}'", id, destination);
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub, _)| *sub != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        if removed {
            debug!("Unsubscribed {}", id);
        }
        removed
    }

    /// Number of handlers subscribed to a destination.
    pub fn handler_count(&self, destination: &str) -> usize {
        self.handlers.read().get(destination).map_or(0, Vec::len)
    }

    pub(crate) fn handlers_for(&self, destination: &str) -> Vec<Arc<dyn WorkHandler>> {
        self.handlers
            .read()
            .get(destination)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued items in dispatch order.
    pub fn pending(&self) -> Vec<WorkItem> {
        self.heap.lock().sorted()
    }

    /// Items currently held by handlers.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Current queue statistics.
    pub fn stats(&self) -> QueueStats {
        let queued = self.len();
        let samples = self.samples.lock();
        let average_processing_ms = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
        };
        drop(samples);

        QueueStats {
            queued,
            in_flight: self.in_flight(),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
            dead_lettered: self.counters.dead_lettered.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            average_processing_ms,
            utilization: if self.config.max_queue_size == 0 {
                1.0
            } else {
                queued as f64 / self.config.max_queue_size as f64
            },
            open_circuits: self.breakers.lock().open_destinations(),
        }
    }

    pub(crate) fn record_sample(&self, duration_ms: u64) {
        let cap = self.config.processing_sample_size.max(1);
        let mut samples = self.samples.lock();
        while samples.len() >= cap {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    /// Circuit state for a destination.
    pub fn circuit_state(&self, destination: &str) -> CircuitState {
        self.breakers.lock().state(destination)
    }

    /// Close a destination's circuit and forget its failure history.
    pub fn reset_circuit(&self, destination: &str) {
        self.breakers.lock().reset(destination);
        info!("Circuit for '{}' reset", destination);
    }

    /// Clear queued items, breakers, samples and counters.
    ///
    /// In-flight items are unaffected and still report their outcome.
    pub fn reset(&self) {
        let dropped = {
            let mut heap = self.heap.lock();
            let len = heap.len();
            heap.clear();
            len
        };
        self.breakers.lock().clear();
        self.rate_limiter.lock().reset();
        self.samples.lock().clear();
        self.counters.reset();
        info!("Dispatch queue reset ({} queued items discarded)", dropped);
    }

    /// Dead-lettered entries, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, DispatchError> {
        self.dead_letters.list().await
    }

    /// Re-submit a dead-lettered item with its retry count reset to zero.
    ///
    /// The entry is restored to the store if the queue rejects it.
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<Uuid, DispatchError> {
        let entry = self
            .dead_letters
            .remove(&id)
            .await?
            .ok_or(DispatchError::DeadLetterNotFound(id))?;

        let mut item = entry.item.clone();
        item.retry_count = 0;
        match self.submit(item).await {
            Ok(item_id) => {
                info!("Replayed dead-letter entry {}", id);
                Ok(item_id)
            }
            Err(e) => {
                if let Err(restore) = self.dead_letters.save(&entry).await {
                    error!("Failed to restore dead-letter entry {}: {}", id, restore);
                }
                Err(e)
            }
        }
    }

    /// Remove every dead-letter entry.
    pub async fn purge_dead_letters(&self) -> Result<usize, DispatchError> {
        let purged = self.dead_letters.purge().await?;
        info!("Purged {} dead-letter entries", purged);
        Ok(purged)
    }

    pub(crate) fn publish(&self, event: QueueEvent) {
        self.publisher.publish(CoreEvent::QueueStateChanged(event));
    }
}

#[async_trait]
impl WorkSink for DispatchQueue {
    async fn submit(&self, item: WorkItem) -> Result<Uuid, ProtocolError> {
        DispatchQueue::submit(self, item)
            .await
            .map_err(|e| ProtocolError::Rejected(e.to_string()))
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
