//! Processing loop.
//!
//! Each tick pulls eligible items while a concurrency permit and rate
//! budget are available, then runs every handler of the item's destination
//! in parallel on a spawned task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_protocols::{QueueEvent, StepRecord, StepStatus, WorkItem, record_step};
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::breaker::{Permit, Transition};
use crate::dead_letter::DeadLetterEntry;
use crate::queue::DispatchQueue;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of [`DispatchQueue::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Every in-flight item finished within the wait.
    pub completed: bool,
    /// Items still held by handlers when the wait ended.
    pub stragglers: usize,
    /// Items left in the queue.
    pub queued: usize,
}

impl DispatchQueue {
    /// Run the processing loop until [`DispatchQueue::shutdown`] is called.
    pub async fn run(self: Arc<Self>) {
        let period = self.config.tick_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Dispatch loop started (tick {:?}, concurrency {})",
            period, self.config.max_concurrency
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Dispatch loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// Dispatch as many eligible items as the concurrency limit and rate
    /// limiter allow. Returns how many were dispatched.
    pub fn tick(self: &Arc<Self>) -> usize {
        if self.is_shutting_down() {
            return 0;
        }

        let mut dispatched = 0;
        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let now = self.clock.now();
            if !self.rate_limiter.lock().has_capacity(now) {
                break;
            }
            let Some((item, trial)) = self.next_eligible(now) else {
                break;
            };
            self.rate_limiter.lock().record(now);

            self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.dispatch(item, trial).await;
                drop(permit);
                queue.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Pop the best item whose destination is not blocked. Items popped for
    /// a blocked destination are parked until its breaker admits again.
    fn next_eligible(&self, now: DateTime<Utc>) -> Option<(WorkItem, bool)> {
        let mut heap = self.heap.lock();
        let mut breakers = self.breakers.lock();

        let ready: Vec<String> = heap
            .parked_destinations()
            .filter(|destination| breakers.admits(destination, now))
            .cloned()
            .collect();
        for destination in ready {
            heap.unpark(&destination);
        }

        while let Some(entry) = heap.pop_entry() {
            match breakers.try_acquire(&entry.item.destination, now) {
                Permit::Granted => return Some((entry.item, false)),
                Permit::Trial => {
                    debug!("Half-open trial for '{}'", entry.item.destination);
                    return Some((entry.item, true));
                }
                Permit::Blocked => heap.park(entry),
            }
        }
        None
    }

    async fn dispatch(&self, item: WorkItem, trial: bool) {
        let handlers = self.handlers_for(&item.destination);
        if handlers.is_empty() {
            self.drop_unhandled(item, trial).await;
            return;
        }

        debug!(
            "Dispatching item {} to {} handler(s) on '{}'",
            item.id,
            handlers.len(),
            item.destination
        );
        let started = self.clock.now();
        let outcomes = join_all(
            handlers
                .iter()
                .map(|handler| AssertUnwindSafe(handler.handle(&item)).catch_unwind()),
        )
        .await;

        let failure = outcomes.into_iter().find_map(|outcome| match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("handler panicked".to_string()),
        });

        match failure {
            None => {
                let elapsed = (self.clock.now() - started).num_milliseconds().max(0) as u64;
                self.on_success(item, elapsed, trial);
            }
            Some(error) => self.on_failure(item, error, trial).await,
        }
    }

    async fn drop_unhandled(&self, item: WorkItem, trial: bool) {
        if trial {
            self.breakers.lock().release_trial(&item.destination);
        }
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
        warn!(
            "No handlers for '{}'; dropping item {}",
            item.destination, item.id
        );
        self.publish(QueueEvent::Dropped {
            item_id: item.id,
            destination: item.destination.clone(),
        });

        let step = StepRecord::new("queue.item_dropped", "dispatch", StepStatus::Skipped)
            .with_owner(item.owner.clone())
            .with_inputs(serde_json::json!({
                "item_id": item.id,
                "destination": item.destination,
            }));
        record_step(self.recorder.as_ref(), step).await;
    }

    fn on_success(&self, item: WorkItem, duration_ms: u64, trial: bool) {
        self.record_sample(duration_ms);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);

        let transition = self.breakers.lock().record_success(&item.destination, trial);
        if transition == Transition::Closed {
            info!("Circuit for '{}' closed", item.destination);
            self.publish(QueueEvent::CircuitClosed {
                destination: item.destination.clone(),
            });
        }

        debug!("Item {} completed in {}ms", item.id, duration_ms);
        self.publish(QueueEvent::Completed {
            item_id: item.id,
            destination: item.destination,
            duration_ms,
        });
    }

    async fn on_failure(&self, mut item: WorkItem, error: String, trial: bool) {
        let now = self.clock.now();
        item.retry_count = item.retry_count.saturating_add(1);
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        warn!(
            "Item {} failed on '{}' (attempt {}): {}",
            item.id, item.destination, item.retry_count, error
        );

        let transition = self
            .breakers
            .lock()
            .record_failure(&item.destination, now, trial);
        if transition == Transition::Opened {
            warn!("Circuit for '{}' opened", item.destination);
            self.publish(QueueEvent::CircuitOpened {
                destination: item.destination.clone(),
            });
        }

        let exhausted = item.retry_count >= self.config.dead_letter_after_retries;
        let requeued = !exhausted && {
            let mut heap = self.heap.lock();
            if heap.len() < self.config.max_queue_size {
                heap.push(item.clone());
                true
            } else {
                false
            }
        };

        if requeued {
            self.counters.retried.fetch_add(1, Ordering::SeqCst);
            self.publish(QueueEvent::Retried {
                item_id: item.id,
                destination: item.destination,
                retry_count: item.retry_count,
            });
        } else {
            self.dead_letter(item, error, now).await;
        }
    }

    async fn dead_letter(&self, item: WorkItem, error: String, now: DateTime<Utc>) {
        let entry = DeadLetterEntry::new(item, error, now);
        if let Err(e) = self.dead_letters.save(&entry).await {
            let mut heap = self.heap.lock();
            if heap.len() < self.config.max_queue_size {
                error!(
                    "Failed to dead-letter item {}: {}; keeping it queued",
                    entry.id(),
                    e
                );
                heap.push(entry.item);
            } else {
                error!(
                    "Failed to dead-letter item {} and queue is full; item lost: {}",
                    entry.id(),
                    e
                );
            }
            return;
        }

        self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
        warn!(
            "Item {} dead-lettered after {} attempts",
            entry.id(),
            entry.item.retry_count
        );
        self.publish(QueueEvent::DeadLettered {
            item_id: entry.item.id,
            destination: entry.item.destination.clone(),
            retry_count: entry.item.retry_count,
            error: entry.last_error.clone(),
        });

        let step = StepRecord::new("queue.item_dead_lettered", "dispatch", StepStatus::Failed)
            .with_owner(entry.item.owner.clone())
            .with_inputs(serde_json::json!({
                "item_id": entry.item.id,
                "destination": entry.item.destination,
                "retry_count": entry.item.retry_count,
            }))
            .with_outputs(serde_json::json!({ "error": entry.last_error }));
        record_step(self.recorder.as_ref(), step).await;
    }

    /// Wait up to `timeout` for in-flight items to finish. Returns how many
    /// are still running.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                return in_flight;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stop admitting work and ticks, then wait for in-flight items up to
    /// the configured shutdown timeout. Stragglers are reported, not killed.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        info!("Dispatch queue shutting down");

        let stragglers = self.drain(self.config.shutdown_timeout()).await;
        let report = ShutdownReport {
            completed: stragglers == 0,
            stragglers,
            queued: self.len(),
        };

        if stragglers > 0 {
            warn!(
                "Shutdown wait elapsed with {} item(s) still in flight",
                stragglers
            );
        } else {
            info!("Dispatch queue stopped ({} item(s) left queued)", report.queued);
        }
        report
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
