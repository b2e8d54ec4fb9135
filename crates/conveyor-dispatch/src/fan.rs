//! Fan-out and fan-in across destinations.

use std::collections::HashMap;
use std::time::Duration;

use conveyor_protocols::{QueueEvent, WorkItem};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::handler::handler_fn;
use crate::queue::DispatchQueue;

/// Items created by one [`DispatchQueue::fan_out`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutReceipt {
    /// Correlation ID shared by every item.
    pub correlation_id: String,
    /// Item IDs in destination order.
    pub item_ids: Vec<Uuid>,
}

impl DispatchQueue {
    /// Submit one payload to every destination as a unit: either all items
    /// are queued or none are.
    pub async fn fan_out<S: AsRef<str>>(
        &self,
        destinations: &[S],
        payload: serde_json::Value,
    ) -> Result<FanOutReceipt, DispatchError> {
        let correlation_id = Uuid::new_v4().to_string();
        if destinations.is_empty() {
            return Ok(FanOutReceipt {
                correlation_id,
                item_ids: Vec::new(),
            });
        }

        self.ensure_accepting()?;
        self.admit(destinations.len()).await?;

        let now = self.clock.now();
        let items: Vec<WorkItem> = destinations
            .iter()
            .map(|dest| {
                let mut item = WorkItem::new(dest.as_ref(), payload.clone())
                    .with_correlation_id(correlation_id.clone());
                item.enqueued_at = now;
                item
            })
            .collect();

        {
            let mut heap = self.heap.lock();
            let max = self.config.max_queue_size;
            if heap.len() + items.len() > max {
                return Err(DispatchError::QueueSaturated {
                    size: heap.len(),
                    max,
                });
            }
            for item in &items {
                heap.push(item.clone());
            }
        }

        for item in &items {
            self.publish(QueueEvent::Queued {
                item_id: item.id,
                destination: item.destination.clone(),
                priority: item.priority,
            });
        }
        debug!(
            "Fanned out {} items (correlation {})",
            items.len(),
            correlation_id
        );

        Ok(FanOutReceipt {
            correlation_id,
            item_ids: items.iter().map(|item| item.id).collect(),
        })
    }

    /// Wait for one item per destination, keyed by destination.
    ///
    /// The temporary listeners are removed whether this resolves or times
    /// out. The first payload per destination wins.
    pub async fn fan_in<S: AsRef<str>>(
        &self,
        destinations: &[S],
        timeout: Duration,
    ) -> Result<HashMap<String, serde_json::Value>, DispatchError> {
        let mut unique: Vec<String> = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let dest = dest.as_ref();
            if !unique.iter().any(|d| d == dest) {
                unique.push(dest.to_string());
            }
        }
        let expected = unique.len();

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, serde_json::Value)>();
        let subscriptions: Vec<_> = unique
            .iter()
            .map(|dest| {
                let tx = tx.clone();
                let name = dest.clone();
                let listener = handler_fn(move |item: WorkItem| {
                    let tx = tx.clone();
                    let name = name.clone();
                    async move {
                        // Receiver gone means fan-in already resolved.
                        let _ = tx.send((name, item.payload));
                        Ok(())
                    }
                });
                self.subscribe(dest, listener)
            })
            .collect();
        drop(tx);

        let mut received: HashMap<String, serde_json::Value> = HashMap::new();
        let deadline = self.clock.sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            if received.len() == expected {
                break Ok(());
            }
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some((dest, payload)) => {
                        received.entry(dest).or_insert(payload);
                    }
                    None => break Err(()),
                },
                _ = &mut deadline => break Err(()),
            }
        };

        for id in subscriptions {
            self.unsubscribe(id);
        }

        match outcome {
            Ok(()) => Ok(received),
            Err(()) => {
                warn!(
                    "Fan-in timed out with {} of {} messages",
                    received.len(),
                    expected
                );
                Err(DispatchError::FanInTimeout {
                    received: received.len(),
                    expected,
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "fan_tests.rs"]
mod tests;
