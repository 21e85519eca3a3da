//! Progress Signal Channel
//!
//! One broadcast topic per workflow execution. A topic exists only while
//! someone listens: it is created by the first subscriber and removed when
//! the last subscription drops or the execution reaches a settled status.
//! Publishing is fire-and-forget; an execution with no listeners publishes
//! into nothing.

use std::sync::Arc;

use dashmap::DashMap;
use kex_core::ProgressSignal;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Per-execution progress topics
#[derive(Clone)]
pub struct SignalHub {
    topics: Arc<DashMap<Uuid, broadcast::Sender<ProgressSignal>>>,
    capacity: usize,
}

impl SignalHub {
    /// `capacity` is the per-topic backlog before slow subscribers lag
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Listen to one execution's progress
    pub fn subscribe(&self, workflow_execution_id: Uuid) -> Subscription {
        let receiver = self
            .topics
            .entry(workflow_execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            workflow_execution_id,
            receiver,
            topics: Arc::clone(&self.topics),
        }
    }

    /// Deliver to current subscribers; returns how many received it
    pub fn publish(&self, signal: &ProgressSignal) -> usize {
        let id = signal.workflow_execution_id;
        let delivered = match self.topics.get(&id) {
            Some(sender) => sender.send(signal.clone()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.topics.remove_if(&id, |_, sender| sender.receiver_count() == 0);
        }
        delivered
    }

    /// Drop the topic; subscribers see the end of the stream
    pub fn close(&self, workflow_execution_id: Uuid) {
        if self.topics.remove(&workflow_execution_id).is_some() {
            debug!(execution = %workflow_execution_id, "Progress topic closed");
        }
    }

    /// Number of live topics
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Receiving end of one execution's topic
pub struct Subscription {
    workflow_execution_id: Uuid,
    receiver: broadcast::Receiver<ProgressSignal>,
    topics: Arc<DashMap<Uuid, broadcast::Sender<ProgressSignal>>>,
}

impl Subscription {
    pub fn workflow_execution_id(&self) -> Uuid {
        self.workflow_execution_id
    }

    /// Next signal, or `None` once the topic is closed
    ///
    /// Signals missed because this subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<ProgressSignal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(execution = %self.workflow_execution_id, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // This receiver still counts until the drop finishes
        self.topics
            .remove_if(&self.workflow_execution_id, |_, sender| sender.receiver_count() <= 1);
    }
}
