//! In-process domain event bus
//!
//! Fans domain events out to subscribers over a tokio broadcast channel.
//! Publication happens after the storage commit; a publish problem is the
//! subscriber's loss, never the committer's.

use async_trait::async_trait;
use tokio::sync::broadcast;

use devflow_core::{DomainEvent, EventPublisher, Result};

const BUS_CAPACITY: usize = 256;

/// Broadcast-backed event bus
#[derive(Clone)]
pub struct InProcessEventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InProcessEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        tracing::debug!(event_type = event.event_type(), "publishing domain event");
        // A send error only means nobody is listening right now
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Background task that mirrors every domain event into the log stream
pub fn spawn_event_logger(bus: &InProcessEventBus) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    tracing::info!(
                        event_type = event.event_type(),
                        payload = %event.to_json(),
                        "domain event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devflow_core::WorkflowId;

    #[tokio::test]
    async fn delivers_events_in_publish_order() {
        let bus = InProcessEventBus::new();
        let mut rx = bus.subscribe();
        let id = WorkflowId::new();

        bus.publish(DomainEvent::WorkflowStarted {
            workflow_id: id,
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();
        bus.publish(DomainEvent::WorkflowCompleted {
            workflow_id: id,
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type(), "workflow.started");
        assert_eq!(rx.recv().await.unwrap().event_type(), "workflow.completed");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = InProcessEventBus::new();
        bus.publish(DomainEvent::WorkflowCancelled {
            workflow_id: WorkflowId::new(),
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();
    }
}
