//! Engine event fan-out.
//!
//! [`EventBus`] carries [`EngineEvent`]s from the schedulers and the
//! lifecycle manager to however many subscribers care to listen. Publishing
//! never blocks: without subscribers an event is dropped, and a slow
//! subscriber lags rather than exerting backpressure on a running workflow.
//! [`EventBus::subscribe_workflow`] narrows a subscription to a single
//! run's events.

use orchid_types::event::EngineEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Broadcast channel for engine events.
///
/// Clones share the underlying channel: every clone publishes into the same
/// stream, and a subscriber sees every event published after it subscribed.
/// Capacity comes from `event_capacity` in the engine configuration.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber. A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every engine event from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single workflow run.
    ///
    /// Engine-scoped events (heartbeats, announcements, shutdown notices)
    /// carry no workflow id and are not delivered through this
    /// subscription.
    pub fn subscribe_workflow(&self, workflow_id: Uuid) -> WorkflowEvents {
        WorkflowEvents {
            workflow_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event to all current subscribers. With no subscribers
    /// the event is dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers, counting workflow-scoped ones.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Subscription limited to one workflow's events.
pub struct WorkflowEvents {
    workflow_id: Uuid,
    receiver: broadcast::Receiver<EngineEvent>,
}

impl WorkflowEvents {
    /// Wait for the next event belonging to the workflow.
    ///
    /// Events dropped because this subscriber lagged are skipped. Returns
    /// `None` once the bus has closed and the backlog is drained.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.workflow_id() == Some(self.workflow_id) => {
                    return Some(event);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain the next already-buffered event for the workflow, if any.
    pub fn try_next(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.workflow_id() == Some(self.workflow_id) => {
                    return Some(event);
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn started(workflow_id: Uuid) -> EngineEvent {
        EngineEvent::WorkflowStarted {
            workflow_id,
            workflow_name: "nightly-sync".to_string(),
            mode: "parallel".to_string(),
            step_count: 3,
        }
    }

    fn step_done(workflow_id: Uuid, step_id: &str) -> EngineEvent {
        EngineEvent::StepCompleted {
            workflow_id,
            step_id: step_id.to_string(),
            step_name: step_id.to_string(),
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(started(Uuid::now_v7()));

        assert!(matches!(first.recv().await, Ok(EngineEvent::WorkflowStarted { .. })));
        assert!(matches!(second.recv().await, Ok(EngineEvent::WorkflowStarted { .. })));
    }

    #[tokio::test]
    async fn workflow_subscription_filters_unrelated_events() {
        let bus = EventBus::new(8);
        let ours = Uuid::now_v7();
        let theirs = Uuid::now_v7();
        let mut events = bus.subscribe_workflow(ours);

        bus.publish(started(theirs));
        bus.publish(started(ours));
        bus.publish(EngineEvent::Heartbeat {
            active_workflows: 1,
            tracked_workflows: 2,
            total_thunks: 3,
        });
        bus.publish(step_done(ours, "extract"));
        bus.publish(step_done(theirs, "extract"));

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first,
            EngineEvent::WorkflowStarted { workflow_id, .. } if workflow_id == ours
        ));
        let second = events.recv().await.unwrap();
        assert!(matches!(
            second,
            EngineEvent::StepCompleted { workflow_id, .. } if workflow_id == ours
        ));

        // Closing the bus ends the subscription once the backlog is drained.
        drop(bus);
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn slow_subscriber_resumes_at_oldest_retained_event() {
        let bus = EventBus::new(2);
        let workflow_id = Uuid::now_v7();
        let mut events = bus.subscribe_workflow(workflow_id);

        for i in 0..5 {
            bus.publish(step_done(workflow_id, &format!("s{i}")));
        }

        let mut seen = Vec::new();
        while let Some(event) = events.try_next() {
            if let EngineEvent::StepCompleted { step_id, .. } = event {
                seen.push(step_id);
            }
        }
        assert_eq!(seen, vec!["s3", "s4"]);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(started(Uuid::now_v7()));
        bus.publish(EngineEvent::ShutdownRequested {
            reason: "drain".to_string(),
        });
    }

    #[test]
    fn clone_publishes_into_the_same_channel() {
        let bus = EventBus::new(8);
        let clone = bus.clone();
        let mut events = bus.subscribe();

        clone.publish(started(Uuid::now_v7()));

        assert!(matches!(events.try_recv(), Ok(EngineEvent::WorkflowStarted { .. })));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut events = bus.subscribe();

        bus.publish(started(Uuid::now_v7()));

        assert!(events.try_recv().is_ok());
    }
}
