//! Plan Telemetry
//!
//! Structured, observational events emitted by the coordinator. Every
//! event is logged and broadcast; subscribers cannot influence planning.

use crate::planner::NodeId;
use crate::time::Seconds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

const DEFAULT_CAPACITY: usize = 256;

/// Coordinator lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanStarted {
        plan_id: String,
        goals: usize,
        primitives: usize,
    },
    NodeScheduled {
        node: NodeId,
        label: String,
        start: Seconds,
        end: Seconds,
    },
    NodeCompleted {
        node: NodeId,
    },
    NodeRejected {
        node: NodeId,
        reason: String,
    },
    ReplanTriggered {
        node: NodeId,
        reason: String,
    },
    PlanCompleted {
        plan_id: String,
        makespan: Seconds,
    },
    PlanFailed {
        plan_id: String,
        reason: String,
    },
}

/// An event with its emission time
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PlanEvent,
}

/// Fan-out of plan events to any number of subscribers
#[derive(Clone)]
pub struct Telemetry {
    tx: broadcast::Sender<EventRecord>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PlanEvent) {
        match &event {
            PlanEvent::PlanStarted { plan_id, goals, primitives } => {
                info!("Plan {} started: {} goals, {} actions", plan_id, goals, primitives)
            }
            PlanEvent::NodeScheduled { node, label, start, end } => {
                info!("Scheduled {} {} at [{}, {}]", node, label, start, end)
            }
            PlanEvent::NodeCompleted { node } => info!("Completed {}", node),
            PlanEvent::NodeRejected { node, reason } => info!("Rejected {}: {}", node, reason),
            PlanEvent::ReplanTriggered { node, reason } => info!("Replanning {}: {}", node, reason),
            PlanEvent::PlanCompleted { plan_id, makespan } => {
                info!("Plan {} completed, makespan {}", plan_id, makespan)
            }
            PlanEvent::PlanFailed { plan_id, reason } => info!("Plan {} failed: {}", plan_id, reason),
        }

        // No subscribers is fine
        let _ = self.tx.send(EventRecord { at: Utc::now(), event });
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let telemetry = Telemetry::new();
        let mut rx = telemetry.subscribe();

        telemetry.emit(PlanEvent::NodeCompleted { node: NodeId(3) });
        let record = rx.recv().await.unwrap();
        assert_eq!(record.event, PlanEvent::NodeCompleted { node: NodeId(3) });
    }

    #[test]
    fn test_event_json_shape() {
        let record = EventRecord {
            at: Utc::now(),
            event: PlanEvent::NodeRejected {
                node: NodeId(2),
                reason: "target_gone".to_string(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "node_rejected");
        assert_eq!(json["reason"], "target_gone");
        assert_eq!(json["node"], 2);
    }

    #[test]
    fn test_emit_without_subscribers() {
        Telemetry::new().emit(PlanEvent::PlanFailed {
            plan_id: "p".to_string(),
            reason: "no solution".to_string(),
        });
    }
}
