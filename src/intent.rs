//! Intent Execution Protocol
//!
//! An intent is the immutable unit handed to a dispatcher: one attempt at
//! one primitive node. The ledger decides, per returned outcome, whether
//! it is fresh (apply it), a duplicate delivery (answer without effects) or
//! a stale attempt (ignore).

use crate::planner::{NodeId, TaskNode};
use crate::state::{Fact, Value};
use crate::time::Seconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// (plan, node, attempt); unique across replans and across plans sharing
/// one dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntentId {
    pub plan: Uuid,
    pub node: NodeId,
    pub attempt: u32,
}

impl IntentId {
    pub fn new(plan: Uuid, node: NodeId, attempt: u32) -> Self {
        Self { plan, node, attempt }
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.attempt)
    }
}

/// Snapshot of a primitive action at issue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub action: String,
    pub args: Vec<Value>,
    pub agent: Option<String>,
    /// Facts that must still hold when the executor starts
    pub preconditions: Vec<Fact>,
    pub effects: Vec<Fact>,
    pub duration: Seconds,
    /// Earliest start in plan time
    pub not_before: Seconds,
    pub issued_at: DateTime<Utc>,
}

impl Intent {
    /// Build the intent for `node`'s given attempt; `None` for non-primitives
    pub fn for_node(plan: Uuid, node: &TaskNode, attempt: u32, not_before: Seconds) -> Option<Self> {
        let action = node.kind.action()?;
        Some(Self {
            id: IntentId::new(plan, node.id, attempt),
            action: action.name.clone(),
            args: action.args.clone(),
            agent: action.agent.clone(),
            preconditions: action.preconditions.clone(),
            effects: action.effects.clone(),
            duration: action.duration,
            not_before,
            issued_at: Utc::now(),
        })
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{} {}({})", self.id, self.action, args.join(", "))
    }
}

/// Result reported by an executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum IntentOutcome {
    Completed,
    /// Preconditions no longer hold; triggers local repair
    Rejected(String),
    /// Execution error; fatal once retries run out
    Failed(String),
    Cancelled,
}

impl IntentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IntentOutcome::Completed => "completed",
            IntentOutcome::Rejected(_) => "rejected",
            IntentOutcome::Failed(_) => "failed",
            IntentOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for IntentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentOutcome::Rejected(reason) | IntentOutcome::Failed(reason) => write!(f, "{}: {}", self.label(), reason),
            _ => write!(f, "{}", self.label()),
        }
    }
}

/// Per-node protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Issued,
    Completed,
    Rejected,
    Cancelled,
    Failed,
}

/// What to do with a reported outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// First report for the live attempt
    Apply(IntentOutcome),
    /// Repeat delivery; answer with this and change nothing
    Duplicate(IntentOutcome),
    /// Outcome for an attempt that was superseded or never issued
    Stale,
}

/// Tracks the latest attempt per node and its protocol state
#[derive(Debug, Default)]
pub struct IntentLedger {
    entries: HashMap<NodeId, (IntentId, IntentState)>,
}

impl IntentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new attempt; earlier attempts for the node become stale
    pub fn issue(&mut self, id: IntentId) {
        self.entries.insert(id.node, (id, IntentState::Issued));
    }

    pub fn state(&self, node: NodeId) -> Option<IntentState> {
        self.entries.get(&node).map(|(_, s)| *s)
    }

    /// The in-flight attempt for `node`, if any
    pub fn in_flight(&self, node: NodeId) -> Option<IntentId> {
        match self.entries.get(&node) {
            Some((id, IntentState::Issued)) => Some(*id),
            _ => None,
        }
    }

    /// Close the node's current attempt as cancelled.
    ///
    /// Returns the attempt if it was still in flight and so needs a cancel
    /// sent to the dispatcher.
    pub fn cancel(&mut self, node: NodeId) -> Option<IntentId> {
        let (id, state) = self.entries.get_mut(&node)?;
        let was_in_flight = *state == IntentState::Issued;
        if !matches!(*state, IntentState::Completed) {
            *state = IntentState::Cancelled;
        }
        was_in_flight.then_some(*id)
    }

    /// Close every in-flight attempt as cancelled, returning them
    pub fn cancel_all(&mut self) -> Vec<IntentId> {
        let mut open: Vec<IntentId> = self
            .entries
            .values_mut()
            .filter(|(_, state)| *state == IntentState::Issued)
            .map(|(id, state)| {
                *state = IntentState::Cancelled;
                *id
            })
            .collect();
        open.sort();
        open
    }

    /// Classify an outcome and, for fresh ones, move the node's state on
    pub fn resolve(&mut self, id: IntentId, outcome: IntentOutcome) -> Resolution {
        let Some((current, state)) = self.entries.get_mut(&id.node) else {
            return Resolution::Stale;
        };
        if *current != id {
            debug!("Ignoring {} for {}: {} is current", outcome, id, current);
            return Resolution::Stale;
        }

        match *state {
            IntentState::Completed => Resolution::Duplicate(IntentOutcome::Completed),
            IntentState::Cancelled => Resolution::Duplicate(IntentOutcome::Rejected(format!("intent {} was cancelled", id))),
            IntentState::Rejected => Resolution::Duplicate(IntentOutcome::Rejected(format!("intent {} was rejected", id))),
            IntentState::Failed => Resolution::Duplicate(IntentOutcome::Failed(format!("intent {} already failed", id))),
            IntentState::Issued => {
                *state = match &outcome {
                    IntentOutcome::Completed => IntentState::Completed,
                    IntentOutcome::Rejected(_) => IntentState::Rejected,
                    IntentOutcome::Failed(_) => IntentState::Failed,
                    IntentOutcome::Cancelled => IntentState::Cancelled,
                };
                Resolution::Apply(outcome)
            }
        }
    }
}
