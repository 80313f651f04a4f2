//! Planner error taxonomy
//!
//! Node-local failures (rejections, temporal conflicts while adding a node)
//! are absorbed by the coordinator. What reaches the caller is a root
//! planning failure or an intent that failed past its retry budget.

use crate::dispatch::DispatchError;
use crate::intent::IntentId;
use crate::planner::NoSolution;
use crate::state::StateConflict;
use crate::temporal::TemporalError;
use serde::Serialize;
use std::fmt;

/// Kind of failure, independent of its reason text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlanningFailure,
    TemporalInconsistency,
    IntentRejected,
    IntentFailed,
    DispatcherUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PlanningFailure => "PlanningFailure",
            ErrorKind::TemporalInconsistency => "TemporalInconsistency",
            ErrorKind::IntentRejected => "IntentRejected",
            ErrorKind::IntentFailed => "IntentFailed",
            ErrorKind::DispatcherUnavailable => "DispatcherUnavailable",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlannerError {
    #[error("planning failed: {0}")]
    PlanningFailure(#[from] NoSolution),

    #[error("temporal inconsistency: {0}")]
    TemporalInconsistency(#[from] TemporalError),

    #[error("intent {id} rejected: {reason}")]
    IntentRejected { id: IntentId, reason: String },

    #[error("intent {id} failed: {reason}")]
    IntentFailed { id: IntentId, reason: String },

    #[error("{0}")]
    DispatcherUnavailable(#[from] DispatchError),

    #[error("state store: {0}")]
    StateConflict(#[from] StateConflict),
}

impl PlannerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlannerError::PlanningFailure(_) => ErrorKind::PlanningFailure,
            PlannerError::TemporalInconsistency(_) => ErrorKind::TemporalInconsistency,
            PlannerError::IntentRejected { .. } => ErrorKind::IntentRejected,
            PlannerError::IntentFailed { .. } => ErrorKind::IntentFailed,
            PlannerError::DispatcherUnavailable(_) => ErrorKind::DispatcherUnavailable,
            // Only the single writer commits; a conflict means the plan is
            // out of step with the world.
            PlannerError::StateConflict(_) => ErrorKind::PlanningFailure,
        }
    }

    /// Human-readable reason without the kind prefix
    pub fn reason(&self) -> String {
        match self {
            PlannerError::PlanningFailure(e) => e.to_string(),
            PlannerError::TemporalInconsistency(e) => e.to_string(),
            PlannerError::IntentRejected { reason, .. } | PlannerError::IntentFailed { reason, .. } => reason.clone(),
            PlannerError::DispatcherUnavailable(e) => e.to_string(),
            PlannerError::StateConflict(e) => e.to_string(),
        }
    }
}
