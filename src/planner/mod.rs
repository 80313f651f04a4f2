//! HTN Planner
//!
//! Turns goals into a time-annotated task tree:
//! - Depth-first method search in priority order
//! - Goal verification against the hypothetical state
//! - Blacklisting of exhausted (task, state) pairs
//! - Local repair of one subtree during execution

pub mod blacklist;
pub mod htn;
pub mod plan;

pub use blacklist::Blacklist;
pub use htn::{HtnPlanner, PlannerStats};
pub use plan::{GroundAction, NodeId, NodeKind, NodeStatus, Plan, TaskNode};

use crate::domain::Goal;
use crate::state::State;
use crate::temporal::DEFAULT_FW_THRESHOLD;

/// Decomposition found no way to reach a goal
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("no solution for {goal}: {reason}")]
pub struct NoSolution {
    pub goal: String,
    pub reason: String,
}

impl NoSolution {
    pub fn new(goal: impl ToString, reason: impl Into<String>) -> Self {
        Self {
            goal: goal.to_string(),
            reason: reason.into(),
        }
    }
}

/// Planning engine configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Maximum decomposition depth
    pub max_depth: usize,
    /// Time-point count up to which the network recomputes fully
    pub fw_threshold: usize,
    /// Order top-level goals one after another
    pub sequential_goals: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            fw_threshold: DEFAULT_FW_THRESHOLD,
            sequential_goals: true,
        }
    }
}

/// Capability the coordinator plans through
pub trait Planner {
    /// Build a plan for `goals` starting from `state`
    fn decompose(&mut self, state: &State, goals: &[Goal]) -> Result<Plan, NoSolution>;

    /// Re-decompose the goal or task at `node` from `state`, in place.
    ///
    /// The caller has already retired the node's unfinished descendants.
    /// Completed descendants stay and new work is ordered after them. The
    /// plan's network is reopened; freezing again is up to the caller.
    fn repair(&mut self, plan: &mut Plan, node: NodeId, state: &State) -> Result<(), NoSolution>;
}
