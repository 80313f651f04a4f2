//! Temporal Network Engine
//!
//! Time points, interval constraints and consistency checking for the plan's
//! timing. The concrete engine is [`TemporalNetwork`]; [`TemporalEngine`] is
//! the capability the planner links task nodes through.

pub mod network;

pub use network::{Constraint, NetworkCheckpoint, Schedule, TemporalNetwork, DEFAULT_FW_THRESHOLD};

use crate::time::Seconds;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque time point handle (index into the network's point arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimePointId(pub usize);

impl TimePointId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TimePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The distinguished zero reference point
pub const ZERO: TimePointId = TimePointId(0);

/// Tag grouping the constraints contributed by one task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub usize);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner:{}", self.0)
    }
}

/// Feasible window of a time point relative to [`ZERO`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub earliest: Seconds,
    pub latest: Seconds,
}

impl Bounds {
    pub fn contains(&self, t: Seconds) -> bool {
        self.earliest <= t && t <= self.latest
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.earliest, self.latest)
    }
}

/// Temporal network errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemporalError {
    #[error("constraint {from} -> {to} in [{lower}, {upper}] creates a negative cycle")]
    Inconsistent {
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    },

    #[error("unknown time point: {0}")]
    UnknownTimePoint(TimePointId),

    #[error("network is frozen; reopen it before adding constraints")]
    Frozen,

    #[error("invalid bounds [{lower}, {upper}]")]
    InvalidBounds { lower: Seconds, upper: Seconds },

    #[error("network has no consistent assignment")]
    Unsolvable,
}

/// Capability interface for temporal reasoning
pub trait TemporalEngine {
    fn add_time_point(&mut self) -> TimePointId;

    fn add_constraint(
        &mut self,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    ) -> Result<(), TemporalError>;

    fn add_owned_constraint(
        &mut self,
        owner: OwnerId,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    ) -> Result<(), TemporalError>;

    fn is_consistent(&self) -> bool;

    fn bounds_of(&self, tp: TimePointId) -> Result<Bounds, TemporalError>;

    fn remove_constraints(&mut self, owner: OwnerId) -> usize;
}
