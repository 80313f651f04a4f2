//! Hybrid Planner
//!
//! Temporal hierarchical task network planning with replanning on failure.
//!
//! # Features
//!
//! - **Temporal Network**: incremental all-pairs shortest paths with
//!   checkpoint/rollback and negative-cycle rejection
//! - **State Store**: immutable versioned snapshots, compare-and-swap commit
//! - **HTN Planner**: prioritized methods, goal verification, blacklisting
//! - **Coordinator**: dispatch in temporal order, local subtree repair
//! - **Intent Protocol**: idempotent, cancellable units of execution
//!
//! # Architecture
//!
//! ```text
//! Scenario ──► HtnPlanner ──► Plan (task tree + TemporalNetwork)
//!                  ▲                 │ freeze
//!                  │ repair          ▼
//!              Coordinator ──► Intent ──► Dispatcher ──► executor
//!                  │  ▲                                    │
//!                  │  └──────────── IntentOutcome ◀────────┘
//!                  ├── StateStore (commit effects)
//!                  └── Telemetry (plan events)
//! ```

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod intent;
pub mod planner;
pub mod state;
pub mod telemetry;
pub mod temporal;
pub mod time;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, Phase, RunReport, RunStats};
pub use dispatch::{DispatchError, Dispatcher, LocalDispatcher, RetryPolicy, RetryingDispatcher};
pub use domain::{Domain, Goal, Scenario, ScenarioLoader};
pub use error::{ErrorKind, PlannerError};
pub use intent::{Intent, IntentId, IntentLedger, IntentOutcome};
pub use planner::{HtnPlanner, NoSolution, NodeId, NodeStatus, Plan, Planner, PlannerConfig};
pub use state::{Fact, State, StateStore, Value};
pub use telemetry::{PlanEvent, Telemetry};
pub use temporal::{TemporalError, TemporalNetwork, TimePointId};
pub use time::Seconds;
