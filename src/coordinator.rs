//! Hybrid Coordinator
//!
//! Drives one plan through its lifecycle:
//! - Planning: decompose goals and solve the temporal network
//! - Executing: issue intents whose temporal predecessors are done
//! - Replanning: repair the smallest failed subtree, escalating upward
//!
//! The coordinator is the only writer of the State Store and of node
//! status. Dispatch results come back through one event queue and are
//! applied in arrival order.

use crate::dispatch::{DispatchError, Dispatcher};
use crate::domain::Goal;
use crate::error::PlannerError;
use crate::intent::{Intent, IntentId, IntentLedger, IntentOutcome, Resolution};
use crate::planner::{NoSolution, NodeId, NodeStatus, Plan, Planner};
use crate::state::{Fact, State, StateStore};
use crate::telemetry::{PlanEvent, Telemetry};
use crate::time::Seconds;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============ Phases ============

/// Lifecycle of the coordinated plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Scheduled,
    Executing,
    Replanning,
    Completed,
    Failed,
}

// ============ Configuration ============

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Intents dispatched concurrently
    pub max_in_flight: usize,
    /// Repairs allowed per run before giving up
    pub max_replans: usize,
    /// Time to wait for a dispatcher outcome
    pub dispatch_timeout: Duration,
    /// Capacity of the outcome event queue
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_replans: 16,
            dispatch_timeout: Duration::from_secs(30),
            event_buffer: 64,
        }
    }
}

// ============ Events ============

#[derive(Debug)]
enum Event {
    Outcome {
        id: IntentId,
        result: Result<IntentOutcome, DispatchError>,
    },
    Interrupt {
        reason: String,
    },
}

/// Sends external requests into a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Event>,
}

impl CoordinatorHandle {
    /// Cancel in-flight work and re-plan every open goal from the current State
    pub async fn interrupt(&self, reason: &str) -> bool {
        self.tx
            .send(Event::Interrupt {
                reason: reason.to_string(),
            })
            .await
            .is_ok()
    }
}

// ============ Run Report ============

/// Counters for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub dispatched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub replans: u64,
    /// Outcomes that repeated an earlier one
    pub duplicates: u64,
}

impl RunStats {
    /// Format for display
    pub fn format(&self) -> String {
        format!(
            "{} dispatched, {} completed, {} rejected, {} failed ({} retried), {} cancelled, {} replans",
            self.dispatched, self.completed, self.rejected, self.failed, self.retried, self.cancelled, self.replans
        )
    }
}

/// Final result of [`Coordinator::run`]
#[derive(Debug, Clone)]
pub struct RunReport {
    pub plan: Plan,
    pub phase: Phase,
    pub state: State,
    pub stats: RunStats,
    pub makespan: Seconds,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "Plan {} {:?}: makespan {}, {}",
            self.plan.id,
            self.phase,
            self.makespan,
            self.stats.format()
        )
    }
}

// ============ Coordinator ============

/// Plan → schedule → execute → replan control loop
pub struct Coordinator<P, D> {
    planner: P,
    dispatcher: Arc<D>,
    store: Arc<StateStore>,
    config: CoordinatorConfig,
    telemetry: Telemetry,
    ledger: IntentLedger,
    phase: Phase,
    stats: RunStats,
    replans: usize,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

impl<P: Planner, D: Dispatcher + 'static> Coordinator<P, D> {
    pub fn new(planner: P, dispatcher: D, store: Arc<StateStore>) -> Self {
        Self::with_config(planner, dispatcher, store, CoordinatorConfig::default())
    }

    pub fn with_config(planner: P, dispatcher: D, store: Arc<StateStore>, config: CoordinatorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            planner,
            dispatcher: Arc::new(dispatcher),
            store,
            config,
            telemetry: Telemetry::new(),
            ledger: IntentLedger::new(),
            phase: Phase::Planning,
            stats: RunStats::default(),
            replans: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.events_tx.clone(),
        }
    }

    fn transition(&mut self, to: Phase) {
        if self.phase != to {
            debug!("Coordinator: {:?} -> {:?}", self.phase, to);
            self.phase = to;
        }
    }

    fn fail(&mut self, plan_id: Option<Uuid>, err: &PlannerError) {
        self.transition(Phase::Failed);
        self.telemetry.emit(PlanEvent::PlanFailed {
            plan_id: plan_id.map(|id| id.to_string()).unwrap_or_default(),
            reason: format!("{}: {}", err.kind(), err.reason()),
        });
    }

    /// Decompose `goals` from the current State and solve the schedule
    pub fn plan(&mut self, goals: &[Goal]) -> Result<Plan, PlannerError> {
        self.transition(Phase::Planning);
        self.ledger = IntentLedger::new();
        self.stats = RunStats::default();
        self.replans = 0;

        let state = self.store.snapshot();
        let mut plan = match self.planner.decompose(&state, goals) {
            Ok(plan) => plan,
            Err(e) => {
                let err = PlannerError::from(e);
                self.fail(None, &err);
                return Err(err);
            }
        };
        plan.freeze()?;

        self.telemetry.emit(PlanEvent::PlanStarted {
            plan_id: plan.id.to_string(),
            goals: goals.len(),
            primitives: plan.primitives().count(),
        });
        self.schedule_pending(&mut plan, None);
        self.transition(Phase::Scheduled);
        Ok(plan)
    }

    /// Mark pending primitives under `scope` (or anywhere) as scheduled
    fn schedule_pending(&mut self, plan: &mut Plan, scope: Option<NodeId>) {
        let candidates: Vec<NodeId> = match scope {
            Some(root) => plan.subtree(root),
            None => plan.nodes().iter().map(|n| n.id).collect(),
        };
        let mut pending: Vec<(Seconds, NodeId)> = candidates
            .into_iter()
            .filter(|id| matches!(plan.node(*id), Some(n) if n.kind.is_primitive() && n.status == NodeStatus::Pending))
            .map(|id| (plan.times_of(id).map(|(s, _)| s).unwrap_or_default(), id))
            .collect();
        pending.sort();

        for (_, id) in pending {
            plan.set_status(id, NodeStatus::Scheduled);
            let (start, end) = plan.times_of(id).unwrap_or_default();
            let label = plan.node(id).map(|n| n.kind.to_string()).unwrap_or_default();
            self.telemetry.emit(PlanEvent::NodeScheduled {
                node: id,
                label,
                start,
                end,
            });
        }
    }

    /// Issue intents for every scheduled primitive whose predecessors have
    /// completed, in earliest-start order (ties by node id).
    ///
    /// The emitted nodes are marked executing; at most `max_in_flight`
    /// nodes execute at once.
    pub fn execute(&mut self, plan: &mut Plan) -> impl Stream<Item = Intent> {
        self.transition(Phase::Executing);
        let busy = plan.primitives().filter(|n| n.status == NodeStatus::Executing).count();
        let limit = self.config.max_in_flight.max(1).saturating_sub(busy);
        tokio_stream::iter(self.issue_ready(plan, limit))
    }

    fn issue_ready(&mut self, plan: &mut Plan, limit: usize) -> Vec<Intent> {
        let view: &Plan = plan;
        let mut ready: Vec<(Seconds, NodeId)> = view
            .primitives()
            .filter(|n| n.status == NodeStatus::Scheduled && predecessors_done(view, n.id))
            .map(|n| (view.times_of(n.id).map(|(s, _)| s).unwrap_or_default(), n.id))
            .collect();
        ready.sort();

        let mut intents = Vec::new();
        for (start, id) in ready.into_iter().take(limit) {
            let Some(node) = plan.node_mut(id) else {
                continue;
            };
            node.attempts += 1;
            node.status = NodeStatus::Executing;

            let Some(intent) = plan
                .node(id)
                .and_then(|node| Intent::for_node(plan.id, node, node.attempts, start))
            else {
                continue;
            };
            self.ledger.issue(intent.id);
            self.stats.dispatched += 1;
            info!("Dispatching {}", intent);
            intents.push(intent);
        }
        intents
    }

    fn spawn_dispatch(&self, intent: Intent) {
        let dispatcher = self.dispatcher.clone();
        let tx = self.events_tx.clone();
        let timeout = self.config.dispatch_timeout;

        tokio::spawn(async move {
            let id = intent.id;
            let result = match tokio::time::timeout(timeout, dispatcher.submit(intent)).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = dispatcher.cancel(&id).await;
                    Err(DispatchError::Unavailable(format!("no outcome within {:?}", timeout)))
                }
            };
            let _ = tx.send(Event::Outcome { id, result }).await;
        });
    }

    /// Apply one executor outcome.
    ///
    /// Returns the outcome as the protocol answers it: a repeated
    /// `Completed` answers `Completed` without touching the State, an
    /// outcome for a cancelled or rejected node answers `Rejected`, and a
    /// superseded attempt answers `Cancelled`.
    pub async fn apply_outcome(
        &mut self,
        plan: &mut Plan,
        id: IntentId,
        outcome: IntentOutcome,
    ) -> Result<IntentOutcome, PlannerError> {
        let outcome = match self.ledger.resolve(id, outcome) {
            Resolution::Apply(outcome) => outcome,
            Resolution::Duplicate(answer) => {
                debug!("Intent {} already settled; answering {}", id, answer);
                self.stats.duplicates += 1;
                return Ok(answer);
            }
            Resolution::Stale => {
                debug!("Intent {} superseded", id);
                return Ok(IntentOutcome::Cancelled);
            }
        };
        info!("Intent {}: {}", id, outcome);

        match &outcome {
            IntentOutcome::Completed => {
                let effects = plan
                    .node(id.node)
                    .and_then(|n| n.kind.action())
                    .map(|a| a.effects.clone())
                    .unwrap_or_default();
                let base = self.store.snapshot();
                self.store.commit(base.version(), base.with_facts(effects))?;

                plan.set_status(id.node, NodeStatus::Completed);
                self.stats.completed += 1;
                self.telemetry.emit(PlanEvent::NodeCompleted { node: id.node });
                self.settle(plan, id.node).await?;
            }
            IntentOutcome::Rejected(reason) => {
                plan.set_status(id.node, NodeStatus::Rejected);
                self.stats.rejected += 1;
                self.telemetry.emit(PlanEvent::NodeRejected {
                    node: id.node,
                    reason: reason.clone(),
                });
                self.repair_and_settle(plan, id.node, reason).await?;
            }
            IntentOutcome::Failed(reason) => {
                self.stats.failed += 1;
                let (attempts, retries) = plan
                    .node(id.node)
                    .map(|n| (n.attempts, n.kind.action().map(|a| a.retries).unwrap_or(0)))
                    .unwrap_or((0, 0));
                if attempts <= retries {
                    warn!("Intent {} failed ({}); retry {}/{}", id, reason, attempts, retries);
                    self.stats.retried += 1;
                    plan.set_status(id.node, NodeStatus::Scheduled);
                } else {
                    plan.set_status(id.node, NodeStatus::Failed);
                    return Err(PlannerError::IntentFailed {
                        id,
                        reason: reason.clone(),
                    });
                }
            }
            IntentOutcome::Cancelled => {
                self.stats.cancelled += 1;
                plan.set_status(id.node, NodeStatus::Cancelled);
                self.repair_and_settle(plan, id.node, "cancelled by executor").await?;
            }
        }
        Ok(outcome)
    }

    async fn repair_and_settle(&mut self, plan: &mut Plan, node: NodeId, reason: &str) -> Result<(), PlannerError> {
        let repaired = self.replan(plan, node, reason).await?;
        if plan.status(repaired) == Some(NodeStatus::Completed) {
            self.settle(plan, repaired).await?;
        }
        Ok(())
    }

    /// Re-decompose the goal or task above `failed` and splice the result in.
    ///
    /// Completed work under it is kept and never re-issued. If the node
    /// cannot be repaired it is marked failed and its parent is tried, up
    /// to the root. Returns the node that was repaired.
    pub async fn replan(&mut self, plan: &mut Plan, failed: NodeId, reason: &str) -> Result<NodeId, PlannerError> {
        self.transition(Phase::Replanning);
        let mut reason = reason.to_string();
        let mut target = plan.repair_target(failed);
        let mut last = NoSolution::new(failed, reason.clone());

        while let Some(node) = target {
            if self.replans >= self.config.max_replans {
                return Err(NoSolution::new(
                    node,
                    format!("replan budget of {} exhausted ({})", self.config.max_replans, reason),
                )
                .into());
            }
            self.replans += 1;
            self.stats.replans += 1;
            self.telemetry.emit(PlanEvent::ReplanTriggered {
                node,
                reason: reason.clone(),
            });

            self.retire(plan, node).await;
            let state = self.projected_state(plan, node);
            match self.planner.repair(plan, node, &state) {
                Ok(()) => {
                    plan.freeze()?;
                    self.schedule_pending(plan, Some(node));
                    self.transition(Phase::Executing);
                    return Ok(node);
                }
                Err(e) => {
                    warn!("Repair of {} failed: {}", node, e);
                    plan.set_status(node, NodeStatus::Failed);
                    reason = format!("{} unreachable: {}", node, e.reason);
                    target = plan.node(node).and_then(|n| n.parent);
                    last = e;
                }
            }
        }

        Err(PlannerError::PlanningFailure(last))
    }

    /// Current State plus the pending effects of goals ordered before
    /// `node`'s root, so later goals are repaired against the world the
    /// earlier ones will leave behind
    fn projected_state(&self, plan: &Plan, node: NodeId) -> State {
        let mut root = node;
        while let Some(parent) = plan.node(root).and_then(|n| n.parent) {
            root = parent;
        }

        let pending: Vec<Fact> = plan
            .roots()
            .iter()
            .take_while(|r| **r != root)
            .flat_map(|r| plan.subtree(*r))
            .filter_map(|id| plan.node(id))
            .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Scheduled | NodeStatus::Executing))
            .filter_map(|n| n.kind.action())
            .flat_map(|a| a.effects.iter().cloned())
            .collect();
        self.store.snapshot().with_facts(pending)
    }

    /// Cancel and detach every unfinished node under `target`
    async fn retire(&mut self, plan: &mut Plan, target: NodeId) {
        let mut cancels = Vec::new();
        for id in plan.subtree(target) {
            let Some(status) = plan.status(id) else {
                continue;
            };
            if status == NodeStatus::Completed {
                continue;
            }
            if let Some(intent) = self.ledger.cancel(id) {
                cancels.push(intent);
            }
            if !status.is_retired() {
                plan.set_status(id, NodeStatus::Cancelled);
            }
            plan.network_mut().remove_constraints(id.owner());
        }

        self.cancel_intents(&cancels).await;
    }

    async fn cancel_intents(&mut self, ids: &[IntentId]) {
        if ids.is_empty() {
            return;
        }
        self.stats.cancelled += ids.len() as u64;
        let dispatcher: &D = &self.dispatcher;
        let acks = join_all(ids.iter().map(|id| dispatcher.cancel(id))).await;
        for (id, ack) in ids.iter().zip(acks) {
            if let Err(e) = ack {
                warn!("Cancel of {} not acknowledged: {}", id, e);
            }
        }
    }

    /// Complete ancestors of `from` whose live children are all done,
    /// verifying goals against the real State on the way up
    async fn settle(&mut self, plan: &mut Plan, from: NodeId) -> Result<(), PlannerError> {
        let mut cursor = plan.node(from).and_then(|n| n.parent);

        while let Some(id) = cursor {
            let Some(node) = plan.node(id) else {
                break;
            };
            let parent = node.parent;

            if node.status != NodeStatus::Completed {
                let mut live = node
                    .children
                    .iter()
                    .filter_map(|c| plan.status(*c))
                    .filter(|s| !s.is_retired())
                    .peekable();
                if live.peek().is_none() || !live.all(|s| s == NodeStatus::Completed) {
                    return Ok(());
                }

                if let Some(goal) = node.kind.goal().cloned() {
                    if !goal.is_satisfied(&self.store.snapshot()) {
                        let repaired = self.replan(plan, id, &format!("{} not achieved", goal)).await?;
                        if plan.status(repaired) != Some(NodeStatus::Completed) {
                            return Ok(());
                        }
                        cursor = plan.node(repaired).and_then(|n| n.parent);
                        continue;
                    }
                }
                plan.set_status(id, NodeStatus::Completed);
                self.telemetry.emit(PlanEvent::NodeCompleted { node: id });
            }
            cursor = parent;
        }
        Ok(())
    }

    async fn interrupt(&mut self, plan: &mut Plan, reason: &str) -> Result<(), PlannerError> {
        info!("Interrupted: {}", reason);
        let open: Vec<NodeId> = plan
            .roots()
            .iter()
            .copied()
            .filter(|r| plan.status(*r) != Some(NodeStatus::Completed))
            .collect();
        for root in open {
            self.repair_and_settle(plan, root, reason).await?;
        }
        Ok(())
    }

    /// Execute `plan` to completion, repairing as outcomes arrive.
    ///
    /// On failure every intent still in flight is cancelled before the
    /// error is returned.
    pub async fn run(&mut self, mut plan: Plan) -> Result<RunReport, PlannerError> {
        let result = self.drive(&mut plan).await;
        if let Err(e) = result {
            self.abandon(&mut plan).await;
            self.dispatcher.forget_plan(plan.id);
            self.fail(Some(plan.id), &e);
            return Err(e);
        }
        self.dispatcher.forget_plan(plan.id);

        self.transition(Phase::Completed);
        let makespan = plan.makespan();
        self.telemetry.emit(PlanEvent::PlanCompleted {
            plan_id: plan.id.to_string(),
            makespan,
        });
        Ok(RunReport {
            phase: self.phase,
            state: self.store.snapshot(),
            stats: self.stats.clone(),
            makespan,
            plan,
        })
    }

    async fn drive(&mut self, plan: &mut Plan) -> Result<(), PlannerError> {
        let mut in_flight = 0usize;

        loop {
            let ready: Vec<Intent> = self.execute(plan).collect().await;
            for intent in ready {
                self.spawn_dispatch(intent);
                in_flight += 1;
            }

            if plan.is_complete() {
                return Ok(());
            }
            if in_flight == 0 {
                return Err(NoSolution::new(plan.id, "no dispatchable actions remain").into());
            }

            let Some(event) = self.events_rx.recv().await else {
                return Err(DispatchError::Unavailable("event queue closed".to_string()).into());
            };
            match event {
                Event::Outcome { id, result } => {
                    if id.plan != plan.id {
                        debug!("Dropping outcome {} from plan {}", id, id.plan);
                        continue;
                    }
                    in_flight = in_flight.saturating_sub(1);
                    let outcome = result.unwrap_or_else(|e| {
                        warn!("Intent {}: {}", id, e);
                        IntentOutcome::Failed(e.to_string())
                    });
                    self.apply_outcome(plan, id, outcome).await?;
                }
                Event::Interrupt { reason } => self.interrupt(plan, &reason).await?,
            }
        }
    }

    /// Cancel everything still in flight for a plan that is being given up
    async fn abandon(&mut self, plan: &mut Plan) {
        let open = self.ledger.cancel_all();
        for id in &open {
            plan.set_status(id.node, NodeStatus::Cancelled);
        }
        self.cancel_intents(&open).await;
    }
}

/// Every live primitive entailed to finish before `id` starts has completed
fn predecessors_done(plan: &Plan, id: NodeId) -> bool {
    plan.primitives()
        .filter(|p| p.id != id && !p.status.is_retired())
        .filter(|p| plan.precedes(p.id, id))
        .all(|p| p.status == NodeStatus::Completed)
}
