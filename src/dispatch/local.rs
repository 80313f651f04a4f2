//! In-process executor
//!
//! Validates each intent against the current State snapshot, waits out the
//! (scaled) action duration, and reports an outcome. It never writes to
//! the store; applying effects is the coordinator's job.

use super::{DispatchError, Dispatcher};
use crate::intent::{Intent, IntentId, IntentOutcome};
use crate::state::StateStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_CONCURRENCY: usize = 8;

/// Executes intents on the local tokio runtime
pub struct LocalDispatcher {
    store: Arc<StateStore>,
    /// Wall-clock seconds per plan second; 0 runs instantly
    time_scale: f64,
    permits: Arc<Semaphore>,
    /// Scripted outcomes by action name, consumed one per submission
    faults: Mutex<HashMap<String, VecDeque<IntentOutcome>>>,
    /// Final outcome per intent id, for redelivery
    outcomes: Mutex<HashMap<IntentId, IntentOutcome>>,
    running: Mutex<HashMap<IntentId, watch::Sender<bool>>>,
    /// Plans whose outcomes were dropped; late work for them is cancelled
    forgotten: Mutex<HashSet<Uuid>>,
    executed: Mutex<Vec<IntentId>>,
}

impl LocalDispatcher {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            time_scale: 0.0,
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            faults: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            forgotten: Mutex::new(HashSet::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Make the next execution of `action` report `outcome` instead of running
    pub fn inject(&self, action: &str, outcome: IntentOutcome) {
        self.faults
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Intent ids actually executed, in order (redeliveries excluded)
    pub fn executed(&self) -> Vec<IntentId> {
        self.executed.lock().clone()
    }

    /// Intents currently waiting out their duration
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }

    /// Outcomes held for redelivery
    pub fn remembered(&self) -> usize {
        self.outcomes.lock().len()
    }

    async fn run(&self, intent: &Intent) -> IntentOutcome {
        let scripted = self
            .faults
            .lock()
            .get_mut(&intent.action)
            .and_then(|queue| queue.pop_front());
        if let Some(outcome) = scripted {
            info!("Intent {}: scripted {}", intent.id, outcome);
            return outcome;
        }

        let state = self.store.snapshot();
        if let Some(agent) = &intent.agent {
            if !state.knows(agent) {
                return IntentOutcome::Rejected(format!("target_gone: {}", agent));
            }
        }
        for fact in &intent.preconditions {
            if !state.holds(&fact.subject, &fact.predicate, &fact.value) {
                let found = state
                    .get(&fact.subject, &fact.predicate)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "nothing".to_string());
                return IntentOutcome::Rejected(format!("precondition_failed: {} (found {})", fact, found));
            }
        }

        let (tx, mut rx) = watch::channel(false);
        self.running.lock().insert(intent.id, tx);

        let wait = Duration::from_secs_f64(intent.duration.as_secs_f64() * self.time_scale);
        if wait.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = rx.changed() => {}
            }
        }
        let cancelled = *rx.borrow();

        self.running.lock().remove(&intent.id);
        if cancelled {
            IntentOutcome::Cancelled
        } else {
            IntentOutcome::Completed
        }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, intent: Intent) -> Result<IntentOutcome, DispatchError> {
        if self.forgotten.lock().contains(&intent.id.plan) {
            debug!("Intent {} belongs to a finished plan", intent.id);
            return Ok(IntentOutcome::Cancelled);
        }
        let previous = self.outcomes.lock().get(&intent.id).cloned();
        if let Some(previous) = previous {
            debug!("Intent {} redelivered; answering {}", intent.id, previous);
            return Ok(previous);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        self.executed.lock().push(intent.id);
        debug!("Executing {}", intent);
        let outcome = self.run(&intent).await;

        if self.forgotten.lock().contains(&intent.id.plan) {
            return Ok(outcome);
        }
        // A cancel that raced with completion wins
        let mut outcomes = self.outcomes.lock();
        let outcome = outcomes.entry(intent.id).or_insert(outcome).clone();
        Ok(outcome)
    }

    async fn cancel(&self, id: &IntentId) -> Result<(), DispatchError> {
        if let Some(tx) = self.running.lock().get(id) {
            let _ = tx.send(true);
        }
        if !self.forgotten.lock().contains(&id.plan) {
            self.outcomes.lock().entry(*id).or_insert(IntentOutcome::Cancelled);
        }
        debug!("Cancel acknowledged for {}", id);
        Ok(())
    }

    fn forget_plan(&self, plan: Uuid) {
        self.forgotten.lock().insert(plan);
        let mut outcomes = self.outcomes.lock();
        let before = outcomes.len();
        outcomes.retain(|id, _| id.plan != plan);
        debug!("Forgot {} outcomes of plan {}", before - outcomes.len(), plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::NodeId;
    use crate::state::{Fact, State};
    use crate::time::Seconds;
    use chrono::Utc;

    fn store() -> Arc<StateStore> {
        Arc::new(StateStore::new(
            State::new().with_fact("Alex", "at", vec![2.0, 0.0]).with_fact("Alex", "speed", 4.0),
        ))
    }

    fn move_intent(attempt: u32, from: Vec<f64>) -> Intent {
        move_intent_for(Uuid::nil(), attempt, from)
    }

    fn move_intent_for(plan: Uuid, attempt: u32, from: Vec<f64>) -> Intent {
        Intent {
            id: IntentId::new(plan, NodeId(2), attempt),
            action: "move".to_string(),
            args: vec!["Alex".into(), vec![8.0, 0.0].into()],
            agent: Some("Alex".to_string()),
            preconditions: vec![Fact::new("Alex", "at", from)],
            effects: vec![Fact::new("Alex", "at", vec![8.0, 0.0])],
            duration: Seconds::from_millis(1500),
            not_before: Seconds::ZERO,
            issued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_completes_without_touching_state() {
        let store = store();
        let version = store.version();
        let dispatcher = LocalDispatcher::new(store.clone());

        let outcome = dispatcher.submit(move_intent(1, vec![2.0, 0.0])).await.unwrap();
        assert_eq!(outcome, IntentOutcome::Completed);
        assert_eq!(store.version(), version);
    }

    #[tokio::test]
    async fn test_rejects_stale_precondition() {
        let dispatcher = LocalDispatcher::new(store());
        let outcome = dispatcher.submit(move_intent(1, vec![5.0, 5.0])).await.unwrap();
        assert!(matches!(outcome, IntentOutcome::Rejected(reason) if reason.starts_with("precondition_failed")));
    }

    #[tokio::test]
    async fn test_rejects_missing_agent() {
        let dispatcher = LocalDispatcher::new(Arc::new(StateStore::new(State::new())));
        let outcome = dispatcher.submit(move_intent(1, vec![2.0, 0.0])).await.unwrap();
        assert_eq!(outcome, IntentOutcome::Rejected("target_gone: Alex".to_string()));
    }

    #[tokio::test]
    async fn test_redelivery_does_not_execute_twice() {
        let dispatcher = LocalDispatcher::new(store());
        dispatcher.inject("move", IntentOutcome::Failed("motor stalled".to_string()));

        let first = dispatcher.submit(move_intent(1, vec![2.0, 0.0])).await.unwrap();
        let again = dispatcher.submit(move_intent(1, vec![2.0, 0.0])).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(dispatcher.executed().len(), 1);

        let retry = dispatcher.submit(move_intent(2, vec![2.0, 0.0])).await.unwrap();
        assert_eq!(retry, IntentOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let dispatcher = Arc::new(LocalDispatcher::new(store()).with_time_scale(10.0));
        let intent = move_intent(1, vec![2.0, 0.0]);
        let id = intent.id;

        let worker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(intent).await })
        };
        while dispatcher.running.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        dispatcher.cancel(&id).await.unwrap();

        assert_eq!(worker.await.unwrap(), Ok(IntentOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_before_submit() {
        let dispatcher = LocalDispatcher::new(store());
        let intent = move_intent(1, vec![2.0, 0.0]);
        dispatcher.cancel(&intent.id).await.unwrap();

        assert_eq!(dispatcher.submit(intent).await.unwrap(), IntentOutcome::Cancelled);
        assert!(dispatcher.executed().is_empty());
    }

    #[tokio::test]
    async fn test_same_attempt_of_new_plan_runs_again() {
        let dispatcher = LocalDispatcher::new(store());
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        dispatcher.submit(move_intent_for(first, 1, vec![2.0, 0.0])).await.unwrap();
        dispatcher.submit(move_intent_for(second, 1, vec![2.0, 0.0])).await.unwrap();

        let plans: Vec<Uuid> = dispatcher.executed().iter().map(|id| id.plan).collect();
        assert_eq!(plans, vec![first, second]);
    }

    #[tokio::test]
    async fn test_forget_plan_drops_its_outcomes() {
        let dispatcher = LocalDispatcher::new(store());
        let (done, live) = (Uuid::new_v4(), Uuid::new_v4());
        dispatcher.submit(move_intent_for(done, 1, vec![2.0, 0.0])).await.unwrap();
        dispatcher.submit(move_intent_for(live, 1, vec![2.0, 0.0])).await.unwrap();
        assert_eq!(dispatcher.remembered(), 2);

        dispatcher.forget_plan(done);
        assert_eq!(dispatcher.remembered(), 1);

        // late work for the finished plan is not run or remembered
        let late = dispatcher.submit(move_intent_for(done, 2, vec![2.0, 0.0])).await.unwrap();
        assert_eq!(late, IntentOutcome::Cancelled);
        assert_eq!(dispatcher.executed().len(), 2);
        assert_eq!(dispatcher.remembered(), 1);
    }
}
