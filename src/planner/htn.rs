//! Depth-first HTN search
//!
//! Every method attempt is bracketed by a plan checkpoint; a failed attempt
//! rolls back both the arena and the temporal network before the next
//! method is tried. A choice stays open until everything after it has been
//! planned, so a later dead end resumes the earlier task with its next
//! method. (task, state) pairs that fail on the state alone go into the
//! blacklist.

use super::blacklist::Blacklist;
use super::plan::{GroundAction, NodeId, NodeKind, NodeStatus, Plan, PlanCheckpoint};
use super::{NoSolution, Planner, PlannerConfig};
use crate::domain::{match_patterns, ActionDef, Bindings, Domain, Goal, Ordering, Subtask, TaskCall};
use crate::state::{State, Value};
use crate::temporal::{TemporalError, TemporalNetwork, TimePointId};
use crate::time::Seconds;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Search counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlannerStats {
    pub methods_tried: u64,
    pub backtracks: u64,
    pub blacklist_hits: u64,
    pub blacklisted: usize,
}

/// Hierarchical task network planner over a fixed domain
pub struct HtnPlanner {
    domain: Arc<Domain>,
    config: PlannerConfig,
    blacklist: Blacklist,
    stats: PlannerStats,
}

impl HtnPlanner {
    pub fn new(domain: Arc<Domain>) -> Self {
        Self::with_config(domain, PlannerConfig::default())
    }

    pub fn with_config(domain: Arc<Domain>, config: PlannerConfig) -> Self {
        Self {
            domain,
            config,
            blacklist: Blacklist::new(),
            stats: PlannerStats::default(),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn stats(&self) -> PlannerStats {
        PlannerStats {
            blacklist_hits: self.blacklist.hits(),
            blacklisted: self.blacklist.len(),
            ..self.stats.clone()
        }
    }

    fn search<'a>(&'a mut self, plan: &'a mut Plan) -> Search<'a> {
        Search {
            domain: &self.domain,
            max_depth: self.config.max_depth,
            sequential_goals: self.config.sequential_goals,
            blacklist: &mut self.blacklist,
            stats: &mut self.stats,
            plan,
        }
    }
}

impl Planner for HtnPlanner {
    fn decompose(&mut self, state: &State, goals: &[Goal]) -> Result<Plan, NoSolution> {
        self.blacklist.clear();
        let mut plan = Plan::new(TemporalNetwork::with_threshold(self.config.fw_threshold));
        let mut furthest = 0;

        let result = self
            .search(&mut plan)
            .solve_roots(goals, 0, state.clone(), Vec::new(), &mut furthest);
        if let Err(failure) = result {
            let goal = goals.get(furthest).map(|g| g.to_string()).unwrap_or_default();
            return Err(NoSolution::new(goal, failure.reason));
        }

        info!(
            "Planned {} goals: {} nodes, {} primitives, {} blacklisted",
            goals.len(),
            plan.len(),
            plan.primitives().count(),
            self.blacklist.len()
        );
        Ok(plan)
    }

    fn repair(&mut self, plan: &mut Plan, node: NodeId, state: &State) -> Result<(), NoSolution> {
        self.blacklist.clear();
        let kind = plan
            .node(node)
            .map(|n| n.kind.clone())
            .ok_or_else(|| NoSolution::new(node, "unknown node"))?;
        let floor = plan.completed_ends(node);
        let depth = plan.depth(node);
        plan.reopen();

        let result = match &kind {
            NodeKind::Goal { goal, .. } => {
                self.search(plan)
                    .solve_goal(node, goal, state, &floor, depth, &mut |_, reached| Ok(reached))
            }
            NodeKind::Compound { task, .. } => {
                self.search(plan)
                    .solve_task(node, task, state, &floor, depth, &mut |_, reached| Ok(reached))
            }
            NodeKind::Primitive { action } => Err(Failure::dead_end(format!(
                "{} is primitive and cannot be re-decomposed",
                action
            ))),
        };

        match result {
            Ok(_) => {
                info!("Repaired {} ({}): {} nodes now", node, kind.signature(), plan.len());
                Ok(())
            }
            Err(failure) => Err(NoSolution::new(kind.signature(), failure.reason)),
        }
    }
}

/// Why a branch of the search failed
#[derive(Debug)]
struct Failure {
    reason: String,
    /// Depends on timing or depth, not only on the state; never blacklisted
    contextual: bool,
}

impl Failure {
    fn dead_end(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            contextual: false,
        }
    }

    fn contextual(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            contextual: true,
        }
    }

    fn temporal(e: TemporalError) -> Self {
        Self::contextual(format!("temporal inconsistency: {}", e))
    }
}

/// What remains to be planned once a task is solved
type Next<'n, 'a> = dyn FnMut(&mut Search<'a>, State) -> Result<State, Failure> + 'n;

/// Like [`Next`], also told which child node was just added
type Then<'n, 'a> = dyn FnMut(&mut Search<'a>, NodeId, State) -> Result<State, Failure> + 'n;

/// One top-level planning call's mutable search context.
///
/// The search is written in continuation-passing style: every solver takes
/// the rest of the plan as `next` and only returns `Ok` once that rest has
/// succeeded too. A failure anywhere later therefore unwinds into the most
/// recent method choice, which rolls back and tries its next method.
struct Search<'a> {
    domain: &'a Domain,
    max_depth: usize,
    sequential_goals: bool,
    blacklist: &'a mut Blacklist,
    stats: &'a mut PlannerStats,
    plan: &'a mut Plan,
}

impl<'a> Search<'a> {
    /// Top-level goals from `index` on, each rooted after `after`
    fn solve_roots(
        &mut self,
        goals: &[Goal],
        index: usize,
        state: State,
        after: Vec<TimePointId>,
        furthest: &mut usize,
    ) -> Result<State, Failure> {
        let Some(goal) = goals.get(index) else {
            return Ok(state);
        };
        *furthest = (*furthest).max(index);

        let deadline = match goal.deadline {
            Some(d) => {
                Some(Seconds::try_from_secs_f64(d).ok_or_else(|| Failure::dead_end(format!("invalid deadline {}", d)))?)
            }
            None => None,
        };
        let kind = NodeKind::Goal {
            goal: goal.clone(),
            method: None,
        };

        let cp = self.plan.checkpoint();
        let result = match self.plan.add_root(kind, &after, deadline) {
            Ok(root) => {
                let sequential = self.sequential_goals;
                self.solve_goal(root, goal, &state, &[], 0, &mut |search, reached| {
                    let after = match search.plan.node(root) {
                        Some(node) if sequential => vec![node.end],
                        _ => Vec::new(),
                    };
                    search.solve_roots(goals, index + 1, reached, after, &mut *furthest)
                })
            }
            Err(e) => Err(Failure::temporal(e)),
        };
        if result.is_err() {
            self.plan.rollback(cp);
        }
        result
    }

    fn solve_goal(
        &mut self,
        node: NodeId,
        goal: &Goal,
        state: &State,
        floor: &[TimePointId],
        depth: usize,
        next: &mut Next<'_, 'a>,
    ) -> Result<State, Failure> {
        if goal.is_satisfied(state) {
            self.plan.set_status(node, NodeStatus::Completed);
            let result = next(self, state.clone());
            if result.is_err() {
                self.plan.set_status(node, NodeStatus::Pending);
            }
            return result;
        }
        if depth > self.max_depth {
            return Err(Failure::contextual(format!("depth limit {} reached at {}", self.max_depth, goal)));
        }

        let task_sig = goal.signature();
        let state_sig = state.signature();
        if self.blacklist.contains(&task_sig, &state_sig) {
            return Err(Failure::dead_end(format!("{} is a known dead end", task_sig)));
        }

        let domain = self.domain;
        let mut last = Failure::dead_end(format!("no method for {}", goal));
        let mut intrinsic = true;
        for method in domain.goal_methods_for(&goal.predicate) {
            let bindings = match match_patterns(&method.preconditions, &method.bind(goal), state) {
                Ok(b) => b,
                Err(reason) => {
                    last = Failure::dead_end(format!("{}: {}", method.name, reason));
                    continue;
                }
            };

            self.stats.methods_tried += 1;
            let cp = self.plan.checkpoint();
            let mut continued = false;
            let result = self.expand_body(
                node,
                &method.subtasks,
                method.ordering,
                &bindings,
                state,
                floor,
                depth + 1,
                &mut |search, reached| {
                    // The method claims the goal; check the state it leaves
                    if !goal.is_satisfied(&reached) {
                        let found = reached
                            .get(&goal.subject, &goal.predicate)
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "nothing".to_string());
                        return Err(Failure::dead_end(format!(
                            "{} did not achieve {} (left {})",
                            method.name, goal, found
                        )));
                    }
                    debug!("{} via {}", goal, method.name);
                    search.plan.set_method(node, Some(method.name.clone()));
                    search.plan.set_status(node, NodeStatus::Expanded);
                    continued = true;
                    next(search, reached)
                },
            );

            match result {
                Ok(done) => return Ok(done),
                Err(failure) => {
                    intrinsic &= !continued && !failure.contextual;
                    last = self.retreat(node, &method.name, cp, continued, failure);
                }
            }
        }

        if intrinsic {
            self.blacklist.insert(&task_sig, &state_sig);
        }
        last.contextual = !intrinsic;
        Err(last)
    }

    fn solve_task(
        &mut self,
        node: NodeId,
        task: &TaskCall,
        state: &State,
        floor: &[TimePointId],
        depth: usize,
        next: &mut Next<'_, 'a>,
    ) -> Result<State, Failure> {
        if depth > self.max_depth {
            return Err(Failure::contextual(format!("depth limit {} reached at {}", self.max_depth, task)));
        }

        let task_sig = task.signature();
        let state_sig = state.signature();
        if self.blacklist.contains(&task_sig, &state_sig) {
            return Err(Failure::dead_end(format!("{} is a known dead end", task_sig)));
        }

        let domain = self.domain;
        let mut last = Failure::dead_end(format!("no method for {}", task));
        let mut intrinsic = true;
        for method in domain.methods_for(&task.name) {
            let bindings = match method
                .bind(&task.args)
                .and_then(|b| match_patterns(&method.preconditions, &b, state))
            {
                Ok(b) => b,
                Err(reason) => {
                    last = Failure::dead_end(format!("{}: {}", method.name, reason));
                    continue;
                }
            };

            self.stats.methods_tried += 1;
            let cp = self.plan.checkpoint();
            let mut continued = false;
            let result = self.expand_body(
                node,
                &method.subtasks,
                method.ordering,
                &bindings,
                state,
                floor,
                depth + 1,
                &mut |search, reached| {
                    debug!("{} via {}", task, method.name);
                    search.plan.set_method(node, Some(method.name.clone()));
                    search.plan.set_status(node, NodeStatus::Expanded);
                    continued = true;
                    next(search, reached)
                },
            );

            match result {
                Ok(done) => return Ok(done),
                Err(failure) => {
                    intrinsic &= !continued && !failure.contextual;
                    last = self.retreat(node, &method.name, cp, continued, failure);
                }
            }
        }

        if intrinsic {
            self.blacklist.insert(&task_sig, &state_sig);
        }
        last.contextual = !intrinsic;
        Err(last)
    }

    /// Undo one method attempt on `node`. Failures from beyond the node
    /// keep their own reason.
    fn retreat(&mut self, node: NodeId, method: &str, cp: PlanCheckpoint, continued: bool, failure: Failure) -> Failure {
        debug!("Backtrack from {}: {}", method, failure.reason);
        self.stats.backtracks += 1;
        self.plan.rollback(cp);
        self.plan.set_method(node, None);
        self.plan.set_status(node, NodeStatus::Pending);
        if continued {
            failure
        } else {
            Failure {
                reason: format!("{}: {}", method, failure.reason),
                ..failure
            }
        }
    }

    /// Expand a method body under `parent`, threading the hypothetical state.
    ///
    /// Sequential children chain end-to-start. Parallel children all see the
    /// entry state and their effects are merged in declaration order.
    #[allow(clippy::too_many_arguments)]
    fn expand_body(
        &mut self,
        parent: NodeId,
        subtasks: &[Subtask],
        ordering: Ordering,
        bindings: &Bindings,
        state: &State,
        floor: &[TimePointId],
        depth: usize,
        next: &mut Next<'_, 'a>,
    ) -> Result<State, Failure> {
        match ordering {
            Ordering::Sequential => self.expand_sequence(parent, subtasks, bindings, state.clone(), floor, depth, next),
            Ordering::Parallel => {
                self.expand_parallel(parent, subtasks, bindings, state, state.clone(), floor, depth, next)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_sequence(
        &mut self,
        parent: NodeId,
        subtasks: &[Subtask],
        bindings: &Bindings,
        state: State,
        after: &[TimePointId],
        depth: usize,
        next: &mut Next<'_, 'a>,
    ) -> Result<State, Failure> {
        let Some((first, rest)) = subtasks.split_first() else {
            return next(self, state);
        };
        self.expand_subtask(parent, first, bindings, &state, after, depth, &mut |search, child, reached| {
            let end: Vec<TimePointId> = search.plan.node(child).map(|n| vec![n.end]).unwrap_or_default();
            search.expand_sequence(parent, rest, bindings, reached, &end, depth, &mut *next)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_parallel(
        &mut self,
        parent: NodeId,
        subtasks: &[Subtask],
        bindings: &Bindings,
        entry: &State,
        merged: State,
        after: &[TimePointId],
        depth: usize,
        next: &mut Next<'_, 'a>,
    ) -> Result<State, Failure> {
        let Some((first, rest)) = subtasks.split_first() else {
            return next(self, merged);
        };
        self.expand_subtask(parent, first, bindings, entry, after, depth, &mut |search, _, reached| {
            let merged = merge_changes(&merged, entry, &reached);
            search.expand_parallel(parent, rest, bindings, entry, merged, after, depth, &mut *next)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_subtask(
        &mut self,
        parent: NodeId,
        subtask: &Subtask,
        bindings: &Bindings,
        state: &State,
        after: &[TimePointId],
        depth: usize,
        then: &mut Then<'_, 'a>,
    ) -> Result<State, Failure> {
        match subtask {
            Subtask::Achieve { achieve } => {
                let fact = achieve.ground(bindings).map_err(Failure::dead_end)?;
                let goal = Goal {
                    subject: fact.subject,
                    predicate: fact.predicate,
                    value: fact.value,
                    deadline: None,
                };
                let kind = NodeKind::Goal {
                    goal: goal.clone(),
                    method: None,
                };
                let child = self.plan.add_child(parent, kind, after).map_err(Failure::temporal)?;
                self.solve_goal(child, &goal, state, &[], depth, &mut |search, reached| {
                    then(search, child, reached)
                })
            }
            Subtask::Invoke { task, args } => {
                let args = args
                    .iter()
                    .map(|t| t.resolve(bindings).ok_or_else(|| format!("unbound argument {} to {}", t, task)))
                    .collect::<Result<Vec<Value>, String>>()
                    .map_err(Failure::dead_end)?;
                let call = TaskCall {
                    name: task.clone(),
                    args,
                };

                if let Some(def) = self.domain.action(task) {
                    let action = ground_action(def, &call.args, state).map_err(Failure::dead_end)?;
                    let reached = state.with_facts(action.effects.iter().cloned());
                    let child = self
                        .plan
                        .add_child(parent, NodeKind::Primitive { action }, after)
                        .map_err(Failure::temporal)?;
                    then(self, child, reached)
                } else {
                    let kind = NodeKind::Compound {
                        task: call.clone(),
                        method: None,
                    };
                    let child = self.plan.add_child(parent, kind, after).map_err(Failure::temporal)?;
                    self.solve_task(child, &call, state, &[], depth, &mut |search, reached| {
                        then(search, child, reached)
                    })
                }
            }
        }
    }
}

/// Bind an action to arguments and the state its preconditions are checked in
pub fn ground_action(def: &ActionDef, args: &[Value], state: &State) -> Result<GroundAction, String> {
    let bindings = def.bind(args)?;
    let bound =
        match_patterns(&def.preconditions, &bindings, state).map_err(|reason| format!("{}: {}", def.name, reason))?;

    let preconditions = def
        .preconditions
        .iter()
        .map(|p| p.ground(&bound))
        .collect::<Result<Vec<_>, _>>()?;
    let effects = def
        .effects
        .iter()
        .map(|p| p.ground(&bound))
        .collect::<Result<Vec<_>, _>>()?;
    let duration = def
        .duration
        .evaluate(&bound, state)
        .map_err(|reason| format!("{}: {}", def.name, reason))?;
    let agent = match &def.agent {
        Some(term) => Some(
            term.resolve(&bound)
                .ok_or_else(|| format!("{}: unbound agent {}", def.name, term))?
                .to_string(),
        ),
        None => None,
    };

    Ok(GroundAction {
        name: def.name.clone(),
        args: args.to_vec(),
        agent,
        preconditions,
        effects,
        duration,
        retries: def.retries,
    })
}

/// Apply the keys `reached` changed relative to `base` onto `current`.
/// Effects only ever set facts, so keys missing from `reached` are skipped.
fn merge_changes(current: &State, base: &State, reached: &State) -> State {
    let changed: Vec<_> = base
        .diff(reached)
        .into_iter()
        .filter_map(|key| {
            reached
                .get(&key.subject, &key.predicate)
                .map(|v| crate::state::Fact::new(&key.subject, &key.predicate, v.clone()))
        })
        .collect();
    if changed.is_empty() {
        current.clone()
    } else {
        current.with_facts(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ScenarioLoader;

    fn planner(toml: &str) -> (HtnPlanner, State, Vec<Goal>) {
        let scenario = ScenarioLoader::parse_str(toml).unwrap();
        let state = scenario.initial_state();
        (HtnPlanner::new(Arc::new(scenario.domain)), state, scenario.goals)
    }

    fn primitive_names(plan: &Plan) -> Vec<String> {
        plan.primitives()
            .filter_map(|n| n.kind.action())
            .map(|a| a.name.clone())
            .collect()
    }

    const COMMUTE: &str = r#"
[domain]
name = "commute"

[[domain.actions]]
name = "drive"
params = ["who"]
effects = [{ subject = "?who", predicate = "at", value = "office" }]
duration = { kind = "fixed", seconds = 10.0 }

[[domain.actions]]
name = "walk"
params = ["who"]
effects = [{ subject = "?who", predicate = "at", value = "office" }]
duration = { kind = "fixed", seconds = 4.0 }

[[domain.goal_methods]]
name = "by_car"
predicate = "at"
subtasks = [{ task = "drive", args = ["?subject"] }]

[[domain.goal_methods]]
name = "on_foot"
predicate = "at"
priority = 1
subtasks = [{ task = "walk", args = ["?subject"] }]

[[facts]]
subject = "Sam"
predicate = "at"
value = "home"
"#;

    #[test]
    fn test_priority_order() {
        let (mut planner, state, _) = planner(COMMUTE);
        let plan = planner.decompose(&state, &[Goal::new("Sam", "at", "office")]).unwrap();
        assert_eq!(primitive_names(&plan), vec!["drive"]);
    }

    #[test]
    fn test_deadline_forces_backtracking() {
        let (mut planner, state, _) = planner(COMMUTE);
        let goal = Goal::new("Sam", "at", "office").with_deadline(5.0);
        let plan = planner.decompose(&state, &[goal]).unwrap();

        assert_eq!(primitive_names(&plan), vec!["walk"]);
        assert_eq!(plan.len(), 2);
        assert!(planner.stats().backtracks >= 1);
    }

    #[test]
    fn test_unreachable_deadline() {
        let (mut planner, state, _) = planner(COMMUTE);
        let goal = Goal::new("Sam", "at", "office").with_deadline(1.0);
        let err = planner.decompose(&state, &[goal]).unwrap_err();
        assert!(err.reason.contains("temporal inconsistency"));
    }

    #[test]
    fn test_satisfied_goal_needs_no_actions() {
        let (mut planner, state, _) = planner(COMMUTE);
        let plan = planner.decompose(&state, &[Goal::new("Sam", "at", "home")]).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.is_complete());
    }

    #[test]
    fn test_goal_verification_rejects_wrong_effect() {
        let (mut planner, state, _) = planner(
            r#"
[domain]
name = "doors"

[[domain.actions]]
name = "kick"
params = ["door"]
effects = [{ subject = "?door", predicate = "broken", value = true }]

[[domain.actions]]
name = "turn_handle"
params = ["door"]
effects = [{ subject = "?door", predicate = "open", value = true }]

[[domain.goal_methods]]
name = "force"
predicate = "open"
subtasks = [{ task = "kick", args = ["?subject"] }]

[[domain.goal_methods]]
name = "politely"
predicate = "open"
priority = 1
subtasks = [{ task = "turn_handle", args = ["?subject"] }]

[[facts]]
subject = "door"
predicate = "open"
value = false
"#,
        );
        let plan = planner.decompose(&state, &[Goal::new("door", "open", true)]).unwrap();
        assert_eq!(primitive_names(&plan), vec!["turn_handle"]);

        let root = plan.node(plan.roots()[0]).unwrap();
        assert!(matches!(&root.kind, NodeKind::Goal { method: Some(m), .. } if m == "politely"));
    }

    #[test]
    fn test_blacklist_prunes_repeated_dead_end() {
        let (mut planner, state, _) = planner(
            r#"
[domain]
name = "locks"

[[domain.actions]]
name = "unlock"
params = ["door"]
effects = [{ subject = "?door", predicate = "open", value = true }]

[[domain.actions]]
name = "pick_lock"
params = ["door"]
effects = [{ subject = "?door", predicate = "open", value = true }]
duration = { kind = "fixed", seconds = 30.0 }

[[domain.goal_methods]]
name = "with_key"
predicate = "open"
subtasks = [{ achieve = { subject = "key", predicate = "held", value = true } }, { task = "unlock", args = ["?subject"] }]

[[domain.goal_methods]]
name = "with_spare_key"
predicate = "open"
priority = 1
subtasks = [{ achieve = { subject = "key", predicate = "held", value = true } }, { task = "unlock", args = ["?subject"] }]

[[domain.goal_methods]]
name = "pick"
predicate = "open"
priority = 2
subtasks = [{ task = "pick_lock", args = ["?subject"] }]

[[facts]]
subject = "door"
predicate = "open"
value = false
"#,
        );
        let plan = planner.decompose(&state, &[Goal::new("door", "open", true)]).unwrap();
        assert_eq!(primitive_names(&plan), vec!["pick_lock"]);

        let stats = planner.stats();
        assert_eq!(stats.blacklist_hits, 1);
        assert_eq!(stats.blacklisted, 1);
    }

    #[test]
    fn test_later_subtask_reopens_earlier_choice() {
        let (mut planner, state, _) = planner(
            r#"
[domain]
name = "paint_shop"

[[domain.actions]]
name = "paint_red"
params = ["item"]
effects = [{ subject = "?item", predicate = "color", value = "red" }]

[[domain.actions]]
name = "paint_blue"
params = ["item"]
effects = [{ subject = "?item", predicate = "color", value = "blue" }]

[[domain.actions]]
name = "ship"
params = ["item"]
preconditions = [{ subject = "?item", predicate = "color", value = "blue" }]
effects = [{ subject = "?item", predicate = "shipped", value = true }]

[[domain.methods]]
name = "red_first"
task = "paint"
params = ["item"]
subtasks = [{ task = "paint_red", args = ["?item"] }]

[[domain.methods]]
name = "blue_second"
task = "paint"
params = ["item"]
priority = 1
subtasks = [{ task = "paint_blue", args = ["?item"] }]

[[domain.goal_methods]]
name = "paint_then_ship"
predicate = "shipped"
subtasks = [{ task = "paint", args = ["?subject"] }, { task = "ship", args = ["?subject"] }]

[[facts]]
subject = "box"
predicate = "shipped"
value = false
"#,
        );
        let plan = planner.decompose(&state, &[Goal::new("box", "shipped", true)]).unwrap();
        assert_eq!(primitive_names(&plan), vec!["paint_blue", "ship"]);

        let paint = plan
            .nodes()
            .iter()
            .find(|n| matches!(&n.kind, NodeKind::Compound { method: Some(m), .. } if m == "blue_second"));
        assert!(paint.is_some());
        // the red attempt left nothing behind
        assert_eq!(plan.len(), 4);
        // ship failing says nothing about paint itself
        assert_eq!(planner.stats().blacklisted, 0);
    }

    const KITCHEN_DEADLINE: &str = r#"
[domain]
name = "line_cook"

[[domain.actions]]
name = "slow_prep"
effects = [{ subject = "dish", predicate = "prepped", value = true }]
duration = { kind = "fixed", seconds = 3.0 }

[[domain.actions]]
name = "quick_prep"
effects = [{ subject = "dish", predicate = "prepped", value = true }]
duration = { kind = "fixed", seconds = 1.0 }

[[domain.actions]]
name = "arrange"
preconditions = [{ subject = "dish", predicate = "prepped", value = true }]
effects = [{ subject = "order", predicate = "served", value = true }]
duration = { kind = "fixed", seconds = 2.0 }

[[domain.methods]]
name = "slow"
task = "prep"
subtasks = [{ task = "slow_prep" }]

[[domain.methods]]
name = "quick"
task = "prep"
priority = 1
subtasks = [{ task = "quick_prep" }]

[[domain.methods]]
name = "plate_it"
task = "plate"
subtasks = [{ task = "arrange" }]

[[domain.goal_methods]]
name = "serve"
predicate = "served"
subtasks = [{ task = "prep" }, { task = "plate" }]

[[facts]]
subject = "order"
predicate = "served"
value = false
"#;

    #[test]
    fn test_deadline_reopens_earlier_sibling() {
        let (mut planner, state, _) = planner(KITCHEN_DEADLINE);
        let goal = Goal::new("order", "served", true).with_deadline(4.0);
        let mut plan = planner.decompose(&state, &[goal]).unwrap();

        assert_eq!(primitive_names(&plan), vec!["quick_prep", "arrange"]);
        // both prep methods leave the same state, so a timing failure of
        // plate must not be remembered as a dead end for that state
        assert_eq!(planner.stats().blacklisted, 0);

        plan.freeze().unwrap();
        let arrange = plan.primitives().last().unwrap().id;
        assert_eq!(plan.times_of(arrange), Some((Seconds::from_secs(1), Seconds::from_secs(3))));
    }

    #[test]
    fn test_deadline_exhausts_every_combination() {
        let (mut planner, state, _) = planner(KITCHEN_DEADLINE);
        let goal = Goal::new("order", "served", true).with_deadline(2.5);
        let err = planner.decompose(&state, &[goal]).unwrap_err();

        assert_eq!(err.goal, "order.served=true");
        assert!(err.reason.contains("temporal inconsistency"), "{}", err.reason);
        // serve, slow (too long on its own), quick, then plate_it after quick
        assert_eq!(planner.stats().methods_tried, 4);
    }

    #[test]
    fn test_later_goal_reopens_earlier_goal() {
        let (mut planner, state, _) = planner(COMMUTE);
        let goals = [
            Goal::new("Sam", "at", "office"),
            Goal::new("Kim", "at", "office").with_deadline(8.0),
        ];
        let plan = planner.decompose(&state, &goals).unwrap();

        assert_eq!(primitive_names(&plan), vec!["walk", "walk"]);
        assert_eq!(plan.roots().len(), 2);
    }

    #[test]
    fn test_parallel_children_overlap() {
        let (mut planner, state, _) = planner(
            r#"
[domain]
name = "kitchen"

[[domain.actions]]
name = "boil"
effects = [{ subject = "water", predicate = "hot", value = true }]
duration = { kind = "fixed", seconds = 3.0 }

[[domain.actions]]
name = "grind"
effects = [{ subject = "beans", predicate = "ground", value = true }]
duration = { kind = "fixed", seconds = 2.0 }

[[domain.actions]]
name = "pour"
preconditions = [
    { subject = "water", predicate = "hot", value = true },
    { subject = "beans", predicate = "ground", value = true },
]
effects = [{ subject = "coffee", predicate = "ready", value = true }]
duration = { kind = "fixed", seconds = 1.0 }

[[domain.methods]]
name = "prep_both"
task = "prep"
ordering = "parallel"
subtasks = [{ task = "boil" }, { task = "grind" }]

[[domain.goal_methods]]
name = "brew"
predicate = "ready"
subtasks = [{ task = "prep" }, { task = "pour" }]

[[facts]]
subject = "coffee"
predicate = "ready"
value = false
"#,
        );
        let mut plan = planner.decompose(&state, &[Goal::new("coffee", "ready", true)]).unwrap();
        let prims: Vec<NodeId> = plan.primitives().map(|n| n.id).collect();
        assert_eq!(primitive_names(&plan), vec!["boil", "grind", "pour"]);

        let (boil, grind, pour) = (prims[0], prims[1], prims[2]);
        assert!(!plan.precedes(boil, grind));
        assert!(!plan.precedes(grind, boil));
        assert!(plan.precedes(boil, pour));
        assert!(plan.precedes(grind, pour));

        plan.freeze().unwrap();
        assert_eq!(plan.times_of(pour), Some((Seconds::from_secs(3), Seconds::from_secs(4))));
    }

    #[test]
    fn test_deterministic() {
        let (mut a, state, _) = planner(COMMUTE);
        let (mut b, _, _) = planner(COMMUTE);
        let goals = [Goal::new("Sam", "at", "office").with_deadline(5.0)];

        let first = a.decompose(&state, &goals).unwrap();
        let second = b.decompose(&state, &goals).unwrap();
        assert_eq!(first.outline(), second.outline());
    }

    #[test]
    fn test_ground_action_binds_from_state() {
        let (planner, state, _) = planner(
            r#"
[domain]
name = "move"

[[domain.actions]]
name = "move"
params = ["agent", "to"]
agent = "?agent"
preconditions = [{ subject = "?agent", predicate = "at", value = "?from" }]
effects = [{ subject = "?agent", predicate = "at", value = "?to" }]
duration = { kind = "distance", from = "?from", to = "?to", speed = { subject = "?agent", predicate = "speed" } }

[[facts]]
subject = "Alex"
predicate = "at"
value = [2, 0]

[[facts]]
subject = "Alex"
predicate = "speed"
value = 4.0
"#,
        );
        let def = planner.domain().action("move").unwrap();
        let action = ground_action(def, &[Value::from("Alex"), Value::Vector(vec![8.0, 0.0])], &state).unwrap();

        assert_eq!(action.duration, Seconds::from_millis(1500));
        assert_eq!(action.agent.as_deref(), Some("Alex"));
        assert_eq!(action.preconditions[0].value, Value::Vector(vec![2.0, 0.0]));
        assert_eq!(action.effects[0].value, Value::Vector(vec![8.0, 0.0]));
    }
}
