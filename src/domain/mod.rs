//! Planning Domain
//!
//! The declarative model the planner searches over:
//! - Actions (primitive, executable, with a duration formula)
//! - Methods (decompositions of compound tasks)
//! - Goal methods (decompositions of "make predicate = value" goals)
//!
//! Domains and scenarios are loaded from TOML or JSON by [`loader`].

pub mod loader;
pub mod types;

pub use loader::ScenarioLoader;
pub use types::*;

use crate::state::{Fact, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Domain validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("duplicate action: {0}")]
    DuplicateAction(String),

    #[error("duplicate method: {0}")]
    DuplicateMethod(String),

    #[error("{0} is both an action and a compound task")]
    AmbiguousTask(String),

    #[error("method {method} references unknown task {task}")]
    UnknownTask { method: String, task: String },

    #[error("method {method} passes {given} arguments to {task}, which takes {expected}")]
    ArityMismatch {
        method: String,
        task: String,
        expected: usize,
        given: usize,
    },

    #[error("{name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Actions and methods for one planning problem family
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub goal_methods: Vec<GoalMethodDef>,
}

impl Domain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: ActionDef) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_goal_method(mut self, method: GoalMethodDef) -> Self {
        self.goal_methods.push(method);
        self
    }

    pub fn action(&self, name: &str) -> Option<&ActionDef> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn is_compound(&self, task: &str) -> bool {
        self.methods.iter().any(|m| m.task == task)
    }

    /// Methods for `task`, by ascending priority then declaration order
    pub fn methods_for(&self, task: &str) -> Vec<&MethodDef> {
        let mut methods: Vec<&MethodDef> = self.methods.iter().filter(|m| m.task == task).collect();
        methods.sort_by_key(|m| m.priority);
        methods
    }

    /// Goal methods for `predicate`, by ascending priority then declaration order
    pub fn goal_methods_for(&self, predicate: &str) -> Vec<&GoalMethodDef> {
        let mut methods: Vec<&GoalMethodDef> = self.goal_methods.iter().filter(|m| m.predicate == predicate).collect();
        methods.sort_by_key(|m| m.priority);
        methods
    }

    /// Check names and arities once, so the planner can trust the tables
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut actions = BTreeSet::new();
        for action in &self.actions {
            if !actions.insert(action.name.as_str()) {
                return Err(DomainError::DuplicateAction(action.name.clone()));
            }
            if action.retries > 16 {
                return Err(DomainError::Invalid {
                    name: action.name.clone(),
                    reason: format!("retries {} exceeds 16", action.retries),
                });
            }
            match &action.duration {
                DurationFormula::Fixed { seconds } if !(*seconds >= 0.0 && seconds.is_finite()) => {
                    return Err(DomainError::Invalid {
                        name: action.name.clone(),
                        reason: format!("duration must be a finite, non-negative number, got {}", seconds),
                    });
                }
                DurationFormula::Distance {
                    speed: Quantity::Term(Term::Lit(speed)),
                    ..
                } if !speed.as_f64().is_some_and(|s| s > 0.0) => {
                    return Err(DomainError::Invalid {
                        name: action.name.clone(),
                        reason: format!("speed must be a positive number, got {}", speed),
                    });
                }
                _ => {}
            }
        }

        let mut methods = BTreeSet::new();
        for method in &self.methods {
            if !methods.insert(method.name.as_str()) {
                return Err(DomainError::DuplicateMethod(method.name.clone()));
            }
            if actions.contains(method.task.as_str()) {
                return Err(DomainError::AmbiguousTask(method.task.clone()));
            }
        }
        for method in &self.goal_methods {
            if !methods.insert(method.name.as_str()) {
                return Err(DomainError::DuplicateMethod(method.name.clone()));
            }
        }

        let bodies = self
            .methods
            .iter()
            .map(|m| (&m.name, &m.subtasks))
            .chain(self.goal_methods.iter().map(|m| (&m.name, &m.subtasks)));
        for (method, subtasks) in bodies {
            for subtask in subtasks {
                let Subtask::Invoke { task, args } = subtask else {
                    continue;
                };
                if let Some(action) = self.action(task) {
                    if action.params.len() != args.len() {
                        return Err(DomainError::ArityMismatch {
                            method: method.clone(),
                            task: task.clone(),
                            expected: action.params.len(),
                            given: args.len(),
                        });
                    }
                } else if let Some(target) = self.methods.iter().find(|m| &m.task == task) {
                    if target.params.len() != args.len() {
                        return Err(DomainError::ArityMismatch {
                            method: method.clone(),
                            task: task.clone(),
                            expected: target.params.len(),
                            given: args.len(),
                        });
                    }
                } else {
                    return Err(DomainError::UnknownTask {
                        method: method.clone(),
                        task: task.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A complete problem: domain, initial facts and goals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub domain: Domain,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub goals: Vec<Goal>,
}

impl Scenario {
    pub fn initial_state(&self) -> State {
        State::from_facts(self.facts.iter().cloned())
    }
}
