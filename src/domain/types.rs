//! Domain Definition Types
//!
//! Declarative actions, methods and goal-methods. Any text term that starts
//! with `?` is a variable; everything else is a literal [`Value`].

use crate::state::{Fact, State, Value};
use crate::time::Seconds;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Variable bindings produced while grounding a definition
pub type Bindings = BTreeMap<String, Value>;

/// A variable or literal in a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Term {
    Var(String),
    Lit(Value),
}

impl Term {
    pub fn var(name: &str) -> Self {
        Term::Var(name.trim_start_matches('?').to_string())
    }

    /// Look the term up in `bindings`; literals resolve to themselves
    pub fn resolve(&self, bindings: &Bindings) -> Option<Value> {
        match self {
            Term::Var(name) => bindings.get(name).cloned(),
            Term::Lit(value) => Some(value.clone()),
        }
    }

    pub fn variable(&self) -> Option<&str> {
        match self {
            Term::Var(name) => Some(name),
            Term::Lit(_) => None,
        }
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        match value {
            Value::Text(s) if s.starts_with('?') => Term::Var(s[1..].to_string()),
            other => Term::Lit(other),
        }
    }
}

impl From<Term> for Value {
    fn from(term: Term) -> Self {
        match term {
            Term::Var(name) => Value::Text(format!("?{}", name)),
            Term::Lit(value) => value,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) => write!(f, "?{}", name),
            Term::Lit(value) => write!(f, "{}", value),
        }
    }
}

/// A fact template used for preconditions, effects and subgoals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub subject: Term,
    pub predicate: String,
    pub value: Term,
}

impl Pattern {
    /// Ground into a fact; fails on an unbound variable
    pub fn ground(&self, bindings: &Bindings) -> Result<Fact, String> {
        let subject = self
            .subject
            .resolve(bindings)
            .ok_or_else(|| format!("unbound subject {} in {}", self.subject, self))?;
        let value = self
            .value
            .resolve(bindings)
            .ok_or_else(|| format!("unbound value {} in {}", self.value, self))?;
        Ok(Fact {
            subject: subject.to_string(),
            predicate: self.predicate.clone(),
            value,
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.subject, self.predicate, self.value)
    }
}

/// Extend `bindings` so that every pattern holds in `state`.
///
/// Subjects must already be bound; an unbound value variable is bound to
/// whatever the state records for that key. Returns `Err` naming the first
/// pattern that does not hold.
pub fn match_patterns(patterns: &[Pattern], bindings: &Bindings, state: &State) -> Result<Bindings, String> {
    let mut bound = bindings.clone();
    for pattern in patterns {
        let subject = pattern
            .subject
            .resolve(&bound)
            .ok_or_else(|| format!("unbound subject {} in {}", pattern.subject, pattern))?
            .to_string();
        let actual = state.get(&subject, &pattern.predicate);

        match (pattern.value.resolve(&bound), actual) {
            (Some(expected), Some(found)) if found.matches(&expected) => {}
            (Some(expected), Some(found)) => {
                return Err(format!(
                    "{}.{} is {} (expected {})",
                    subject, pattern.predicate, found, expected
                ))
            }
            (Some(expected), None) => {
                return Err(format!("{}.{} is unknown (expected {})", subject, pattern.predicate, expected))
            }
            (None, Some(found)) => {
                if let Some(name) = pattern.value.variable() {
                    bound.insert(name.to_string(), found.clone());
                }
            }
            (None, None) => return Err(format!("{}.{} is unknown", subject, pattern.predicate)),
        }
    }
    Ok(bound)
}

/// Numeric operand: a term, or a fact looked up in the current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Fact { subject: Term, predicate: String },
    Term(Term),
}

impl Quantity {
    fn evaluate(&self, bindings: &Bindings, state: &State) -> Result<f64, String> {
        let value = match self {
            Quantity::Fact { subject, predicate } => {
                let subject = subject
                    .resolve(bindings)
                    .ok_or_else(|| format!("unbound subject {}", subject))?
                    .to_string();
                state
                    .get(&subject, predicate)
                    .cloned()
                    .ok_or_else(|| format!("{}.{} is unknown", subject, predicate))?
            }
            Quantity::Term(term) => term.resolve(bindings).ok_or_else(|| format!("unbound {}", term))?,
        };
        value.as_f64().ok_or_else(|| format!("{} is not a number", value))
    }
}

/// How an action's duration is computed, always normalized to seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DurationFormula {
    Fixed { seconds: f64 },
    /// Travel time: distance between two positions over a speed
    Distance { from: Term, to: Term, speed: Quantity },
}

impl Default for DurationFormula {
    fn default() -> Self {
        DurationFormula::Fixed { seconds: 0.0 }
    }
}

impl DurationFormula {
    pub fn evaluate(&self, bindings: &Bindings, state: &State) -> Result<Seconds, String> {
        let secs = match self {
            DurationFormula::Fixed { seconds } => *seconds,
            DurationFormula::Distance { from, to, speed } => {
                let from = from.resolve(bindings).ok_or_else(|| format!("unbound {}", from))?;
                let to = to.resolve(bindings).ok_or_else(|| format!("unbound {}", to))?;
                let distance = from
                    .distance(&to)
                    .ok_or_else(|| format!("no distance between {} and {}", from, to))?;
                let speed = speed.evaluate(bindings, state)?;
                if speed <= 0.0 {
                    return Err(format!("speed must be positive, got {}", speed));
                }
                distance / speed
            }
        };
        if secs < 0.0 {
            return Err(format!("negative duration {}", secs));
        }
        Seconds::try_from_secs_f64(secs).ok_or_else(|| format!("unrepresentable duration {}", secs))
    }
}

/// A primitive, directly executable action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    /// Agent that carries the action out
    #[serde(default)]
    pub agent: Option<Term>,
    #[serde(default)]
    pub preconditions: Vec<Pattern>,
    #[serde(default)]
    pub effects: Vec<Pattern>,
    #[serde(default)]
    pub duration: DurationFormula,
    /// Re-issues allowed after a `Failed` outcome
    #[serde(default)]
    pub retries: u32,
}

impl ActionDef {
    pub fn bind(&self, args: &[Value]) -> Result<Bindings, String> {
        bind_params(&self.name, &self.params, args)
    }
}

/// Whether subtasks run one after another or may overlap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    #[default]
    Sequential,
    Parallel,
}

/// One entry in a method body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subtask {
    /// Reach a predicate value (becomes a goal node)
    Achieve { achieve: Pattern },
    /// Run an action or compound task
    Invoke {
        task: String,
        #[serde(default)]
        args: Vec<Term>,
    },
}

/// Decomposition of a compound task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub params: Vec<String>,
    /// Lower values are tried first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub preconditions: Vec<Pattern>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub ordering: Ordering,
}

impl MethodDef {
    pub fn bind(&self, args: &[Value]) -> Result<Bindings, String> {
        bind_params(&self.name, &self.params, args)
    }
}

/// Decomposition of a goal `subject.predicate = value`.
///
/// `?subject` and `?value` are bound to the goal before preconditions run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalMethodDef {
    pub name: String,
    pub predicate: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub preconditions: Vec<Pattern>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub ordering: Ordering,
}

impl GoalMethodDef {
    pub fn bind(&self, goal: &Goal) -> Bindings {
        let mut bindings = Bindings::new();
        bindings.insert("subject".to_string(), Value::Text(goal.subject.clone()));
        bindings.insert("value".to_string(), goal.value.clone());
        bindings
    }
}

/// Desired predicate value, optionally with a deadline in seconds from plan start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub subject: String,
    pub predicate: String,
    pub value: Value,
    #[serde(default)]
    pub deadline: Option<f64>,
}

impl Goal {
    pub fn new(subject: &str, predicate: &str, value: impl Into<Value>) -> Self {
        Self {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            value: value.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, seconds: f64) -> Self {
        self.deadline = Some(seconds);
        self
    }

    pub fn is_satisfied(&self, state: &State) -> bool {
        state.holds(&self.subject, &self.predicate, &self.value)
    }

    pub fn signature(&self) -> String {
        format!("achieve({}.{}={})", self.subject, self.predicate, self.value)
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.subject, self.predicate, self.value)
    }
}

/// A task name applied to ground arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCall {
    pub name: String,
    pub args: Vec<Value>,
}

impl TaskCall {
    pub fn signature(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TaskCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{}({})", self.name, args.join(", "))
    }
}

fn bind_params(name: &str, params: &[String], args: &[Value]) -> Result<Bindings, String> {
    if params.len() != args.len() {
        return Err(format!("{} expects {} arguments, got {}", name, params.len(), args.len()));
    }
    Ok(params
        .iter()
        .map(|p| p.trim_start_matches('?').to_string())
        .zip(args.iter().cloned())
        .collect())
}
