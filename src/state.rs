//! Versioned Fact Store
//!
//! Immutable subject-predicate-value snapshots plus a store holding the
//! single "current" pointer:
//! - Every mutation yields a new [`State`] with a fresh version
//! - Snapshots share their fact map until written
//! - The store keeps a bounded history for rollback

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MAX_HISTORY: usize = 32;
const NUMBER_EPSILON: f64 = 1e-9;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// A fact value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    /// Coordinates such as a position `{2,0}`
    Vector(Vec<f64>),
}

impl Value {
    /// Feed a variant tag and the exact value to `hasher`; `1`, `"1"` and
    /// `true` must not collide
    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            Value::Bool(b) => {
                hasher.update([b'b', u8::from(*b)]);
            }
            Value::Number(n) => {
                hasher.update([b'n']);
                hasher.update(canonical(*n).to_bits().to_le_bytes());
            }
            Value::Text(t) => {
                hasher.update([b's']);
                hash_text(hasher, t);
            }
            Value::Vector(v) => {
                hasher.update([b'v']);
                hasher.update((v.len() as u64).to_le_bytes());
                for x in v {
                    hasher.update(canonical(*x).to_bits().to_le_bytes());
                }
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Euclidean distance between two vectors, or absolute difference of numbers
    pub fn distance(&self, other: &Value) -> Option<f64> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Some((a - b).abs()),
            (Value::Vector(a), Value::Vector(b)) if a.len() == b.len() => {
                Some(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt())
            }
            _ => None,
        }
    }

    /// Equality with a tolerance for floating point components
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() < NUMBER_EPSILON,
            (Value::Vector(a), Value::Vector(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < NUMBER_EPSILON)
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

/// Key of a fact: at most one value per (subject, predicate)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactKey {
    pub subject: String,
    pub predicate: String,
}

impl FactKey {
    pub fn new(subject: &str, predicate: &str) -> Self {
        Self {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subject, self.predicate)
    }
}

/// A (subject, predicate, value) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub subject: String,
    pub predicate: String,
    pub value: Value,
}

impl Fact {
    pub fn new(subject: &str, predicate: &str, value: impl Into<Value>) -> Self {
        Self {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> FactKey {
        FactKey::new(&self.subject, &self.predicate)
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.subject, self.predicate, self.value)
    }
}

/// One immutable version of the world
#[derive(Debug, Clone)]
pub struct State {
    version: u64,
    facts: Arc<BTreeMap<FactKey, Value>>,
}

impl State {
    pub fn new() -> Self {
        Self {
            version: next_version(),
            facts: Arc::new(BTreeMap::new()),
        }
    }

    pub fn from_facts(facts: impl IntoIterator<Item = Fact>) -> Self {
        Self::new().with_facts(facts)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, subject: &str, predicate: &str) -> Option<&Value> {
        self.facts.get(&FactKey::new(subject, predicate))
    }

    /// Whether `subject.predicate` currently equals `value`
    pub fn holds(&self, subject: &str, predicate: &str, value: &Value) -> bool {
        self.get(subject, predicate).map(|v| v.matches(value)).unwrap_or(false)
    }

    /// Whether any fact is recorded about `subject`
    pub fn knows(&self, subject: &str) -> bool {
        self.facts.keys().any(|k| k.subject == subject)
    }

    pub fn with_fact(&self, subject: &str, predicate: &str, value: impl Into<Value>) -> State {
        self.with_facts([Fact::new(subject, predicate, value)])
    }

    /// Apply several facts as a single new version
    pub fn with_facts(&self, facts: impl IntoIterator<Item = Fact>) -> State {
        let mut map = (*self.facts).clone();
        for fact in facts {
            map.insert(FactKey::new(&fact.subject, &fact.predicate), fact.value);
        }
        State {
            version: next_version(),
            facts: Arc::new(map),
        }
    }

    pub fn without_fact(&self, subject: &str, predicate: &str) -> State {
        let mut map = (*self.facts).clone();
        map.remove(&FactKey::new(subject, predicate));
        State {
            version: next_version(),
            facts: Arc::new(map),
        }
    }

    pub fn facts(&self) -> impl Iterator<Item = Fact> + '_ {
        self.facts.iter().map(|(k, v)| Fact {
            subject: k.subject.clone(),
            predicate: k.predicate.clone(),
            value: v.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Keys whose value differs between `self` and `other` (including absent ones)
    pub fn diff(&self, other: &State) -> BTreeSet<FactKey> {
        diff(self, other)
    }

    /// Content hash of the fact set, independent of version
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.facts.iter() {
            hash_text(&mut hasher, &key.subject);
            hash_text(&mut hasher, &key.predicate);
            value.hash_into(&mut hasher);
        }
        hex::encode(hasher.finalize())
    }
}

/// `-0.0` and `0.0` compare equal, so they hash equal
fn canonical(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x
    }
}

/// Length-prefixed so adjacent strings cannot run into each other
fn hash_text(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Same facts, regardless of version
impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.facts, &other.facts) || self.facts == other.facts
    }
}

/// Keys changed between two versions
pub fn diff(a: &State, b: &State) -> BTreeSet<FactKey> {
    let mut changed = BTreeSet::new();
    for (key, value) in a.facts.iter() {
        match b.facts.get(key) {
            Some(other) if other.matches(value) => {}
            _ => {
                changed.insert(key.clone());
            }
        }
    }
    for key in b.facts.keys() {
        if !a.facts.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed
}

/// Error when a commit races with another writer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("state version conflict: expected {expected}, current is {actual}")]
pub struct StateConflict {
    pub expected: u64,
    pub actual: u64,
}

/// Holder of the current State version.
///
/// Readers take cheap snapshots; the coordinator is the only writer and
/// commits with a compare-and-swap on the version it read.
pub struct StateStore {
    current: RwLock<State>,
    history: Mutex<VecDeque<State>>,
    max_history: usize,
}

impl StateStore {
    pub fn new(initial: State) -> Self {
        Self::with_history(initial, DEFAULT_MAX_HISTORY)
    }

    pub fn with_history(initial: State, max_history: usize) -> Self {
        Self {
            current: RwLock::new(initial),
            history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    pub fn snapshot(&self) -> State {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Replace the current version if it is still `expected`
    pub fn commit(&self, expected: u64, next: State) -> Result<(), StateConflict> {
        let mut current = self.current.write();
        if current.version() != expected {
            return Err(StateConflict {
                expected,
                actual: current.version(),
            });
        }
        let previous = std::mem::replace(&mut *current, next);
        debug!("State: v{} -> v{}", previous.version(), current.version());

        let mut history = self.history.lock();
        history.push_back(previous);
        while history.len() > self.max_history {
            history.pop_front();
        }
        Ok(())
    }

    /// Restore a retained version; later versions are discarded
    pub fn rollback_to(&self, version: u64) -> Option<State> {
        let mut history = self.history.lock();
        let pos = history.iter().position(|s| s.version() == version)?;
        let restored = history[pos].clone();
        history.truncate(pos);
        *self.current.write() = restored.clone();
        Some(restored)
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_fact_leaves_original() {
        let s0 = State::new().with_fact("Alex", "at", vec![2.0, 0.0]);
        let s1 = s0.with_fact("Alex", "at", vec![8.0, 0.0]);

        assert!(s0.holds("Alex", "at", &Value::Vector(vec![2.0, 0.0])));
        assert!(s1.holds("Alex", "at", &Value::Vector(vec![8.0, 0.0])));
        assert_ne!(s0.version(), s1.version());
    }

    #[test]
    fn test_diff() {
        let a = State::new().with_fact("door", "open", false).with_fact("Alex", "speed", 4.0);
        let b = a.with_fact("door", "open", true).with_fact("box", "at", "shelf");

        let changed = diff(&a, &b);
        assert_eq!(changed.len(), 2);
        assert!(changed.contains(&FactKey::new("door", "open")));
        assert!(changed.contains(&FactKey::new("box", "at")));
        assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn test_signature_ignores_version_and_order() {
        let a = State::new().with_fact("x", "p", 1.0).with_fact("y", "p", 2.0);
        let b = State::new().with_fact("y", "p", 2.0).with_fact("x", "p", 1.0);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), a.with_fact("x", "p", 3.0).signature());
    }

    #[test]
    fn test_signature_tells_value_kinds_apart() {
        let base = State::new();
        let signatures: Vec<String> = [
            Value::Number(1.0),
            Value::from("1"),
            Value::Bool(true),
            Value::from("true"),
            Value::Vector(vec![1.0]),
        ]
        .into_iter()
        .map(|v| base.with_fact("lamp", "level", v).signature())
        .collect();

        for (i, a) in signatures.iter().enumerate() {
            for b in &signatures[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(
            base.with_fact("x", "p", 0.0).signature(),
            base.with_fact("x", "p", -0.0).signature()
        );
    }

    #[test]
    fn test_vector_distance() {
        let from = Value::Vector(vec![2.0, 0.0]);
        let to = Value::Vector(vec![8.0, 0.0]);
        assert_eq!(from.distance(&to), Some(6.0));
        assert_eq!(from.distance(&Value::from("kitchen")), None);
    }

    #[test]
    fn test_store_commit_conflict() {
        let store = StateStore::new(State::new());
        let base = store.snapshot();
        let next = base.with_fact("a", "b", true);
        store.commit(base.version(), next.clone()).unwrap();

        let stale = base.with_fact("a", "b", false);
        let err = store.commit(base.version(), stale).unwrap_err();
        assert_eq!(err.actual, next.version());
    }

    #[test]
    fn test_store_rollback() {
        let store = StateStore::new(State::new());
        let v0 = store.snapshot();
        store.commit(v0.version(), v0.with_fact("a", "b", 1.0)).unwrap();
        let v1 = store.snapshot();
        store.commit(v1.version(), v1.with_fact("a", "b", 2.0)).unwrap();

        let restored = store.rollback_to(v1.version()).unwrap();
        assert_eq!(restored.get("a", "b"), Some(&Value::Number(1.0)));
        assert_eq!(store.version(), v1.version());
        assert_eq!(store.history_len(), 1);
    }
}
