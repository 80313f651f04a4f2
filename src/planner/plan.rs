//! Plan Arena
//!
//! A plan is a forest of task nodes stored in a flat arena and addressed by
//! [`NodeId`]. Each node owns two time points in the plan's
//! [`TemporalNetwork`] and tags the constraints it contributes with its own
//! id, so a subtree's timing can be retracted without touching the rest.

use crate::domain::{Goal, TaskCall};
use crate::state::{Fact, Value};
use crate::temporal::{OwnerId, Schedule, TemporalError, TemporalNetwork, TimePointId, ZERO};
use crate::time::Seconds;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Index of a node in the plan arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Owner tag for this node's constraints
    pub fn owner(self) -> OwnerId {
        OwnerId(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Lifecycle of a task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    /// Goal or compound task with a chosen method
    Expanded,
    /// Primitive with a solved start time, waiting for predecessors
    Scheduled,
    Executing,
    Completed,
    Rejected,
    Cancelled,
    Failed,
}

impl NodeStatus {
    pub fn icon(self) -> &'static str {
        match self {
            NodeStatus::Pending => "○",
            NodeStatus::Expanded => "▸",
            NodeStatus::Scheduled => "◌",
            NodeStatus::Executing => "◎",
            NodeStatus::Completed => "●",
            NodeStatus::Rejected => "⊘",
            NodeStatus::Cancelled => "◇",
            NodeStatus::Failed => "✗",
        }
    }

    /// No further transitions happen from here
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Rejected | NodeStatus::Cancelled | NodeStatus::Failed
        )
    }

    /// Node was taken out of the plan and no longer orders anything
    pub fn is_retired(self) -> bool {
        matches!(self, NodeStatus::Rejected | NodeStatus::Cancelled)
    }
}

/// A fully bound action ready to become an intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundAction {
    pub name: String,
    pub args: Vec<Value>,
    pub agent: Option<String>,
    pub preconditions: Vec<Fact>,
    pub effects: Vec<Fact>,
    pub duration: Seconds,
    pub retries: u32,
}

impl fmt::Display for GroundAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{}({})", self.name, args.join(", "))
    }
}

/// What a node stands for
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Goal { goal: Goal, method: Option<String> },
    Compound { task: TaskCall, method: Option<String> },
    Primitive { action: GroundAction },
}

impl NodeKind {
    pub fn is_primitive(&self) -> bool {
        matches!(self, NodeKind::Primitive { .. })
    }

    pub fn action(&self) -> Option<&GroundAction> {
        match self {
            NodeKind::Primitive { action } => Some(action),
            _ => None,
        }
    }

    pub fn goal(&self) -> Option<&Goal> {
        match self {
            NodeKind::Goal { goal, .. } => Some(goal),
            _ => None,
        }
    }

    /// Signature used for blacklisting and logs
    pub fn signature(&self) -> String {
        match self {
            NodeKind::Goal { goal, .. } => goal.signature(),
            NodeKind::Compound { task, .. } => task.signature(),
            NodeKind::Primitive { action } => action.to_string(),
        }
    }

    fn set_method(&mut self, name: Option<String>) {
        match self {
            NodeKind::Goal { method, .. } | NodeKind::Compound { method, .. } => *method = name,
            NodeKind::Primitive { .. } => {}
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Goal { goal, method } => {
                write!(f, "achieve {}", goal)?;
                if let Some(m) = method {
                    write!(f, " via {}", m)?;
                }
                Ok(())
            }
            NodeKind::Compound { task, method } => {
                write!(f, "{}", task)?;
                if let Some(m) = method {
                    write!(f, " via {}", m)?;
                }
                Ok(())
            }
            NodeKind::Primitive { action } => write!(f, "{} {}", action, action.duration),
        }
    }
}

/// One node of the task tree
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub start: TimePointId,
    pub end: TimePointId,
    /// Intents issued for this node so far
    pub attempts: u32,
}

/// Marker for undoing speculative expansion
#[derive(Debug, Clone)]
pub struct PlanCheckpoint {
    nodes: usize,
    roots: usize,
    network: crate::temporal::NetworkCheckpoint,
}

/// A task forest with its temporal network
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    nodes: Vec<TaskNode>,
    roots: Vec<NodeId>,
    network: TemporalNetwork,
    schedule: Option<Schedule>,
}

impl Plan {
    pub fn new(network: TemporalNetwork) -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes: Vec::new(),
            roots: Vec::new(),
            network,
            schedule: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&TaskNode> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn network(&self) -> &TemporalNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut TemporalNetwork {
        &mut self.network
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn set_status(&mut self, id: NodeId, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.status = status;
        }
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.node(id).map(|n| n.status)
    }

    pub fn set_method(&mut self, id: NodeId, method: Option<String>) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.kind.set_method(method);
        }
    }

    /// Add a top-level node.
    ///
    /// `after` lists time points the node must start after; `deadline`
    /// bounds its end relative to plan start.
    pub fn add_root(
        &mut self,
        kind: NodeKind,
        after: &[TimePointId],
        deadline: Option<Seconds>,
    ) -> Result<NodeId, TemporalError> {
        let id = self.push(None, kind);
        self.roots.push(id);
        self.link(id, after)?;
        if let Some(deadline) = deadline {
            let end = self.nodes[id.0].end;
            self.network
                .add_owned_constraint(id.owner(), ZERO, end, Seconds::ZERO, deadline)?;
        }
        Ok(id)
    }

    /// Add a node under `parent`, nested inside its interval
    pub fn add_child(&mut self, parent: NodeId, kind: NodeKind, after: &[TimePointId]) -> Result<NodeId, TemporalError> {
        let id = self.push(Some(parent), kind);
        self.link(id, after)?;

        let (start, end) = (self.nodes[id.0].start, self.nodes[id.0].end);
        let (parent_start, parent_end) = (self.nodes[parent.0].start, self.nodes[parent.0].end);
        self.network
            .add_owned_constraint(id.owner(), parent_start, start, Seconds::ZERO, Seconds::INFINITY)?;
        self.network
            .add_owned_constraint(id.owner(), end, parent_end, Seconds::ZERO, Seconds::INFINITY)?;
        Ok(id)
    }

    fn push(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        let start = self.network.add_time_point();
        let end = self.network.add_time_point();
        self.nodes.push(TaskNode {
            id,
            parent,
            children: Vec::new(),
            kind,
            status: NodeStatus::Pending,
            start,
            end,
            attempts: 0,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    fn link(&mut self, id: NodeId, after: &[TimePointId]) -> Result<(), TemporalError> {
        let node = &self.nodes[id.0];
        let (start, end, owner) = (node.start, node.end, id.owner());
        let (lower, upper) = match node.kind.action() {
            Some(action) => (action.duration, action.duration),
            None => (Seconds::ZERO, Seconds::INFINITY),
        };
        self.network
            .add_owned_constraint(owner, ZERO, start, Seconds::ZERO, Seconds::INFINITY)?;
        self.network.add_owned_constraint(owner, start, end, lower, upper)?;
        for &tp in after {
            self.network
                .add_owned_constraint(owner, tp, start, Seconds::ZERO, Seconds::INFINITY)?;
        }
        Ok(())
    }

    /// Snapshot of the arena and network before a choice point
    pub fn checkpoint(&self) -> PlanCheckpoint {
        PlanCheckpoint {
            nodes: self.nodes.len(),
            roots: self.roots.len(),
            network: self.network.checkpoint(),
        }
    }

    /// Drop every node and constraint added since `cp`.
    ///
    /// Later choices may have attached children to any surviving node, so
    /// every child list is cut back, not only the one being expanded.
    pub fn rollback(&mut self, cp: PlanCheckpoint) {
        self.nodes.truncate(cp.nodes);
        self.roots.truncate(cp.roots);
        for node in &mut self.nodes {
            let keep = node.children.partition_point(|c| c.0 < cp.nodes);
            node.children.truncate(keep);
        }
        self.network.rollback(cp.network);
    }

    /// All descendants of `id` in depth-first order, excluding `id`
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).map(|n| n.children.iter().rev().copied().collect()).unwrap_or_default();
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.node(next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Nearest node at or above `id` that can be re-decomposed
    pub fn repair_target(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.node(current)?;
            if !node.kind.is_primitive() {
                return Some(current);
            }
            cursor = node.parent;
        }
        None
    }

    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cursor = self.node(id).and_then(|n| n.parent);
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.node(parent).and_then(|n| n.parent);
        }
        depth
    }

    /// End points of completed primitives under `id`
    pub fn completed_ends(&self, id: NodeId) -> Vec<TimePointId> {
        self.subtree(id)
            .into_iter()
            .filter_map(|n| self.node(n))
            .filter(|n| n.kind.is_primitive() && n.status == NodeStatus::Completed)
            .map(|n| n.end)
            .collect()
    }

    pub fn primitives(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter().filter(|n| n.kind.is_primitive())
    }

    /// Solve the network and lock it for execution
    pub fn freeze(&mut self) -> Result<&Schedule, TemporalError> {
        let schedule = self.network.freeze()?;
        let schedule = self.schedule.insert(schedule);
        Ok(&*schedule)
    }

    /// Unlock the network for repair
    pub fn reopen(&mut self) {
        self.network.reopen();
    }

    /// Start and end time of `id`: solved times when frozen, else earliest bounds
    pub fn times_of(&self, id: NodeId) -> Option<(Seconds, Seconds)> {
        let node = self.node(id)?;
        if let Some(schedule) = &self.schedule {
            if let (Some(s), Some(e)) = (schedule.time_of(node.start), schedule.time_of(node.end)) {
                return Some((s, e));
            }
        }
        let start = self.network.bounds_of(node.start).ok()?.earliest;
        let end = self.network.bounds_of(node.end).ok()?.earliest;
        Some((start, end))
    }

    /// Whether `a` must finish before `b` starts
    pub fn precedes(&self, a: NodeId, b: NodeId) -> bool {
        match (self.node(a), self.node(b)) {
            (Some(a), Some(b)) => self.network.precedes(a.end, b.start),
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.roots.iter().all(|r| self.status(*r) == Some(NodeStatus::Completed))
    }

    /// Fraction of live primitives completed (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        let live: Vec<&TaskNode> = self.primitives().filter(|n| !n.status.is_retired()).collect();
        if live.is_empty() {
            return 0.0;
        }
        let completed = live.iter().filter(|n| n.status == NodeStatus::Completed).count();
        completed as f64 / live.len() as f64
    }

    /// Longest solved end time
    pub fn makespan(&self) -> Seconds {
        self.schedule.as_ref().map(|s| s.makespan()).unwrap_or(Seconds::ZERO)
    }

    /// Structural fingerprint: node kinds, parents and times, without ids
    pub fn outline(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| {
                let (start, end) = self.times_of(n.id).unwrap_or_default();
                format!(
                    "{}|{}|{}|{}",
                    n.parent.map(|p| p.0.to_string()).unwrap_or_default(),
                    n.kind,
                    start,
                    end
                )
            })
            .collect()
    }

    /// Format the task tree for display
    pub fn render(&self) -> String {
        let mut s = format!("Plan {}\n", self.id);
        for root in &self.roots {
            self.render_node(*root, 0, &mut s);
        }
        s.push_str(&format!(
            "\nProgress: {:.0}%  Makespan: {}\n",
            self.progress() * 100.0,
            self.makespan()
        ));
        s
    }

    fn render_node(&self, id: NodeId, indent: usize, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        let times = self
            .times_of(id)
            .map(|(s, e)| format!(" [{} → {}]", s, e))
            .unwrap_or_default();
        out.push_str(&format!(
            "{}{} {} {}{}\n",
            "  ".repeat(indent),
            node.status.icon(),
            node.id,
            node.kind,
            times
        ));
        for child in &node.children {
            self.render_node(*child, indent + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primitive(name: &str, secs: i64) -> NodeKind {
        NodeKind::Primitive {
            action: GroundAction {
                name: name.to_string(),
                args: vec![],
                agent: None,
                preconditions: vec![],
                effects: vec![],
                duration: Seconds::from_secs(secs),
                retries: 0,
            },
        }
    }

    fn goal() -> NodeKind {
        NodeKind::Goal {
            goal: Goal::new("door", "open", true),
            method: None,
        }
    }

    #[test]
    fn test_children_nest_in_parent() {
        let mut plan = Plan::new(TemporalNetwork::new());
        let root = plan.add_root(goal(), &[], None).unwrap();
        let a = plan.add_child(root, primitive("a", 2), &[]).unwrap();
        let a_end = plan.node(a).unwrap().end;
        let b = plan.add_child(root, primitive("b", 3), &[a_end]).unwrap();

        assert!(plan.precedes(a, b));
        assert!(!plan.precedes(b, a));

        let root_end = plan.node(root).unwrap().end;
        assert_eq!(plan.network().bounds_of(root_end).unwrap().earliest, Seconds::from_secs(5));
        assert_eq!(plan.subtree(root), vec![a, b]);
        assert_eq!(plan.repair_target(b), Some(root));
    }

    #[test]
    fn test_deadline_rejects_long_child() {
        let mut plan = Plan::new(TemporalNetwork::new());
        let root = plan.add_root(goal(), &[], Some(Seconds::from_secs(5))).unwrap();
        let cp = plan.checkpoint();

        let err = plan.add_child(root, primitive("drive", 10), &[]).unwrap_err();
        assert!(matches!(err, TemporalError::Inconsistent { .. }));

        plan.rollback(cp);
        assert_eq!(plan.len(), 1);
        assert!(plan.node(root).unwrap().children.is_empty());
        assert!(plan.add_child(root, primitive("walk", 4), &[]).is_ok());
    }

    #[test]
    fn test_freeze_and_render() {
        let mut plan = Plan::new(TemporalNetwork::new());
        let root = plan.add_root(goal(), &[], None).unwrap();
        let a = plan.add_child(root, primitive("a", 2), &[]).unwrap();
        plan.freeze().unwrap();

        assert_eq!(plan.times_of(a), Some((Seconds::ZERO, Seconds::from_secs(2))));
        assert_eq!(plan.makespan(), Seconds::from_secs(2));

        plan.set_status(a, NodeStatus::Completed);
        let text = plan.render();
        assert!(text.contains("● n1 a() 2s"));
        assert!(text.contains("Progress: 100%"));
    }
}
