//! Simple Temporal Network
//!
//! Distance-graph representation with an all-pairs shortest-path matrix:
//! - Full Floyd–Warshall below a configurable time-point count
//! - Incremental relaxation restricted to affected rows/columns above it
//! - Atomic rejection of constraints that would close a negative cycle
//! - Owner-tagged constraints so a subtree's timing can be retracted

use super::{Bounds, OwnerId, TemporalEngine, TemporalError, TimePointId};
use crate::time::Seconds;
use serde::Serialize;
use tracing::debug;

const INF: i64 = Seconds::INFINITY.as_millis();

/// Default time-point count up to which full recomputation is used
pub const DEFAULT_FW_THRESHOLD: usize = 64;

/// A stored interval constraint `to - from ∈ [lower, upper]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Constraint {
    pub from: TimePointId,
    pub to: TimePointId,
    pub lower: Seconds,
    pub upper: Seconds,
    pub owner: Option<OwnerId>,
}

/// Snapshot used by the planner to undo speculative additions
#[derive(Debug, Clone)]
pub struct NetworkCheckpoint {
    points: usize,
    constraints: usize,
    dist: Vec<Vec<i64>>,
}

/// A solved assignment of one time per time point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    times: Vec<Seconds>,
}

impl Schedule {
    pub fn time_of(&self, tp: TimePointId) -> Option<Seconds> {
        self.times.get(tp.index()).copied()
    }

    /// Latest assigned time across all points
    pub fn makespan(&self) -> Seconds {
        self.times.iter().copied().max().unwrap_or(Seconds::ZERO)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Simple Temporal Network over fixed-point seconds.
///
/// Time point 0 is the zero reference and always exists.
#[derive(Debug, Clone)]
pub struct TemporalNetwork {
    constraints: Vec<Constraint>,
    /// `dist[i][j]` is the tightest known upper bound on `t_j - t_i`
    dist: Vec<Vec<i64>>,
    fw_threshold: usize,
    frozen: bool,
}

impl TemporalNetwork {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_FW_THRESHOLD)
    }

    /// Create with a custom full-recomputation threshold
    pub fn with_threshold(fw_threshold: usize) -> Self {
        Self {
            constraints: Vec::new(),
            dist: vec![vec![0]],
            fw_threshold,
            frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.dist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dist.len() <= 1
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn add_time_point(&mut self) -> TimePointId {
        let id = self.dist.len();
        for row in &mut self.dist {
            row.push(INF);
        }
        let mut row = vec![INF; id + 1];
        row[id] = 0;
        self.dist.push(row);
        TimePointId(id)
    }

    /// Add an unowned constraint
    pub fn add_constraint(
        &mut self,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    ) -> Result<(), TemporalError> {
        self.insert(from, to, lower, upper, None)
    }

    /// Add a constraint retractable through [`remove_constraints`](Self::remove_constraints)
    pub fn add_owned_constraint(
        &mut self,
        owner: OwnerId,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    ) -> Result<(), TemporalError> {
        self.insert(from, to, lower, upper, Some(owner))
    }

    fn insert(
        &mut self,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
        owner: Option<OwnerId>,
    ) -> Result<(), TemporalError> {
        if self.frozen {
            return Err(TemporalError::Frozen);
        }
        self.check_point(from)?;
        self.check_point(to)?;
        if lower.is_pos_infinite() || upper.is_neg_infinite() {
            return Err(TemporalError::InvalidBounds { lower, upper });
        }

        let inconsistent = TemporalError::Inconsistent { from, to, lower, upper };
        if lower > upper {
            return Err(inconsistent);
        }

        // A new negative cycle must pass through exactly one of the two new
        // edges (the cycle using both is `upper - lower`, covered above).
        let (f, t) = (from.index(), to.index());
        if upper.is_finite() && path_sum(self.dist[t][f], upper.as_millis()) < 0 {
            return Err(inconsistent);
        }
        if lower.is_finite() && path_sum(self.dist[f][t], -lower.as_millis()) < 0 {
            return Err(inconsistent);
        }

        self.constraints.push(Constraint { from, to, lower, upper, owner });

        if self.len() <= self.fw_threshold {
            self.recompute();
        } else {
            if upper.is_finite() {
                self.relax(f, t, upper.as_millis());
            }
            if lower.is_finite() {
                self.relax(t, f, -lower.as_millis());
            }
        }

        debug!("STN: {} -> {} in [{}, {}]", from, to, lower, upper);
        Ok(())
    }

    /// Retract every constraint tagged with `owner`; returns how many were removed
    pub fn remove_constraints(&mut self, owner: OwnerId) -> usize {
        let before = self.constraints.len();
        self.constraints.retain(|c| c.owner != Some(owner));
        let removed = before - self.constraints.len();
        if removed > 0 {
            self.rebuild();
            debug!("STN: retracted {} constraints owned by {}", removed, owner);
        }
        removed
    }

    pub fn is_consistent(&self) -> bool {
        self.dist.iter().enumerate().all(|(i, row)| row[i] >= 0)
    }

    /// Earliest and latest time of `tp` relative to the zero point
    pub fn bounds_of(&self, tp: TimePointId) -> Result<Bounds, TemporalError> {
        self.check_point(tp)?;
        let i = tp.index();
        Ok(Bounds {
            earliest: Seconds::from_millis(self.dist[i][0]).neg(),
            latest: Seconds::from_millis(self.dist[0][i]),
        })
    }

    /// Tightest known upper bound on `b - a`
    pub fn distance(&self, a: TimePointId, b: TimePointId) -> Result<Seconds, TemporalError> {
        self.check_point(a)?;
        self.check_point(b)?;
        Ok(Seconds::from_millis(self.dist[a.index()][b.index()]))
    }

    /// Whether the network entails `a <= b`
    pub fn precedes(&self, a: TimePointId, b: TimePointId) -> bool {
        match (self.dist.get(b.index()), self.dist.get(a.index())) {
            (Some(row), Some(_)) => row[a.index()] <= 0,
            _ => false,
        }
    }

    pub fn checkpoint(&self) -> NetworkCheckpoint {
        NetworkCheckpoint {
            points: self.dist.len(),
            constraints: self.constraints.len(),
            dist: self.dist.clone(),
        }
    }

    /// Restore a checkpoint taken on this network.
    ///
    /// Checkpoints nest: rolling back to one invalidates every later one.
    pub fn rollback(&mut self, cp: NetworkCheckpoint) {
        self.constraints.truncate(cp.constraints);
        self.dist = cp.dist;
        debug_assert_eq!(self.dist.len(), cp.points);
    }

    /// Solve and lock the network.
    ///
    /// Each point is pinned in id order to its earliest consistent time (or
    /// its latest, or zero when unbounded); pinning within the current bounds
    /// never introduces a negative cycle, so the result satisfies every
    /// constraint.
    pub fn freeze(&mut self) -> Result<Schedule, TemporalError> {
        if !self.is_consistent() {
            return Err(TemporalError::Unsolvable);
        }
        let mut work = self.clone();
        work.fw_threshold = 0;
        let mut times = Vec::with_capacity(self.len());
        times.push(Seconds::ZERO);
        for i in 1..work.len() {
            let earliest = -work.dist[i][0];
            let latest = work.dist[0][i];
            let value = if work.dist[i][0] < INF {
                earliest
            } else if latest < INF {
                latest
            } else {
                0
            };
            work.relax(0, i, value);
            work.relax(i, 0, -value);
            times.push(Seconds::from_millis(value));
        }
        self.frozen = true;
        Ok(Schedule { times })
    }

    /// Allow incremental changes again after [`freeze`](Self::freeze)
    pub fn reopen(&mut self) {
        self.frozen = false;
    }

    fn check_point(&self, tp: TimePointId) -> Result<(), TemporalError> {
        if tp.index() < self.dist.len() {
            Ok(())
        } else {
            Err(TemporalError::UnknownTimePoint(tp))
        }
    }

    /// Tighten `u -> v` to `w` and propagate through every pair whose
    /// shortest path can now route over the new edge.
    fn relax(&mut self, u: usize, v: usize, w: i64) {
        if w >= self.dist[u][v] {
            return;
        }
        let n = self.dist.len();
        let into_u: Vec<(usize, i64)> = (0..n)
            .filter_map(|i| {
                let d = self.dist[i][u];
                (d < INF).then_some((i, d))
            })
            .collect();
        let from_v: Vec<(usize, i64)> = (0..n)
            .filter_map(|j| {
                let d = self.dist[v][j];
                (d < INF).then_some((j, d))
            })
            .collect();

        for &(i, diu) in &into_u {
            let via = diu + w;
            let row = &mut self.dist[i];
            for &(j, dvj) in &from_v {
                let candidate = via + dvj;
                if candidate < row[j] {
                    row[j] = candidate;
                }
            }
        }
    }

    fn reset_distances(&mut self) {
        let n = self.dist.len();
        for (i, row) in self.dist.iter_mut().enumerate() {
            row.clear();
            row.resize(n, INF);
            row[i] = 0;
        }
    }

    fn rebuild(&mut self) {
        if self.len() <= self.fw_threshold {
            self.recompute();
            return;
        }
        self.reset_distances();
        let edges: Vec<(usize, usize, Seconds, Seconds)> = self
            .constraints
            .iter()
            .map(|c| (c.from.index(), c.to.index(), c.lower, c.upper))
            .collect();
        for (f, t, lower, upper) in edges {
            if upper.is_finite() {
                self.relax(f, t, upper.as_millis());
            }
            if lower.is_finite() {
                self.relax(t, f, -lower.as_millis());
            }
        }
    }

    /// Full Floyd–Warshall from the constraint list
    fn recompute(&mut self) {
        self.reset_distances();
        for c in &self.constraints {
            let (f, t) = (c.from.index(), c.to.index());
            if c.upper.is_finite() && c.upper.as_millis() < self.dist[f][t] {
                self.dist[f][t] = c.upper.as_millis();
            }
            if c.lower.is_finite() && -c.lower.as_millis() < self.dist[t][f] {
                self.dist[t][f] = -c.lower.as_millis();
            }
        }
        let n = self.dist.len();
        for k in 0..n {
            for i in 0..n {
                let dik = self.dist[i][k];
                if dik >= INF {
                    continue;
                }
                for j in 0..n {
                    let dkj = self.dist[k][j];
                    if dkj >= INF {
                        continue;
                    }
                    if dik + dkj < self.dist[i][j] {
                        self.dist[i][j] = dik + dkj;
                    }
                }
            }
        }
    }
}

impl Default for TemporalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalEngine for TemporalNetwork {
    fn add_time_point(&mut self) -> TimePointId {
        TemporalNetwork::add_time_point(self)
    }

    fn add_owned_constraint(
        &mut self,
        owner: OwnerId,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    ) -> Result<(), TemporalError> {
        TemporalNetwork::add_owned_constraint(self, owner, from, to, lower, upper)
    }

    fn add_constraint(
        &mut self,
        from: TimePointId,
        to: TimePointId,
        lower: Seconds,
        upper: Seconds,
    ) -> Result<(), TemporalError> {
        TemporalNetwork::add_constraint(self, from, to, lower, upper)
    }

    fn is_consistent(&self) -> bool {
        TemporalNetwork::is_consistent(self)
    }

    fn bounds_of(&self, tp: TimePointId) -> Result<Bounds, TemporalError> {
        TemporalNetwork::bounds_of(self, tp)
    }

    fn remove_constraints(&mut self, owner: OwnerId) -> usize {
        TemporalNetwork::remove_constraints(self, owner)
    }
}

fn path_sum(a: i64, b: i64) -> i64 {
    if a >= INF || b >= INF {
        INF
    } else {
        a + b
    }
}
