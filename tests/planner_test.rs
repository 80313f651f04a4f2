//! HTN planner integration tests against the courier scenario
//!
//! Run with: cargo test --test planner_test

use hybrid_planner::planner::NodeKind;
use hybrid_planner::{Goal, HtnPlanner, NodeStatus, Planner, Scenario, ScenarioLoader, Seconds, Value};
use std::path::PathBuf;
use std::sync::Arc;

fn secs(s: f64) -> Seconds {
    Seconds::try_from_secs_f64(s).unwrap()
}

async fn courier() -> Scenario {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/courier.toml");
    ScenarioLoader::load(&path).await.unwrap()
}

fn is_move_to(kind: &NodeKind, x: f64) -> bool {
    matches!(kind.action(), Some(a) if a.name == "move" && a.args.get(1) == Some(&Value::Vector(vec![x, 0.0])))
}

#[tokio::test]
async fn test_move_duration_from_distance_and_speed() {
    let scenario = courier().await;
    let mut planner = HtnPlanner::new(Arc::new(scenario.domain.clone()));
    let mut plan = planner.decompose(&scenario.initial_state(), &scenario.goals).unwrap();
    plan.freeze().unwrap();

    // {2,0} -> {8,0} at speed 4
    let carry = plan.primitives().find(|n| is_move_to(&n.kind, 8.0)).unwrap();
    let (start, end) = plan.times_of(carry.id).unwrap();
    assert_eq!(start, secs(1.0));
    assert_eq!(end, secs(2.5));

    let order: Vec<String> = plan
        .primitives()
        .map(|n| n.kind.action().map(|a| a.name.clone()).unwrap_or_default())
        .collect();
    assert_eq!(order, vec!["move", "pickup", "move", "drop", "move"]);
    assert_eq!(plan.makespan(), secs(5.0));
    assert!(plan.render().contains("move(Alex, {8,0})"));
}

#[tokio::test]
async fn test_same_inputs_same_plan() {
    let scenario = courier().await;
    let domain = Arc::new(scenario.domain.clone());
    let state = scenario.initial_state();

    let mut first = HtnPlanner::new(domain.clone()).decompose(&state, &scenario.goals).unwrap();
    let mut second = HtnPlanner::new(domain).decompose(&state, &scenario.goals).unwrap();
    first.freeze().unwrap();
    second.freeze().unwrap();
    assert_eq!(first.outline(), second.outline());
}

#[tokio::test]
async fn test_deadline_too_tight() {
    let scenario = courier().await;
    let mut planner = HtnPlanner::new(Arc::new(scenario.domain.clone()));
    let goal = Goal::new("parcel", "at", vec![8.0, 0.0]).with_deadline(2.0);

    let err = planner.decompose(&scenario.initial_state(), &[goal]).unwrap_err();
    assert_eq!(err.goal, "parcel.at={8,0}");
}

#[tokio::test]
async fn test_no_method_for_immobile_subject() {
    let scenario = courier().await;
    let mut planner = HtnPlanner::new(Arc::new(scenario.domain.clone()));
    let state = scenario.initial_state().without_fact("parcel", "carrier");

    let err = planner
        .decompose(&state, &[Goal::new("parcel", "at", vec![8.0, 0.0])])
        .unwrap_err();
    assert!(err.reason.contains("deliver"), "{}", err.reason);
}

#[tokio::test]
async fn test_repair_keeps_completed_work() {
    let scenario = courier().await;
    let mut planner = HtnPlanner::new(Arc::new(scenario.domain.clone()));
    let mut plan = planner
        .decompose(&scenario.initial_state(), &scenario.goals[..1])
        .unwrap();
    plan.freeze().unwrap();
    let root = plan.roots()[0];

    // First leg done; then someone moves the parcel to {4,0}
    let fetch = plan.primitives().find(|n| is_move_to(&n.kind, 2.0)).unwrap().id;
    let fetch_goal = plan.node(fetch).and_then(|n| n.parent).unwrap();
    plan.set_status(fetch, NodeStatus::Completed);
    plan.set_status(fetch_goal, NodeStatus::Completed);
    for id in plan.subtree(root) {
        if plan.status(id) != Some(NodeStatus::Completed) {
            plan.set_status(id, NodeStatus::Cancelled);
            plan.network_mut().remove_constraints(id.owner());
        }
    }

    let state = scenario
        .initial_state()
        .with_fact("Alex", "at", vec![2.0, 0.0])
        .with_fact("parcel", "at", vec![4.0, 0.0]);
    planner.repair(&mut plan, root, &state).unwrap();
    plan.freeze().unwrap();

    assert_eq!(plan.status(fetch), Some(NodeStatus::Completed));
    let detour = plan
        .primitives()
        .find(|n| n.status == NodeStatus::Pending && is_move_to(&n.kind, 4.0))
        .unwrap();
    let (start, end) = plan.times_of(detour.id).unwrap();
    assert!(start >= plan.times_of(fetch).unwrap().1);
    assert_eq!(end.as_millis() - start.as_millis(), 500);

    let live = plan
        .primitives()
        .filter(|n| n.status == NodeStatus::Pending)
        .count();
    assert_eq!(live, 4);
}
