//! Temporal network integration tests
//!
//! Run with: cargo test --test temporal_test

use hybrid_planner::temporal::{OwnerId, TemporalError, TemporalNetwork, TimePointId, ZERO};
use hybrid_planner::Seconds;

fn secs(s: f64) -> Seconds {
    Seconds::try_from_secs_f64(s).unwrap()
}

#[test]
fn test_conflicting_duration_leaves_network_unchanged() {
    let mut stn = TemporalNetwork::new();
    let a = stn.add_time_point();
    let b = stn.add_time_point();
    stn.add_constraint(a, b, secs(2.0), secs(2.0)).unwrap();

    let err = stn.add_constraint(a, b, secs(5.0), secs(5.0)).unwrap_err();
    assert!(matches!(err, TemporalError::Inconsistent { .. }));
    assert!(stn.is_consistent());
    assert_eq!(stn.distance(a, b).unwrap(), secs(2.0));
    assert_eq!(stn.distance(b, a).unwrap(), secs(-2.0));
    assert_eq!(stn.constraints().len(), 1);
}

#[test]
fn test_unknown_time_point() {
    let mut stn = TemporalNetwork::new();
    let ghost = TimePointId(42);
    assert_eq!(
        stn.add_constraint(ZERO, ghost, Seconds::ZERO, secs(1.0)),
        Err(TemporalError::UnknownTimePoint(ghost))
    );
    assert!(stn.bounds_of(ghost).is_err());
}

/// A small job-shop: two machines, three jobs, a shared deadline
fn job_shop(threshold: usize) -> (TemporalNetwork, Vec<(TimePointId, TimePointId)>) {
    let mut stn = TemporalNetwork::with_threshold(threshold);
    let durations = [1.5, 2.0, 0.5];
    let mut jobs = Vec::new();
    for d in durations {
        let start = stn.add_time_point();
        let end = stn.add_time_point();
        stn.add_constraint(ZERO, start, Seconds::ZERO, Seconds::INFINITY).unwrap();
        stn.add_constraint(start, end, secs(d), secs(d)).unwrap();
        stn.add_constraint(ZERO, end, Seconds::ZERO, secs(6.0)).unwrap();
        jobs.push((start, end));
    }
    // job 0 then job 1 on one machine; job 2 waits for both
    stn.add_constraint(jobs[0].1, jobs[1].0, Seconds::ZERO, Seconds::INFINITY).unwrap();
    stn.add_constraint(jobs[1].1, jobs[2].0, secs(0.25), Seconds::INFINITY).unwrap();
    (stn, jobs)
}

#[test]
fn test_schedule_satisfies_every_constraint() {
    let (mut stn, jobs) = job_shop(64);
    let schedule = stn.freeze().unwrap();

    for c in stn.constraints() {
        let gap = schedule.time_of(c.to).unwrap().as_millis() - schedule.time_of(c.from).unwrap().as_millis();
        assert!(gap >= c.lower.as_millis(), "{:?} violated by gap {}", c, gap);
        if c.upper.is_finite() {
            assert!(gap <= c.upper.as_millis(), "{:?} violated by gap {}", c, gap);
        }
    }
    assert_eq!(schedule.time_of(jobs[2].0), Some(secs(3.75)));
    assert_eq!(schedule.makespan(), secs(4.25));
}

#[test]
fn test_bounds_agree_between_recompute_strategies() {
    let (full, jobs) = job_shop(usize::MAX);
    let (incremental, _) = job_shop(0);

    for (start, end) in jobs {
        assert_eq!(full.bounds_of(start).unwrap(), incremental.bounds_of(start).unwrap());
        assert_eq!(full.bounds_of(end).unwrap(), incremental.bounds_of(end).unwrap());
    }
}

#[test]
fn test_deadline_tightens_latest_start() {
    let (stn, jobs) = job_shop(64);
    // job 2 must end by 6.0 and lasts 0.5
    assert_eq!(stn.bounds_of(jobs[2].0).unwrap().latest, secs(5.5));
    // job 0 feeds job 1 (2.0) and the 0.25 gap before job 2 (0.5)
    assert_eq!(stn.bounds_of(jobs[0].1).unwrap().latest, secs(3.25));
}

#[test]
fn test_retract_owned_subtree_timing() {
    let mut stn = TemporalNetwork::new();
    let a = stn.add_time_point();
    let b = stn.add_time_point();
    stn.add_constraint(ZERO, a, secs(1.0), secs(1.0)).unwrap();
    stn.add_owned_constraint(OwnerId(3), a, b, secs(4.0), secs(4.0)).unwrap();

    // conflicts with the owned constraint only
    assert!(stn.add_constraint(ZERO, b, Seconds::ZERO, secs(2.0)).is_err());

    stn.remove_constraints(OwnerId(3));
    stn.add_constraint(ZERO, b, Seconds::ZERO, secs(2.0)).unwrap();
    assert_eq!(stn.bounds_of(b).unwrap().latest, secs(2.0));
}
