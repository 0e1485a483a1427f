use chrono::{DateTime, TimeZone, Utc};
use egress_audit::lifecycle::{CheckState, LifecycleState};
use egress_audit::merge::{merge, RecordTable};
use egress_audit::record::Record;
use itertools::Itertools;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
}

fn complete(hour: u32, state: LifecycleState, checks: &[CheckState]) -> Record {
    Record::new("cluster-1", at(hour))
        .unwrap()
        .with_name("prod")
        .with_lifecycle_state(state)
        .with_check_states(checks)
}

fn vanished(hour: u32) -> Record {
    Record::new("cluster-1", at(hour)).unwrap()
}

/// Everything merge must agree on regardless of order.
#[derive(Debug, PartialEq)]
struct Identity {
    timestamp: DateTime<Utc>,
    content_timestamp: DateTime<Utc>,
    name: Option<String>,
    state: Option<LifecycleState>,
    checks: Option<Vec<CheckState>>,
    suspect_deleted: bool,
    reached: Vec<LifecycleState>,
}

fn identity(record: &Record) -> Identity {
    Identity {
        timestamp: record.timestamp,
        content_timestamp: record.content_timestamp(),
        name: record.cluster_name.clone(),
        state: record.lifecycle_state,
        checks: record.in_flight_check_states.as_ref().map(|c| c.to_vec()),
        suspect_deleted: record.suspect_deleted,
        reached: record.reached_states().iter().collect(),
    }
}

fn fold(records: impl IntoIterator<Item = Record>) -> Record {
    records.into_iter().reduce(|acc, r| merge(acc, r).unwrap()).unwrap()
}

fn pool() -> Vec<Record> {
    vec![
        complete(1, LifecycleState::Installing, &[CheckState::Running]),
        complete(3, LifecycleState::Ready, &[CheckState::Failed]),
        vanished(5),
        complete(2, LifecycleState::Error, &[CheckState::Failed]),
        complete(3, LifecycleState::Installing, &[CheckState::Passed]),
        vanished(4),
    ]
}

#[test]
fn test_fold_is_order_independent() {
    let records = pool();
    let expected = identity(&fold(records.clone()));
    for order in records.into_iter().permutations(6) {
        assert_eq!(identity(&fold(order)), expected);
    }
}

#[test]
fn test_fold_result_for_pool() {
    let merged = fold(pool());
    // Newest complete observation is hour 3, and ready outranks installing there.
    assert_eq!(merged.lifecycle_state, Some(LifecycleState::Ready));
    assert_eq!(merged.content_timestamp(), at(3));
    // The cluster disappeared at hour 5.
    assert!(merged.suspect_deleted);
    assert_eq!(merged.timestamp, at(5));
    assert_eq!(merged.reached_states().len(), 3);
}

#[test]
fn test_merge_is_associative() {
    let records = pool();
    for triple in records.iter().cloned().combinations_with_replacement(3) {
        let (r1, r2, r3) = (triple[0].clone(), triple[1].clone(), triple[2].clone());
        let left = merge(merge(r1.clone(), r2.clone()).unwrap(), r3.clone()).unwrap();
        let right = merge(r1, merge(r2, r3).unwrap()).unwrap();
        assert_eq!(identity(&left), identity(&right));
    }
}

#[test]
fn test_merge_is_commutative() {
    for pair in pool().into_iter().permutations(2) {
        let (a, b) = (pair[0].clone(), pair[1].clone());
        assert_eq!(identity(&merge(a.clone(), b.clone()).unwrap()), identity(&merge(b, a).unwrap()));
    }
}

#[test]
fn test_reached_states_is_union_of_observations() {
    let states = [
        LifecycleState::Pending,
        LifecycleState::Installing,
        LifecycleState::Ready,
        LifecycleState::Hibernating,
        LifecycleState::Resuming,
    ];
    let records: Vec<Record> = states
        .iter()
        .enumerate()
        .map(|(i, s)| complete(i as u32, *s, &[CheckState::Passed]))
        .chain(std::iter::once(vanished(12)))
        .collect();
    let merged = fold(records);
    assert_eq!(merged.reached_states().len(), states.len());
    for state in states {
        assert!(merged.reached_states().contains(state));
    }
}

#[test]
fn test_newer_complete_observation_replaces_retained_one() {
    // Complete at 1, gone at 5, complete again at 3 (arriving last).
    let suspect = merge(complete(1, LifecycleState::Installing, &[CheckState::Running]), vanished(5)).unwrap();
    assert!(suspect.suspect_deleted);
    let merged = merge(suspect, complete(3, LifecycleState::Ready, &[CheckState::Passed])).unwrap();
    assert_eq!(merged.lifecycle_state, Some(LifecycleState::Ready));
    assert!(merged.suspect_deleted);
    assert_eq!(merged.timestamp, at(5));
}

#[test]
fn test_reappearing_cluster_is_no_longer_suspect() {
    let merged = fold(vec![
        complete(1, LifecycleState::Installing, &[CheckState::Running]),
        vanished(2),
        complete(3, LifecycleState::Ready, &[CheckState::Passed]),
    ]);
    assert!(!merged.suspect_deleted);
    assert_eq!(merged.content_timestamp(), merged.timestamp);
}

#[test]
fn test_table_rejects_nothing_and_keys_by_id() {
    let mut table = RecordTable::new();
    for record in pool() {
        table.insert(record).unwrap();
    }
    table.insert(Record::new("cluster-2", at(1)).unwrap().with_name("other")).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(identity(table.get("cluster-1").unwrap()), identity(&fold(pool())));
}
