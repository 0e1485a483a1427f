//! Combining repeated observations of one cluster into a single canonical record.
//!
//! Folding any permutation of the same observations through [`merge`] yields the same
//! identifying fields and the same `reached_states`. Upstream collection can deliver
//! duplicated and out-of-order rows, so [`RecordTable`] relies on that.

use crate::lifecycle::LifecycleState;
use crate::record::Record;
use crate::AuditError;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

/// Orders two observations of the same cluster: later timestamp first, then further
/// lifecycle progress. Records of different clusters are not comparable.
pub fn compare(a: &Record, b: &Record) -> Result<Ordering, AuditError> {
    if a.cluster_id() != b.cluster_id() {
        return Err(AuditError::CrossCluster {
            left: a.cluster_id().to_string(),
            right: b.cluster_id().to_string(),
        });
    }
    Ok(a.timestamp.cmp(&b.timestamp).then_with(|| a.lifecycle_state.cmp(&b.lifecycle_state)))
}

// Deterministic order between records whose timestamps and states tie.
fn tie_break(a: &Record, b: &Record) -> Ordering {
    a.in_flight_check_states
        .cmp(&b.in_flight_check_states)
        .then_with(|| a.cluster_name.cmp(&b.cluster_name))
        .then_with(|| {
            let a_loc = a.log_location.as_ref().map(|u| u.as_str());
            let b_loc = b.log_location.as_ref().map(|u| u.as_str());
            a_loc.cmp(&b_loc)
        })
        .then_with(|| a.found_verifier_logs.cmp(&b.found_verifier_logs))
        .then_with(|| a.found_all_tests_passed.cmp(&b.found_all_tests_passed))
        .then_with(|| a.found_egress_failures.cmp(&b.found_egress_failures))
}

// Which complete observation should supply the identifying fields.
fn content_order(a: &Record, b: &Record) -> Ordering {
    a.content_timestamp()
        .cmp(&b.content_timestamp())
        .then_with(|| a.lifecycle_state.cmp(&b.lifecycle_state))
        .then_with(|| tie_break(a, b))
}

// Whether the newest observation folded into this record was an incomplete one.
fn ends_incomplete(record: &Record) -> bool {
    record.suspect_deleted || record.is_incomplete()
}

// Sort key of a record's newest observation. At equal time and state a complete
// observation outranks an incomplete one.
fn latest_observation(record: &Record) -> (DateTime<Utc>, Option<LifecycleState>, bool) {
    let ends_incomplete = ends_incomplete(record);
    let state = if record.suspect_deleted { None } else { record.lifecycle_state };
    (record.timestamp, state, !ends_incomplete)
}

/// Merges two observations of the same cluster.
///
/// If the later observation is incomplete while the earlier one is not, the cluster is
/// assumed to have been deleted in between: the earlier record survives, flagged
/// `suspect_deleted`, with its timestamp advanced to the later one. Otherwise the later
/// record wins. Either way the state history is the union of both sides. Memoized
/// lookups missing on the survivor are taken from the other side only when both point at
/// the same log location, since every lookup is derived from the documents under it.
///
/// A suspect record keeps the time of the observation it retained, so a complete
/// observation that is newer than the retained one but older than the disappearance
/// still replaces it. This keeps the fold independent of input order.
pub fn merge(a: Record, b: Record) -> Result<Record, AuditError> {
    let ordering = compare(&a, &b)?;
    let timestamp = a.timestamp.max(b.timestamp);
    let latest_incomplete = if latest_observation(&a) >= latest_observation(&b) {
        ends_incomplete(&a)
    } else {
        ends_incomplete(&b)
    };

    let a_wins = match (a.is_incomplete(), b.is_incomplete()) {
        (false, true) => true,
        (true, false) => false,
        (true, true) => ordering.then_with(|| tie_break(&a, &b)) != Ordering::Less,
        (false, false) => content_order(&a, &b) != Ordering::Less,
    };
    let (mut merged, other) = if a_wins { (a, b) } else { (b, a) };

    if !merged.is_incomplete() {
        merged.retained_at = latest_incomplete.then(|| merged.content_timestamp());
        merged.suspect_deleted = latest_incomplete;
    }
    merged.timestamp = timestamp;
    merged.reached_states.union_with(&other.reached_states);
    if merged.log_location == other.log_location {
        merged.cache.backfill_from(&other.cache);
    }
    Ok(merged)
}

/// The deduplicated accumulator: one canonical record per cluster id.
#[derive(Debug, Default, Clone)]
pub struct RecordTable {
    records: FxHashMap<String, Record>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a record into the entry for its cluster.
    pub fn insert(&mut self, record: Record) -> Result<(), AuditError> {
        match self.records.remove(record.cluster_id()) {
            Some(existing) => {
                let merged = merge(existing, record)?;
                self.records.insert(merged.cluster_id().to_string(), merged);
            }
            None => {
                self.records.insert(record.cluster_id().to_string(), record);
            }
        }
        Ok(())
    }

    pub fn get(&self, cluster_id: &str) -> Option<&Record> {
        self.records.get(cluster_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn retain(&mut self, keep: impl FnMut(&String, &mut Record) -> bool) {
        self.records.retain(keep);
    }

    /// Records sorted by cluster id.
    pub fn into_sorted(self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.into_values().collect();
        records.sort_by(|a, b| a.cluster_id().cmp(b.cluster_id()));
        records
    }
}

impl FromIterator<Record> for Result<RecordTable, AuditError> {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut table = RecordTable::new();
        for record in iter {
            table.insert(record)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CheckState;
    use crate::record::Cached;
    use crate::classify::{Classifier, Outcome};
    use crate::fetch::StaticDocumentStore;
    use crate::verifier_log::{EndpointPolicy, VerifierLog};
    use chrono::TimeZone;
    use url::Url;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn observed(cid: &str, hour: u32, state: LifecycleState) -> Record {
        Record::new(cid, at(hour))
            .unwrap()
            .with_name("c")
            .with_lifecycle_state(state)
            .with_check_states(&[CheckState::Failed])
    }

    #[test]
    fn test_compare_rejects_different_clusters() {
        let a = observed("a", 1, LifecycleState::Ready);
        let b = observed("b", 1, LifecycleState::Ready);
        assert!(matches!(compare(&a, &b), Err(AuditError::CrossCluster { .. })));
        assert!(merge(a, b).is_err());
    }

    #[test]
    fn test_compare_timestamp_then_state_rank() {
        let early_ready = observed("a", 1, LifecycleState::Ready);
        let late_installing = observed("a", 2, LifecycleState::Installing);
        let early_installing = observed("a", 1, LifecycleState::Installing);
        assert_eq!(compare(&late_installing, &early_ready).unwrap(), Ordering::Greater);
        assert_eq!(compare(&early_ready, &early_installing).unwrap(), Ordering::Greater);
        assert_eq!(compare(&early_ready, &early_ready.clone()).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_later_record_wins_and_states_accumulate() {
        let installing = observed("a", 1, LifecycleState::Installing);
        let ready = observed("a", 2, LifecycleState::Ready).with_check_states(&[CheckState::Passed]);
        let merged = merge(installing, ready).unwrap();
        assert_eq!(merged.lifecycle_state, Some(LifecycleState::Ready));
        assert!(merged.has_check_state(CheckState::Passed));
        assert!(merged.reached_states().contains(LifecycleState::Installing));
        assert!(merged.reached_states().contains(LifecycleState::Ready));
        assert!(!merged.suspect_deleted);
    }

    #[test]
    fn test_vanished_cluster_keeps_last_complete_record() {
        let complete = observed("a", 1, LifecycleState::Ready);
        let vanished = Record::new("a", at(5)).unwrap();
        let merged = merge(vanished, complete.clone()).unwrap();
        assert!(merged.suspect_deleted);
        assert_eq!(merged.timestamp, at(5));
        assert_eq!(merged.lifecycle_state, Some(LifecycleState::Ready));
        assert_eq!(merged.cluster_name, complete.cluster_name);
    }

    #[test]
    fn test_two_incomplete_records_stay_incomplete() {
        let merged = merge(Record::new("a", at(1)).unwrap(), Record::new("a", at(2)).unwrap()).unwrap();
        assert!(merged.is_incomplete());
        assert!(!merged.suspect_deleted);
        assert_eq!(merged.timestamp, at(2));
    }

    #[test]
    fn test_cached_lookups_are_backfilled() {
        let mut earlier = observed("a", 1, LifecycleState::Ready);
        earlier.cache.hosted_cluster = Cached::Resolved(Some(true));
        earlier.cache.log = Cached::Resolved(Some(VerifierLog::default()));
        let mut later = observed("a", 2, LifecycleState::Ready);
        later.cache.log = Cached::Resolved(None);

        let merged = merge(earlier, later).unwrap();
        assert_eq!(merged.cache.hosted_cluster, Cached::Resolved(Some(true)));
        assert_eq!(merged.cache.log, Cached::Resolved(None));
        assert!(merged.cache.organization_id.is_unfetched());
    }

    #[test]
    fn test_lookups_from_another_run_are_not_backfilled() {
        let store = StaticDocumentStore::new()
            .with_cluster("https://logs.example.com/a/run1/", &[("subnet-1.log", "egressURL error: quay.io:443 (Blocked)\n")], None)
            .with_cluster(
                "https://logs.example.com/a/run2/",
                &[("subnet-1.log", "network verifier error: timed out waiting for the condition\n")],
                None,
            );
        let policy = EndpointPolicy::default();
        let classifier = Classifier::new(&store, &policy);
        let run = |hour, path: &str| {
            observed("a", hour, LifecycleState::Ready)
                .with_log_location(Url::parse(&format!("https://logs.example.com/a/{}/", path)).unwrap())
        };

        let mut earlier = run(1, "run1");
        assert_eq!(classifier.classify(&mut earlier).value, Some(Outcome::FalsePositive));
        assert_eq!(classifier.classify(&mut run(2, "run2")).value, Some(Outcome::Error));

        let mut merged = merge(earlier, run(2, "run2")).unwrap();
        assert!(merged.cache.log.is_unfetched());
        let outcome = classifier.classify(&mut merged);
        assert!(outcome.fetched);
        assert_eq!(outcome.value, Some(Outcome::Error));
    }

    #[test]
    fn test_equal_rank_ties_are_order_independent() {
        let a = observed("a", 1, LifecycleState::Ready).with_check_states(&[CheckState::Passed]);
        let b = observed("a", 1, LifecycleState::Ready).with_check_states(&[CheckState::Failed]);
        let ab = merge(a.clone(), b.clone()).unwrap();
        let ba = merge(b, a).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_table_folds_by_cluster_id() {
        let mut table = RecordTable::new();
        table.insert(observed("a", 1, LifecycleState::Installing)).unwrap();
        table.insert(observed("b", 1, LifecycleState::Ready)).unwrap();
        table.insert(observed("a", 3, LifecycleState::Ready)).unwrap();
        table.insert(observed("a", 2, LifecycleState::Error)).unwrap();

        assert_eq!(table.len(), 2);
        let a = table.get("a").unwrap();
        assert_eq!(a.timestamp, at(3));
        assert_eq!(a.reached_states().len(), 3);

        let ids: Vec<String> = table.into_sorted().iter().map(|r| r.cluster_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
