//! Scoring a merged record against ground truth.
//!
//! Ground truth is whether the cluster ever reached `ready`; the prediction is whether the
//! verifier reported `passed`. The verifier is treated as a detector of blocked egress, so
//! a "positive" is a verifier failure.

use crate::fetch::DocumentStore;
use crate::lifecycle::{CheckState, LifecycleState};
use crate::record::{Fetched, Record};
use crate::verifier_log::EndpointPolicy;
use crossbeam_channel::{bounded, unbounded};
use std::collections::BTreeSet;
use std::fmt;
use std::thread;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
    Error,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::TrueNegative,
        Outcome::FalseNegative,
        Outcome::TruePositive,
        Outcome::FalsePositive,
        Outcome::Error,
    ];

    /// Row label used in the report.
    pub fn label(self) -> &'static str {
        match self {
            Outcome::TruePositive => "True Positives",
            Outcome::TrueNegative => "True Negatives",
            Outcome::FalsePositive => "False Positives",
            Outcome::FalseNegative => "False Negatives",
            Outcome::Error => "Errors",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::TruePositive => "TRUE_POSITIVE",
            Outcome::TrueNegative => "TRUE_NEGATIVE",
            Outcome::FalsePositive => "FALSE_POSITIVE",
            Outcome::FalseNegative => "FALSE_NEGATIVE",
            Outcome::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// What the aggregator needs to know about one classified cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRecord {
    pub cluster_id: String,
    /// `None` means indeterminate.
    pub outcome: Option<Outcome>,
    /// Relevant blocked endpoints. Only collected for false positives.
    pub egress_failures: BTreeSet<String>,
    /// Only collected when the classifier was asked to.
    pub subnet_ids: Option<BTreeSet<String>>,
    pub fetched: bool,
}

pub struct Classifier<'a> {
    store: &'a dyn DocumentStore,
    policy: &'a EndpointPolicy,
    collect_subnet_ids: bool,
}

impl<'a> Classifier<'a> {
    pub fn new(store: &'a dyn DocumentStore, policy: &'a EndpointPolicy) -> Self {
        Self { store, policy, collect_subnet_ids: false }
    }

    pub fn collect_subnet_ids(mut self, collect: bool) -> Self {
        self.collect_subnet_ids = collect;
        self
    }

    /// Classifies one record. `Ok(None)` is indeterminate. Remote failures never surface
    /// here; they resolve to empty logs and fall through to a false positive.
    pub fn classify(&self, record: &mut Record) -> Fetched<Option<Outcome>> {
        let check_states_empty = record.in_flight_check_states.as_ref().is_none_or(|s| s.is_empty());
        if record.is_incomplete() || record.reached_states().is_empty() || check_states_empty {
            return Fetched { value: None, fetched: false };
        }

        let became_ready = record.reached_states().contains(LifecycleState::Ready);
        let passed = record.has_check_state(CheckState::Passed);
        let outcome = match (became_ready, passed) {
            (true, true) => Outcome::TrueNegative,
            (false, false) => Outcome::TruePositive,
            (false, true) => Outcome::FalseNegative,
            (true, false) => return self.refine_apparent_false_positive(record),
        };
        Fetched { value: Some(outcome), fetched: false }
    }

    fn refine_apparent_false_positive(&self, record: &mut Record) -> Fetched<Option<Outcome>> {
        let log = record.verifier_log(self.store);
        let outcome = if self.policy.any_forced(&log.value.egress_failures) {
            Outcome::TruePositive
        } else if !log.value.errors.is_empty() {
            Outcome::Error
        } else {
            Outcome::FalsePositive
        };
        Fetched { value: Some(outcome), fetched: log.fetched }
    }

    /// Classifies and gathers the per-cluster facts reporting needs.
    pub fn classify_record(&self, record: &mut Record) -> ClassifiedRecord {
        let outcome = self.classify(record);
        let mut fetched = outcome.fetched;

        let egress_failures = if outcome.value == Some(Outcome::FalsePositive) {
            let failures = record.egress_failures(self.store);
            fetched |= failures.fetched;
            self.policy.retain_relevant(&failures.value)
        } else {
            BTreeSet::new()
        };

        let subnet_ids = if self.collect_subnet_ids && outcome.value.is_some() {
            let subnets = record.subnet_ids(self.store);
            fetched |= subnets.fetched;
            Some(subnets.value.unwrap_or_default())
        } else {
            None
        };

        ClassifiedRecord {
            cluster_id: record.cluster_id().to_string(),
            outcome: outcome.value,
            egress_failures,
            subnet_ids,
            fetched,
        }
    }
}

/// Classifies every record over a pool of `workers` threads. Each record is handed to
/// exactly one worker, so records need no locking. Results come back sorted by cluster id.
pub fn classify_all(records: Vec<Record>, classifier: &Classifier<'_>, workers: usize) -> Vec<ClassifiedRecord> {
    let mut results = if workers <= 1 || records.len() <= 1 {
        records.into_iter().map(|mut record| classifier.classify_record(&mut record)).collect()
    } else {
        fan_out(records, classifier, workers)
    };
    results.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
    results
}

fn fan_out(records: Vec<Record>, classifier: &Classifier<'_>, workers: usize) -> Vec<ClassifiedRecord> {
    let total = records.len();
    let workers = workers.min(total);
    let (job_tx, job_rx) = bounded::<Record>(workers * 2);
    let (result_tx, result_rx) = unbounded::<ClassifiedRecord>();

    thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                let mut handled = 0usize;
                for mut record in job_rx.iter() {
                    if result_tx.send(classifier.classify_record(&mut record)).is_err() {
                        break;
                    }
                    handled += 1;
                }
                debug!(worker, handled, "classification worker finished");
            });
        }
        drop(result_tx);

        for record in records {
            if job_tx.send(record).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    let results: Vec<ClassifiedRecord> = result_rx.iter().collect();
    debug!(total, collected = results.len(), "classification pool drained");
    results
}
