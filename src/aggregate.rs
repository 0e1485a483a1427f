//! Outcome counts and the detector statistics derived from them.

use crate::classify::{ClassifiedRecord, Outcome};
use crate::AuditError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// What one counted item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountUnit {
    #[default]
    ClusterId,
    /// Clusters installed into the same set of subnets count once per outcome.
    SubnetIdSet,
}

impl CountUnit {
    pub fn plural(self) -> &'static str {
        match self {
            CountUnit::ClusterId => "Clusters",
            CountUnit::SubnetIdSet => "Subnet ID Sets",
        }
    }

    /// Rates only make sense when each cluster is one sample.
    pub fn supports_rates(self) -> bool {
        self == CountUnit::ClusterId
    }
}

impl FromStr for CountUnit {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cluster_id" => Ok(CountUnit::ClusterId),
            "subnet_id_set" => Ok(CountUnit::SubnetIdSet),
            other => Err(AuditError::Config(format!(
                "unknown count unit {:?} (expected cluster_id or subnet_id_set)",
                other
            ))),
        }
    }
}

/// A percentage that may be undefined because its denominator is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ratio(pub Option<f64>);

impl Ratio {
    pub fn of(numerator: usize, denominator: usize) -> Self {
        if denominator == 0 {
            Ratio(None)
        } else {
            Ratio(Some(numerator as f64 / denominator as f64))
        }
    }

    pub fn is_defined(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{:.2}%", value * 100.0),
            None => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
    pub errors: usize,
}

impl OutcomeCounts {
    pub fn get(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::TruePositive => self.tp,
            Outcome::TrueNegative => self.tn,
            Outcome::FalsePositive => self.fp,
            Outcome::FalseNegative => self.fn_,
            Outcome::Error => self.errors,
        }
    }

    fn slot(&mut self, outcome: Outcome) -> &mut usize {
        match outcome {
            Outcome::TruePositive => &mut self.tp,
            Outcome::TrueNegative => &mut self.tn,
            Outcome::FalsePositive => &mut self.fp,
            Outcome::FalseNegative => &mut self.fn_,
            Outcome::Error => &mut self.errors,
        }
    }

    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_ + self.errors
    }

    /// FP / (FP + TN)
    pub fn false_positive_rate(&self) -> Ratio {
        Ratio::of(self.fp, self.fp + self.tn)
    }

    /// TP / (TP + FP)
    pub fn precision(&self) -> Ratio {
        Ratio::of(self.tp, self.tp + self.fp)
    }

    /// FP / (TP + TN + FP + FN). Errors are left out of the denominator.
    pub fn frustration_risk(&self) -> Ratio {
        Ratio::of(self.fp, self.tp + self.tn + self.fp + self.fn_)
    }
}

/// Everything the report prints.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub unit: CountUnit,
    /// Counts in `unit`s. Equal to `cluster_counts` when counting clusters.
    pub counts: OutcomeCounts,
    pub cluster_counts: OutcomeCounts,
    pub indeterminate: usize,
    /// Blocked endpoints implicated in false positives, most frequent first.
    pub fp_endpoints: Vec<(String, usize)>,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.counts.total()
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    unit: CountUnit,
    clusters: OutcomeCounts,
    subnet_sets: BTreeMap<Outcome, BTreeSet<BTreeSet<String>>>,
    indeterminate: usize,
    fp_endpoints: BTreeMap<String, usize>,
}

impl Aggregator {
    pub fn new(unit: CountUnit) -> Self {
        Self { unit, ..Self::default() }
    }

    pub fn add(&mut self, record: &ClassifiedRecord) {
        let Some(outcome) = record.outcome else {
            self.indeterminate += 1;
            return;
        };
        *self.clusters.slot(outcome) += 1;

        if outcome == Outcome::FalsePositive {
            for endpoint in &record.egress_failures {
                *self.fp_endpoints.entry(endpoint.clone()).or_insert(0) += 1;
            }
        }
        if self.unit == CountUnit::SubnetIdSet {
            // Unknown subnets share the empty set.
            let subnets = record.subnet_ids.clone().unwrap_or_default();
            self.subnet_sets.entry(outcome).or_default().insert(subnets);
        }
    }

    pub fn finish(self) -> Summary {
        let counts = match self.unit {
            CountUnit::ClusterId => self.clusters,
            CountUnit::SubnetIdSet => {
                let mut counts = OutcomeCounts::default();
                for (outcome, sets) in &self.subnet_sets {
                    *counts.slot(*outcome) = sets.len();
                }
                counts
            }
        };
        let fp_endpoints = self
            .fp_endpoints
            .into_iter()
            .sorted_by(|(a_ep, a_n), (b_ep, b_n)| b_n.cmp(a_n).then_with(|| a_ep.cmp(b_ep)))
            .collect();
        Summary {
            unit: self.unit,
            counts,
            cluster_counts: self.clusters,
            indeterminate: self.indeterminate,
            fp_endpoints,
        }
    }
}

pub fn aggregate<'a>(records: impl IntoIterator<Item = &'a ClassifiedRecord>, unit: CountUnit) -> Summary {
    let mut aggregator = Aggregator::new(unit);
    for record in records {
        aggregator.add(record);
    }
    aggregator.finish()
}
