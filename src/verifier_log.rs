//! Parsing of raw verifier output into blocked endpoints and runtime errors.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static EGRESS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"egressURL error: (?:[a-z]{3,5}://)?([\w\-\.]+:\d+)\s").expect("egress pattern compiles")
});

static VERIFIER_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"network verifier error:\s*(exceeded max wait time for \w* waiter",
        r"|missing required permission [\w\d]*:[\w\d]*",
        r"|waiter state transitioned to Failure",
        r"|timed out waiting for the condition",
        r"|unable to cleanup [\w ]*",
        r"|error performing [\w\d]*:[\w\d]*)",
    ))
    .expect("verifier error pattern compiles")
});

/// What a verifier run reported, reduced to the two sets classification needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifierLog {
    pub egress_failures: BTreeSet<String>,
    pub errors: BTreeSet<String>,
}

impl VerifierLog {
    pub fn parse(output: &str) -> Self {
        VerifierLog { egress_failures: egress_failures(output), errors: errors(output) }
    }

    pub fn is_empty(&self) -> bool {
        self.egress_failures.is_empty() && self.errors.is_empty()
    }
}

/// `host:port` destinations the verifier could not reach.
pub fn egress_failures(output: &str) -> BTreeSet<String> {
    EGRESS_URL.captures_iter(output).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()).collect()
}

/// Runtime errors that mean the verifier itself did not finish cleanly.
pub fn errors(output: &str) -> BTreeSet<String> {
    VERIFIER_ERROR
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end().to_string())
        .collect()
}

/// Endpoints to drop from results entirely, and endpoints whose blockage always counts
/// as a genuine failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPolicy {
    pub ignored: BTreeSet<String>,
    pub force_failure: BTreeSet<String>,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        EndpointPolicy {
            ignored: BTreeSet::from(["example.com".to_string()]),
            force_failure: BTreeSet::new(),
        }
    }
}

impl EndpointPolicy {
    pub fn is_ignored(&self, endpoint: &str) -> bool {
        matches_any(&self.ignored, endpoint)
    }

    pub fn is_forced_failure(&self, endpoint: &str) -> bool {
        matches_any(&self.force_failure, endpoint)
    }

    /// Egress failures with ignored endpoints removed.
    pub fn retain_relevant(&self, failures: &BTreeSet<String>) -> BTreeSet<String> {
        failures.iter().filter(|ep| !self.is_ignored(ep)).cloned().collect()
    }

    pub fn any_forced(&self, failures: &BTreeSet<String>) -> bool {
        failures.iter().any(|ep| !self.is_ignored(ep) && self.is_forced_failure(ep))
    }
}

// An entry matches either the full `host:port` or just the host.
fn matches_any(entries: &BTreeSet<String>, endpoint: &str) -> bool {
    if entries.contains(endpoint) {
        return true;
    }
    match endpoint.rsplit_once(':') {
        Some((host, _port)) => entries.contains(host),
        None => false,
    }
}
