//! One normalized observation of a cluster, plus the lazily fetched data hanging off it.

use crate::fetch::{self, ClusterDescription, DocumentStore};
use crate::fields::{self, TriState};
use crate::lifecycle::{self, CheckState, CheckStates, LifecycleState, StateSet};
use crate::ownership::OwnershipResolver;
use crate::verifier_log::VerifierLog;
use crate::AuditError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::warn;
use url::Url;

/// A tabular input row exactly as read, before any coercion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRow {
    pub timestamp: Option<String>,
    pub cid: Option<String>,
    pub cname: Option<String>,
    pub state: Option<String>,
    pub found_verifier_logs: Option<String>,
    pub found_all_tests_passed: Option<String>,
    pub found_egress_failures: Option<String>,
    pub log_download_url: Option<String>,
    pub inflight_states: Option<String>,
}

/// Memo slot for a remote lookup. `Resolved(None)` records that the lookup was attempted
/// and came back unknown, so it is not retried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Cached<T> {
    #[default]
    Unfetched,
    Resolved(Option<T>),
}

impl<T> Cached<T> {
    pub fn is_unfetched(&self) -> bool {
        matches!(self, Cached::Unfetched)
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            Cached::Resolved(Some(v)) => Some(v),
            _ => None,
        }
    }

    /// Keeps our value if we have one, otherwise takes `other`'s.
    fn backfill_from(&mut self, other: &Cached<T>)
    where
        T: Clone,
    {
        if self.is_unfetched() {
            *self = other.clone();
        }
    }
}

/// A value read through a memo, tagged with whether producing it cost a remote fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub value: T,
    pub fetched: bool,
}

impl<T> Fetched<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched { value: f(self.value), fetched: self.fetched }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordCache {
    pub(crate) log: Cached<VerifierLog>,
    pub(crate) description: Cached<ClusterDescription>,
    pub(crate) hosted_cluster: Cached<bool>,
    pub(crate) organization_id: Cached<String>,
    pub(crate) subnet_ids: Cached<BTreeSet<String>>,
}

impl RecordCache {
    pub(crate) fn backfill_from(&mut self, other: &RecordCache) {
        self.log.backfill_from(&other.log);
        self.description.backfill_from(&other.description);
        self.hosted_cluster.backfill_from(&other.hosted_cluster);
        self.organization_id.backfill_from(&other.organization_id);
        self.subnet_ids.backfill_from(&other.subnet_ids);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    cluster_id: String,
    pub cluster_name: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
    pub in_flight_check_states: Option<CheckStates>,
    pub found_verifier_logs: TriState,
    pub found_all_tests_passed: TriState,
    pub found_egress_failures: TriState,
    pub log_location: Option<Url>,
    pub(crate) reached_states: StateSet,
    pub suspect_deleted: bool,
    /// When suspect, the time of the complete observation that was retained.
    pub(crate) retained_at: Option<DateTime<Utc>>,
    pub(crate) cache: RecordCache,
}

static EMPTY_LOG: Lazy<VerifierLog> = Lazy::new(VerifierLog::default);

fn valid_cluster_id(cid: &str) -> bool {
    cid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Record {
    /// A bare observation with no optional fields set.
    pub fn new(cluster_id: impl Into<String>, timestamp: DateTime<Utc>) -> Result<Self, AuditError> {
        let cluster_id = cluster_id.into();
        let trimmed = cluster_id.trim();
        if fields::is_nully_str(Some(trimmed)) {
            return Err(AuditError::malformed("missing cluster id (cid)"));
        }
        if !valid_cluster_id(trimmed) {
            return Err(AuditError::malformed(format!("invalid cluster id {:?}", cluster_id)));
        }
        Ok(Record {
            timestamp,
            cluster_id: trimmed.to_string(),
            cluster_name: None,
            lifecycle_state: None,
            in_flight_check_states: None,
            found_verifier_logs: TriState::Unknown,
            found_all_tests_passed: TriState::Unknown,
            found_egress_failures: TriState::Unknown,
            log_location: None,
            reached_states: StateSet::new(),
            suspect_deleted: false,
            retained_at: None,
            cache: RecordCache::default(),
        })
    }

    pub fn from_row(row: &RawRow) -> Result<Self, AuditError> {
        let timestamp = match fields::non_nully(row.timestamp.as_deref()) {
            Some(ts) => fields::parse_timestamp(ts)?,
            None => return Err(AuditError::malformed("missing timestamp")),
        };
        let mut record = Record::new(row.cid.clone().unwrap_or_default(), timestamp)?;

        record.cluster_name = fields::non_nully(row.cname.as_deref()).map(str::to_string);
        if let Some(state) = fields::non_nully(row.state.as_deref()) {
            record = record.with_lifecycle_state(state.parse()?);
        }
        if let Some(json) = fields::non_nully(row.inflight_states.as_deref()) {
            record.in_flight_check_states = Some(lifecycle::parse_check_states(json)?);
        }
        record.found_verifier_logs = fields::parse_tri_state(row.found_verifier_logs.as_deref());
        record.found_all_tests_passed = fields::parse_tri_state(row.found_all_tests_passed.as_deref());
        record.found_egress_failures = fields::parse_tri_state(row.found_egress_failures.as_deref());
        record.log_location = fields::parse_log_location(row.log_download_url.as_deref());
        Ok(record)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.cluster_name = Some(name.to_string());
        self
    }

    /// Sets the observed lifecycle state and records it in the state history.
    pub fn with_lifecycle_state(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = Some(state);
        self.reached_states.observe(state);
        self
    }

    pub fn with_check_states(mut self, states: &[CheckState]) -> Self {
        self.in_flight_check_states = Some(states.iter().copied().collect());
        self
    }

    pub fn with_log_location(mut self, url: Url) -> Self {
        self.log_location = Some(url);
        self
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn reached_states(&self) -> &StateSet {
        &self.reached_states
    }

    /// Time of the observation the identifying fields came from. Differs from
    /// `timestamp` only for suspect-deleted records.
    pub fn content_timestamp(&self) -> DateTime<Utc> {
        self.retained_at.unwrap_or(self.timestamp)
    }

    /// Incomplete records carry no name, lifecycle state or check states and cannot be
    /// classified.
    pub fn is_incomplete(&self) -> bool {
        self.cluster_name.is_none() && self.lifecycle_state.is_none() && self.in_flight_check_states.is_none()
    }

    pub fn has_check_state(&self, state: CheckState) -> bool {
        self.in_flight_check_states.as_ref().is_some_and(|s| s.contains(&state))
    }

    pub fn within(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        self.timestamp >= since && self.timestamp <= until
    }

    /// Parsed verifier log, fetched once from `log_location`. Fetch failures resolve to an
    /// empty log.
    pub fn verifier_log(&mut self, store: &dyn DocumentStore) -> Fetched<&VerifierLog> {
        let fetched = self.cache.log.is_unfetched();
        if fetched {
            let log = match &self.log_location {
                Some(base) => match fetch::fetch_subnet_logs(store, base) {
                    Ok(text) => Some(VerifierLog::parse(&text)),
                    Err(e) => {
                        warn!(cid = %self.cluster_id, error = %e, "could not fetch verifier logs");
                        None
                    }
                },
                None => None,
            };
            self.cache.log = Cached::Resolved(Some(log.unwrap_or_default()));
        }
        Fetched { value: self.cache.log.resolved().unwrap_or(&*EMPTY_LOG), fetched }
    }

    pub fn egress_failures(&mut self, store: &dyn DocumentStore) -> Fetched<BTreeSet<String>> {
        self.verifier_log(store).map(|log| log.egress_failures.clone())
    }

    pub fn errors(&mut self, store: &dyn DocumentStore) -> Fetched<BTreeSet<String>> {
        self.verifier_log(store).map(|log| log.errors.clone())
    }

    /// Cluster description document, fetched once. `None` if it could not be retrieved.
    pub fn description(&mut self, store: &dyn DocumentStore) -> Fetched<Option<&ClusterDescription>> {
        let fetched = self.cache.description.is_unfetched();
        if fetched {
            let description = match &self.log_location {
                Some(base) => fetch::fetch_description(store, base)
                    .map_err(|e| warn!(cid = %self.cluster_id, error = %e, "could not fetch cluster description"))
                    .ok(),
                None => None,
            };
            self.cache.description = Cached::Resolved(description);
        }
        Fetched { value: self.cache.description.resolved(), fetched }
    }

    pub fn is_hosted_cluster(&mut self, store: &dyn DocumentStore) -> Fetched<Option<bool>> {
        if let Cached::Resolved(value) = &self.cache.hosted_cluster {
            return Fetched { value: *value, fetched: false };
        }
        let description = self.description(store);
        let fetched = description.fetched;
        let value = description.value.map(ClusterDescription::is_hosted_cluster);
        self.cache.hosted_cluster = Cached::Resolved(value);
        Fetched { value, fetched }
    }

    pub fn subnet_ids(&mut self, store: &dyn DocumentStore) -> Fetched<Option<BTreeSet<String>>> {
        if let Cached::Resolved(value) = &self.cache.subnet_ids {
            return Fetched { value: value.clone(), fetched: false };
        }
        let description = self.description(store);
        let fetched = description.fetched;
        let value = description.value.map(ClusterDescription::subnet_ids);
        self.cache.subnet_ids = Cached::Resolved(value.clone());
        Fetched { value, fetched }
    }

    /// Owning organization, resolved from the description's subscription reference.
    pub fn organization_id(
        &mut self,
        store: &dyn DocumentStore,
        resolver: &dyn OwnershipResolver,
    ) -> Fetched<Option<String>> {
        if let Cached::Resolved(value) = &self.cache.organization_id {
            return Fetched { value: value.clone(), fetched: false };
        }
        let description = self.description(store);
        let mut fetched = description.fetched;
        let href = description.value.and_then(|d| d.subscription_href()).map(str::to_string);
        let value = href.and_then(|href| {
            fetched = true;
            resolver
                .organization_for_subscription(&href)
                .map_err(|e| warn!(cid = %self.cluster_id, error = %e, "could not resolve organization"))
                .ok()
        });
        self.cache.organization_id = Cached::Resolved(value.clone());
        Fetched { value, fetched }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticDocumentStore;
    use crate::ownership::StaticOwnership;

    fn row(cid: &str) -> RawRow {
        RawRow {
            timestamp: Some("2024-05-01T10:00:00Z".to_string()),
            cid: Some(cid.to_string()),
            ..RawRow::default()
        }
    }

    #[test]
    fn test_from_row_full() {
        let raw = RawRow {
            cname: Some("prod-1".to_string()),
            state: Some("ready".to_string()),
            found_verifier_logs: Some("TRUE".to_string()),
            found_all_tests_passed: Some("FALSE".to_string()),
            found_egress_failures: Some("NULL".to_string()),
            log_download_url: Some("https://logs.example.com/c1/".to_string()),
            inflight_states: Some(r#"["failed"]"#.to_string()),
            ..row("c1")
        };
        let record = Record::from_row(&raw).unwrap();
        assert_eq!(record.cluster_id(), "c1");
        assert_eq!(record.cluster_name.as_deref(), Some("prod-1"));
        assert_eq!(record.lifecycle_state, Some(LifecycleState::Ready));
        assert!(record.reached_states().contains(LifecycleState::Ready));
        assert!(record.has_check_state(CheckState::Failed));
        assert_eq!(record.found_verifier_logs, TriState::True);
        assert_eq!(record.found_all_tests_passed, TriState::False);
        assert_eq!(record.found_egress_failures, TriState::Unknown);
        assert!(record.log_location.is_some());
        assert!(!record.is_incomplete());
    }

    #[test]
    fn test_from_row_minimal_is_incomplete() {
        let record = Record::from_row(&row("c1")).unwrap();
        assert!(record.is_incomplete());
        assert!(record.reached_states().is_empty());
    }

    #[test]
    fn test_invalid_url_becomes_absent() {
        let raw = RawRow { log_download_url: Some("s3://bucket/key".to_string()), ..row("c1") };
        assert!(Record::from_row(&raw).unwrap().log_location.is_none());
    }

    #[test]
    fn test_malformed_rows_are_rejected() {
        assert!(Record::from_row(&RawRow { cid: Some("NULL".into()), ..row("x") }).unwrap_err().is_malformed_row());
        assert!(Record::from_row(&RawRow { cid: Some("a b".into()), ..row("x") }).unwrap_err().is_malformed_row());
        assert!(Record::from_row(&RawRow { timestamp: None, ..row("c1") }).unwrap_err().is_malformed_row());
        assert!(Record::from_row(&RawRow { timestamp: Some("soon".into()), ..row("c1") }).unwrap_err().is_malformed_row());
        assert!(Record::from_row(&RawRow { state: Some("melting".into()), ..row("c1") }).unwrap_err().is_malformed_row());
        assert!(Record::from_row(&RawRow { inflight_states: Some("[passed".into()), ..row("c1") })
            .unwrap_err()
            .is_malformed_row());
    }

    #[test]
    fn test_log_fetch_is_memoized() {
        let store = StaticDocumentStore::new().with_cluster(
            "https://logs.example.com/c1/",
            &[("subnet-1.log", "egressURL error: quay.io:443 (x)\n")],
            None,
        );
        let mut record = Record::from_row(&RawRow {
            log_download_url: Some("https://logs.example.com/c1/".into()),
            ..row("c1")
        })
        .unwrap();

        let first = record.egress_failures(&store);
        assert!(first.fetched);
        assert!(first.value.contains("quay.io:443"));

        let second = record.egress_failures(&StaticDocumentStore::new());
        assert!(!second.fetched);
        assert_eq!(second.value, first.value);
    }

    #[test]
    fn test_log_fetch_failure_degrades_to_empty() {
        let mut record = Record::from_row(&RawRow {
            log_download_url: Some("https://logs.example.com/missing/".into()),
            ..row("c1")
        })
        .unwrap();
        let log = record.verifier_log(&StaticDocumentStore::new());
        assert!(log.fetched);
        assert!(log.value.is_empty());
    }

    #[test]
    fn test_description_derived_fields() {
        let store = StaticDocumentStore::new().with_cluster(
            "https://logs.example.com/c1/",
            &[],
            Some(r#"{"hypershift":{"enabled":true},"subscription":{"href":"/subs/s1"},"aws":{"subnet_ids":["subnet-1"]}}"#),
        );
        let ownership = StaticOwnership::new().with_subscription("/subs/s1", "org-1");
        let mut record = Record::from_row(&RawRow {
            log_download_url: Some("https://logs.example.com/c1/".into()),
            ..row("c1")
        })
        .unwrap();

        let hosted = record.is_hosted_cluster(&store);
        assert_eq!(hosted.value, Some(true));
        assert!(hosted.fetched);

        let subnets = record.subnet_ids(&store);
        assert!(!subnets.fetched);
        assert_eq!(subnets.value.unwrap().len(), 1);

        assert_eq!(record.organization_id(&store, &ownership).value.as_deref(), Some("org-1"));
        let again = record.organization_id(&store, &StaticOwnership::new());
        assert!(!again.fetched);
        assert_eq!(again.value.as_deref(), Some("org-1"));
    }

    #[test]
    fn test_description_unknown_without_location() {
        let mut record = Record::from_row(&row("c1")).unwrap();
        assert_eq!(record.is_hosted_cluster(&StaticDocumentStore::new()).value, None);
        assert_eq!(record.subnet_ids(&StaticDocumentStore::new()).value, None);
    }
}
