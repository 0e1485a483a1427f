//! End-to-end audit: ingest, deduplicate, filter, classify, aggregate.

use crate::aggregate::{self, CountUnit, Summary};
use crate::classify::{self, ClassifiedRecord, Classifier};
use crate::config::{AuditConfig, InclusionFilter};
use crate::fetch::DocumentStore;
use crate::ingest::{self, IngestStats};
use crate::merge::RecordTable;
use crate::ownership::{OrganizationDirectory, OwnershipResolver};
use crate::AuditError;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditOutcome {
    pub summary: Summary,
    pub classified: Vec<ClassifiedRecord>,
    pub ingest: IngestStats,
    pub dropped_hosted: usize,
    pub dropped_internal: usize,
    /// Clusters whose owner could not be determined while ownership filtering was on.
    pub dropped_unowned: usize,
}

fn filter_hosted(table: &mut RecordTable, filter: InclusionFilter, store: &dyn DocumentStore) -> usize {
    if !filter.is_active() {
        return 0;
    }
    let before = table.len();
    table.retain(|_, record| filter.keeps(record.is_hosted_cluster(store).value));
    let dropped = before - table.len();
    info!(?filter, dropped, remaining = table.len(), "applied hosted-cluster filter");
    dropped
}

fn filter_internal(
    table: &mut RecordTable,
    filter: InclusionFilter,
    store: &dyn DocumentStore,
    resolver: Option<&dyn OwnershipResolver>,
) -> Result<(usize, usize), AuditError> {
    if !filter.is_active() {
        return Ok((0, 0));
    }
    let resolver = resolver
        .ok_or_else(|| AuditError::Config("internal-customer filtering needs cluster-management credentials".to_string()))?;

    let mut directory = OrganizationDirectory::new(resolver);
    let mut unowned = 0usize;
    let mut mismatched = 0usize;
    table.retain(|_, record| {
        let internal = record
            .organization_id(store, directory.resolver())
            .value
            .and_then(|org| directory.is_internal(&org).ok());
        match internal {
            None => {
                unowned += 1;
                false
            }
            Some(internal) if filter.keeps(Some(internal)) => true,
            Some(_) => {
                mismatched += 1;
                false
            }
        }
    });

    if unowned > 0 {
        warn!(clusters = unowned, "discarded clusters whose owner could not be determined");
    }
    info!(?filter, dropped = mismatched, organizations = directory.len(), "applied internal-customer filter");
    Ok((mismatched, unowned))
}

/// Runs the audit over an already deduplicated table.
pub fn run(
    mut table: RecordTable,
    config: &AuditConfig,
    store: &dyn DocumentStore,
    resolver: Option<&dyn OwnershipResolver>,
) -> Result<AuditOutcome, AuditError> {
    let dropped_hosted = filter_hosted(&mut table, config.hosted, store);
    let (dropped_internal, dropped_unowned) = filter_internal(&mut table, config.internal, store, resolver)?;

    let started = Instant::now();
    let classifier =
        Classifier::new(store, &config.endpoints).collect_subnet_ids(config.count == CountUnit::SubnetIdSet);
    let classified = classify::classify_all(table.into_sorted(), &classifier, config.workers);
    let fetches = classified.iter().filter(|c| c.fetched).count();
    info!(
        clusters = classified.len(),
        fetches,
        workers = config.workers,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "classified clusters"
    );

    let summary = aggregate::aggregate(&classified, config.count);
    Ok(AuditOutcome {
        summary,
        classified,
        ingest: IngestStats::default(),
        dropped_hosted,
        dropped_internal,
        dropped_unowned,
    })
}

/// Reads a CSV of observations and runs the audit over it.
pub fn audit_path(
    path: &Path,
    config: &AuditConfig,
    store: &dyn DocumentStore,
    resolver: Option<&dyn OwnershipResolver>,
) -> Result<AuditOutcome, AuditError> {
    let (table, stats) = ingest::ingest_path(path, &config.range)?;
    let mut outcome = run(table, config, store, resolver)?;
    outcome.ingest = stats;
    Ok(outcome)
}
