use clap::Parser;
use dotenv::dotenv;
use egress_audit::aggregate::CountUnit;
use egress_audit::config::{AuditConfig, InclusionFilter};
use egress_audit::fetch::{HttpDocumentStore, ResponseCache};
use egress_audit::ownership::{OcmClient, OcmCredentials, OwnershipResolver};
use egress_audit::{fields, pipeline, report, AuditError};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "egress_audit")]
#[command(about = "Score network verifier results against cluster install outcomes", long_about = None)]
struct Cli {
    /// CSV of cluster observations
    csv_path: PathBuf,
    /// Only hosted-control-plane clusters
    #[arg(long, conflicts_with = "no_hcp")]
    hcp: bool,
    /// Exclude hosted-control-plane clusters
    #[arg(long)]
    no_hcp: bool,
    /// Only clusters owned by internal customers (needs OCM_CONFIG)
    #[arg(long, conflicts_with = "no_internal_cx")]
    internal_cx: bool,
    /// Exclude clusters owned by internal customers (needs OCM_CONFIG)
    #[arg(long)]
    no_internal_cx: bool,
    /// Ignore observations before this time (inclusive, UTC)
    #[arg(long)]
    since: Option<String>,
    /// Ignore observations after this time (inclusive, UTC)
    #[arg(long)]
    until: Option<String>,
    /// What one counted item is: cluster_id or subnet_id_set
    #[arg(long, value_parser = parse_count_unit)]
    count: Option<CountUnit>,
    /// JSON settings file
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Persist fetched documents here between runs
    #[arg(long, conflicts_with = "no_cache")]
    cache: Option<PathBuf>,
    /// Do not read or write the response cache
    #[arg(long)]
    no_cache: bool,
    #[arg(long)]
    workers: Option<usize>,
    /// Per-request HTTP timeout
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn parse_count_unit(s: &str) -> Result<CountUnit, String> {
    s.parse().map_err(|e: AuditError| e.to_string())
}

fn build_config(cli: &Cli) -> Result<AuditConfig, AuditError> {
    let mut config = AuditConfig::load(cli.settings.as_deref())?;
    if let Some(since) = &cli.since {
        config.range.since = fields::parse_timestamp(since)?;
    }
    if let Some(until) = &cli.until {
        config.range.until = fields::parse_timestamp(until)?;
    }
    if let Some(hosted) = InclusionFilter::from_flags(cli.hcp, cli.no_hcp) {
        config.hosted = hosted;
    }
    if let Some(internal) = InclusionFilter::from_flags(cli.internal_cx, cli.no_internal_cx) {
        config.internal = internal;
    }
    if let Some(count) = cli.count {
        config.count = count;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(secs) = cli.timeout_secs {
        config.http_timeout = Duration::from_secs(secs);
    }
    if cli.no_cache {
        config.cache_path = None;
    } else if let Some(path) = &cli.cache {
        config.cache_path = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), AuditError> {
    let config = build_config(&cli)?;

    let cache = Arc::new(match &config.cache_path {
        Some(path) => ResponseCache::open(path)?,
        None => ResponseCache::in_memory(),
    });
    let store = HttpDocumentStore::new(config.http_timeout, Arc::clone(&cache))?;
    let ocm = if config.internal.is_active() {
        Some(OcmClient::new(OcmCredentials::from_env()?, config.http_timeout)?)
    } else {
        None
    };
    let resolver = ocm.as_ref().map(|client| client as &dyn OwnershipResolver);

    let outcome = pipeline::audit_path(&cli.csv_path, &config, &store, resolver)?;
    info!(
        rows = outcome.ingest.rows,
        skipped_rows = outcome.ingest.skipped,
        dropped_hosted = outcome.dropped_hosted,
        dropped_internal = outcome.dropped_internal,
        dropped_unowned = outcome.dropped_unowned,
        "audit complete"
    );

    // Cache persistence is best-effort.
    if let Err(e) = cache.save() {
        warn!(error = %e, "could not save response cache");
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    report::write_report(&outcome.summary, &mut out)?;
    out.flush()?;
    Ok(())
}

fn main() {
    dotenv().ok();
    egress_audit::init_tracing("egress-audit");
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("[egress_audit] {}", e);
        std::process::exit(1);
    }
}
