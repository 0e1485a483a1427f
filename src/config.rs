//! Run configuration: defaults, then an optional JSON settings file, then environment.
//! Command-line flags are applied last by the binary.

use crate::aggregate::CountUnit;
use crate::fetch::DEFAULT_TIMEOUT_SECS;
use crate::fields;
use crate::ingest::DateRange;
use crate::verifier_log::EndpointPolicy;
use crate::AuditError;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CACHE_ENV: &str = "EGRESS_AUDIT_CACHE";
pub const TIMEOUT_ENV: &str = "EGRESS_AUDIT_HTTP_TIMEOUT_SECS";
pub const WORKERS_ENV: &str = "EGRESS_AUDIT_WORKERS";

/// Three-way filter on a per-cluster boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionFilter {
    /// Keep only clusters where the property holds.
    Only,
    /// Drop clusters where the property holds.
    Exclude,
    #[default]
    Any,
}

impl InclusionFilter {
    /// `--flag` / `--no-flag` / neither.
    pub fn from_flags(only: bool, exclude: bool) -> Option<Self> {
        match (only, exclude) {
            (true, _) => Some(InclusionFilter::Only),
            (false, true) => Some(InclusionFilter::Exclude),
            (false, false) => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != InclusionFilter::Any
    }

    /// Unknown values only pass when the filter is inactive.
    pub fn keeps(self, value: Option<bool>) -> bool {
        match self {
            InclusionFilter::Any => true,
            InclusionFilter::Only => value == Some(true),
            InclusionFilter::Exclude => value == Some(false),
        }
    }
}

impl FromStr for InclusionFilter {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "only" => Ok(InclusionFilter::Only),
            "exclude" => Ok(InclusionFilter::Exclude),
            "any" => Ok(InclusionFilter::Any),
            other => Err(AuditError::Config(format!("unknown filter {:?} (expected only, exclude or any)", other))),
        }
    }
}

/// Shape of the `--settings` file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    pub since: Option<String>,
    pub until: Option<String>,
    pub hosted: Option<InclusionFilter>,
    pub internal: Option<InclusionFilter>,
    pub count: Option<CountUnit>,
    pub ignored_endpoints: Option<BTreeSet<String>>,
    pub force_failure_endpoints: Option<BTreeSet<String>>,
    pub http_timeout_secs: Option<u64>,
    pub workers: Option<usize>,
    pub cache: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditConfig {
    pub range: DateRange,
    pub hosted: InclusionFilter,
    pub internal: InclusionFilter,
    pub count: CountUnit,
    pub endpoints: EndpointPolicy,
    pub http_timeout: Duration,
    pub workers: usize,
    pub cache_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            range: DateRange::default(),
            hosted: InclusionFilter::Any,
            internal: InclusionFilter::Any,
            count: CountUnit::ClusterId,
            endpoints: EndpointPolicy::default(),
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workers: 1,
            cache_path: None,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, AuditError> {
    value
        .trim()
        .parse()
        .map_err(|_| AuditError::Config(format!("{} has invalid value {:?}", key, value)))
}

impl AuditConfig {
    pub fn load(settings: Option<&Path>) -> Result<Self, AuditError> {
        let mut config = AuditConfig::default();
        if let Some(path) = settings {
            config.apply_settings(SettingsFile::from_path(path)?)?;
        }
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_settings(&mut self, settings: SettingsFile) -> Result<(), AuditError> {
        if let Some(since) = settings.since {
            self.range.since = fields::parse_timestamp(&since)?;
        }
        if let Some(until) = settings.until {
            self.range.until = fields::parse_timestamp(&until)?;
        }
        if let Some(hosted) = settings.hosted {
            self.hosted = hosted;
        }
        if let Some(internal) = settings.internal {
            self.internal = internal;
        }
        if let Some(count) = settings.count {
            self.count = count;
        }
        if let Some(ignored) = settings.ignored_endpoints {
            self.endpoints.ignored = ignored;
        }
        if let Some(forced) = settings.force_failure_endpoints {
            self.endpoints.force_failure = forced;
        }
        if let Some(secs) = settings.http_timeout_secs {
            self.http_timeout = Duration::from_secs(secs);
        }
        if let Some(workers) = settings.workers {
            self.workers = workers;
        }
        if settings.cache.is_some() {
            self.cache_path = settings.cache;
        }
        self.validate()
    }

    pub fn apply_env(&mut self) -> Result<(), AuditError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), AuditError> {
        if let Some(path) = lookup(CACHE_ENV).filter(|p| !p.trim().is_empty()) {
            self.cache_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(secs) = lookup(TIMEOUT_ENV) {
            self.http_timeout = Duration::from_secs(parse_env(TIMEOUT_ENV, &secs)?);
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            self.workers = parse_env(WORKERS_ENV, &workers)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.range.since > self.range.until {
            return Err(AuditError::Config(format!(
                "since ({}) is after until ({})",
                self.range.since, self.range.until
            )));
        }
        if self.workers == 0 {
            return Err(AuditError::Config("workers must be at least 1".to_string()));
        }
        if self.http_timeout.is_zero() {
            return Err(AuditError::Config("HTTP timeout must be positive".to_string()));
        }
        Ok(())
    }
}

impl SettingsFile {
    pub fn from_path(path: &Path) -> Result<Self, AuditError> {
        let text = fs::read_to_string(path)
            .map_err(|e| AuditError::Config(format!("cannot read settings {}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| AuditError::Config(format!("invalid settings {}: {}", path.display(), e)))
    }
}
