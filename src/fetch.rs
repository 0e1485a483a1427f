//! Remote document retrieval for verifier logs and cluster descriptions.
//!
//! Everything that talks to the network sits behind [`DocumentStore`] so the
//! classifier can be driven from memory in tests.

use crate::AuditError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DESCRIPTION_FILE: &str = "cluster.json";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

static HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("href pattern compiles"));

/// Read-only access to the object store holding verifier output.
pub trait DocumentStore: Send + Sync {
    /// Fetches a document body. Non-2xx responses are errors.
    fn get_text(&self, url: &Url) -> Result<String, AuditError>;

    /// Lists the entries under a directory-style URL.
    fn list(&self, base: &Url) -> Result<Vec<String>, AuditError> {
        let index = self.get_text(&directory_url(base))?;
        Ok(parse_listing(&index))
    }
}

/// Ensures a trailing slash so relative joins stay inside the directory.
pub fn directory_url(base: &Url) -> Url {
    if base.path().ends_with('/') {
        return base.clone();
    }
    let mut dir = base.clone();
    let path = format!("{}/", base.path());
    dir.set_path(&path);
    dir
}

/// Extracts entry names from an HTML index (`href="..."`), falling back to one name per
/// whitespace-separated token for plain-text listings.
pub fn parse_listing(index: &str) -> Vec<String> {
    let hrefs: Vec<String> = HREF.captures_iter(index).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()).collect();
    if !hrefs.is_empty() {
        return hrefs;
    }
    index.split_whitespace().map(str::to_string).collect()
}

/// Per-subnet log files are named `subnet-<id>.log`.
pub fn is_subnet_log(entry: &str) -> bool {
    let name = entry.trim_end_matches('/').rsplit('/').next().unwrap_or(entry);
    name.starts_with("subnet-") && name.ends_with(".log")
}

/// Fetches and concatenates every per-subnet log under `base`.
pub fn fetch_subnet_logs(store: &dyn DocumentStore, base: &Url) -> Result<String, AuditError> {
    let dir = directory_url(base);
    let mut names: Vec<String> = store.list(&dir)?.into_iter().filter(|e| is_subnet_log(e)).collect();
    names.sort();
    names.dedup();
    if names.is_empty() {
        return Err(AuditError::Http {
            url: dir.to_string(),
            status: None,
            message: "no subnet log files listed".to_string(),
        });
    }

    let mut combined = String::new();
    for name in names {
        let url = dir.join(&name).map_err(|e| AuditError::Other(format!("bad log path {}: {}", name, e)))?;
        combined.push_str(&store.get_text(&url)?);
        combined.push('\n');
    }
    Ok(combined)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Hypershift {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AwsSettings {
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

/// The cluster description document stored next to the verifier logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterDescription {
    #[serde(default)]
    pub hypershift: Option<Hypershift>,
    #[serde(default)]
    pub subscription: Option<SubscriptionRef>,
    #[serde(default)]
    pub aws: Option<AwsSettings>,
}

impl ClusterDescription {
    pub fn is_hosted_cluster(&self) -> bool {
        self.hypershift.as_ref().is_some_and(|h| h.enabled)
    }

    pub fn subscription_href(&self) -> Option<&str> {
        self.subscription.as_ref().and_then(|s| s.href.as_deref())
    }

    pub fn subnet_ids(&self) -> BTreeSet<String> {
        self.aws.as_ref().map(|a| a.subnet_ids.iter().cloned().collect()).unwrap_or_default()
    }
}

pub fn fetch_description(store: &dyn DocumentStore, base: &Url) -> Result<ClusterDescription, AuditError> {
    let url = directory_url(base)
        .join(DESCRIPTION_FILE)
        .map_err(|e| AuditError::Other(format!("bad description path: {}", e)))?;
    let body = store.get_text(&url)?;
    Ok(serde_json::from_str(&body)?)
}

/// Never-expiring memo of successful GET bodies, keyed by URL.
///
/// Remote logs are immutable once written, so entries are never invalidated. The cache
/// can be persisted between runs with [`ResponseCache::save`].
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, String>>,
    path: Option<PathBuf>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct CacheFile {
    entries: Vec<(String, String)>,
}

impl ResponseCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads a persisted cache, or starts empty if the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let mut entries = HashMap::new();
        if path.exists() {
            let bytes = fs::read(path)?;
            let (file, _): (CacheFile, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
            entries.extend(file.entries);
            info!(entries = entries.len(), path = %path.display(), "loaded HTTP response cache");
        }
        Ok(ResponseCache { entries: Mutex::new(entries), path: Some(path.to_path_buf()) })
    }

    pub fn get(&self, url: &str) -> Option<String> {
        self.lock().get(url).cloned()
    }

    pub fn insert(&self, url: &str, body: String) {
        self.lock().insert(url.to_string(), body);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the cache atomically: temp file first, then rename over the old one.
    pub fn save(&self) -> Result<(), AuditError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut entries: Vec<(String, String)> =
            self.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort();
        let count = entries.len();
        let bytes = bincode::encode_to_vec(CacheFile { entries }, bincode::config::standard())?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = path.with_extension("tmp");
        fs::write(&temp, bytes)?;
        fs::rename(&temp, path)?;
        info!(entries = count, path = %path.display(), "saved HTTP response cache");
        Ok(())
    }

    // A poisoned lock only means another worker panicked mid-insert; the map is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// [`DocumentStore`] over HTTP with a bounded per-request timeout.
pub struct HttpDocumentStore {
    client: reqwest::blocking::Client,
    cache: Arc<ResponseCache>,
}

impl HttpDocumentStore {
    pub fn new(timeout: Duration, cache: Arc<ResponseCache>) -> Result<Self, AuditError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, cache })
    }
}

impl DocumentStore for HttpDocumentStore {
    fn get_text(&self, url: &Url) -> Result<String, AuditError> {
        if let Some(body) = self.cache.get(url.as_str()) {
            return Ok(body);
        }

        debug!(%url, "fetching");
        let response = self.client.get(url.clone()).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Http {
                url: url.to_string(),
                status: Some(status.as_u16()),
                message: status.canonical_reason().unwrap_or("request failed").to_string(),
            });
        }
        let body = response.text()?;
        self.cache.insert(url.as_str(), body.clone());
        Ok(body)
    }
}

/// In-memory store used by tests and benches.
#[derive(Debug, Default, Clone)]
pub struct StaticDocumentStore {
    documents: HashMap<String, String>,
}

impl StaticDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a log directory: an index, one log per subnet, and optionally a description.
    pub fn with_cluster(mut self, base: &str, logs: &[(&str, &str)], description: Option<&str>) -> Self {
        let base = if base.ends_with('/') { base.to_string() } else { format!("{}/", base) };
        let mut index = String::new();
        for (name, body) in logs {
            index.push_str(&format!("<a href=\"{}\">{}</a>\n", name, name));
            self.documents.insert(format!("{}{}", base, name), body.to_string());
        }
        if let Some(description) = description {
            index.push_str(&format!("<a href=\"{}\">{}</a>\n", DESCRIPTION_FILE, DESCRIPTION_FILE));
            self.documents.insert(format!("{}{}", base, DESCRIPTION_FILE), description.to_string());
        }
        self.documents.insert(base, index);
        self
    }
}

impl DocumentStore for StaticDocumentStore {
    fn get_text(&self, url: &Url) -> Result<String, AuditError> {
        self.documents.get(url.as_str()).cloned().ok_or_else(|| AuditError::Http {
            url: url.to_string(),
            status: Some(404),
            message: "Not Found".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_directory_url_adds_slash_once() {
        assert_eq!(directory_url(&url("https://h.example.com/a/b")).as_str(), "https://h.example.com/a/b/");
        assert_eq!(directory_url(&url("https://h.example.com/a/b/")).as_str(), "https://h.example.com/a/b/");
    }

    #[test]
    fn test_parse_listing_html_and_plain() {
        let html = r#"<html><a href="subnet-1.log">x</a> <a href='cluster.json'>y</a></html>"#;
        assert_eq!(parse_listing(html), vec!["subnet-1.log", "cluster.json"]);
        assert_eq!(parse_listing("subnet-1.log\nsubnet-2.log\n"), vec!["subnet-1.log", "subnet-2.log"]);
    }

    #[test]
    fn test_is_subnet_log() {
        assert!(is_subnet_log("subnet-0abc.log"));
        assert!(is_subnet_log("/logs/c1/subnet-0abc.log"));
        assert!(!is_subnet_log("cluster.json"));
        assert!(!is_subnet_log("subnet-0abc.txt"));
    }

    #[test]
    fn test_fetch_subnet_logs_concatenates_in_name_order() {
        let store = StaticDocumentStore::new().with_cluster(
            "https://logs.example.com/c1",
            &[("subnet-b.log", "second"), ("subnet-a.log", "first")],
            None,
        );
        let text = fetch_subnet_logs(&store, &url("https://logs.example.com/c1")).unwrap();
        assert_eq!(text, "first\nsecond\n");
    }

    #[test]
    fn test_fetch_subnet_logs_without_logs_is_error() {
        let store = StaticDocumentStore::new().with_cluster("https://logs.example.com/c1", &[], Some("{}"));
        assert!(fetch_subnet_logs(&store, &url("https://logs.example.com/c1/")).is_err());
    }

    #[test]
    fn test_description_fields() {
        let body = r#"{"hypershift":{"enabled":true},"subscription":{"id":"s1","href":"/api/accounts_mgmt/v1/subscriptions/s1"},"aws":{"subnet_ids":["subnet-b","subnet-a"]},"name":"ignored"}"#;
        let store = StaticDocumentStore::new().with_cluster("https://logs.example.com/c1/", &[], Some(body));
        let desc = fetch_description(&store, &url("https://logs.example.com/c1")).unwrap();
        assert!(desc.is_hosted_cluster());
        assert_eq!(desc.subscription_href(), Some("/api/accounts_mgmt/v1/subscriptions/s1"));
        assert_eq!(desc.subnet_ids().into_iter().collect::<Vec<_>>(), vec!["subnet-a", "subnet-b"]);
    }

    #[test]
    fn test_empty_description_defaults() {
        let desc: ClusterDescription = serde_json::from_str("{}").unwrap();
        assert!(!desc.is_hosted_cluster());
        assert!(desc.subscription_href().is_none());
        assert!(desc.subnet_ids().is_empty());
    }

    #[test]
    fn test_response_cache_round_trips_through_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cache").join("http.bin");

        let cache = ResponseCache::open(&path).unwrap();
        assert!(cache.is_empty());
        cache.insert("https://logs.example.com/a", "body-a".to_string());
        cache.save().unwrap();

        let reloaded = ResponseCache::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("https://logs.example.com/a").as_deref(), Some("body-a"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_in_memory_cache_save_is_noop() {
        let cache = ResponseCache::in_memory();
        cache.insert("k", "v".to_string());
        cache.save().unwrap();
        assert_eq!(cache.len(), 1);
    }
}
