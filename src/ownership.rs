//! Who owns a cluster, as told by the cluster-management API.

use crate::AuditError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

pub const OCM_CONFIG_ENV: &str = "OCM_CONFIG";
pub const INTERNAL_CAPABILITY: &str = "capability.organization.internal";

// Refresh this long before the token's stated expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

pub trait OwnershipResolver: Send + Sync {
    /// Resolves a subscription reference (an API path) to its organization id.
    fn organization_for_subscription(&self, subscription_href: &str) -> Result<String, AuditError>;

    /// Whether the organization belongs to an internal customer.
    fn is_internal(&self, organization_id: &str) -> Result<bool, AuditError>;
}

/// Credentials file named by `OCM_CONFIG`.
#[derive(Debug, Clone, Deserialize)]
pub struct OcmCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub token_url: String,
    pub url: String,
}

impl OcmCredentials {
    pub fn from_file(path: &Path) -> Result<Self, AuditError> {
        let text = fs::read_to_string(path)
            .map_err(|e| AuditError::Config(format!("cannot read OCM credentials {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_env() -> Result<Self, AuditError> {
        match std::env::var(OCM_CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim())),
            _ => Err(AuditError::Config(format!("{} must point to an OCM credentials file", OCM_CONFIG_ENV))),
        }
    }
}

#[derive(Debug, Clone)]
struct BearerToken {
    access_token: String,
    refresh_token: String,
    expires_at: Option<i64>,
}

impl BearerToken {
    fn is_expired(&self, now: i64) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp - EXPIRY_SKEW_SECS,
            None => true,
        }
    }
}

/// Reads the `exp` claim from a JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct Subscription {
    organization_id: Option<String>,
}

#[derive(Deserialize)]
struct Capability {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct Organization {
    #[serde(default)]
    capabilities: Vec<Capability>,
}

/// Read-only client for the cluster-management API using the OAuth2 refresh-token flow.
pub struct OcmClient {
    http: reqwest::blocking::Client,
    client_id: String,
    token_url: String,
    base_url: String,
    token: Mutex<BearerToken>,
}

impl OcmClient {
    pub fn new(credentials: OcmCredentials, timeout: Duration) -> Result<Self, AuditError> {
        let http = reqwest::blocking::Client::builder().connect_timeout(timeout).timeout(timeout).build()?;
        let expires_at = jwt_expiry(&credentials.access_token);
        Ok(Self {
            http,
            client_id: credentials.client_id,
            token_url: credentials.token_url,
            base_url: credentials.url.trim_end_matches('/').to_string(),
            token: Mutex::new(BearerToken {
                access_token: credentials.access_token,
                refresh_token: credentials.refresh_token,
                expires_at,
            }),
        })
    }

    fn refresh(&self, token: &mut BearerToken) -> Result<(), AuditError> {
        debug!(token_url = %self.token_url, "refreshing OCM bearer token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", token.refresh_token.as_str()),
            ])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Http {
                url: self.token_url.clone(),
                status: Some(status.as_u16()),
                message: "token refresh rejected".to_string(),
            });
        }
        let refreshed: TokenResponse = serde_json::from_str(&response.text()?)?;
        token.expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now().timestamp() + secs)
            .or_else(|| jwt_expiry(&refreshed.access_token));
        token.access_token = refreshed.access_token;
        if let Some(refresh_token) = refreshed.refresh_token {
            token.refresh_token = refresh_token;
        }
        Ok(())
    }

    fn bearer(&self, force_refresh: bool) -> Result<String, AuditError> {
        let mut token = self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if force_refresh || token.is_expired(Utc::now().timestamp()) {
            self.refresh(&mut token)?;
        }
        Ok(token.access_token.clone())
    }

    /// GETs an API path, refreshing and retrying once if the token was rejected.
    pub fn get_text(&self, path: &str) -> Result<String, AuditError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retried = false;
        loop {
            let response = self.http.get(&url).bearer_auth(self.bearer(retried)?).send()?;
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && !retried {
                retried = true;
                continue;
            }
            if !status.is_success() {
                return Err(AuditError::Http {
                    url,
                    status: Some(status.as_u16()),
                    message: status.canonical_reason().unwrap_or("request failed").to_string(),
                });
            }
            return Ok(response.text()?);
        }
    }
}

impl OwnershipResolver for OcmClient {
    fn organization_for_subscription(&self, subscription_href: &str) -> Result<String, AuditError> {
        let subscription: Subscription = serde_json::from_str(&self.get_text(subscription_href)?)?;
        subscription
            .organization_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AuditError::Ownership(format!("subscription {} has no organization", subscription_href)))
    }

    fn is_internal(&self, organization_id: &str) -> Result<bool, AuditError> {
        let path = format!("/api/accounts_mgmt/v1/organizations/{}?fetchCapabilities=true", organization_id);
        let organization: Organization = serde_json::from_str(&self.get_text(&path)?)?;
        Ok(organization
            .capabilities
            .iter()
            .any(|c| c.name == INTERNAL_CAPABILITY && c.value.eq_ignore_ascii_case("true")))
    }
}

/// Fixed answers, for tests and offline runs.
#[derive(Debug, Default, Clone)]
pub struct StaticOwnership {
    subscriptions: FxHashMap<String, String>,
    internal: FxHashMap<String, bool>,
}

impl StaticOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(mut self, href: &str, organization_id: &str) -> Self {
        self.subscriptions.insert(href.to_string(), organization_id.to_string());
        self
    }

    pub fn with_organization(mut self, organization_id: &str, internal: bool) -> Self {
        self.internal.insert(organization_id.to_string(), internal);
        self
    }
}

impl OwnershipResolver for StaticOwnership {
    fn organization_for_subscription(&self, subscription_href: &str) -> Result<String, AuditError> {
        self.subscriptions
            .get(subscription_href)
            .cloned()
            .ok_or_else(|| AuditError::Ownership(format!("unknown subscription {}", subscription_href)))
    }

    fn is_internal(&self, organization_id: &str) -> Result<bool, AuditError> {
        self.internal
            .get(organization_id)
            .copied()
            .ok_or_else(|| AuditError::Ownership(format!("unknown organization {}", organization_id)))
    }
}

/// Memoizes internal/external status per organization for one run.
pub struct OrganizationDirectory<'a> {
    resolver: &'a dyn OwnershipResolver,
    internal_by_org: FxHashMap<String, bool>,
}

impl<'a> OrganizationDirectory<'a> {
    pub fn new(resolver: &'a dyn OwnershipResolver) -> Self {
        Self { resolver, internal_by_org: FxHashMap::default() }
    }

    pub fn resolver(&self) -> &'a dyn OwnershipResolver {
        self.resolver
    }

    pub fn is_internal(&mut self, organization_id: &str) -> Result<bool, AuditError> {
        if let Some(&internal) = self.internal_by_org.get(organization_id) {
            return Ok(internal);
        }
        let internal = self.resolver.is_internal(organization_id)?;
        self.internal_by_org.insert(organization_id.to_string(), internal);
        Ok(internal)
    }

    pub fn len(&self) -> usize {
        self.internal_by_org.len()
    }

    pub fn is_empty(&self) -> bool {
        self.internal_by_org.is_empty()
    }
}
