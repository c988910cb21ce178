//! Token acquisition for Azure DevOps REST and Analytics.
//!
//! Tokens come from the user's Azure CLI session (`az account
//! get-access-token`). The Analytics endpoint rejects tokens minted for the
//! primary OAuth flow, so it gets its own [`TokenScope`] and its own cache
//! slot; the two never mix.
//!
//! Acquisition is single-flight: concurrent callers share one in-flight
//! refresh instead of racing `az` subprocesses.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Azure DevOps first-party application id, the `--resource` passed to the
/// CLI for both scopes.
const ADO_RESOURCE_ID: &str = "499b84ac-1321-427f-aa17-267ca6975798";

/// Refresh this long before the token's stated expiry.
const EXPIRY_SLACK_MINUTES: i64 = 5;

/// Which backend a token is for. Analytics only accepts CLI-issued tokens,
/// so the scopes are cached and refreshed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenScope {
    /// `dev.azure.com` REST endpoints.
    AdoRest,
    /// `analytics.dev.azure.com` OData endpoints.
    Analytics,
}

/// Produces bearer tokens for ADO calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a valid bearer token for the given scope, refreshing if the
    /// cached one is expired or close to it.
    async fn bearer_token(&self, scope: TokenScope) -> Result<String>;

    /// Cheap availability probe used by the dispatcher's pre-check for
    /// CLI-dependent tools. Implementations should not mint a token here.
    async fn ensure_available(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::minutes(EXPIRY_SLACK_MINUTES) > now
    }
}

/// `az account get-access-token` JSON output.
#[derive(Debug, Deserialize)]
struct AzTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,

    // The CLI emits a local timestamp in `expiresOn` and a UTC one in
    // `expires_on` (epoch seconds) depending on version; we accept either.
    #[serde(rename = "expiresOn", default)]
    expires_on: Option<String>,

    #[serde(rename = "expires_on", default)]
    expires_on_epoch: Option<i64>,
}

/// Token provider backed by the Azure CLI.
pub struct AzCliTokenProvider {
    rest_cache: Mutex<Option<CachedToken>>,
    analytics_cache: Mutex<Option<CachedToken>>,
}

impl AzCliTokenProvider {
    pub fn new() -> Self {
        Self {
            rest_cache: Mutex::new(None),
            analytics_cache: Mutex::new(None),
        }
    }

    fn cache_for(&self, scope: TokenScope) -> &Mutex<Option<CachedToken>> {
        match scope {
            TokenScope::AdoRest => &self.rest_cache,
            TokenScope::Analytics => &self.analytics_cache,
        }
    }

    async fn acquire(&self) -> Result<CachedToken> {
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                ADO_RESOURCE_ID,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| Error::auth(format!("failed to invoke Azure CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::auth(format!(
                "az account get-access-token failed; run `az login` ({})",
                stderr.trim()
            )));
        }

        let parsed: AzTokenResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::auth(format!("unexpected Azure CLI output: {e}")))?;

        let expires_at = parse_expiry(&parsed)
            .unwrap_or_else(|| Utc::now() + ChronoDuration::minutes(30));

        Ok(CachedToken {
            token: parsed.access_token,
            expires_at,
        })
    }
}

impl Default for AzCliTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_expiry(response: &AzTokenResponse) -> Option<DateTime<Utc>> {
    if let Some(epoch) = response.expires_on_epoch {
        return DateTime::<Utc>::from_timestamp(epoch, 0);
    }
    let raw = response.expires_on.as_deref()?;
    // Newer CLIs emit RFC 3339; older ones emit a naive local timestamp.
    // A naive timestamp read as UTC only errs on the safe (early) side in
    // western timezones, and the slack window absorbs the rest.
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl TokenProvider for AzCliTokenProvider {
    async fn bearer_token(&self, scope: TokenScope) -> Result<String> {
        // Holding the scope's mutex across the refresh is the single-flight
        // mechanism: the second caller blocks, then finds a fresh token.
        let mut cache = self.cache_for(scope).lock().await;

        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.acquire().await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    async fn ensure_available(&self) -> Result<()> {
        let status = Command::new("az")
            .args(["version", "--output", "none"])
            .output()
            .await;

        match status {
            Ok(output) if output.status.success() => Ok(()),
            Ok(_) => Err(Error::auth(
                "Azure CLI is installed but not signed in; run `az login`",
            )),
            Err(_) => Err(Error::auth(
                "Azure CLI (az) not found on PATH; install it and run `az login`",
            )),
        }
    }
}
