//! # Server configuration
//!
//! Everything the server needs to talk to one Azure DevOps organization:
//! the organization name, one or more area paths, per-tool default values,
//! and the tuning knobs for TTLs, timeouts, and concurrency.
//!
//! The project name is not passed explicitly; it is derived from the first
//! segment of the first configured area path (area paths are
//! backslash-delimited, `Project\Team\Component`).
//!
//! ## Example
//!
//! ```rust
//! use ado_mcp::ServerConfig;
//!
//! let config = ServerConfig::builder()
//!     .organization("contoso")
//!     .area_path(r"Fabrikam\Platform\Storage")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.project, "Fabrikam");
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TTL for query handles: one hour.
pub const DEFAULT_HANDLE_TTL: Duration = Duration::from_secs(3600);

/// Azure DevOps caps batched work-item reads at 200 ids per request.
pub const ADO_BATCH_CEILING: usize = 200;

/// Per-call HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Configured default argument values merged into tool calls when the
/// caller omits them (explicit argument > configured default > schema
/// default).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolDefaults {
    /// Default work-item type for creation-style operations.
    pub work_item_type: Option<String>,

    /// Default priority value.
    pub priority: Option<i64>,

    /// Default assignee (email or display name).
    pub assigned_to: Option<String>,

    /// Default iteration path.
    pub iteration_path: Option<String>,
}

/// Server configuration assembled at startup from CLI arguments.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Azure DevOps organization name (`https://dev.azure.com/{organization}`).
    pub organization: String,

    /// Project name, derived from the first area path.
    pub project: String,

    /// Configured area paths; at least one is required.
    pub area_paths: Vec<String>,

    /// GUID identifying the GitHub Copilot service account, used to classify
    /// its revisions as automation when computing staleness.
    pub copilot_guid: Option<String>,

    /// Configured per-tool defaults.
    pub defaults: ToolDefaults,

    /// TTL applied to newly created query handles.
    pub handle_ttl: Duration,

    /// Per-call HTTP timeout.
    pub http_timeout: Duration,

    /// Concurrent in-flight ADO requests (the rate gate's permit count).
    pub request_gate: usize,

    /// Concurrent work-item batch fetches during context snapshotting.
    pub fetch_concurrency: usize,

    /// Concurrent revision-history fetches for substantive-change analysis.
    pub revision_concurrency: usize,

    /// Concurrent per-item mutations inside one bulk operation.
    pub bulk_concurrency: usize,
}

impl ServerConfig {
    /// Start building a configuration.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Base URL for the organization's REST API, without a trailing slash.
    pub fn rest_base_url(&self) -> String {
        format!(
            "https://dev.azure.com/{}/{}/_apis",
            self.organization, self.project
        )
    }

    /// Base URL for the Analytics (OData) endpoint.
    pub fn analytics_base_url(&self) -> String {
        format!(
            "https://analytics.dev.azure.com/{}/{}/_odata/v3.0-preview",
            self.organization, self.project
        )
    }

    /// Resolve the area path for a tool call: an explicit argument always
    /// wins; a single configured path is used implicitly; multiple
    /// configured paths require the caller to pick one.
    pub fn resolve_area_path(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(path) = explicit {
            return Ok(path.to_string());
        }
        match self.area_paths.as_slice() {
            [only] => Ok(only.clone()),
            many => Err(Error::validation(format!(
                "multiple area paths are configured; pass areaPath explicitly (one of: {})",
                many.join(", ")
            ))),
        }
    }
}

/// Derive the project name from an area path: the first backslash-delimited
/// segment. Returns `None` for empty input.
pub fn project_from_area_path(area_path: &str) -> Option<String> {
    area_path
        .trim_start_matches('\\')
        .split('\\')
        .next()
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Builder for [`ServerConfig`] with validation at `build()`.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    organization: Option<String>,
    area_paths: Vec<String>,
    copilot_guid: Option<String>,
    defaults: ToolDefaults,
    handle_ttl: Option<Duration>,
    http_timeout: Option<Duration>,
    request_gate: Option<usize>,
    fetch_concurrency: Option<usize>,
    revision_concurrency: Option<usize>,
    bulk_concurrency: Option<usize>,
}

impl ServerConfigBuilder {
    /// Set the Azure DevOps organization name.
    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Add one area path. Call repeatedly for multiple paths.
    pub fn area_path(mut self, path: impl Into<String>) -> Self {
        self.area_paths.push(path.into());
        self
    }

    /// Set the Copilot service-account GUID.
    pub fn copilot_guid(mut self, guid: impl Into<String>) -> Self {
        self.copilot_guid = Some(guid.into());
        self
    }

    /// Replace the configured tool defaults.
    pub fn defaults(mut self, defaults: ToolDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Override the query-handle TTL.
    pub fn handle_ttl(mut self, ttl: Duration) -> Self {
        self.handle_ttl = Some(ttl);
        self
    }

    /// Override the per-call HTTP timeout.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Override the bulk per-item concurrency.
    pub fn bulk_concurrency(mut self, n: usize) -> Self {
        self.bulk_concurrency = Some(n);
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the organization is missing or empty,
    /// no area path was provided, or the project cannot be derived from the
    /// first area path.
    pub fn build(self) -> Result<ServerConfig> {
        let organization = self
            .organization
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config("organization is required"))?
            .to_string();

        if self.area_paths.is_empty() {
            return Err(Error::config("at least one --area-path is required"));
        }
        let project = project_from_area_path(&self.area_paths[0]).ok_or_else(|| {
            Error::config(format!(
                "cannot derive project from area path {:?}",
                self.area_paths[0]
            ))
        })?;

        Ok(ServerConfig {
            organization,
            project,
            area_paths: self.area_paths,
            copilot_guid: self.copilot_guid,
            defaults: self.defaults,
            handle_ttl: self.handle_ttl.unwrap_or(DEFAULT_HANDLE_TTL),
            http_timeout: self.http_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT),
            request_gate: self.request_gate.unwrap_or(8),
            fetch_concurrency: self.fetch_concurrency.unwrap_or(2),
            revision_concurrency: self.revision_concurrency.unwrap_or(10),
            bulk_concurrency: self.bulk_concurrency.unwrap_or(5),
        })
    }
}
