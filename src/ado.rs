//! Authenticated JSON client for Azure DevOps REST and Analytics.
//!
//! [`AdoGateway`] is the seam between the server's engines and the network:
//! the query executor, bulk engine, and undo engine all talk to this trait,
//! which keeps them testable against an in-memory fake. [`AdoClient`] is the
//! production implementation over `reqwest`.
//!
//! Policies enforced here rather than in callers:
//!
//! - batched work-item reads never exceed the 200-id API ceiling;
//! - every request passes the shared rate gate (a semaphore), so one bulk
//!   operation cannot starve the rest of the process;
//! - transient failures (5xx, 429, timeouts) retry with backoff;
//! - read and write calls are counted, which lets tests prove the dry-run
//!   path never mutates and lets telemetry report per-tool API usage.

use crate::auth::{TokenProvider, TokenScope};
use crate::config::{ADO_BATCH_CEILING, ServerConfig};
use crate::models::{AdoWorkItem, JsonPatchOp, WiqlOutcome, WorkItemRevision};
use crate::retry::{RetryConfig, retry_transient};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;

/// Everything the engines need from Azure DevOps.
#[async_trait]
pub trait AdoGateway: Send + Sync {
    /// Run a WIQL query, returning the declared query type and the ordered
    /// id list (flat result ids, or relation targets for tree queries).
    async fn query_wiql(&self, wiql: &str) -> Result<WiqlOutcome>;

    /// Fetch work items by id, chunking into ≤200-id batches. Order of the
    /// result matches the order of `ids`. `fields` limits the response to
    /// the named reference fields; `expand_relations` fetches the full item
    /// including its relations instead (the API does not allow both).
    async fn get_work_items(
        &self,
        ids: &[i64],
        fields: Option<&[String]>,
        expand_relations: bool,
    ) -> Result<Vec<AdoWorkItem>>;

    /// Full revision history for one work item, oldest first.
    async fn get_revisions(&self, id: i64) -> Result<Vec<WorkItemRevision>>;

    /// Apply a JSON-patch document to a work item.
    async fn update_work_item(&self, id: i64, ops: &[JsonPatchOp]) -> Result<AdoWorkItem>;

    /// Append a discussion comment.
    async fn add_comment(&self, id: i64, text: &str) -> Result<()>;

    /// Delete a work item (moves it to the recycle bin).
    async fn delete_work_item(&self, id: i64) -> Result<()>;

    /// Restore a previously deleted work item from the recycle bin.
    async fn restore_work_item(&self, id: i64) -> Result<()>;

    /// Run an OData query against the Analytics endpoint. `query` is the
    /// encoded query string after `WorkItems?`.
    async fn query_analytics(&self, query: &str) -> Result<Value>;

    /// Read-only API calls issued so far.
    fn read_calls(&self) -> u64;

    /// State-mutating API calls issued so far.
    fn write_calls(&self) -> u64;
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default)]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WiqlResponse {
    #[serde(rename = "queryType", default)]
    query_type: Option<String>,

    #[serde(rename = "workItems", default)]
    work_items: Vec<WiqlItemRef>,

    #[serde(rename = "workItemRelations", default)]
    work_item_relations: Vec<WiqlRelationRef>,
}

#[derive(Debug, Deserialize)]
struct WiqlItemRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WiqlRelationRef {
    #[serde(default)]
    target: Option<WiqlItemRef>,
}

/// Production gateway over `reqwest`.
pub struct AdoClient {
    http: reqwest::Client,
    config: Arc<ServerConfig>,
    tokens: Arc<dyn TokenProvider>,
    gate: Semaphore,
    retry: RetryConfig,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl AdoClient {
    pub fn new(config: Arc<ServerConfig>, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            gate: Semaphore::new(config.request_gate),
            retry: RetryConfig::default(),
            config,
            tokens,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// One authenticated request with rate gating and transient retry.
    /// `content_type` overrides `application/json` (JSON-patch calls need
    /// `application/json-patch+json`).
    async fn send(
        &self,
        method: Method,
        url: &str,
        scope: TokenScope,
        body: Option<&Value>,
        content_type: Option<&str>,
        mutating: bool,
    ) -> Result<Value> {
        let this = self;
        retry_transient(self.retry.clone(), move || {
            let method = method.clone();
            async move {
                this.request_once(method, url, scope, body, content_type, mutating)
                    .await
            }
        })
        .await
    }

    async fn request_once(
        &self,
        method: Method,
        url: &str,
        scope: TokenScope,
        body: Option<&Value>,
        content_type: Option<&str>,
        mutating: bool,
    ) -> Result<Value> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::other("rate gate closed"))?;

        let token = self.tokens.bearer_token(scope).await?;

        if mutating {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", content_type.unwrap_or("application/json"));
        if let Some(body) = body {
            request = request.body(serde_json::to_vec(body)?);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unspecified")
                .to_string();
            return Err(Error::rate_limited(format!(
                "429 from {url} (Retry-After: {retry_after})"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status.as_u16(), upstream_message(&text)));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = response.text().await.map_err(Error::Http)?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.rest_base_url(), path)
    }
}

/// Pull the human-readable `message` out of an ADO error body, falling back
/// to the raw text.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no response body".to_string()
            } else {
                trimmed.chars().take(500).collect()
            }
        })
}

/// Collect ids from a WIQL response, deduplicating while preserving result
/// order. Tree queries report ids through `workItemRelations` targets.
fn collect_wiql_ids(response: &WiqlResponse) -> Vec<i64> {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();

    let raw = response
        .work_items
        .iter()
        .map(|r| r.id)
        .chain(
            response
                .work_item_relations
                .iter()
                .filter_map(|r| r.target.as_ref().map(|t| t.id)),
        );

    for id in raw {
        if seen.insert(id) {
            ids.push(id);
        }
    }
    ids
}

#[async_trait]
impl AdoGateway for AdoClient {
    async fn query_wiql(&self, wiql: &str) -> Result<WiqlOutcome> {
        let url = self.rest_url("wit/wiql?api-version=7.1");
        let body = json!({ "query": wiql });
        let raw = self
            .send(Method::POST, &url, TokenScope::AdoRest, Some(&body), None, false)
            .await?;

        let response: WiqlResponse = serde_json::from_value(raw)?;
        Ok(WiqlOutcome {
            query_type: response.query_type.clone().unwrap_or_else(|| "flat".into()),
            ids: collect_wiql_ids(&response),
        })
    }

    async fn get_work_items(
        &self,
        ids: &[i64],
        fields: Option<&[String]>,
        expand_relations: bool,
    ) -> Result<Vec<AdoWorkItem>> {
        let mut items = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(ADO_BATCH_CEILING) {
            let id_list = chunk
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");

            // fields and $expand are mutually exclusive on this endpoint.
            let url = match (fields, expand_relations) {
                (_, true) => self.rest_url(&format!(
                    "wit/workitems?ids={id_list}&$expand=relations&api-version=7.1"
                )),
                (Some(fields), false) if !fields.is_empty() => self.rest_url(&format!(
                    "wit/workitems?ids={id_list}&fields={}&api-version=7.1",
                    fields.join(",")
                )),
                _ => self.rest_url(&format!("wit/workitems?ids={id_list}&api-version=7.1")),
            };

            let raw = self
                .send(Method::GET, &url, TokenScope::AdoRest, None, None, false)
                .await?;
            let batch: ListResponse<AdoWorkItem> = serde_json::from_value(raw)?;
            items.extend(batch.value);
        }

        Ok(items)
    }

    async fn get_revisions(&self, id: i64) -> Result<Vec<WorkItemRevision>> {
        let url = self.rest_url(&format!("wit/workitems/{id}/revisions?api-version=7.1"));
        let raw = self
            .send(Method::GET, &url, TokenScope::AdoRest, None, None, false)
            .await?;
        let response: ListResponse<WorkItemRevision> = serde_json::from_value(raw)?;
        Ok(response.value)
    }

    async fn update_work_item(&self, id: i64, ops: &[JsonPatchOp]) -> Result<AdoWorkItem> {
        let url = self.rest_url(&format!("wit/workitems/{id}?api-version=7.1"));
        let body = serde_json::to_value(ops)?;
        let raw = self
            .send(
                Method::PATCH,
                &url,
                TokenScope::AdoRest,
                Some(&body),
                Some("application/json-patch+json"),
                true,
            )
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn add_comment(&self, id: i64, text: &str) -> Result<()> {
        let url = self.rest_url(&format!(
            "wit/workItems/{id}/comments?api-version=7.1-preview.3"
        ));
        let body = json!({ "text": text });
        self.send(Method::POST, &url, TokenScope::AdoRest, Some(&body), None, true)
            .await?;
        Ok(())
    }

    async fn delete_work_item(&self, id: i64) -> Result<()> {
        let url = self.rest_url(&format!("wit/workItems/{id}?api-version=7.1"));
        self.send(Method::DELETE, &url, TokenScope::AdoRest, None, None, true)
            .await?;
        Ok(())
    }

    async fn restore_work_item(&self, id: i64) -> Result<()> {
        let url = self.rest_url(&format!("wit/recyclebin/{id}?api-version=7.1"));
        let body = json!({ "isDeleted": false });
        self.send(Method::PATCH, &url, TokenScope::AdoRest, Some(&body), None, true)
            .await?;
        Ok(())
    }

    async fn query_analytics(&self, query: &str) -> Result<Value> {
        let url = format!("{}/WorkItems?{query}", self.config.analytics_base_url());
        self.send(Method::GET, &url, TokenScope::Analytics, None, None, false)
            .await
    }

    fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
