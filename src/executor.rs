//! WIQL query execution: pagination, context snapshotting, staleness
//! enrichment, hygiene filters, and handle creation.
//!
//! The executor is the only component that creates query handles. Context
//! is snapshotted at query time precisely so that selectors, previews, and
//! comment templates later run without touching ADO again.

use crate::ado::AdoGateway;
use crate::config::{ADO_BATCH_CEILING, ServerConfig};
use crate::handles::{HandleMetadata, QueryHandleStore, QueryKind};
use crate::models::{self, ItemContext};
use crate::staleness::{self, AutomationPatterns};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// Default page size when the caller does not paginate explicitly.
const DEFAULT_PAGE_SIZE: usize = 200;

/// How many items a query preview shows.
pub const PREVIEW_LIMIT: usize = 10;

/// Fields snapshotted into every item context.
const CONTEXT_FIELDS: &[&str] = &[
    models::FIELD_TITLE,
    models::FIELD_STATE,
    models::FIELD_TYPE,
    models::FIELD_TAGS,
    models::FIELD_ASSIGNED_TO,
    models::FIELD_AREA_PATH,
    models::FIELD_ITERATION_PATH,
    models::FIELD_CHANGED_DATE,
    models::FIELD_DESCRIPTION,
];

/// Post-fetch hygiene filters applied to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPattern {
    MissingDescription,
    PlaceholderTitles,
    Duplicates,
}

impl FilterPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterPattern::MissingDescription => "missing_description",
            FilterPattern::PlaceholderTitles => "placeholder_titles",
            FilterPattern::Duplicates => "duplicates",
        }
    }
}

impl FromStr for FilterPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "missing_description" => Ok(FilterPattern::MissingDescription),
            "placeholder_titles" => Ok(FilterPattern::PlaceholderTitles),
            "duplicates" => Ok(FilterPattern::Duplicates),
            other => Err(Error::validation(format!(
                "unknown filter pattern {other:?}; supported: missing_description, placeholder_titles, duplicates"
            ))),
        }
    }
}

/// One WIQL execution request.
#[derive(Debug, Clone)]
pub struct WiqlQueryRequest {
    pub query: String,
    pub top: Option<usize>,
    pub skip: Option<usize>,

    /// Extra field reference names to snapshot beyond the defaults.
    pub include_fields: Vec<String>,

    /// Compute `lastSubstantiveChangeDate`/`daysInactive` per item.
    pub include_substantive_change: bool,

    pub filter_patterns: Vec<FilterPattern>,
    pub filter_days_inactive_min: Option<i64>,
    pub filter_days_inactive_max: Option<i64>,

    pub return_query_handle: bool,

    /// With `return_query_handle`: respond with only the handle id and
    /// count. Context is still fetched and stored.
    pub handle_only: bool,
}

impl WiqlQueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top: None,
            skip: None,
            include_fields: Vec::new(),
            include_substantive_change: false,
            filter_patterns: Vec::new(),
            filter_days_inactive_min: None,
            filter_days_inactive_max: None,
            return_query_handle: false,
            handle_only: false,
        }
    }

    fn wants_inactivity_filter(&self) -> bool {
        self.filter_days_inactive_min.is_some() || self.filter_days_inactive_max.is_some()
    }
}

/// Execution output: the response payload plus non-fatal warnings.
#[derive(Debug)]
pub struct ExecutorOutput {
    pub data: Value,
    pub warnings: Vec<String>,
}

/// Runs WIQL queries and mints query handles.
pub struct QueryExecutor {
    gateway: Arc<dyn AdoGateway>,
    store: Arc<QueryHandleStore>,
    config: Arc<ServerConfig>,
    patterns: AutomationPatterns,
}

impl QueryExecutor {
    pub fn new(
        gateway: Arc<dyn AdoGateway>,
        store: Arc<QueryHandleStore>,
        config: Arc<ServerConfig>,
    ) -> Self {
        let patterns = AutomationPatterns::new(config.copilot_guid.as_deref());
        Self {
            gateway,
            store,
            config,
            patterns,
        }
    }

    /// Execute a WIQL request end to end.
    pub async fn run_wiql(&self, request: &WiqlQueryRequest) -> Result<ExecutorOutput> {
        let mut warnings = Vec::new();

        let outcome = self.gateway.query_wiql(&request.query).await?;
        let total_count = outcome.ids.len();

        // Client-side pagination over the full id list.
        let skip = request.skip.unwrap_or(0);
        let top = request.top.unwrap_or(DEFAULT_PAGE_SIZE);
        let page_ids: Vec<i64> = outcome.ids.iter().skip(skip).take(top).copied().collect();
        let has_next_page = skip + page_ids.len() < total_count;
        let next_skip = has_next_page.then_some(skip + page_ids.len());

        // Snapshot context for the page.
        let mut context = self
            .fetch_context(&page_ids, &request.include_fields, &mut warnings)
            .await;

        if request.include_substantive_change {
            self.enrich_staleness(&page_ids, &mut context, &mut warnings)
                .await;
        } else if request.wants_inactivity_filter() {
            return Err(Error::validation(
                "filterByDaysInactiveMin/Max require includeSubstantiveChange",
            ));
        }

        // Hygiene and inactivity filters run on the snapshot, never on ADO.
        let final_ids = apply_filters(&page_ids, &context, request);
        context.retain(|id, _| final_ids.contains(id));

        let work_item_count = final_ids.len();
        let mut data = json!({
            "workItemCount": work_item_count,
            "totalCount": total_count,
            "hasNextPage": has_next_page,
        });
        if let Some(next_skip) = next_skip {
            data["nextSkip"] = json!(next_skip);
        }

        if request.return_query_handle {
            let filter_criteria = describe_filters(request);
            let handle_id = self.store.store(
                final_ids.clone(),
                request.query.clone(),
                HandleMetadata {
                    project: self.config.project.clone(),
                    query_type: QueryKind::from_wiql_type(&outcome.query_type),
                    filter_criteria,
                    created_by: None,
                },
                None,
                context.clone(),
            );
            data["queryHandle"] = json!(handle_id);

            if !request.handle_only {
                data["items"] = json!(preview_items(&final_ids, &context, PREVIEW_LIMIT));
            }
        } else {
            data["items"] = json!(snapshot_items(&final_ids, &context));
        }

        Ok(ExecutorOutput { data, warnings })
    }

    /// Fetch work items for the page in ≤200-id batches with a small
    /// concurrency cap. A failed batch degrades to a warning; the snapshot
    /// is allowed to be partial.
    async fn fetch_context(
        &self,
        ids: &[i64],
        extra_fields: &[String],
        warnings: &mut Vec<String>,
    ) -> HashMap<i64, ItemContext> {
        if ids.is_empty() {
            return HashMap::new();
        }

        let mut field_list: Vec<String> =
            CONTEXT_FIELDS.iter().map(|s| s.to_string()).collect();
        for field in extra_fields {
            if !field_list.contains(field) {
                field_list.push(field.clone());
            }
        }

        let chunks: Vec<Vec<i64>> = ids
            .chunks(ADO_BATCH_CEILING)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut stream = futures::stream::iter(chunks.into_iter().map(|chunk| {
            let gateway = Arc::clone(&self.gateway);
            let fields = field_list.clone();
            async move {
                let result = gateway.get_work_items(&chunk, Some(&fields), false).await;
                (chunk, result)
            }
        }))
        .buffered(self.config.fetch_concurrency);

        let mut context = HashMap::with_capacity(ids.len());
        while let Some((chunk, result)) = stream.next().await {
            match result {
                Ok(items) => {
                    for item in &items {
                        context.insert(item.id, ItemContext::from_work_item(item, extra_fields));
                    }
                }
                Err(err) => warnings.push(format!(
                    "failed to fetch context for {} item(s) starting at id {}: {err}",
                    chunk.len(),
                    chunk.first().copied().unwrap_or_default()
                )),
            }
        }
        context
    }

    /// Fetch revision history per item with bounded fan-out and derive
    /// staleness fields. Individual failures become warnings.
    async fn enrich_staleness(
        &self,
        ids: &[i64],
        context: &mut HashMap<i64, ItemContext>,
        warnings: &mut Vec<String>,
    ) {
        let now = chrono::Utc::now();
        let mut stream = futures::stream::iter(ids.iter().copied().map(|id| {
            let gateway = Arc::clone(&self.gateway);
            async move { (id, gateway.get_revisions(id).await) }
        }))
        .buffer_unordered(self.config.revision_concurrency);

        while let Some((id, result)) = stream.next().await {
            match result {
                Ok(revisions) => {
                    if let Some(ctx) = context.get_mut(&id) {
                        let last = staleness::last_substantive_change(&revisions, &self.patterns);
                        ctx.last_substantive_change_date = last;
                        ctx.days_inactive = last.map(|l| staleness::days_between(l, now));
                    }
                }
                Err(err) => warnings.push(format!(
                    "substantive-change analysis failed for item {id}: {err}"
                )),
            }
        }
    }

    /// Fetch a single work item and bind it to a single-item handle, used
    /// by tools that need bulk-style safety for one id.
    pub async fn snapshot_single_item(&self, id: i64) -> Result<(String, ItemContext)> {
        let items = self.gateway.get_work_items(&[id], None, false).await?;
        let item = items
            .first()
            .ok_or_else(|| Error::upstream(404, format!("work item {id} not found")))?;
        let ctx = ItemContext::from_work_item(item, &[]);

        let mut context = HashMap::new();
        context.insert(id, ctx.clone());
        let handle_id = self.store.store(
            vec![id],
            format!("single item {id}"),
            HandleMetadata {
                project: self.config.project.clone(),
                query_type: QueryKind::SingleItem,
                filter_criteria: None,
                created_by: None,
            },
            None,
            context,
        );
        Ok((handle_id, ctx))
    }
}

fn describe_filters(request: &WiqlQueryRequest) -> Option<Value> {
    let mut filters = serde_json::Map::new();
    if !request.filter_patterns.is_empty() {
        filters.insert(
            "patterns".into(),
            json!(
                request
                    .filter_patterns
                    .iter()
                    .map(FilterPattern::as_str)
                    .collect::<Vec<_>>()
            ),
        );
    }
    if let Some(min) = request.filter_days_inactive_min {
        filters.insert("daysInactiveMin".into(), json!(min));
    }
    if let Some(max) = request.filter_days_inactive_max {
        filters.insert("daysInactiveMax".into(), json!(max));
    }
    (!filters.is_empty()).then(|| Value::Object(filters))
}

/// Apply pattern and inactivity filters, preserving id order. Items with no
/// snapshot are dropped whenever any filter is active, since they cannot be
/// evaluated.
fn apply_filters(
    ids: &[i64],
    context: &HashMap<i64, ItemContext>,
    request: &WiqlQueryRequest,
) -> Vec<i64> {
    let filtering =
        !request.filter_patterns.is_empty() || request.wants_inactivity_filter();
    if !filtering {
        return ids.to_vec();
    }

    // Duplicate detection: normalized-title collisions, everything after
    // the first occurrence in a colliding group.
    let duplicate_ids: std::collections::HashSet<i64> =
        if request.filter_patterns.contains(&FilterPattern::Duplicates) {
            let mut first_seen: HashMap<String, i64> = HashMap::new();
            let mut duplicates = std::collections::HashSet::new();
            for id in ids {
                if let Some(ctx) = context.get(id) {
                    let normalized = normalize_title(&ctx.title);
                    if first_seen.contains_key(&normalized) {
                        duplicates.insert(*id);
                    } else {
                        first_seen.insert(normalized, *id);
                    }
                }
            }
            duplicates
        } else {
            Default::default()
        };

    ids.iter()
        .copied()
        .filter(|id| {
            let Some(ctx) = context.get(id) else {
                return false;
            };

            for pattern in &request.filter_patterns {
                let matched = match pattern {
                    FilterPattern::MissingDescription => !ctx.has_description,
                    FilterPattern::PlaceholderTitles => {
                        staleness::is_placeholder_title(&ctx.title)
                    }
                    FilterPattern::Duplicates => duplicate_ids.contains(id),
                };
                if !matched {
                    return false;
                }
            }

            if request.wants_inactivity_filter() {
                let Some(days) = ctx.days_inactive else {
                    return false;
                };
                if let Some(min) = request.filter_days_inactive_min {
                    if days < min {
                        return false;
                    }
                }
                if let Some(max) = request.filter_days_inactive_max {
                    if days > max {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

fn normalize_title(title: &str) -> String {
    title.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The agent-facing sanity-check list: `{index, id, title, state, type,
/// daysInactive?, tags}` for the first `limit` items.
pub fn preview_items(
    ids: &[i64],
    context: &HashMap<i64, ItemContext>,
    limit: usize,
) -> Vec<Value> {
    ids.iter()
        .take(limit)
        .enumerate()
        .map(|(index, id)| {
            let mut entry = json!({ "index": index, "id": id });
            if let Some(ctx) = context.get(id) {
                entry["title"] = json!(ctx.title);
                entry["state"] = json!(ctx.state);
                entry["type"] = json!(ctx.item_type);
                entry["tags"] = json!(ctx.tags);
                if let Some(days) = ctx.days_inactive {
                    entry["daysInactive"] = json!(days);
                }
            }
            entry
        })
        .collect()
}

/// Full snapshot rows for non-handle responses.
fn snapshot_items(ids: &[i64], context: &HashMap<i64, ItemContext>) -> Vec<Value> {
    ids.iter()
        .map(|id| {
            match context.get(id) {
                Some(ctx) => {
                    let mut entry = serde_json::to_value(ctx).unwrap_or_else(|_| json!({}));
                    entry["id"] = json!(id);
                    entry
                }
                None => json!({ "id": id }),
            }
        })
        .collect()
}
