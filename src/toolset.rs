//! The server's public tool surface.
//!
//! Each tool is a thin handler over the engines in [`AppState`]; all
//! argument schemas, dry-run defaults, and destructive markings live here
//! so the whole surface can be reviewed in one file.

use crate::ado::AdoGateway;
use crate::auth::TokenProvider;
use crate::bulk::{BulkAction, BulkEngine, BulkRequest};
use crate::config::ServerConfig;
use crate::dispatch::{
    ArgKind, ArgumentSchema, ToolContext, ToolRegistration, ToolRegistry,
};
use crate::envelope::ToolExecutionResult;
use crate::executor::{FilterPattern, QueryExecutor, WiqlQueryRequest, preview_items};
use crate::generator::{GenerateRequest, QueryFormat, QueryGenerator};
use crate::handles::QueryHandleStore;
use crate::odata::{OdataExecutor, OdataQueryRequest, OdataQueryType};
use crate::selector::ItemSelector;
use crate::undo::{UndoEngine, UndoJournal};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::str::FromStr;
use std::sync::Arc;

/// Shared state every tool handler closes over.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub gateway: Arc<dyn AdoGateway>,
    pub store: Arc<QueryHandleStore>,
    pub journal: Arc<UndoJournal>,
    pub executor: Arc<QueryExecutor>,
    pub odata: Arc<OdataExecutor>,
    pub bulk: Arc<BulkEngine>,
    pub undo: Arc<UndoEngine>,
    pub generator: Arc<QueryGenerator>,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>, gateway: Arc<dyn AdoGateway>) -> Self {
        let store = Arc::new(QueryHandleStore::new(config.handle_ttl));
        let journal = Arc::new(UndoJournal::new());
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            Arc::clone(&config),
        ));
        let odata = Arc::new(OdataExecutor::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            Arc::clone(&config),
        ));
        let bulk = Arc::new(BulkEngine::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            Arc::clone(&journal),
            Arc::clone(&config),
        ));
        let undo = Arc::new(UndoEngine::new(Arc::clone(&gateway), Arc::clone(&journal)));
        let generator = Arc::new(QueryGenerator::new(
            Arc::clone(&gateway),
            Arc::clone(&executor),
        ));

        Self {
            config,
            gateway,
            store,
            journal,
            executor,
            odata,
            bulk,
            undo,
            generator,
        }
    }
}

/// Configured argument defaults merged into tool calls (precedence sits
/// between explicit arguments and schema defaults).
pub fn configured_defaults(config: &ServerConfig) -> Map<String, Value> {
    let mut defaults = Map::new();
    defaults.insert("organization".into(), json!(config.organization));
    defaults.insert("project".into(), json!(config.project));
    if let [only] = config.area_paths.as_slice() {
        defaults.insert("areaPath".into(), json!(only));
    }
    if let Some(wit) = &config.defaults.work_item_type {
        defaults.insert("workItemType".into(), json!(wit));
    }
    if let Some(priority) = config.defaults.priority {
        defaults.insert("priority".into(), json!(priority));
    }
    if let Some(assignee) = &config.defaults.assigned_to {
        defaults.insert("assignedTo".into(), json!(assignee));
    }
    if let Some(iteration) = &config.defaults.iteration_path {
        defaults.insert("iterationPath".into(), json!(iteration));
    }
    defaults
}

macro_rules! register {
    ($registry:expr, $state:expr, $registration:expr, $handler:path) => {{
        let state = Arc::clone(&$state);
        $registry.register($registration.build(move |args, ctx| {
            let state = Arc::clone(&state);
            async move { $handler(state, args, ctx).await }
        }))?;
    }};
}

/// Build the full tool registry. Fails fast on duplicate names.
pub fn build_registry(
    state: Arc<AppState>,
    provider: Option<Arc<dyn TokenProvider>>,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new(configured_defaults(&state.config));
    if let Some(provider) = provider {
        registry = registry.with_token_provider(provider);
    }

    register!(
        registry,
        state,
        ToolRegistration::new(
            "query-wiql",
            "Run a WIQL query against Azure DevOps work items. Returns a query handle for \
             safe bulk operations plus a preview of the first matches.",
        )
        .schema(
            ArgumentSchema::new()
                .required("wiqlQuery", ArgKind::String, "WIQL query text")
                .optional("top", ArgKind::Integer, "page size (default 200)")
                .optional("skip", ArgKind::Integer, "items to skip for pagination")
                .optional(
                    "includeFields",
                    ArgKind::Array,
                    "extra field reference names to snapshot",
                )
                .with_default(
                    "includeSubstantiveChange",
                    ArgKind::Boolean,
                    "derive lastSubstantiveChangeDate/daysInactive from revision history",
                    json!(false),
                )
                .optional(
                    "filterByPatterns",
                    ArgKind::Array,
                    "post-fetch filters: missing_description, placeholder_titles, duplicates",
                )
                .optional(
                    "filterByDaysInactiveMin",
                    ArgKind::Integer,
                    "keep items inactive at least this many days",
                )
                .optional(
                    "filterByDaysInactiveMax",
                    ArgKind::Integer,
                    "keep items inactive at most this many days",
                )
                .with_default(
                    "returnQueryHandle",
                    ArgKind::Boolean,
                    "bind results to an opaque handle",
                    json!(true),
                )
                .with_default(
                    "handleOnly",
                    ArgKind::Boolean,
                    "respond with only the handle id and count",
                    json!(false),
                ),
        ),
        handle_query_wiql
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "query-odata",
            "Run an aggregate query against Azure DevOps Analytics (counts, group-bys, \
             velocity and cycle-time metrics, or a custom OData query string).",
        )
        .requires_az_cli()
        .schema(
            ArgumentSchema::new()
                .required(
                    "queryType",
                    ArgKind::String,
                    "workItemCount | groupByState | groupByType | groupByAssignee | \
                     velocityMetrics | cycleTimeMetrics | customQuery",
                )
                .optional(
                    "customQuery",
                    ArgKind::String,
                    "query string after WorkItems? (customQuery only)",
                )
                .optional("areaPath", ArgKind::String, "filter to an area path subtree")
                .optional("workItemType", ArgKind::String, "filter by work item type")
                .optional("state", ArgKind::String, "filter by state")
                .optional(
                    "createdAfter",
                    ArgKind::String,
                    "ISO 8601 lower bound on CreatedDate",
                )
                .optional(
                    "completedAfter",
                    ArgKind::String,
                    "ISO 8601 lower bound on CompletedDate (metrics queries)",
                )
                .optional("top", ArgKind::Integer, "row cap for custom queries")
                .with_default(
                    "returnQueryHandle",
                    ArgKind::Boolean,
                    "bind WorkItemId rows to a handle",
                    json!(false),
                ),
        ),
        handle_query_odata
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "list-query-handles",
            "List unexpired query handles with item counts and expiry times.",
        ),
        handle_list_handles
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "inspect-query-handle",
            "Show a handle's original query, metadata, expiry, and an item preview.",
        )
        .schema(
            ArgumentSchema::new()
                .required("queryHandle", ArgKind::String, "handle id (qh_…)")
                .with_default(
                    "includePreview",
                    ArgKind::Boolean,
                    "include the first items",
                    json!(true),
                ),
        ),
        handle_inspect_handle
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "analyze-query-handle",
            "Aggregate statistics over a handle's snapshot: state/type/assignee \
             distributions and staleness buckets. No ADO calls.",
        )
        .schema(ArgumentSchema::new().required(
            "queryHandle",
            ArgKind::String,
            "handle id (qh_…)",
        )),
        handle_analyze_handle
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "execute-bulk-operations",
            "Apply a sequence of actions (update-fields, add-tag, remove-tag, comment, \
             assign, transition-state, link, remove, move-to-iteration, \
             enhance-description) to items selected from a query handle. Dry-run by \
             default.",
        )
        .destructive()
        .schema(
            ArgumentSchema::new()
                .required("queryHandle", ArgKind::String, "handle id (qh_…)")
                .with_default(
                    "itemSelector",
                    ArgKind::Any,
                    "\"all\", an index list like [0,2], or a criteria object",
                    json!("all"),
                )
                .required("actions", ArgKind::Array, "ordered action list")
                .with_default(
                    "dryRun",
                    ArgKind::Boolean,
                    "plan without writing",
                    json!(true),
                ),
        ),
        handle_bulk_operations
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "undo-bulk",
            "Revert a journaled bulk operation, by operation id or the most recent \
             operation for a handle. Items changed by someone else since are skipped.",
        )
        .schema(
            ArgumentSchema::new()
                .optional("operationId", ArgKind::String, "operation id (op_…)")
                .optional(
                    "queryHandle",
                    ArgKind::String,
                    "undo the latest operation for this handle",
                ),
        ),
        handle_undo_bulk
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "undo-by-time-window",
            "Forensic undo: revert every journaled operation by an actor within the \
             last N hours, newest first, skipping third-party-modified items.",
        )
        .schema(
            ArgumentSchema::new()
                .with_default(
                    "actor",
                    ArgKind::String,
                    "journal actor name",
                    json!("mcp-client"),
                )
                .with_default(
                    "hoursBack",
                    ArgKind::Integer,
                    "window size in hours",
                    json!(24),
                ),
        ),
        handle_undo_window
    );

    register!(
        registry,
        state,
        ToolRegistration::new(
            "generate-query",
            "Generate a WIQL or OData query from a natural-language description using \
             the host model, validating it against live data before returning.",
        )
        .schema(
            ArgumentSchema::new()
                .required(
                    "description",
                    ArgKind::String,
                    "what the query should find",
                )
                .with_default("format", ArgKind::String, "wiql | odata", json!("wiql"))
                .with_default(
                    "testQuery",
                    ArgKind::Boolean,
                    "execute candidates and iterate on failures",
                    json!(true),
                )
                .with_default(
                    "maxIterations",
                    ArgKind::Integer,
                    "correction attempts (max 5)",
                    json!(3),
                )
                .with_default(
                    "returnQueryHandle",
                    ArgKind::Boolean,
                    "run the validated query and return a handle",
                    json!(false),
                ),
        ),
        handle_generate_query
    );

    Ok(registry)
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn arg_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

fn arg_bool(args: &Map<String, Value>, name: &str) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(false)
}

fn arg_usize(args: &Map<String, Value>, name: &str) -> Option<usize> {
    args.get(name).and_then(Value::as_u64).map(|v| v as usize)
}

fn arg_i64(args: &Map<String, Value>, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

fn arg_string_list(args: &Map<String, Value>, name: &str) -> Result<Vec<String>> {
    match args.get(name) {
        None => Ok(Vec::new()),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|e| {
                e.as_str().map(str::to_string).ok_or_else(|| {
                    Error::validation(format!("{name} entries must be strings, got {e}"))
                })
            })
            .collect(),
        Some(other) => Err(Error::validation(format!(
            "{name} must be an array of strings, got {other}"
        ))),
    }
}

/// Accept a full RFC 3339 timestamp or a bare `YYYY-MM-DD` date.
fn parse_date_arg(raw: &str, name: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc())
        .map_err(|_| {
            Error::validation(format!(
                "{name} must be an ISO 8601 date or timestamp, got {raw:?}"
            ))
        })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_query_wiql(
    state: Arc<AppState>,
    args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let mut request = WiqlQueryRequest::new(
        arg_str(&args, "wiqlQuery").ok_or_else(|| Error::validation("wiqlQuery is required"))?,
    );
    request.top = arg_usize(&args, "top");
    request.skip = arg_usize(&args, "skip");
    request.include_fields = arg_string_list(&args, "includeFields")?;
    request.include_substantive_change = arg_bool(&args, "includeSubstantiveChange");
    request.filter_patterns = arg_string_list(&args, "filterByPatterns")?
        .iter()
        .map(|p| FilterPattern::from_str(p))
        .collect::<Result<Vec<_>>>()?;
    request.filter_days_inactive_min = arg_i64(&args, "filterByDaysInactiveMin");
    request.filter_days_inactive_max = arg_i64(&args, "filterByDaysInactiveMax");
    request.return_query_handle = arg_bool(&args, "returnQueryHandle");
    request.handle_only = arg_bool(&args, "handleOnly");

    let calls_before = state.gateway.read_calls() + state.gateway.write_calls();
    let output = state.executor.run_wiql(&request).await?;
    let calls_after = state.gateway.read_calls() + state.gateway.write_calls();

    let mut result = ToolExecutionResult::success("query-wiql", output.data)
        .with_warnings(output.warnings);
    result.metadata.api_calls = Some(calls_after - calls_before);
    Ok(result)
}

async fn handle_query_odata(
    state: Arc<AppState>,
    args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let query_type = OdataQueryType::from_str(
        arg_str(&args, "queryType").ok_or_else(|| Error::validation("queryType is required"))?,
    )?;

    let mut request = OdataQueryRequest::new(query_type);
    request.custom_query = arg_str(&args, "customQuery").map(str::to_string);
    request.area_path = arg_str(&args, "areaPath").map(str::to_string);
    request.work_item_type = arg_str(&args, "workItemType").map(str::to_string);
    request.state = arg_str(&args, "state").map(str::to_string);
    request.created_after = arg_str(&args, "createdAfter")
        .map(|raw| parse_date_arg(raw, "createdAfter"))
        .transpose()?;
    request.completed_after = arg_str(&args, "completedAfter")
        .map(|raw| parse_date_arg(raw, "completedAfter"))
        .transpose()?;
    request.top = arg_usize(&args, "top");
    request.return_query_handle = arg_bool(&args, "returnQueryHandle");

    let output = state.odata.run(&request).await?;
    Ok(ToolExecutionResult::success("query-odata", output.data)
        .with_warnings(output.warnings))
}

async fn handle_list_handles(
    state: Arc<AppState>,
    _args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let handles = state.store.list();
    Ok(ToolExecutionResult::success(
        "list-query-handles",
        json!({
            "count": handles.len(),
            "handles": handles,
        }),
    ))
}

async fn handle_inspect_handle(
    state: Arc<AppState>,
    args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let handle_id =
        arg_str(&args, "queryHandle").ok_or_else(|| Error::validation("queryHandle is required"))?;
    let handle = state.store.get_data(handle_id)?;

    let mut data = json!({
        "queryHandle": handle.id,
        "workItemCount": handle.work_item_ids.len(),
        "originalQuery": handle.original_query,
        "metadata": handle.metadata,
        "createdAt": handle.created_at,
        "expiresAt": handle.expires_at,
    });
    if args.get("includePreview").and_then(Value::as_bool).unwrap_or(true) {
        data["items"] = json!(preview_items(
            &handle.work_item_ids,
            &handle.item_context,
            crate::executor::PREVIEW_LIMIT
        ));
    }
    Ok(ToolExecutionResult::success("inspect-query-handle", data))
}

async fn handle_analyze_handle(
    state: Arc<AppState>,
    args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let handle_id =
        arg_str(&args, "queryHandle").ok_or_else(|| Error::validation("queryHandle is required"))?;
    let handle = state.store.get_data(handle_id)?;

    let mut by_state: std::collections::BTreeMap<String, usize> = Default::default();
    let mut by_type: std::collections::BTreeMap<String, usize> = Default::default();
    let mut by_assignee: std::collections::BTreeMap<String, usize> = Default::default();
    let mut staleness = json!({
        "0-7": 0, "8-30": 0, "31-90": 0, "90+": 0, "unknown": 0
    });

    for id in &handle.work_item_ids {
        let Some(ctx) = handle.item_context.get(id) else {
            continue;
        };
        *by_state.entry(ctx.state.clone()).or_default() += 1;
        *by_type.entry(ctx.item_type.clone()).or_default() += 1;
        *by_assignee
            .entry(ctx.assigned_to.clone().unwrap_or_else(|| "unassigned".into()))
            .or_default() += 1;

        let bucket = match ctx.days_inactive {
            Some(d) if d <= 7 => "0-7",
            Some(d) if d <= 30 => "8-30",
            Some(d) if d <= 90 => "31-90",
            Some(_) => "90+",
            None => "unknown",
        };
        staleness[bucket] = json!(staleness[bucket].as_u64().unwrap_or(0) + 1);
    }

    Ok(ToolExecutionResult::success(
        "analyze-query-handle",
        json!({
            "queryHandle": handle.id,
            "workItemCount": handle.work_item_ids.len(),
            "itemsWithContext": handle.item_context.len(),
            "byState": by_state,
            "byType": by_type,
            "byAssignee": by_assignee,
            "stalenessBuckets": staleness,
        }),
    ))
}

async fn handle_bulk_operations(
    state: Arc<AppState>,
    args: Map<String, Value>,
    ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let query_handle = arg_str(&args, "queryHandle")
        .ok_or_else(|| Error::validation("queryHandle is required"))?
        .to_string();
    let item_selector = ItemSelector::from_value(
        args.get("itemSelector").unwrap_or(&json!("all")),
    )?;
    let actions: Vec<BulkAction> = serde_json::from_value(
        args.get("actions")
            .cloned()
            .ok_or_else(|| Error::validation("actions is required"))?,
    )
    .map_err(|e| Error::validation(format!("invalid actions: {e}")))?;
    let dry_run = args
        .get("dryRun")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let request = BulkRequest {
        query_handle,
        item_selector,
        actions,
        dry_run,
    };

    let calls_before = state.gateway.read_calls() + state.gateway.write_calls();
    let execution = state
        .bulk
        .execute(&request, ctx.sampling.clone(), &ctx.cancellation)
        .await?;
    let calls_after = state.gateway.read_calls() + state.gateway.write_calls();

    let mut result = if execution.failed > 0 {
        let errors: Vec<String> = execution.data["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .filter(|r| r["success"] == json!(false))
                    .map(|r| {
                        format!(
                            "item {}: {}",
                            r["id"],
                            r["error"].as_str().unwrap_or("unknown error")
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        ToolExecutionResult::failure("execute-bulk-operations", errors)
            .with_data(execution.data)
    } else {
        ToolExecutionResult::success("execute-bulk-operations", execution.data)
    };
    result = result.with_warnings(execution.warnings);
    result.metadata.api_calls = Some(calls_after - calls_before);
    Ok(result)
}

async fn handle_undo_bulk(
    state: Arc<AppState>,
    args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let data = state
        .undo
        .undo_operation(arg_str(&args, "operationId"), arg_str(&args, "queryHandle"))
        .await?;
    Ok(ToolExecutionResult::success("undo-bulk", data))
}

async fn handle_undo_window(
    state: Arc<AppState>,
    args: Map<String, Value>,
    _ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let actor = arg_str(&args, "actor").unwrap_or("mcp-client");
    let hours = arg_i64(&args, "hoursBack").unwrap_or(24).clamp(1, 24 * 30);
    let to = Utc::now();
    let from = to - chrono::Duration::hours(hours);

    let data = state.undo.undo_window(actor, from, to).await?;
    Ok(ToolExecutionResult::success("undo-by-time-window", data))
}

async fn handle_generate_query(
    state: Arc<AppState>,
    args: Map<String, Value>,
    ctx: ToolContext,
) -> Result<ToolExecutionResult> {
    let sampling = ctx.sampling.clone().ok_or_else(|| {
        Error::sampling_unavailable("the connected MCP host does not offer sampling")
    })?;

    let mut request = GenerateRequest::new(
        arg_str(&args, "description")
            .ok_or_else(|| Error::validation("description is required"))?,
        QueryFormat::from_str(arg_str(&args, "format").unwrap_or("wiql"))?,
    );
    request.test_query = args
        .get("testQuery")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if let Some(iterations) = arg_usize(&args, "maxIterations") {
        request.max_iterations = iterations;
    }
    request.return_query_handle = arg_bool(&args, "returnQueryHandle");

    let output = state
        .generator
        .generate(&request, sampling, &ctx.cancellation)
        .await?;
    Ok(ToolExecutionResult::success("generate-query", output.data)
        .with_warnings(output.warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolDefaults;

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .organization("contoso")
            .area_path(r"Fabrikam\Platform")
            .defaults(ToolDefaults {
                work_item_type: Some("Task".into()),
                priority: Some(2),
                assigned_to: None,
                iteration_path: None,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_configured_defaults_include_derived_project() {
        let defaults = configured_defaults(&config());
        assert_eq!(defaults["organization"], "contoso");
        assert_eq!(defaults["project"], "Fabrikam");
        assert_eq!(defaults["areaPath"], r"Fabrikam\Platform");
        assert_eq!(defaults["workItemType"], "Task");
        assert_eq!(defaults["priority"], 2);
        assert!(defaults.get("assignedTo").is_none());
    }

    #[test]
    fn test_multiple_area_paths_produce_no_default() {
        let config = ServerConfig::builder()
            .organization("contoso")
            .area_path(r"Fabrikam\Platform")
            .area_path(r"Fabrikam\Web")
            .build()
            .unwrap();
        let defaults = configured_defaults(&config);
        assert!(defaults.get("areaPath").is_none());
    }

    #[test]
    fn test_parse_date_arg_forms() {
        assert!(parse_date_arg("2026-07-01", "createdAfter").is_ok());
        assert!(parse_date_arg("2026-07-01T10:30:00Z", "createdAfter").is_ok());
        assert!(parse_date_arg("last tuesday", "createdAfter").is_err());
    }
}
