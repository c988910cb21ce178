//! OData Analytics queries: typed descriptors compiled to Analytics URLs.
//!
//! Analytics speaks a different dialect from the REST API: aggregation via
//! `$apply`, navigation paths like `AssignedTo/UserEmail`, and — the
//! operational trap — it rejects tokens from the primary OAuth flow, which
//! is why every call here goes through the gateway's Analytics-scoped
//! authenticator.
//!
//! Date filter formats differ by column type: `CreatedDate` comparisons use
//! a full timestamp, `CompletedDate` comparisons in the metrics queries use
//! the date-only `YYYY-MM-DDZ` form.

use crate::ado::AdoGateway;
use crate::config::ServerConfig;
use crate::executor::{ExecutorOutput, PREVIEW_LIMIT, preview_items};
use crate::handles::{HandleMetadata, QueryHandleStore, QueryKind};
use crate::models::ItemContext;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// The supported Analytics query shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdataQueryType {
    WorkItemCount,
    GroupByState,
    GroupByType,
    GroupByAssignee,
    VelocityMetrics,
    CycleTimeMetrics,
    CustomQuery,
}

impl OdataQueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OdataQueryType::WorkItemCount => "workItemCount",
            OdataQueryType::GroupByState => "groupByState",
            OdataQueryType::GroupByType => "groupByType",
            OdataQueryType::GroupByAssignee => "groupByAssignee",
            OdataQueryType::VelocityMetrics => "velocityMetrics",
            OdataQueryType::CycleTimeMetrics => "cycleTimeMetrics",
            OdataQueryType::CustomQuery => "customQuery",
        }
    }
}

impl FromStr for OdataQueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "workItemCount" => Ok(OdataQueryType::WorkItemCount),
            "groupByState" => Ok(OdataQueryType::GroupByState),
            "groupByType" => Ok(OdataQueryType::GroupByType),
            "groupByAssignee" => Ok(OdataQueryType::GroupByAssignee),
            "velocityMetrics" => Ok(OdataQueryType::VelocityMetrics),
            "cycleTimeMetrics" => Ok(OdataQueryType::CycleTimeMetrics),
            "customQuery" => Ok(OdataQueryType::CustomQuery),
            other => Err(Error::validation(format!(
                "unknown OData query type {other:?}"
            ))),
        }
    }
}

/// One Analytics request.
#[derive(Debug, Clone)]
pub struct OdataQueryRequest {
    pub query_type: OdataQueryType,

    /// Verbatim query string after `WorkItems?`, required for
    /// `customQuery`, rejected otherwise.
    pub custom_query: Option<String>,

    pub area_path: Option<String>,
    pub work_item_type: Option<String>,
    pub state: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub completed_after: Option<DateTime<Utc>>,

    /// Row cap for custom queries.
    pub top: Option<usize>,

    pub return_query_handle: bool,
}

impl OdataQueryRequest {
    pub fn new(query_type: OdataQueryType) -> Self {
        Self {
            query_type,
            custom_query: None,
            area_path: None,
            work_item_type: None,
            state: None,
            created_after: None,
            completed_after: None,
            top: None,
            return_query_handle: false,
        }
    }
}

/// Escape a string literal for an OData filter expression.
fn odata_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

fn filter_clauses(request: &OdataQueryRequest) -> Vec<String> {
    let mut clauses = Vec::new();
    if let Some(area) = &request.area_path {
        clauses.push(format!(
            "startswith(Area/AreaPath, {})",
            odata_literal(area)
        ));
    }
    if let Some(wit) = &request.work_item_type {
        clauses.push(format!("WorkItemType eq {}", odata_literal(wit)));
    }
    if let Some(state) = &request.state {
        clauses.push(format!("State eq {}", odata_literal(state)));
    }
    if let Some(created) = &request.created_after {
        clauses.push(format!(
            "CreatedDate ge {}",
            created.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    clauses
}

fn completed_clause(request: &OdataQueryRequest) -> String {
    match &request.completed_after {
        Some(completed) => format!(
            "StateCategory eq 'Completed' and CompletedDate ge {}",
            completed.format("%Y-%m-%dZ")
        ),
        None => "StateCategory eq 'Completed'".to_string(),
    }
}

/// Compile a request into the query string after `WorkItems?`.
pub fn build_query(request: &OdataQueryRequest) -> Result<String> {
    if request.query_type == OdataQueryType::CustomQuery {
        return request
            .custom_query
            .clone()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| Error::validation("customQuery requires a query string"));
    }
    if request.custom_query.is_some() {
        return Err(Error::validation(format!(
            "customQuery text is only valid with queryType customQuery, not {}",
            request.query_type.as_str()
        )));
    }

    let base_filter = filter_clauses(request).join(" and ");
    let filtered = |aggregation: &str| -> String {
        if base_filter.is_empty() {
            format!("$apply={aggregation}")
        } else {
            format!("$apply=filter({base_filter})/{aggregation}")
        }
    };

    let query = match request.query_type {
        OdataQueryType::WorkItemCount => filtered("aggregate($count as Count)"),
        OdataQueryType::GroupByState => {
            filtered("groupby((State), aggregate($count as Count))")
        }
        OdataQueryType::GroupByType => {
            filtered("groupby((WorkItemType), aggregate($count as Count))")
        }
        OdataQueryType::GroupByAssignee => {
            filtered("groupby((AssignedTo/UserEmail), aggregate($count as Count))")
        }
        OdataQueryType::VelocityMetrics => {
            let mut clauses = filter_clauses(request);
            clauses.push(completed_clause(request));
            format!(
                "$apply=filter({})/groupby((Iteration/IterationName), aggregate($count as Count))",
                clauses.join(" and ")
            )
        }
        OdataQueryType::CycleTimeMetrics => {
            let mut clauses = filter_clauses(request);
            clauses.push(completed_clause(request));
            format!(
                "$apply=filter({})/aggregate(CycleTimeDays with average as AverageCycleTimeDays, $count as Count)",
                clauses.join(" and ")
            )
        }
        OdataQueryType::CustomQuery => unreachable!("handled above"),
    };

    Ok(query)
}

/// Percent-encode the characters reqwest will not accept raw in a URL.
pub(crate) fn encode_query(query: &str) -> String {
    query
        .replace(' ', "%20")
        .replace('"', "%22")
        .replace('<', "%3C")
        .replace('>', "%3E")
}

/// Runs Analytics queries and synthesizes handles from custom-query rows.
pub struct OdataExecutor {
    gateway: Arc<dyn AdoGateway>,
    store: Arc<QueryHandleStore>,
    config: Arc<ServerConfig>,
}

impl OdataExecutor {
    pub fn new(
        gateway: Arc<dyn AdoGateway>,
        store: Arc<QueryHandleStore>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    pub async fn run(&self, request: &OdataQueryRequest) -> Result<ExecutorOutput> {
        let mut query = build_query(request)?;
        if let Some(top) = request.top {
            query.push_str(&format!("&$top={top}"));
        }

        let raw = self.gateway.query_analytics(&encode_query(&query)).await?;
        let rows: Vec<Value> = raw
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut warnings = Vec::new();
        let mut handle_fields = None;
        if request.return_query_handle {
            match self.synthesize_handle(&query, &rows) {
                Ok(fields) => handle_fields = Some(fields),
                Err(err) => warnings.push(format!("no query handle created: {err}")),
            }
        }

        let mut data = json!({
            "queryType": request.query_type.as_str(),
            "resultCount": rows.len(),
            "results": rows,
        });
        if let Some((handle_id, ids, context)) = handle_fields {
            data["queryHandle"] = json!(handle_id);
            data["workItemCount"] = json!(ids.len());
            data["items"] = json!(preview_items(&ids, &context, PREVIEW_LIMIT));
        }

        Ok(ExecutorOutput { data, warnings })
    }

    /// Build a handle from rows that carry a `WorkItemId` column, copying
    /// whatever context columns came back with them.
    fn synthesize_handle(
        &self,
        query: &str,
        rows: &[Value],
    ) -> Result<(String, Vec<i64>, HashMap<i64, ItemContext>)> {
        let mut ids = Vec::new();
        let mut context = HashMap::new();

        for row in rows {
            let Some(id) = row.get("WorkItemId").and_then(Value::as_i64) else {
                continue;
            };
            ids.push(id);

            let ctx_value = json!({
                "title": row.get("Title").and_then(Value::as_str).unwrap_or_default(),
                "state": row.get("State").and_then(Value::as_str).unwrap_or_default(),
                "type": row.get("WorkItemType").and_then(Value::as_str).unwrap_or_default(),
                "tags": [],
                "hasDescription": false
            });
            if let Ok(ctx) = serde_json::from_value::<ItemContext>(ctx_value) {
                context.insert(id, ctx);
            }
        }

        if ids.is_empty() {
            return Err(Error::validation(
                "result rows carry no WorkItemId column; select WorkItemId to get a handle",
            ));
        }

        let handle_id = self.store.store(
            ids.clone(),
            query.to_string(),
            HandleMetadata {
                project: self.config.project.clone(),
                query_type: QueryKind::Analytics,
                filter_criteria: None,
                created_by: None,
            },
            None,
            context.clone(),
        );
        Ok((handle_id, ids, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_type_parsing() {
        assert_eq!(
            "groupByState".parse::<OdataQueryType>().unwrap(),
            OdataQueryType::GroupByState
        );
        assert!("groupBySeverity".parse::<OdataQueryType>().is_err());
    }

    #[test]
    fn test_count_query_with_filters() {
        let mut request = OdataQueryRequest::new(OdataQueryType::WorkItemCount);
        request.work_item_type = Some("Bug".into());
        request.state = Some("Active".into());

        let query = build_query(&request).unwrap();
        assert_eq!(
            query,
            "$apply=filter(WorkItemType eq 'Bug' and State eq 'Active')/aggregate($count as Count)"
        );
    }

    #[test]
    fn test_count_query_without_filters() {
        let request = OdataQueryRequest::new(OdataQueryType::WorkItemCount);
        assert_eq!(build_query(&request).unwrap(), "$apply=aggregate($count as Count)");
    }

    #[test]
    fn test_group_by_assignee_uses_navigation_path() {
        let request = OdataQueryRequest::new(OdataQueryType::GroupByAssignee);
        let query = build_query(&request).unwrap();
        assert!(query.contains("AssignedTo/UserEmail"));
    }

    #[test]
    fn test_created_date_uses_full_timestamp() {
        let mut request = OdataQueryRequest::new(OdataQueryType::WorkItemCount);
        request.created_after = Some("2026-07-01T00:00:00Z".parse().unwrap());

        let query = build_query(&request).unwrap();
        assert!(query.contains("CreatedDate ge 2026-07-01T00:00:00Z"));
    }

    #[test]
    fn test_velocity_uses_date_only_completed_filter() {
        let mut request = OdataQueryRequest::new(OdataQueryType::VelocityMetrics);
        request.completed_after = Some("2026-06-15T10:30:00Z".parse().unwrap());

        let query = build_query(&request).unwrap();
        assert!(query.contains("CompletedDate ge 2026-06-15Z"));
        assert!(query.contains("StateCategory eq 'Completed'"));
        assert!(query.contains("Iteration/IterationName"));
    }

    #[test]
    fn test_area_path_quotes_escaped() {
        let mut request = OdataQueryRequest::new(OdataQueryType::WorkItemCount);
        request.area_path = Some(r"Proj\Team's Area".into());

        let query = build_query(&request).unwrap();
        assert!(query.contains("Team''s Area"));
    }

    #[test]
    fn test_custom_query_passthrough_and_exclusivity() {
        let mut request = OdataQueryRequest::new(OdataQueryType::CustomQuery);
        request.custom_query =
            Some("$select=WorkItemId,Title&$filter=State eq 'Active'".into());
        assert_eq!(
            build_query(&request).unwrap(),
            "$select=WorkItemId,Title&$filter=State eq 'Active'"
        );

        let mut bad = OdataQueryRequest::new(OdataQueryType::GroupByState);
        bad.custom_query = Some("$select=WorkItemId".into());
        assert!(build_query(&bad).is_err());
    }

    #[test]
    fn test_custom_query_requires_text() {
        let request = OdataQueryRequest::new(OdataQueryType::CustomQuery);
        assert!(matches!(build_query(&request), Err(Error::Validation(_))));
    }

    #[test]
    fn test_encode_query_spaces() {
        assert_eq!(
            encode_query("State eq 'Active'"),
            "State%20eq%20'Active'"
        );
    }
}
