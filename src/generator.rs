//! AI-assisted query generation: natural language → validated WIQL/OData.
//!
//! The generator samples the host LLM with a grammar-constrained prompt,
//! then closes the loop by actually executing the candidate query against
//! ADO. Execution errors are fed back to the model as a correction turn,
//! bounded by `maxIterations`. A query is only reported `isValidated` after
//! it ran successfully.

use crate::ado::AdoGateway;
use crate::executor::{ExecutorOutput, QueryExecutor, WiqlQueryRequest};
use crate::odata::encode_query;
use crate::sampling::{ModelPreferences, SamplingClient, SamplingMessage, SamplingRequest};
use crate::{Error, Result};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Iteration defaults and bounds.
pub const DEFAULT_MAX_ITERATIONS: usize = 3;
pub const MAX_ITERATIONS_CEILING: usize = 5;

/// Row cap applied when test-executing a candidate query.
const TEST_ROW_CAP: usize = 50;

/// Target query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFormat {
    Wiql,
    Odata,
}

impl QueryFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryFormat::Wiql => "wiql",
            QueryFormat::Odata => "odata",
        }
    }
}

impl FromStr for QueryFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wiql" => Ok(QueryFormat::Wiql),
            "odata" => Ok(QueryFormat::Odata),
            other => Err(Error::validation(format!(
                "unknown query format {other:?}; expected wiql or odata"
            ))),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub description: String,
    pub format: QueryFormat,

    /// Execute candidates against ADO and iterate on failures.
    pub test_query: bool,

    /// Clamped to 1..=[`MAX_ITERATIONS_CEILING`].
    pub max_iterations: usize,

    /// On success, run the query through the executor and attach a handle.
    pub return_query_handle: bool,
}

impl GenerateRequest {
    pub fn new(description: impl Into<String>, format: QueryFormat) -> Self {
        Self {
            description: description.into(),
            format,
            test_query: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            return_query_handle: false,
        }
    }

    fn iteration_cap(&self) -> usize {
        self.max_iterations.clamp(1, MAX_ITERATIONS_CEILING)
    }
}

/// Generates and validates queries via host sampling.
pub struct QueryGenerator {
    gateway: Arc<dyn AdoGateway>,
    executor: Arc<QueryExecutor>,
}

impl QueryGenerator {
    pub fn new(gateway: Arc<dyn AdoGateway>, executor: Arc<QueryExecutor>) -> Self {
        Self { gateway, executor }
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
        sampling: Arc<dyn SamplingClient>,
        cancel: &CancellationToken,
    ) -> Result<ExecutorOutput> {
        let system_prompt = system_prompt_for(request.format);
        let mut messages = vec![SamplingMessage::user(format!(
            "Write a single {} query for this request: {}",
            request.format.as_str().to_uppercase(),
            request.description
        ))];

        let cap = request.iteration_cap();
        let mut last_query = String::new();
        let mut last_error = String::new();

        for iteration in 1..=cap {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let sampling_request = SamplingRequest::new(messages.clone())
                .with_system_prompt(system_prompt.clone())
                .with_max_tokens(500)
                .with_model_preferences(ModelPreferences::speed_first());
            let raw = sampling.complete(sampling_request).await?;
            let query = strip_code_fences(&raw);
            if query.is_empty() {
                last_error = "model returned no query text".to_string();
                messages.push(SamplingMessage::assistant(raw));
                messages.push(SamplingMessage::user(
                    "The response contained no query. Reply with only the query text.",
                ));
                continue;
            }
            last_query = query.clone();
            messages.push(SamplingMessage::assistant(query.clone()));

            if !request.test_query {
                return Ok(ExecutorOutput {
                    data: json!({
                        "query": query,
                        "format": request.format.as_str(),
                        "isValidated": false,
                        "iterationCount": iteration,
                    }),
                    warnings: vec!["query was not test-executed (testQuery=false)".to_string()],
                });
            }

            match self.test_execute(&query, request.format).await {
                Ok((result_count, sample)) => {
                    let mut data = json!({
                        "query": query,
                        "format": request.format.as_str(),
                        "isValidated": true,
                        "resultCount": result_count,
                        "sampleResults": sample,
                        "iterationCount": iteration,
                    });
                    let mut warnings = Vec::new();

                    if request.return_query_handle && request.format == QueryFormat::Wiql {
                        let mut wiql = WiqlQueryRequest::new(query.clone());
                        wiql.return_query_handle = true;
                        let handle_output = self.executor.run_wiql(&wiql).await?;
                        warnings.extend(handle_output.warnings);
                        if let Value::Object(extra) = handle_output.data {
                            for (key, value) in extra {
                                data[key] = value;
                            }
                        }
                    }
                    return Ok(ExecutorOutput { data, warnings });
                }
                Err(err) => {
                    last_error = err.to_string();
                    messages.push(SamplingMessage::user(format!(
                        "That query failed to execute: {last_error}. Please correct it and reply with only the fixed query."
                    )));
                }
            }
        }

        Ok(ExecutorOutput {
            data: json!({
                "query": last_query,
                "format": request.format.as_str(),
                "isValidated": false,
                "error": last_error,
                "iterationCount": cap,
            }),
            warnings: vec![format!(
                "query could not be validated within {cap} iteration(s)"
            )],
        })
    }

    /// Execute a candidate with a tight row cap; returns the result count
    /// and a small id/row sample.
    async fn test_execute(&self, query: &str, format: QueryFormat) -> Result<(usize, Value)> {
        match format {
            QueryFormat::Wiql => {
                let outcome = self.gateway.query_wiql(query).await?;
                let sample: Vec<i64> = outcome.ids.iter().take(10).copied().collect();
                Ok((outcome.ids.len(), json!(sample)))
            }
            QueryFormat::Odata => {
                let capped = format!("{query}&$top={TEST_ROW_CAP}");
                let raw = self.gateway.query_analytics(&encode_query(&capped)).await?;
                let rows = raw
                    .get("value")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let sample: Vec<Value> = rows.iter().take(5).cloned().collect();
                Ok((rows.len(), json!(sample)))
            }
        }
    }
}

fn system_prompt_for(format: QueryFormat) -> String {
    match format {
        QueryFormat::Wiql => "\
You write WIQL (Work Item Query Language) for Azure DevOps. Rules:
- Output exactly one query and nothing else. No explanations, no markdown.
- Shape: SELECT [System.Id] FROM WorkItems WHERE <conditions> [ORDER BY ...]
- Field references in brackets: [System.Id], [System.Title], [System.State], \
[System.WorkItemType], [System.Tags], [System.AreaPath], [System.IterationPath], \
[System.CreatedDate], [System.ChangedDate], [System.AssignedTo], \
[Microsoft.VSTS.Common.Priority]
- String literals in single quotes; dates support macros @Today, @Today-7
- Paths use UNDER: [System.AreaPath] UNDER 'Project\\Area'
- Tags use CONTAINS: [System.Tags] CONTAINS 'tag'
Example: SELECT [System.Id] FROM WorkItems WHERE [System.WorkItemType] = 'Bug' \
AND [System.CreatedDate] >= @Today-7"
            .to_string(),
        QueryFormat::Odata => "\
You write OData query strings for the Azure DevOps Analytics WorkItems entity. Rules:
- Output exactly one query string (the part after `WorkItems?`) and nothing else.
- Columns: WorkItemId, Title, State, WorkItemType, StateCategory, CreatedDate, \
CompletedDate, CycleTimeDays, Area/AreaPath, Iteration/IterationPath, \
AssignedTo/UserEmail
- Aggregations use $apply=filter(...)/groupby((Col), aggregate($count as Count))
- Plain selections use $select and $filter; always include WorkItemId in $select
- Date literals are ISO 8601 with a Z suffix
Example: $select=WorkItemId,Title&$filter=State eq 'Active' and \
WorkItemType eq 'Bug'"
            .to_string(),
    }
}

/// Strip markdown code fencing and surrounding prose from a model reply,
/// keeping the query text.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Some(open) = trimmed.find("```") {
        let after_open = &trimmed[open + 3..];
        if let Some(close) = after_open.find("```") {
            let mut inner = &after_open[..close];
            // Drop a language tag on the opening fence line.
            if let Some(newline) = inner.find('\n') {
                let first_line = inner[..newline].trim();
                if !first_line.is_empty()
                    && first_line
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    inner = &inner[newline + 1..];
                }
            }
            return inner.trim().to_string();
        }
    }

    trimmed.to_string()
}
