//! # Tool dispatch
//!
//! The registry maps tool names to handlers; the dispatcher is the single
//! choke point every MCP call passes through:
//!
//! 1. unknown tool names become failure envelopes, not protocol errors;
//! 2. arguments are validated against the tool's declared schema, with the
//!    offending field named in the error;
//! 3. missing arguments are filled by precedence — explicit argument, then
//!    configured default (organization, project, area path, …), then the
//!    schema's own default;
//! 4. tools that need the Azure CLI are pre-checked so the user gets an
//!    actionable "run `az login`" instead of a deep HTTP failure;
//! 5. handler errors are converted to envelopes — nothing throws across
//!    the tool boundary;
//! 6. telemetry (name, duration, outcome) goes to `tracing` at debug level
//!    with no work-item content in it.

use crate::auth::TokenProvider;
use crate::envelope::ToolExecutionResult;
use crate::sampling::SamplingClient;
use crate::{Error, Result};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Argument types a tool schema can declare. `Any` is for arguments whose
/// shape is a union the handler parses itself (e.g. item selectors, which
/// are a string, an index list, or a criteria object).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ArgKind {
    fn json_name(&self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Integer => "integer",
            ArgKind::Number => "number",
            ArgKind::Boolean => "boolean",
            ArgKind::Object => "object",
            ArgKind::Array => "array",
            ArgKind::Any => "any",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::Number => value.is_number(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::Object => value.is_object(),
            ArgKind::Array => value.is_array(),
            ArgKind::Any => true,
        }
    }
}

#[derive(Debug, Clone)]
struct ArgField {
    kind: ArgKind,
    required: bool,
    default: Option<Value>,
    description: String,
}

/// Typed argument descriptor for one tool: field name → (type, required,
/// default). Unknown fields are rejected at dispatch.
#[derive(Debug, Clone, Default)]
pub struct ArgumentSchema {
    fields: BTreeMap<String, ArgField>,
}

impl ArgumentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field.
    pub fn required(mut self, name: &str, kind: ArgKind, description: &str) -> Self {
        self.fields.insert(
            name.to_string(),
            ArgField {
                kind,
                required: true,
                default: None,
                description: description.to_string(),
            },
        );
        self
    }

    /// Add an optional field with no default.
    pub fn optional(mut self, name: &str, kind: ArgKind, description: &str) -> Self {
        self.fields.insert(
            name.to_string(),
            ArgField {
                kind,
                required: false,
                default: None,
                description: description.to_string(),
            },
        );
        self
    }

    /// Add an optional field with a schema default.
    pub fn with_default(
        mut self,
        name: &str,
        kind: ArgKind,
        description: &str,
        default: Value,
    ) -> Self {
        self.fields.insert(
            name.to_string(),
            ArgField {
                kind,
                required: false,
                default: Some(default),
                description: description.to_string(),
            },
        );
        self
    }

    /// Validate raw arguments and merge defaults. Precedence, highest
    /// first: explicit argument, configured default, schema default.
    pub fn validate_and_merge(
        &self,
        args: Value,
        configured: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let provided = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::validation(format!(
                    "arguments must be an object, got {other}"
                )));
            }
        };

        let unknown: Vec<&str> = provided
            .keys()
            .map(String::as_str)
            .filter(|k| !self.fields.contains_key(*k))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::validation(format!(
                "unknown argument(s): {}; supported: {}",
                unknown.join(", "),
                self.fields.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }

        let mut merged = Map::new();
        for (name, field) in &self.fields {
            // Explicit null counts as absent so callers can "unset".
            let explicit = provided.get(name).filter(|v| !v.is_null());
            let value = explicit
                .or_else(|| configured.get(name).filter(|v| !v.is_null()))
                .or(field.default.as_ref());

            match value {
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(Error::validation(format!(
                            "argument `{name}`: expected {}, got {value}",
                            field.kind.json_name()
                        )));
                    }
                    merged.insert(name.clone(), value.clone());
                }
                None if field.required => {
                    return Err(Error::validation(format!(
                        "missing required argument `{name}` ({})",
                        field.kind.json_name()
                    )));
                }
                None => {}
            }
        }
        Ok(merged)
    }

    /// Render as JSON Schema for `tools/list`.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for (name, field) in &self.fields {
            // `Any` fields carry no "type" constraint in the schema.
            let mut prop = if field.kind == ArgKind::Any {
                json!({ "description": field.description })
            } else {
                json!({
                    "type": field.kind.json_name(),
                    "description": field.description,
                })
            };
            if let Some(default) = &field.default {
                prop["default"] = default.clone();
            }
            properties.insert(name.clone(), prop);
            if field.required {
                required.push(name.clone());
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Per-call context passed to handlers: the sampling bridge for the current
/// peer (absent when the host lacks the capability) and the call's
/// cancellation token.
#[derive(Clone)]
pub struct ToolContext {
    pub sampling: Option<Arc<dyn SamplingClient>>,
    pub cancellation: CancellationToken,
}

impl ToolContext {
    /// Context with no sampling and a fresh token; used by tests and
    /// internal invocations.
    pub fn background() -> Self {
        Self {
            sampling: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Type alias for tool handler functions. Handlers receive the validated,
/// default-merged arguments and return an envelope; the `Arc`/`Pin<Box>`
/// shape erases each handler's concrete future type so the registry can
/// hold them uniformly.
pub type ToolHandler = Arc<
    dyn Fn(Map<String, Value>, ToolContext) -> Pin<Box<dyn Future<Output = Result<ToolExecutionResult>> + Send>>
        + Send
        + Sync,
>;

/// A registered tool: metadata, schema, and handler.
#[derive(Clone)]
pub struct RegisteredTool {
    name: String,
    description: String,
    schema: ArgumentSchema,
    destructive: bool,
    requires_az_cli: bool,
    handler: ToolHandler,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> Value {
        self.schema.to_json_schema()
    }

    pub fn is_destructive(&self) -> bool {
        self.destructive
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name)
            .field("destructive", &self.destructive)
            .field("requires_az_cli", &self.requires_az_cli)
            .finish()
    }
}

/// Builder for registering a tool.
pub struct ToolRegistration {
    name: String,
    description: String,
    schema: ArgumentSchema,
    destructive: bool,
    requires_az_cli: bool,
}

impl ToolRegistration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: ArgumentSchema::new(),
            destructive: false,
            requires_az_cli: false,
        }
    }

    pub fn schema(mut self, schema: ArgumentSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Mark the tool as destructive (its dry-run default is the only thing
    /// between an agent and data loss).
    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// Mark the tool as requiring a signed-in Azure CLI.
    pub fn requires_az_cli(mut self) -> Self {
        self.requires_az_cli = true;
        self
    }

    /// Attach the handler and produce the registrable tool.
    pub fn build<F, Fut>(self, handler: F) -> RegisteredTool
    where
        F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolExecutionResult>> + Send + 'static,
    {
        RegisteredTool {
            name: self.name,
            description: self.description,
            schema: self.schema,
            destructive: self.destructive,
            requires_az_cli: self.requires_az_cli,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

/// Registry plus dispatcher.
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    configured_defaults: Map<String, Value>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ToolRegistry {
    pub fn new(configured_defaults: Map<String, Value>) -> Self {
        Self {
            tools: BTreeMap::new(),
            configured_defaults,
            token_provider: None,
        }
    }

    /// Attach the provider used for the Azure CLI pre-check.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Register a tool. Duplicate names are a startup bug, not a runtime
    /// condition.
    pub fn register(&mut self, tool: RegisteredTool) -> Result<()> {
        if self.tools.contains_key(tool.name()) {
            return Err(Error::config(format!(
                "duplicate tool name: {}",
                tool.name()
            )));
        }
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Route one call. Always returns an envelope.
    pub async fn dispatch(&self, name: &str, args: Value, ctx: ToolContext) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolExecutionResult::failure(name, vec![format!("unknown tool: {name}")]);
        };

        let merged = match tool.schema.validate_and_merge(args, &self.configured_defaults) {
            Ok(merged) => merged,
            Err(err) => return ToolExecutionResult::from_error(name, &err),
        };

        if tool.requires_az_cli {
            if let Some(provider) = &self.token_provider {
                if let Err(err) = provider.ensure_available().await {
                    return ToolExecutionResult::from_error(name, &err);
                }
            }
        }

        let started = Instant::now();
        let mut result = match (tool.handler)(merged, ctx).await {
            Ok(result) => result,
            Err(err) => ToolExecutionResult::from_error(name, &err),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        result.metadata.duration_ms = Some(duration_ms);

        tracing::debug!(
            tool = name,
            duration_ms,
            success = result.success,
            "tool call completed"
        );
        result
    }
}
