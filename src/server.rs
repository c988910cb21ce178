//! MCP server that exposes the [`ToolRegistry`] via the MCP protocol.
//!
//! [`WorkItemMcpServer`] wraps a [`ToolRegistry`] and serves its tools over
//! stdio. Tool results are the JSON envelope, pretty-printed into a text
//! content block; handler failures are still envelopes, so the protocol
//! layer never sees an exception.
//!
//! The peer connection doubles as the sampling channel: each `call_tool`
//! hands its handler a [`SamplingClient`] backed by the requesting peer, so
//! AI-assisted tools can ask the host's model for completions.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, CreateMessageRequestParams, Implementation,
    ListToolsResult, ModelHint, ModelPreferences, ProtocolVersion, Role, SamplingContent,
    SamplingMessage, SamplingMessageContent, ServerCapabilities, ServerInfo, Tool as McpTool,
};
use rmcp::service::{Peer, RequestContext, RoleServer};
use rmcp::transport::io::stdio;
use rmcp::{ErrorData, ServerHandler, ServiceExt};

use crate::dispatch::{ToolContext, ToolRegistry};
use crate::sampling::{self, SamplingClient, SamplingRequest, SamplingRole};
use crate::{Error, Result};
use async_trait::async_trait;

/// MCP server over a tool registry.
///
/// Call [`serve_stdio`](WorkItemMcpServer::serve_stdio) to start serving
/// via stdin/stdout.
pub struct WorkItemMcpServer {
    registry: Arc<ToolRegistry>,
    name: String,
    version: String,
}

impl WorkItemMcpServer {
    pub fn new(
        registry: Arc<ToolRegistry>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            name: name.into(),
            version: version.into(),
        }
    }

    /// Serve over stdio. Blocks until the client disconnects.
    pub async fn serve_stdio(self) -> Result<()> {
        let transport = stdio();
        let handler = WorkItemServerHandler {
            registry: self.registry,
            name: self.name,
            version: self.version,
        };
        let service = handler
            .serve(transport)
            .await
            .map_err(|e| Error::other(format!("MCP transport setup failed: {e}")))?;
        service
            .waiting()
            .await
            .map_err(|e| Error::other(format!("MCP transport failed: {e}")))?;
        Ok(())
    }
}

/// Internal handler implementing [`ServerHandler`] for the MCP protocol.
struct WorkItemServerHandler {
    registry: Arc<ToolRegistry>,
    name: String,
    version: String,
}

impl ServerHandler for WorkItemServerHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
                ..Default::default()
            },
            instructions: Some(
                "Azure DevOps work-item tools. Query first (query-wiql), then operate on \
                 the returned query handle; never pass raw work-item ids to bulk tools. \
                 Destructive tools default to dryRun=true."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, ErrorData> {
        let tools: Vec<McpTool> = self
            .registry
            .iter()
            .map(|tool| {
                let schema = tool.input_schema();
                let schema_obj = schema.as_object().cloned().unwrap_or_default();

                McpTool {
                    name: Cow::Owned(tool.name().to_string()),
                    title: None,
                    description: Some(Cow::Owned(tool.description().to_string())),
                    input_schema: Arc::new(schema_obj),
                    output_schema: None,
                    annotations: None,
                    execution: None,
                    icons: None,
                    meta: None,
                }
            })
            .collect();

        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let tool_name = request.name.to_string();
        let args = match request.arguments {
            Some(map) => serde_json::Value::Object(map),
            None => serde_json::Value::Null,
        };

        let ctx = ToolContext {
            sampling: Some(Arc::new(PeerSamplingClient {
                peer: context.peer.clone(),
            }) as Arc<dyn SamplingClient>),
            cancellation: context.ct.clone(),
        };

        let envelope = self.registry.dispatch(&tool_name, args, ctx).await;
        let text = serde_json::to_string_pretty(&envelope)
            .unwrap_or_else(|e| format!("{{\"success\":false,\"errors\":[\"{e}\"]}}"));

        // The envelope already distinguishes success; mirror it in the MCP
        // result so hosts that only look at isError still behave.
        if envelope.success {
            Ok(CallToolResult::success(vec![Content::text(text)]))
        } else {
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
    }
}

/// [`SamplingClient`] backed by the requesting peer's `sampling/createMessage`.
struct PeerSamplingClient {
    peer: Peer<RoleServer>,
}

#[async_trait]
impl SamplingClient for PeerSamplingClient {
    async fn complete(&self, request: SamplingRequest) -> Result<String> {
        let messages: Vec<SamplingMessage> = request
            .messages
            .iter()
            .map(|m| SamplingMessage {
                role: match m.role {
                    SamplingRole::User => Role::User,
                    SamplingRole::Assistant => Role::Assistant,
                },
                content: SamplingContent::Single(SamplingMessageContent::text(m.content.clone())),
                meta: None,
            })
            .collect();

        let model_preferences = request.model_preferences.map(to_rmcp_preferences);

        let params = CreateMessageRequestParams {
            meta: None,
            task: None,
            messages,
            model_preferences,
            system_prompt: request.system_prompt.clone(),
            include_context: None,
            temperature: request.temperature.map(|t| t as f32),
            max_tokens: request.max_tokens,
            stop_sequences: None,
            metadata: None,
            tools: None,
            tool_choice: None,
        };

        let result = self
            .peer
            .create_message(params)
            .await
            .map_err(|e| Error::sampling_unavailable(e.to_string()))?;

        result
            .message
            .content
            .into_vec()
            .into_iter()
            .find_map(|c| c.as_text().map(|t| t.text.clone()))
            .ok_or_else(|| Error::sampling_unavailable("host returned non-text content"))
    }
}

fn to_rmcp_preferences(preferences: sampling::ModelPreferences) -> ModelPreferences {
    ModelPreferences {
        hints: Some(
            preferences
                .hints
                .into_iter()
                .map(|name| ModelHint { name: Some(name) })
                .collect(),
        ),
        cost_priority: Some(preferences.cost_priority),
        speed_priority: Some(preferences.speed_priority),
        intelligence_priority: Some(preferences.intelligence_priority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ArgKind, ArgumentSchema, ToolRegistration};
    use crate::envelope::ToolExecutionResult;
    use serde_json::{Map, json};

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new(Map::new());
        registry
            .register(
                ToolRegistration::new("echo", "echo the message")
                    .schema(ArgumentSchema::new().required(
                        "message",
                        ArgKind::String,
                        "text",
                    ))
                    .build(|args, _ctx| async move {
                        Ok(ToolExecutionResult::success("echo", json!(args)))
                    }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_server_constructs() {
        let server =
            WorkItemMcpServer::new(Arc::new(registry_with_echo()), "ado-workitem-mcp", "0.3.0");
        assert_eq!(server.name, "ado-workitem-mcp");
        assert_eq!(server.version, "0.3.0");
    }

    #[test]
    fn test_handler_get_info_enables_tools() {
        let handler = WorkItemServerHandler {
            registry: Arc::new(registry_with_echo()),
            name: "test".into(),
            version: "0.0.1".into(),
        };
        let info = handler.get_info();
        assert_eq!(info.server_info.name, "test");
        assert!(info.capabilities.tools.is_some());
        assert!(info.instructions.unwrap().contains("query handle"));
    }

    #[test]
    fn test_registry_schemas_convert_to_mcp_shape() {
        let registry = registry_with_echo();
        let tool = registry.get("echo").unwrap();
        let schema = tool.input_schema();

        let obj = schema.as_object().unwrap();
        assert_eq!(obj["type"], "object");
        assert!(obj["properties"]["message"].is_object());
    }

    #[test]
    fn test_model_preferences_conversion() {
        let prefs = to_rmcp_preferences(sampling::ModelPreferences::speed_first());
        let hints = prefs.hints.unwrap();
        assert!(!hints.is_empty());
        assert!(hints[0].name.as_ref().unwrap().contains("haiku"));
        assert_eq!(prefs.speed_priority, Some(0.9));
    }
}
