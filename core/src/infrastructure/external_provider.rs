use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::provider::Provider;
use crate::domain::types::{ParameterType, PermissionLevel, Tool, ToolContent, ToolParameter, ToolResult};

use super::stdio_transport::StdioTransport;

const CLIENT_NAME: &str = "aegis-tool-orchestrator";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Spawn configuration for one external (subprocess) tool server.
#[derive(Debug, Clone)]
pub struct ExternalServerConfig {
    pub server_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub default_permission_level: PermissionLevel,
}

impl ExternalServerConfig {
    pub fn new(server_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            default_permission_level: PermissionLevel::Read,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Adapts one [`StdioTransport`] to the [`Provider`] interface: performs the
/// MCP handshake, caches the translated tool catalog, and translates calls
/// and results. See SPEC_FULL.md §4.2.
///
/// The transport sits behind a lock rather than a plain field so a
/// provider can be restarted in place: `initialize` re-spawns the child
/// whenever the held transport is no longer alive instead of silently
/// no-opping against a dead connection (§4.4, restart semantics).
pub struct ExternalProvider {
    config: ExternalServerConfig,
    transport: AsyncMutex<StdioTransport>,
    tools: RwLock<Vec<Tool>>,
}

impl ExternalProvider {
    pub async fn connect(config: ExternalServerConfig) -> OrchestratorResult<Self> {
        let transport = Self::spawn_transport(&config).await?;
        Ok(Self {
            config,
            transport: AsyncMutex::new(transport),
            tools: RwLock::new(Vec::new()),
        })
    }

    async fn spawn_transport(config: &ExternalServerConfig) -> OrchestratorResult<StdioTransport> {
        StdioTransport::connect(
            config.server_id.clone(),
            &config.command,
            &config.args,
            &config.env,
            config.cwd.as_deref(),
        )
        .await
    }

    fn translate_tool(&self, entry: &Value) -> Option<Tool> {
        let name = entry.get("name")?.as_str()?.to_string();
        let description = entry
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let schema = entry.get("inputSchema");
        let required: Vec<String> = schema
            .and_then(|s| s.get("required"))
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();
        let mut parameters = Vec::new();
        if let Some(properties) = schema.and_then(|s| s.get("properties")).and_then(Value::as_object) {
            for (param_name, param_schema) in properties {
                parameters.push(json_schema_to_parameter(param_name, param_schema, &required));
            }
        }
        Some(Tool {
            name,
            description,
            parameters,
            server_id: self.config.server_id.clone(),
            requires_confirmation: false,
            permission_level: self.config.default_permission_level,
        })
    }
}

fn json_schema_to_parameter(name: &str, schema: &Value, required: &[String]) -> ToolParameter {
    let param_type = match schema.get("type").and_then(Value::as_str) {
        Some("string") => ParameterType::String,
        Some("number") => ParameterType::Number,
        Some("integer") => ParameterType::Integer,
        Some("boolean") => ParameterType::Boolean,
        Some("array") => ParameterType::Array,
        Some("object") => ParameterType::Object,
        // Unknown or absent schema types default to string (§4.2).
        _ => ParameterType::default(),
    };
    let items = schema
        .get("items")
        .map(|item_schema| Box::new(json_schema_to_parameter("item", item_schema, &[])));
    ToolParameter {
        name: name.to_string(),
        param_type,
        description: schema
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        required: required.iter().any(|r| r == name),
        default: schema.get("default").cloned(),
        enum_values: schema.get("enum").and_then(Value::as_array).cloned(),
        items,
    }
}

#[async_trait]
impl Provider for ExternalProvider {
    fn server_id(&self) -> &str {
        &self.config.server_id
    }

    async fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    async fn initialize(&self) -> OrchestratorResult<()> {
        let mut transport = self.transport.lock().await;
        if !transport.is_alive() {
            tracing::info!(server_id = %self.config.server_id, "respawning external server for restart");
            *transport = Self::spawn_transport(&self.config).await?;
        }

        let init_result = transport.initialize(CLIENT_NAME, CLIENT_VERSION).await?;
        let supports_tools = init_result
            .get("capabilities")
            .and_then(|c| c.get("tools"))
            .is_some();
        if !supports_tools {
            // Some servers omit capability advertisement but still answer
            // tools/list; attempt the listing regardless and fall back to
            // an empty catalog if it errors.
        }
        match transport
            .request("tools/list", Value::Object(Default::default()), Duration::from_secs(30))
            .await
        {
            Ok(result) => {
                let entries = result.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();
                let translated: Vec<Tool> = entries.iter().filter_map(|e| self.translate_tool(e)).collect();
                *self.tools.write() = translated;
            }
            Err(e) => {
                tracing::warn!(server_id = %self.config.server_id, error = %e, "tools/list failed");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> OrchestratorResult<()> {
        let result = self.transport.lock().await.close().await;
        self.tools.write().clear();
        result
    }

    async fn call(&self, name: &str, arguments: HashMap<String, Value>) -> ToolResult {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let response = match self.transport.lock().await.request("tools/call", params, DEFAULT_CALL_TIMEOUT).await {
            Ok(value) => value,
            Err(e) => return ToolResult::error(format!("transport error: {e}")),
        };

        let is_error = response.get("isError").and_then(Value::as_bool).unwrap_or(false);
        let content_items = response.get("content").and_then(Value::as_array).cloned().unwrap_or_default();

        if is_error {
            let message = content_items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            return ToolResult::error(if message.is_empty() {
                "tool call failed".to_string()
            } else {
                message
            });
        }

        if content_items.is_empty() {
            return ToolResult::success_text("Success");
        }

        let content = content_items
            .iter()
            .map(translate_content_item)
            .collect::<Vec<_>>();
        ToolResult::success(content)
    }

    async fn health_check(&self) -> bool {
        self.transport.lock().await.is_alive()
    }
}

fn translate_content_item(item: &Value) -> ToolContent {
    match item.get("type").and_then(Value::as_str) {
        Some("image") => ToolContent::Image {
            data: item.get("data").and_then(Value::as_str).unwrap_or_default().to_string(),
            mime_type: item
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
        },
        Some("resource") => ToolContent::Resource {
            uri: item.get("uri").and_then(Value::as_str).unwrap_or_default().to_string(),
            mime_type: item.get("mimeType").and_then(Value::as_str).map(String::from),
        },
        _ => ToolContent::Text {
            text: item.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_json_schema_type_defaults_to_string() {
        let schema = json!({"type": "frobnicate"});
        let param = json_schema_to_parameter("x", &schema, &[]);
        assert_eq!(param.param_type, ParameterType::String);
    }

    #[test]
    fn required_list_marks_matching_parameter() {
        let schema = json!({"type": "number"});
        let param = json_schema_to_parameter("count", &schema, &["count".to_string()]);
        assert!(param.required);
    }
}
