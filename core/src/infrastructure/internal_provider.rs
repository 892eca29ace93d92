use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::domain::errors::OrchestratorResult;
use crate::domain::provider::Provider;
use crate::domain::types::{ParameterType, Tool, ToolResult};

pub type HandlerFn = Arc<dyn Fn(HashMap<String, Value>) -> BoxFuture<'static, ToolResult> + Send + Sync>;

struct Entry {
    tool: Tool,
    handler: HandlerFn,
}

/// Exposes in-process handler functions through the [`Provider`] interface.
/// This is the seam that concrete built-in tool implementations (filesystem,
/// git, process, system — out of scope for this crate) plug into; this type
/// owns only registration, argument validation, and dispatch. See
/// SPEC_FULL.md §4.3.
pub struct InternalProvider {
    server_id: String,
    entries: HashMap<String, Entry>,
}

impl InternalProvider {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            entries: HashMap::new(),
        }
    }

    /// Registers one tool and its handler. Replaces any prior registration
    /// under the same name.
    pub fn register(&mut self, tool: Tool, handler: HandlerFn) {
        self.entries.insert(tool.name.clone(), Entry { tool, handler });
    }

    fn validate(tool: &Tool, arguments: &HashMap<String, Value>) -> Result<(), String> {
        for param in &tool.parameters {
            match arguments.get(&param.name) {
                None => {
                    if param.required {
                        return Err(format!("missing required argument '{}'", param.name));
                    }
                }
                Some(value) => {
                    if !value_matches_type(value, param.param_type) {
                        return Err(format!(
                            "argument '{}' expected {:?}, got {}",
                            param.name, param.param_type, value
                        ));
                    }
                    if let Some(allowed) = &param.enum_values {
                        if !allowed.contains(value) {
                            return Err(format!("argument '{}' is not one of the allowed values", param.name));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn value_matches_type(value: &Value, param_type: ParameterType) -> bool {
    match param_type {
        ParameterType::String => value.is_string(),
        ParameterType::Number => value.is_number(),
        ParameterType::Integer => value.is_i64() || value.is_u64(),
        ParameterType::Boolean => value.is_boolean(),
        ParameterType::Array => value.is_array(),
        ParameterType::Object => value.is_object(),
    }
}

#[async_trait]
impl Provider for InternalProvider {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn tools(&self) -> Vec<Tool> {
        self.entries.values().map(|e| e.tool.clone()).collect()
    }

    async fn initialize(&self) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn call(&self, name: &str, arguments: HashMap<String, Value>) -> ToolResult {
        let Some(entry) = self.entries.get(name) else {
            return ToolResult::error(format!("tool '{name}' not found on server '{}'", self.server_id));
        };
        if let Err(message) = Self::validate(&entry.tool, &arguments) {
            return ToolResult::error(format!("invalid arguments: {message}"));
        }
        (entry.handler)(arguments).await
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{PermissionLevel, ToolParameter};

    fn echo_tool() -> Tool {
        Tool {
            name: "echo".to_string(),
            description: "echoes its message argument".to_string(),
            parameters: vec![ToolParameter::new("message", ParameterType::String).required()],
            server_id: "internal".to_string(),
            requires_confirmation: false,
            permission_level: PermissionLevel::Read,
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut provider = InternalProvider::new("internal");
        provider.register(
            echo_tool(),
            Arc::new(|args| {
                Box::pin(async move {
                    let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
                    ToolResult::success_text(message.to_string())
                })
            }),
        );

        let mut args = HashMap::new();
        args.insert("message".to_string(), Value::String("hi".to_string()));
        let result = provider.call("echo", args).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected_before_dispatch() {
        let mut provider = InternalProvider::new("internal");
        provider.register(
            echo_tool(),
            Arc::new(|_| Box::pin(async move { ToolResult::success_text("should not run") })),
        );

        let result = provider.call("echo", HashMap::new()).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("missing required argument"));
    }

    #[tokio::test]
    async fn unknown_tool_name_is_an_error() {
        let provider = InternalProvider::new("internal");
        let result = provider.call("nope", HashMap::new()).await;
        assert!(!result.success);
    }
}
