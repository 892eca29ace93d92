use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Permission level attached to a [`Tool`], driving security-gate policy.
/// Ordering matters: variants are declared least to most sensitive so that
/// `PermissionLevel::Dangerous > PermissionLevel::Read` compares naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
    Execute,
    System,
    Dangerous,
}

/// Scalar/shape of a [`ToolParameter`], mirroring a JSON-schema `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl Default for ParameterType {
    fn default() -> Self {
        // JSON-schema types this crate does not recognize default to string,
        // matching the lenient external-provider schema mapping.
        ParameterType::String
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub items: Option<Box<ToolParameter>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: false,
            default: None,
            enum_values: None,
            items: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Catalog entry: a named, schema-described operation exposed by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub server_id: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub permission_level: PermissionLevel,
}

impl Tool {
    /// Converts this tool into the JSON shape a model driver expects:
    /// `{name, description, inputSchema: {type, properties, required}}`.
    pub fn to_model_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut schema = serde_json::Map::new();
            schema.insert(
                "type".to_string(),
                Value::String(parameter_type_json_name(param.param_type).to_string()),
            );
            if !param.description.is_empty() {
                schema.insert(
                    "description".to_string(),
                    Value::String(param.description.clone()),
                );
            }
            if let Some(default) = &param.default {
                schema.insert("default".to_string(), default.clone());
            }
            if let Some(values) = &param.enum_values {
                schema.insert("enum".to_string(), Value::Array(values.clone()));
            }
            properties.insert(param.name.clone(), Value::Object(schema));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": {
                "type": "object",
                "properties": Value::Object(properties),
                "required": required,
            }
        })
    }
}

fn parameter_type_json_name(param_type: ParameterType) -> &'static str {
    match param_type {
        ParameterType::String => "string",
        ParameterType::Number => "number",
        ParameterType::Integer => "integer",
        ParameterType::Boolean => "boolean",
        ParameterType::Array => "array",
        ParameterType::Object => "object",
    }
}

/// Request envelope. Created by the model driver; never mutated after
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: HashMap::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: HashMap<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
    Resource { uri: String, mime_type: Option<String> },
    Error { message: String },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent::Text { text: text.into() }
    }
}

/// Response envelope. A result with `success=false` always carries an
/// `error_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: Vec<ToolContent>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ToolResult {
    pub fn success(content: Vec<ToolContent>) -> Self {
        Self {
            success: true,
            content,
            error_message: None,
            metadata: HashMap::new(),
        }
    }

    pub fn success_text(text: impl Into<String>) -> Self {
        Self::success(vec![ToolContent::text(text)])
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            content: vec![ToolContent::Error {
                message: message.clone(),
            }],
            error_message: Some(message),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// State of a supervised provider. Non-terminal: `Error` can be left via a
/// manual or automatic restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub state: ServerState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub restart_count: u32,
}

impl ServerStatus {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            state: ServerState::Stopped,
            started_at: None,
            last_heartbeat: None,
            tool_count: 0,
            error_count: 0,
            last_error: None,
            restart_count: 0,
        }
    }
}
