use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::OrchestratorResult;
use super::types::{Tool, ToolResult};

/// Uniform interface over anything that can supply tools: an in-process
/// handler registry or a subprocess speaking MCP. The router and security
/// gate never distinguish between the two beyond `server_id()`.
///
/// `call` never raises across this boundary — every failure, including a
/// security denial upstream of the provider, is encoded in the returned
/// `ToolResult`. `initialize`/`shutdown` are idempotent.
#[async_trait]
pub trait Provider: Send + Sync {
    fn server_id(&self) -> &str;

    async fn tools(&self) -> Vec<Tool>;

    async fn initialize(&self) -> OrchestratorResult<()>;

    async fn shutdown(&self) -> OrchestratorResult<()>;

    async fn call(&self, name: &str, arguments: HashMap<String, Value>) -> ToolResult;

    async fn health_check(&self) -> bool;
}
