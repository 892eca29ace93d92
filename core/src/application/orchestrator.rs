use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::application::security_gate::{ConfirmationHandler, SecurityGate};
use crate::application::tool_router::{RouterStats, ToolRouter};
use crate::config::OrchestratorConfig;
use crate::domain::errors::OrchestratorResult;
use crate::domain::provider::Provider;
use crate::domain::security_context::TrustLevel;
use crate::domain::types::{ServerState, ServerStatus, Tool, ToolCall, ToolResult};
use crate::infrastructure::server_manager::ServerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Internal,
    External,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total_servers: usize,
    pub running_servers: usize,
    pub error_servers: usize,
    pub stats: RouterStats,
}

/// Single public entry point: registration, initialization ordering,
/// aggregated catalog, dispatch, and shutdown. See SPEC_FULL.md §4.7.
pub struct Orchestrator {
    manager: Arc<ServerManager>,
    router: Arc<ToolRouter>,
    security_gate: Arc<SecurityGate>,
    default_timeout: Duration,
    initialized: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, trust_level: TrustLevel) -> Self {
        let security_gate = Arc::new(SecurityGate::new(config.security_policy, trust_level, config.max_audit_entries));
        let default_timeout = Duration::from_secs_f64(config.router.default_timeout_secs);
        let manager = ServerManager::new(config.server_manager);
        let router = Arc::new(ToolRouter::new(config.router, Arc::clone(&security_gate), Arc::clone(&manager)));
        Self {
            manager,
            router,
            security_gate,
            default_timeout,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>, kind: ProviderKind) -> OrchestratorResult<()> {
        self.manager.register(Arc::clone(&provider))?;
        self.router.register_provider(provider, kind == ProviderKind::External);
        Ok(())
    }

    /// Brings every registered provider up and refreshes the router index.
    /// Idempotent: a second call is a no-op returning an empty map.
    pub async fn initialize(&self) -> OrchestratorResult<HashMap<String, bool>> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(HashMap::new());
        }
        let outcome = self.manager.initialize_all().await;
        self.router.refresh_index().await;
        Ok(outcome)
    }

    /// Shuts down every provider, clears the router cache, and resets the
    /// security context. The audit log is preserved. Idempotent.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        self.manager.shutdown_all().await;
        self.security_gate.reset_context();
    }

    async fn ensure_initialized(&self) {
        if !self.initialized.load(Ordering::SeqCst) {
            let _ = self.initialize().await;
        }
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.ensure_initialized().await;
        self.router.tools().await
    }

    pub async fn tools_for_model(&self) -> Vec<Value> {
        self.tools().await.iter().map(Tool::to_model_schema).collect()
    }

    pub fn set_confirmation_handler(&self, handler: ConfirmationHandler) {
        self.security_gate.set_confirmation_handler(handler);
    }

    pub async fn execute_tool(&self, tool_call: ToolCall, timeout: Option<Duration>) -> ToolResult {
        self.ensure_initialized().await;
        self.router.execute(tool_call, timeout.or(Some(self.default_timeout))).await
    }

    pub async fn execute_tools(
        &self,
        tool_calls: Vec<ToolCall>,
        parallel: bool,
        timeout: Option<Duration>,
    ) -> HashMap<String, ToolResult> {
        self.ensure_initialized().await;
        self.router.execute_many(tool_calls, parallel, timeout.or(Some(self.default_timeout))).await
    }

    pub async fn call_tool_by_name(&self, name: &str, arguments: HashMap<String, Value>) -> ToolResult {
        let call = ToolCall::new(uuid::Uuid::new_v4().to_string(), name).with_arguments(arguments);
        self.execute_tool(call, None).await
    }

    pub async fn restart_server(&self, server_id: &str) -> OrchestratorResult<()> {
        self.manager.restart(server_id).await?;
        self.router.refresh_index().await;
        Ok(())
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.manager.statuses()
    }

    pub fn health(&self) -> HealthReport {
        let statuses = self.manager.statuses();
        let running = statuses.iter().filter(|s| s.state == ServerState::Running).count();
        let errored = statuses.iter().filter(|s| s.state == ServerState::Error).count();
        HealthReport {
            total_servers: statuses.len(),
            running_servers: running,
            error_servers: errored,
            stats: self.router.stats(),
        }
    }
}
