use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerManagerConfig;
use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::provider::Provider;
use crate::domain::types::{ServerState, ServerStatus};

/// Supervises provider lifecycle: registration, parallel start/stop, manual
/// restart, and a periodic health-monitor loop with a capped restart
/// budget. No global registry — each `ServerManager` is a plain,
/// independently constructible instance (the singleton pattern this design
/// replaces is named in SPEC_FULL.md §9). See SPEC_FULL.md §4.4.
pub struct ServerManager {
    config: ServerManagerConfig,
    providers: Mutex<HashMap<String, Arc<dyn Provider>>>,
    statuses: Mutex<HashMap<String, ServerStatus>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerManager {
    pub fn new(config: ServerManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            providers: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            health_task: Mutex::new(None),
        })
    }

    pub fn register(&self, provider: Arc<dyn Provider>) -> OrchestratorResult<()> {
        let server_id = provider.server_id().to_string();
        let mut providers = self.providers.lock();
        if providers.contains_key(&server_id) {
            return Err(OrchestratorError::DuplicateServer(server_id));
        }
        self.statuses
            .lock()
            .insert(server_id.clone(), ServerStatus::new(server_id.clone()));
        providers.insert(server_id, provider);
        Ok(())
    }

    fn provider(&self, server_id: &str) -> OrchestratorResult<Arc<dyn Provider>> {
        self.providers
            .lock()
            .get(server_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownServer(server_id.to_string()))
    }

    fn set_state(&self, server_id: &str, state: ServerState) {
        if let Some(status) = self.statuses.lock().get_mut(server_id) {
            status.state = state;
            match state {
                ServerState::Running => {
                    status.started_at = Some(Utc::now());
                    status.last_heartbeat = Some(Utc::now());
                }
                ServerState::Error => {
                    status.error_count += 1;
                }
                _ => {}
            }
        }
    }

    /// Only `Stopped` and `Error` admit a new `initialize`; a provider mid
    /// transition rejects further transitions until it reaches a steady
    /// state.
    fn can_start(&self, server_id: &str) -> bool {
        matches!(
            self.statuses.lock().get(server_id).map(|s| s.state),
            Some(ServerState::Stopped) | Some(ServerState::Error)
        )
    }

    async fn start_one(self: &Arc<Self>, server_id: String) -> bool {
        if !self.can_start(&server_id) {
            return false;
        }
        self.set_state(&server_id, ServerState::Starting);
        let Ok(provider) = self.provider(&server_id) else {
            return false;
        };
        match provider.initialize().await {
            Ok(()) => {
                let tool_count = provider.tools().await.len();
                self.set_state(&server_id, ServerState::Running);
                if let Some(status) = self.statuses.lock().get_mut(&server_id) {
                    status.tool_count = tool_count;
                }
                info!(server_id = %server_id, tool_count, "provider started");
                true
            }
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "provider failed to start");
                if let Some(status) = self.statuses.lock().get_mut(&server_id) {
                    status.last_error = Some(e.to_string());
                }
                self.set_state(&server_id, ServerState::Error);
                false
            }
        }
    }

    async fn stop_one(&self, server_id: &str) {
        if !matches!(
            self.statuses.lock().get(server_id).map(|s| s.state),
            Some(ServerState::Running) | Some(ServerState::Error)
        ) {
            return;
        }
        self.set_state(server_id, ServerState::Stopping);
        if let Ok(provider) = self.provider(server_id) {
            if let Err(e) = provider.shutdown().await {
                warn!(server_id = %server_id, error = %e, "error during shutdown");
            }
        }
        self.set_state(server_id, ServerState::Stopped);
    }

    /// Transitions every registered provider from `Stopped` through
    /// `Starting` to `Running` (or `Error`), in parallel. Starts the health
    /// monitor loop on first successful initialization.
    pub async fn initialize_all(self: &Arc<Self>) -> HashMap<String, bool> {
        let ids: Vec<String> = self.providers.lock().keys().cloned().collect();
        let results = join_all(ids.into_iter().map(|id| {
            let this = Arc::clone(self);
            async move { (id.clone(), this.start_one(id).await) }
        }))
        .await;
        let outcome: HashMap<String, bool> = results.into_iter().collect();

        if outcome.values().any(|ok| *ok) && self.health_task.lock().is_none() {
            self.spawn_health_monitor();
        }
        outcome
    }

    fn spawn_health_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                this.run_health_pass().await;
            }
        });
        *self.health_task.lock() = Some(handle);
    }

    async fn run_health_pass(self: &Arc<Self>) {
        let running: Vec<String> = self
            .statuses
            .lock()
            .iter()
            .filter(|(_, status)| status.state == ServerState::Running)
            .map(|(id, _)| id.clone())
            .collect();

        for server_id in running {
            let Ok(provider) = self.provider(&server_id) else { continue };
            let healthy = provider.health_check().await;
            if healthy {
                if let Some(status) = self.statuses.lock().get_mut(&server_id) {
                    status.last_heartbeat = Some(Utc::now());
                }
                continue;
            }

            warn!(server_id = %server_id, "health check failed");
            let restart_count = self.statuses.lock().get(&server_id).map(|s| s.restart_count).unwrap_or(0);
            if self.config.auto_restart && restart_count < self.config.max_restart_attempts {
                if let Err(e) = self.restart(&server_id).await {
                    warn!(server_id = %server_id, error = %e, "auto-restart failed");
                }
                if let Some(status) = self.statuses.lock().get_mut(&server_id) {
                    status.restart_count += 1;
                }
            } else {
                warn!(server_id = %server_id, "restart budget exhausted, pinning to error");
                self.set_state(&server_id, ServerState::Error);
            }
        }
    }

    /// Shuts down then re-initializes one provider after a quiet period.
    /// Resets the restart counter on success.
    pub async fn restart(self: &Arc<Self>, server_id: &str) -> OrchestratorResult<()> {
        self.stop_one(server_id).await;
        tokio::time::sleep(Duration::from_millis(self.config.restart_quiet_period_ms)).await;
        let started = self.start_one(server_id.to_string()).await;
        if started {
            if let Some(status) = self.statuses.lock().get_mut(server_id) {
                status.restart_count = 0;
            }
            Ok(())
        } else {
            Err(OrchestratorError::InvalidState(
                server_id.to_string(),
                "restart failed".to_string(),
            ))
        }
    }

    /// Cancels the health monitor, then shuts down every running provider
    /// in parallel.
    pub async fn shutdown_all(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        let ids: Vec<String> = self.providers.lock().keys().cloned().collect();
        join_all(ids.iter().map(|id| self.stop_one(id))).await;
    }

    pub fn running_servers(&self) -> Vec<String> {
        self.statuses
            .lock()
            .iter()
            .filter(|(_, s)| s.state == ServerState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn providers_snapshot(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.lock().values().cloned().collect()
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.statuses.lock().values().cloned().collect()
    }

    pub fn status(&self, server_id: &str) -> Option<ServerStatus> {
        self.statuses.lock().get(server_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use crate::domain::types::{Tool, ToolResult};

    struct FakeProvider {
        id: String,
        healthy: AtomicBool,
        init_calls: AtomicU32,
    }

    impl FakeProvider {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                healthy: AtomicBool::new(true),
                init_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn server_id(&self) -> &str {
            &self.id
        }

        async fn tools(&self) -> Vec<Tool> {
            Vec::new()
        }

        async fn initialize(&self) -> OrchestratorResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn call(&self, _name: &str, _arguments: Map<String, serde_json::Value>) -> ToolResult {
            ToolResult::error("not implemented")
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicate_server_id() {
        let manager = ServerManager::new(ServerManagerConfig::default());
        manager.register(Arc::new(FakeProvider::new("a"))).expect("first registration");
        let err = manager.register(Arc::new(FakeProvider::new("a"))).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateServer(_)));
    }

    #[tokio::test]
    async fn initialize_all_transitions_providers_to_running() {
        let manager = ServerManager::new(ServerManagerConfig::default());
        manager.register(Arc::new(FakeProvider::new("a"))).unwrap();

        let outcome = manager.initialize_all().await;
        assert_eq!(outcome.get("a"), Some(&true));
        assert_eq!(manager.status("a").unwrap().state, ServerState::Running);

        manager.shutdown_all().await;
        assert_eq!(manager.status("a").unwrap().state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn restart_resets_counter_on_success() {
        let manager = ServerManager::new(ServerManagerConfig::default());
        manager.register(Arc::new(FakeProvider::new("a"))).unwrap();
        manager.initialize_all().await;

        if let Some(status) = manager.statuses.lock().get_mut("a") {
            status.restart_count = 2;
        }
        manager.restart("a").await.expect("restart succeeds");
        assert_eq!(manager.status("a").unwrap().restart_count, 0);
        assert_eq!(manager.status("a").unwrap().state, ServerState::Running);

        manager.shutdown_all().await;
    }
}
