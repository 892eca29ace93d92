use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::application::security_gate::SecurityGate;
use crate::config::RouterConfig;
use crate::domain::provider::Provider;
use crate::domain::security_context::short_fingerprint;
use crate::domain::types::{Tool, ToolCall, ToolResult};
use crate::infrastructure::server_manager::ServerManager;

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub call_id: String,
    pub tool_name: String,
    pub server_id: String,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: chrono::DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

struct CacheEntry {
    result: ToolResult,
    inserted_at: Instant,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RouterStats {
    pub total_calls: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub per_tool: HashMap<String, ToolStats>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ToolStats {
    pub calls: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

/// Maintains a name→provider index, a global concurrency ceiling, an
/// optional result cache, and bounded execution history. See SPEC_FULL.md
/// §4.6.
pub struct ToolRouter {
    config: RouterConfig,
    security_gate: Arc<SecurityGate>,
    manager: Arc<ServerManager>,
    internal_providers: Mutex<Vec<Arc<dyn Provider>>>,
    external_providers: Mutex<Vec<Arc<dyn Provider>>>,
    index: DashMap<String, (Tool, Arc<dyn Provider>)>,
    semaphore: Arc<tokio::sync::Semaphore>,
    cache: DashMap<String, CacheEntry>,
    history: Mutex<VecDeque<ExecutionRecord>>,
}

impl ToolRouter {
    pub fn new(config: RouterConfig, security_gate: Arc<SecurityGate>, manager: Arc<ServerManager>) -> Self {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_tools));
        Self {
            config,
            security_gate,
            manager,
            internal_providers: Mutex::new(Vec::new()),
            external_providers: Mutex::new(Vec::new()),
            index: DashMap::new(),
            semaphore,
            cache: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers a provider's catalog for indexing. External providers are
    /// tracked separately so they can overlay internal ones on a name
    /// collision (invariant I1) every time the index rebuilds.
    pub fn register_provider(&self, provider: Arc<dyn Provider>, external: bool) {
        if external {
            self.external_providers.lock().push(provider);
        } else {
            self.internal_providers.lock().push(provider);
        }
    }

    /// Rebuilds the index from the registered providers that are currently
    /// RUNNING per the server manager, external providers overlaying
    /// internal ones so they win any name collision (I1). Called before
    /// every read, mirroring the original's refresh-on-every-read
    /// `get_all_tools`, so a health-monitor-driven state transition is
    /// always reflected before the next dispatch (I5).
    pub async fn refresh_index(&self) {
        let running: HashSet<String> = self.manager.running_servers().into_iter().collect();
        let internal = self.internal_providers.lock().clone();
        let external = self.external_providers.lock().clone();
        let mut built = HashMap::new();
        for provider in internal
            .iter()
            .filter(|p| running.contains(p.server_id()))
            .chain(external.iter().filter(|p| running.contains(p.server_id())))
        {
            for tool in provider.tools().await {
                built.insert(tool.name.clone(), (tool, Arc::clone(provider)));
            }
        }
        self.index.clear();
        for (name, entry) in built {
            self.index.insert(name, entry);
        }
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.refresh_index().await;
        self.index.iter().map(|entry| entry.value().0.clone()).collect()
    }

    /// Looks up a tool by name. A cache hit is only trusted if its
    /// provider is still running; otherwise (or on a miss) the index is
    /// rebuilt and the lookup retried, so a provider that has since
    /// errored or stopped is never routed to (I5).
    async fn find(&self, name: &str) -> Option<(Tool, Arc<dyn Provider>)> {
        if let Some(entry) = self.index.get(name) {
            let (tool, provider) = entry.value().clone();
            if self.manager.running_servers().iter().any(|id| id == provider.server_id()) {
                return Some((tool, provider));
            }
        }
        self.refresh_index().await;
        self.index.get(name).map(|entry| entry.value().clone())
    }

    fn cache_key(name: &str, arguments: &HashMap<String, Value>) -> String {
        short_fingerprint(name, arguments)
    }

    fn cache_get(&self, key: &str) -> Option<ToolResult> {
        if !self.config.cache_enabled {
            return None;
        }
        let entry = self.cache.get(key)?;
        if entry.inserted_at.elapsed() > Duration::from_secs(self.config.cache_ttl_secs) {
            return None;
        }
        Some(entry.result.clone())
    }

    fn cache_put(&self, key: String, result: ToolResult) {
        if !self.config.cache_enabled || !result.success {
            return;
        }
        self.cache.insert(key, CacheEntry { result, inserted_at: Instant::now() });
        if self.cache.len() > self.config.cache_max_entries {
            let mut by_age: Vec<(String, Instant)> =
                self.cache.iter().map(|entry| (entry.key().clone(), entry.value().inserted_at)).collect();
            by_age.sort_by_key(|(_, inserted_at)| *inserted_at);
            for (key, _) in by_age.into_iter().take(self.config.cache_eviction_batch) {
                self.cache.remove(&key);
            }
        }
    }

    fn record_history(&self, record: ExecutionRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        if history.len() > self.config.max_history_entries {
            let drop_count = history.len() - self.config.history_truncate_to;
            for _ in 0..drop_count {
                history.pop_front();
            }
        }
    }

    /// Executes one call: lookup, semaphore acquire, cache check, security
    /// authorization, provider dispatch under a timeout, history recording.
    pub async fn execute(&self, tool_call: ToolCall, timeout: Option<Duration>) -> ToolResult {
        let Some((tool, provider)) = self.find(&tool_call.name).await else {
            return ToolResult::error(format!("tool '{}' not found in any running server", tool_call.name));
        };

        let cache_key = Self::cache_key(&tool_call.name, &tool_call.arguments);
        if let Some(cached) = self.cache_get(&cache_key) {
            debug!(tool = %tool_call.name, "cache hit");
            return cached;
        }

        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        if let Err(reason) = self.security_gate.authorize(&tool, &tool_call.arguments).await {
            return ToolResult::error(format!("permission denied: {reason}"));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let call_timeout = timeout.unwrap_or_else(|| Duration::from_secs_f64(self.config.default_timeout_secs));

        let result = match tokio::time::timeout(call_timeout, provider.call(&tool_call.name, tool_call.arguments.clone())).await {
            Ok(result) => result,
            Err(_) => ToolResult::error(format!(
                "tool '{}' timed out after {:.1}s",
                tool_call.name,
                call_timeout.as_secs_f64()
            )),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        self.record_history(ExecutionRecord {
            call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            server_id: tool.server_id.clone(),
            started_at,
            completed_at: Utc::now(),
            duration_ms,
            success: result.success,
        });

        if result.success {
            self.cache_put(cache_key, result.clone());
        }

        info!(tool = %tool_call.name, success = result.success, duration_ms, "tool execution completed");
        result
    }

    /// Dispatches many calls. Strictly sequential (left to right) when
    /// `parallel` is false so later calls observe earlier calls' effect on
    /// the security context; otherwise concurrent, bounded by the same
    /// semaphore, with no ordering guarantee.
    pub async fn execute_many(
        &self,
        tool_calls: Vec<ToolCall>,
        parallel: bool,
        timeout: Option<Duration>,
    ) -> HashMap<String, ToolResult> {
        if parallel {
            let results = join_all(tool_calls.into_iter().map(|call| {
                let id = call.id.clone();
                async move { (id, self.execute(call, timeout).await) }
            }))
            .await;
            results.into_iter().collect()
        } else {
            let mut results = HashMap::new();
            for call in tool_calls {
                let id = call.id.clone();
                let result = self.execute(call, timeout).await;
                results.insert(id, result);
            }
            results
        }
    }

    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Computes success rate and average duration on demand from history;
    /// no precomputed counters are kept.
    pub fn stats(&self) -> RouterStats {
        let history = self.history.lock();
        if history.is_empty() {
            return RouterStats::default();
        }

        let total_calls = history.len();
        let successes = history.iter().filter(|r| r.success).count();
        let total_duration: u64 = history.iter().map(|r| r.duration_ms).sum();

        let mut per_tool: HashMap<String, (usize, usize, u64)> = HashMap::new();
        for record in history.iter() {
            let entry = per_tool.entry(record.tool_name.clone()).or_insert((0, 0, 0));
            entry.0 += 1;
            if record.success {
                entry.1 += 1;
            }
            entry.2 += record.duration_ms;
        }

        RouterStats {
            total_calls,
            success_rate: successes as f64 / total_calls as f64,
            average_duration_ms: total_duration as f64 / total_calls as f64,
            per_tool: per_tool
                .into_iter()
                .map(|(name, (calls, successes, duration))| {
                    (
                        name,
                        ToolStats {
                            calls,
                            success_rate: successes as f64 / calls as f64,
                            average_duration_ms: duration as f64 / calls as f64,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::ServerManagerConfig;
    use crate::domain::errors::OrchestratorResult;
    use crate::domain::security_context::{SecurityPolicy, TrustLevel};
    use crate::domain::types::{ParameterType, PermissionLevel, ToolParameter};

    struct FakeProvider {
        id: String,
        tool_name: String,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn server_id(&self) -> &str {
            &self.id
        }

        async fn tools(&self) -> Vec<Tool> {
            vec![Tool {
                name: self.tool_name.clone(),
                description: String::new(),
                parameters: vec![ToolParameter::new("x", ParameterType::String)],
                server_id: self.id.clone(),
                requires_confirmation: false,
                permission_level: PermissionLevel::Read,
            }]
        }

        async fn initialize(&self) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn shutdown(&self) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn call(&self, _name: &str, _arguments: HashMap<String, Value>) -> ToolResult {
            ToolResult::success_text("ok")
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn make_router(manager: Arc<ServerManager>) -> ToolRouter {
        let security_gate = Arc::new(SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000));
        ToolRouter::new(RouterConfig::default(), security_gate, manager)
    }

    #[tokio::test]
    async fn stopped_provider_is_excluded_from_the_index() {
        let manager = ServerManager::new(ServerManagerConfig::default());
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider { id: "a".to_string(), tool_name: "greet".to_string() });
        manager.register(Arc::clone(&provider)).unwrap();
        manager.initialize_all().await;

        let router = make_router(Arc::clone(&manager));
        router.register_provider(Arc::clone(&provider), false);

        assert_eq!(router.tools().await.len(), 1);

        manager.shutdown_all().await;
        assert!(router.tools().await.is_empty());
    }

    #[tokio::test]
    async fn execute_reports_not_found_once_the_provider_has_stopped() {
        let manager = ServerManager::new(ServerManagerConfig::default());
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider { id: "a".to_string(), tool_name: "greet".to_string() });
        manager.register(Arc::clone(&provider)).unwrap();
        manager.initialize_all().await;

        let router = make_router(Arc::clone(&manager));
        router.register_provider(Arc::clone(&provider), false);
        router.tools().await;

        manager.shutdown_all().await;

        let result = router.execute(ToolCall::new("1", "greet"), None).await;
        assert!(!result.success);
    }
}
