use serde::{Deserialize, Serialize};

use crate::domain::SecurityPolicy;

/// Tuning knobs for the tool router (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_concurrent_tools: usize,
    pub default_timeout_secs: f64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_eviction_batch: usize,
    pub max_history_entries: usize,
    pub history_truncate_to: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: 5,
            default_timeout_secs: 60.0,
            cache_enabled: true,
            cache_ttl_secs: 300,
            cache_max_entries: 100,
            cache_eviction_batch: 20,
            max_history_entries: 1000,
            history_truncate_to: 500,
        }
    }
}

/// Tuning knobs for the server manager's supervision loop (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerManagerConfig {
    pub health_check_interval_secs: u64,
    pub max_restart_attempts: u32,
    pub restart_quiet_period_ms: u64,
    pub auto_restart: bool,
}

impl Default for ServerManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            max_restart_attempts: 3,
            restart_quiet_period_ms: 500,
            auto_restart: true,
        }
    }
}

/// Aggregated configuration handed to the `Orchestrator` constructor. The
/// core accepts config; it does not discover it from disk or environment —
/// an embedding application owns that (§10.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub security_policy: SecurityPolicy,
    pub router: RouterConfig,
    pub server_manager: ServerManagerConfig,
    /// Number of audit-log entries retained before truncation to half.
    pub max_audit_entries: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            security_policy: SecurityPolicy::default(),
            router: RouterConfig::default(),
            server_manager: ServerManagerConfig::default(),
            max_audit_entries: 1000,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanity-checks the tuning knobs. Not called implicitly by the
    /// constructor — callers loading config from an external source should
    /// run this before handing it to `Orchestrator::new`.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.router.max_concurrent_tools > 0, "max_concurrent_tools must be positive");
        anyhow::ensure!(self.router.default_timeout_secs > 0.0, "default_timeout_secs must be positive");
        anyhow::ensure!(
            self.router.history_truncate_to <= self.router.max_history_entries,
            "history_truncate_to must not exceed max_history_entries"
        );
        anyhow::ensure!(
            self.router.cache_eviction_batch <= self.router.cache_max_entries,
            "cache_eviction_batch must not exceed cache_max_entries"
        );
        anyhow::ensure!(
            self.server_manager.health_check_interval_secs > 0,
            "health_check_interval_secs must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        OrchestratorConfig::default().validate().expect("defaults must pass validation");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.router.max_concurrent_tools = 0;
        assert!(config.validate().is_err());
    }
}
