use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::security_context::{fingerprint, SecurityContext, SecurityPolicy, TrustLevel};
use crate::domain::types::{PermissionLevel, Tool};

const PATH_ARG_NAMES: &[&str] = &["path", "file", "filename", "directory", "dir"];
const COMMAND_ARG_NAMES: &[&str] = &["command", "cmd", "script"];

pub type ConfirmationHandler = Arc<dyn Fn(String, String) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Denied,
    UserDenied,
    Executing,
    Success,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub server_id: String,
    pub permission_level: PermissionLevel,
    pub status: AuditStatus,
    pub details: String,
}

fn command_blocklist_regex() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"rm\s+-[rf]+\s+/",
            r"dd\s+if=/dev/(zero|random)",
            r"mkfs\.",
            r"chmod\s+-R\s+777\s+/",
            r">\s*/dev/sd[a-z]",
            r"\|\s*(ba)?sh\b",
            r"eval\s+",
            r"`[^`]*`",
            r"\$\(",
        ]
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("static pattern is valid"))
        .collect()
    })
}

fn injection_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ("semicolon-chain", Regex::new(r";\s*\w").unwrap()),
            ("pipe-chain", Regex::new(r"\|\s*\w").unwrap()),
            ("and-chain", Regex::new(r"&&\s*\w").unwrap()),
            ("or-chain", Regex::new(r"\|\|\s*\w").unwrap()),
            ("subshell", Regex::new(r"\$\([^)]*\)").unwrap()),
            ("backtick", Regex::new(r"`[^`]*`").unwrap()),
            ("root-redirect", Regex::new(r">\s*/(root|home)\b").unwrap()),
        ]
    })
}

/// Evaluates invocations against a [`SecurityPolicy`], interactively
/// confirming when required, and memoizing decisions per session. See
/// SPEC_FULL.md §4.5.
pub struct SecurityGate {
    policy: SecurityPolicy,
    context: Mutex<SecurityContext>,
    audit_log: Mutex<VecDeque<AuditEntry>>,
    confirmation_handler: Mutex<Option<ConfirmationHandler>>,
    rate_limiter: Option<DefaultDirectRateLimiter>,
    max_audit_entries: usize,
    audit_truncate_to: usize,
}

impl SecurityGate {
    /// `max_audit_entries` is the ring-buffer cap; on overflow the log is
    /// truncated to half that, matching the 1000→500 default (§4.5).
    pub fn new(policy: SecurityPolicy, trust_level: TrustLevel, max_audit_entries: usize) -> Self {
        let rate_limiter = NonZeroU32::new(policy.max_operations_per_minute)
            .map(|limit| governor::RateLimiter::direct(Quota::per_minute(limit)));
        Self {
            policy,
            context: Mutex::new(SecurityContext::new(trust_level)),
            audit_log: Mutex::new(VecDeque::new()),
            confirmation_handler: Mutex::new(None),
            rate_limiter,
            max_audit_entries: max_audit_entries.max(1),
            audit_truncate_to: (max_audit_entries.max(1) / 2).max(1),
        }
    }

    pub fn set_confirmation_handler(&self, handler: ConfirmationHandler) {
        *self.confirmation_handler.lock() = Some(handler);
    }

    pub fn reset_context(&self) {
        self.context.lock().reset();
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log.lock().iter().cloned().collect()
    }

    fn audit(&self, tool: &Tool, status: AuditStatus, details: impl Into<String>) {
        let mut log = self.audit_log.lock();
        log.push_back(AuditEntry {
            timestamp: Utc::now(),
            tool_name: tool.name.clone(),
            server_id: tool.server_id.clone(),
            permission_level: tool.permission_level,
            status,
            details: details.into(),
        });
        if log.len() > self.max_audit_entries {
            let drop_count = log.len() - self.audit_truncate_to;
            log.drain(0..drop_count);
        }
    }

    /// Runs the full check pipeline (§4.5), confirming interactively when
    /// required. Returns `Ok(())` if the call may proceed, `Err(reason)` if
    /// it must be denied.
    ///
    /// Order matters: a permission-level result only short-circuits the
    /// pipeline when it is a hard DENY (insufficient trust). A CONFIRM
    /// requirement is carried forward — argument inspection still runs, and
    /// only denies there or the per-tool confirmation flag, last, actually
    /// prompts the handler. This mirrors the original's
    /// `check_tool_permission`: permission level, then arguments, then
    /// confirmation.
    pub async fn authorize(&self, tool: &Tool, arguments: &HashMap<String, Value>) -> Result<(), String> {
        if let Some(limiter) = &self.rate_limiter {
            if limiter.check().is_err() {
                self.audit(tool, AuditStatus::Denied, "rate limit exceeded");
                return Err("rate limit exceeded".to_string());
            }
        }

        let print = fingerprint(&tool.name, arguments);

        if self.context.lock().denied_operations.contains(&print) {
            self.audit(tool, AuditStatus::Denied, "previously denied");
            return Err("previously denied".to_string());
        }

        let mut confirm_reason = self.check_permission_level(tool)?;

        if let Some(reason) = self.inspect_arguments(arguments) {
            self.audit(tool, AuditStatus::Denied, &reason);
            return Err(reason);
        }

        if tool.requires_confirmation && confirm_reason.is_none() {
            confirm_reason = Some("tool requires confirmation".to_string());
        }

        match confirm_reason {
            Some(reason) => self.resolve_confirm(tool, arguments, &print, reason).await,
            None => {
                self.audit(tool, AuditStatus::Executing, "allowed");
                Ok(())
            }
        }
    }

    /// Returns `Ok(Some(reason))` when confirmation is needed, `Ok(None)`
    /// when the level passes through, or `Err` when trust is insufficient
    /// (a hard deny, never a confirmation prompt).
    fn check_permission_level(&self, tool: &Tool) -> Result<Option<String>, String> {
        let trust = self.context.lock().trust_level;
        match tool.permission_level {
            PermissionLevel::Dangerous => {
                if trust < TrustLevel::Admin {
                    self.audit(tool, AuditStatus::Denied, "insufficient trust for dangerous tool");
                    return Err("insufficient trust level".to_string());
                }
                Ok(self.policy.require_confirmation_dangerous.then(|| "dangerous operation".to_string()))
            }
            PermissionLevel::System => {
                if trust < TrustLevel::Elevated {
                    self.audit(tool, AuditStatus::Denied, "insufficient trust for system tool");
                    return Err("insufficient trust level".to_string());
                }
                Ok(self.policy.require_confirmation_system.then(|| "system operation".to_string()))
            }
            PermissionLevel::Execute => Ok(self.policy.require_confirmation_execute.then(|| "execute operation".to_string())),
            PermissionLevel::Write => Ok(self.policy.require_confirmation_write.then(|| "write operation".to_string())),
            PermissionLevel::Read => Ok(None),
        }
    }

    fn inspect_arguments(&self, arguments: &HashMap<String, Value>) -> Option<String> {
        for (name, value) in arguments {
            let Some(text) = value.as_str() else { continue };

            if PATH_ARG_NAMES.contains(&name.as_str()) {
                if let Some(reason) = self.check_path(text) {
                    return Some(reason);
                }
            }

            if COMMAND_ARG_NAMES.contains(&name.as_str()) {
                let lowered = text.to_lowercase();
                if self.policy.blocked_commands.iter().any(|blocked| lowered.contains(&blocked.to_lowercase())) {
                    return Some(format!("blocked command in argument '{name}'"));
                }
                if command_blocklist_regex().iter().any(|re| re.is_match(text)) {
                    return Some(format!("dangerous command pattern in argument '{name}'"));
                }
            }
        }

        let matched_kinds: usize = injection_patterns()
            .iter()
            .filter(|(_, re)| arguments.values().filter_map(Value::as_str).any(|s| re.is_match(s)))
            .count();
        if matched_kinds >= 2 {
            return Some("potential command injection".to_string());
        }

        None
    }

    fn check_path(&self, raw_path: &str) -> Option<String> {
        let resolved = resolve_path(raw_path);
        let resolved_str = resolved.to_string_lossy();

        if self
            .policy
            .sandbox_blocked_paths
            .iter()
            .any(|blocked| resolved_str.starts_with(blocked.as_str()))
        {
            return Some(format!("path '{raw_path}' is blocked"));
        }

        if self.policy.sandbox_enabled && !self.policy.sandbox_allowed_paths.is_empty() {
            let allowed = self
                .policy
                .sandbox_allowed_paths
                .iter()
                .any(|prefix| resolved_str.starts_with(prefix.as_str()));
            if !allowed {
                return Some(format!("path '{raw_path}' is outside the sandbox"));
            }
        }

        if self
            .policy
            .blocked_extensions
            .iter()
            .any(|ext| resolved_str.to_lowercase().ends_with(&ext.to_lowercase()))
        {
            return Some(format!("path '{raw_path}' has a blocked extension"));
        }

        None
    }

    async fn resolve_confirm(
        &self,
        tool: &Tool,
        arguments: &HashMap<String, Value>,
        print: &str,
        reason: String,
    ) -> Result<(), String> {
        if self.context.lock().confirmed_operations.contains(print) {
            self.audit(tool, AuditStatus::Executing, "previously confirmed");
            return Ok(());
        }

        let handler = self.confirmation_handler.lock().clone();
        let Some(handler) = handler else {
            self.audit(tool, AuditStatus::Denied, "confirmation required, no handler registered");
            return Err("confirmation required, no handler registered".to_string());
        };

        let title = format!("Confirm {}", tool.name);
        let message = format_confirmation_message(tool, arguments, &reason);
        let confirmed = handler(title, message).await;

        if confirmed {
            self.context.lock().confirmed_operations.insert(print.to_string());
            info!(tool = %tool.name, "operation confirmed by user");
            self.audit(tool, AuditStatus::Executing, "confirmed by user");
            Ok(())
        } else {
            self.context.lock().denied_operations.insert(print.to_string());
            warn!(tool = %tool.name, "operation denied by user");
            self.audit(tool, AuditStatus::UserDenied, "cancelled by user");
            Err("cancelled by user".to_string())
        }
    }
}

fn format_confirmation_message(tool: &Tool, arguments: &HashMap<String, Value>, reason: &str) -> String {
    let args_preview = arguments
        .iter()
        .map(|(k, v)| {
            let rendered = v.to_string();
            let truncated: String = rendered.chars().take(100).collect();
            format!("{k}={truncated}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Tool '{}' ({:?}) requests permission: {reason}\nArguments: {args_preview}",
        tool.name, tool.permission_level
    )
}

fn resolve_path(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ToolParameter;

    fn tool(name: &str, level: PermissionLevel, requires_confirmation: bool) -> Tool {
        Tool {
            name: name.to_string(),
            description: String::new(),
            parameters: vec![ToolParameter::new("path", crate::domain::types::ParameterType::String)],
            server_id: "srv".to_string(),
            requires_confirmation,
            permission_level: level,
        }
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::String(v.to_string()))).collect()
    }

    #[tokio::test]
    async fn blocked_path_denies_without_confirmation_handler() {
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000);
        let t = tool("write_file", PermissionLevel::Write, false);
        let result = gate.authorize(&t, &args(&[("path", "/etc/passwd")])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn confirmed_operation_is_remembered() {
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000);
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { true })));
        let t = tool("write_file", PermissionLevel::Write, false);
        let call_args = args(&[("path", "/tmp/a"), ("content", "x")]);

        assert!(gate.authorize(&t, &call_args).await.is_ok());
        // Second call must not need the handler again; memoized.
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { false })));
        assert!(gate.authorize(&t, &call_args).await.is_ok());
    }

    #[tokio::test]
    async fn denied_operation_stays_denied_for_the_session() {
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000);
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { false })));
        let t = tool("delete_file", PermissionLevel::Write, false);
        let call_args = args(&[("path", "/tmp/b")]);

        assert!(gate.authorize(&t, &call_args).await.is_err());
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { true })));
        let result = gate.authorize(&t, &call_args).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err(), "previously denied");
    }

    #[tokio::test]
    async fn insufficient_trust_denies_dangerous_tool_outright() {
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Untrusted, 1000);
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { true })));
        let t = tool("format_disk", PermissionLevel::Dangerous, false);
        let result = gate.authorize(&t, &args(&[])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_tool_passes_without_confirmation() {
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Untrusted, 1000);
        let t = tool("read_file", PermissionLevel::Read, false);
        let result = gate.authorize(&t, &args(&[("path", "/tmp/readable")])).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn blocked_path_denies_even_when_tool_requires_confirmation() {
        // A write tool always needs confirmation, but a blocked path must
        // deny before the handler is ever consulted (pipeline order).
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000);
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { true })));
        let t = tool("write_file", PermissionLevel::Write, false);
        let result = gate.authorize(&t, &args(&[("path", "/etc/shadow")])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn blocked_extension_is_denied() {
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000);
        gate.set_confirmation_handler(Arc::new(|_, _| Box::pin(async { true })));
        let t = tool("write_file", PermissionLevel::Write, false);
        let result = gate.authorize(&t, &args(&[("path", "/tmp/payload.exe")])).await;
        assert!(result.is_err());
    }

    #[test]
    fn injection_heuristic_requires_two_distinct_pattern_matches() {
        let single = args(&[("command", "ls; echo hi")]);
        let double = args(&[("command", "ls; echo hi && rm stuff")]);
        let gate = SecurityGate::new(SecurityPolicy::default(), TrustLevel::Admin, 1000);
        let t = tool("run", PermissionLevel::Execute, false);

        assert!(gate.inspect_arguments(&single).is_none());
        assert!(gate.inspect_arguments(&double).is_some());
    }
}
