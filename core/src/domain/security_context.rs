use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Caller-assigned trust tier. The core makes no assumption about a default;
/// an embedding application must pick one explicitly (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    Untrusted = 0,
    Basic = 1,
    Elevated = 2,
    Admin = 3,
}

/// Immutable policy configuration. Defaults favor safety: every
/// confirmation flag is `true` except for `read`, which the pipeline never
/// gates on confirmation at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub require_confirmation_write: bool,
    pub require_confirmation_execute: bool,
    pub require_confirmation_system: bool,
    pub require_confirmation_dangerous: bool,
    pub sandbox_enabled: bool,
    pub sandbox_allowed_paths: Vec<String>,
    pub sandbox_blocked_paths: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub blocked_extensions: Vec<String>,
    /// Rolling-minute cap on security-gated operations per session. Zero
    /// disables the rate limit check entirely.
    pub max_operations_per_minute: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            require_confirmation_write: true,
            require_confirmation_execute: true,
            require_confirmation_system: true,
            require_confirmation_dangerous: true,
            sandbox_enabled: true,
            sandbox_allowed_paths: Vec::new(),
            sandbox_blocked_paths: vec![
                "/etc".to_string(),
                "/sys".to_string(),
                "/proc".to_string(),
                "/boot".to_string(),
            ],
            blocked_commands: vec![
                "rm -rf /".to_string(),
                "mkfs".to_string(),
                ":(){ :|:& };:".to_string(),
            ],
            blocked_extensions: vec![".exe".to_string(), ".dll".to_string(), ".so".to_string()],
            max_operations_per_minute: 60,
        }
    }
}

/// Mutable per-session state carried across calls within one orchestrator
/// lifetime. Confirmed/denied sets are fingerprint memoizations; once a
/// fingerprint lands in `denied_operations` it stays denied for the session
/// (invariant I4).
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub trust_level: TrustLevel,
    pub confirmed_operations: HashSet<String>,
    pub denied_operations: HashSet<String>,
}

impl SecurityContext {
    pub fn new(trust_level: TrustLevel) -> Self {
        Self {
            trust_level,
            confirmed_operations: HashSet::new(),
            denied_operations: HashSet::new(),
        }
    }

    pub fn reset(&mut self) {
        self.confirmed_operations.clear();
        self.denied_operations.clear();
    }
}

/// Fingerprint of a `(tool_name, arguments)` pair: `sha256(name ||
/// canonical(arguments))`, used for confirmation memoization and the
/// router's result cache key.
pub fn fingerprint(tool_name: &str, arguments: &HashMap<String, Value>) -> String {
    let canonical = canonicalize_arguments(arguments);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short (16 hex char) variant used as the router's cache key, matching the
/// source's truncated-digest convention.
pub fn short_fingerprint(tool_name: &str, arguments: &HashMap<String, Value>) -> String {
    fingerprint(tool_name, arguments)[..16].to_string()
}

/// Stable JSON serialization independent of map-insertion order, so that
/// `{a:1,b:2}` and `{b:2,a:1}` produce identical fingerprints.
fn canonicalize_arguments(arguments: &HashMap<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = arguments.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for byte in bytes.as_ref() {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let mut a = HashMap::new();
        a.insert("a".to_string(), Value::from(1));
        a.insert("b".to_string(), Value::from(2));

        let mut b = HashMap::new();
        b.insert("b".to_string(), Value::from(2));
        b.insert("a".to_string(), Value::from(1));

        assert_eq!(fingerprint("add", &a), fingerprint("add", &b));
    }

    #[test]
    fn fingerprint_differs_by_tool_name() {
        let args = HashMap::new();
        assert_ne!(fingerprint("a", &args), fingerprint("b", &args));
    }

    #[test]
    fn short_fingerprint_is_sixteen_hex_chars() {
        let args = HashMap::new();
        let key = short_fingerprint("add", &args);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
