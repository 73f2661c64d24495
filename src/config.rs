use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{SecurityError, SecurityResult};

/// Settings for one security service instance. Unspecified fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Capacity of the parsed predicate LRU; 0 reparses on every call
    pub predicate_cache_size: usize,
    /// Bootstrap creates admin/reader/writer users alongside the default roles
    pub create_default_users: bool,
    pub token_ttl_secs: u64,
    /// Optional JSON-lines audit file
    pub audit_log_path: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            predicate_cache_size: 300,
            create_default_users: true,
            token_ttl_secs: 60 * 60,
            audit_log_path: None,
        }
    }
}

impl SecurityConfig {
    pub fn from_json(text: &str) -> SecurityResult<Self> {
        serde_json::from_str(text).map_err(|e| SecurityError::configuration(format!("invalid security config: {}", e)))
    }

    /// Defaults overlaid with ROWSEC_* environment variables.
    pub fn from_env() -> Self { Self::default().overlay(|k| std::env::var(k).ok()) }

    fn overlay<F: Fn(&str) -> Option<String>>(mut self, get: F) -> Self {
        if let Some(v) = get("ROWSEC_PREDICATE_CACHE_SIZE") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.predicate_cache_size = n,
                Err(_) => tracing::warn!(target: "rowsec::admin", var = "ROWSEC_PREDICATE_CACHE_SIZE", "ignoring malformed value"),
            }
        }
        if let Some(v) = get("ROWSEC_CREATE_DEFAULT_USERS") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.create_default_users = true,
                "0" | "false" | "no" | "off" => self.create_default_users = false,
                _ => tracing::warn!(target: "rowsec::admin", var = "ROWSEC_CREATE_DEFAULT_USERS", "ignoring malformed value"),
            }
        }
        if let Some(v) = get("ROWSEC_TOKEN_TTL_SECS") {
            match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => self.token_ttl_secs = n,
                _ => tracing::warn!(target: "rowsec::admin", var = "ROWSEC_TOKEN_TTL_SECS", "ignoring malformed value"),
            }
        }
        if let Some(v) = get("ROWSEC_AUDIT_LOG") {
            if !v.trim().is_empty() { self.audit_log_path = Some(PathBuf::from(v.trim())); }
        }
        self
    }
}
