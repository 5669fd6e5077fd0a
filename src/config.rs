//! `Config` and `DomainRule` (spec §3), loaded from `sidecar.json` (spec §6).

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_port() -> u16 {
    8080
}

fn default_env_file() -> String {
    ".env.vault".to_string()
}

fn default_ca_cert_path() -> String {
    "certs/ca.crt".to_string()
}

fn default_ca_key_path() -> String {
    "certs/ca.key".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaConfig {
    #[serde(default = "default_ca_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_ca_key_path")]
    pub key_path: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: default_ca_cert_path(),
            key_path: default_ca_key_path(),
        }
    }
}

/// Policy for one destination host (spec §3).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainRule {
    /// header name -> template string containing `${VAR}` placeholders.
    #[serde(default)]
    pub inject_headers: HashMap<String, String>,
    /// ordered secret key names substituted into scanned header values.
    #[serde(default)]
    pub replace_values: Vec<String>,
    /// restricts replace_values scanning to these header names (empty = scan all).
    #[serde(default)]
    pub replace_in_headers: HashSet<String>,
}

impl DomainRule {
    /// An empty rule is a no-op pass-through (spec §3 invariant).
    pub fn is_noop(&self) -> bool {
        self.inject_headers.is_empty() && self.replace_values.is_empty()
    }

    /// Every secret name this rule could ever emit upstream — used by the
    /// defense-in-depth whitelist scan (SPEC_FULL §4.C).
    pub fn referenced_secret_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.replace_values.clone();
        for template in self.inject_headers.values() {
            names.extend(extract_placeholders(template));
        }
        names
    }
}

/// Extract `${VAR}` placeholder names from a template string, in order.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        names.push(after[..end].to_string());
        rest = &after[end + 1..];
    }
    names
}

/// Root configuration (spec §3, wire format spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_env_file")]
    pub env_file: String,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub domains: HashMap<String, DomainRule>,
    /// Explicit opt-in to bind all interfaces instead of loopback-only (spec §4.A).
    #[serde(default)]
    pub unsafe_bind_all: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            env_file: default_env_file(),
            ca: CaConfig::default(),
            domains: HashMap::new(),
            unsafe_bind_all: false,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Config {
    /// Load from a JSON file. Invalid JSON is a fatal startup error
    /// (spec §6); unknown keys are ignored for forward-compatibility.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.domains = config
            .domains
            .into_iter()
            .map(|(host, rule)| (normalize_host(&host), rule))
            .collect();
        Ok(config)
    }

    /// Look up the rule for a normalized host (exact match, spec §4.C).
    pub fn rule_for(&self, host: &str) -> Option<&DomainRule> {
        self.domains.get(host)
    }
}

/// Lowercase and strip a trailing `:port` from a host string (spec §4.C).
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rfind(':') {
        // Don't strip a port from a bare IPv6 literal with no brackets;
        // in practice Host headers/CONNECT targets bracket IPv6, e.g. `[::1]:443`.
        Some(idx) if !host.starts_with('[') || host[..idx].ends_with(']') => &host[..idx],
        _ => host,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.to_ascii_lowercase()
}
