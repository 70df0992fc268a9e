//! Kernel Configuration
//!
//! Loaded from a JSON file, then overlaid with `REFLEX_*` environment
//! variables. Every field has a default, so an empty object is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use reflex_guard::{DomainFilterConfig, Policy};

use crate::engine::{EngineMode, GovernanceRules};

/// Gate names accepted in `gates`
pub const KNOWN_GATES: [&str; 4] = ["boot", "guard", "stabilizer", "domain_filter"];

pub const ENV_ENGINE_MODE: &str = "REFLEX_ENGINE_MODE";
pub const ENV_AUDIT_LOG: &str = "REFLEX_AUDIT_LOG";
pub const ENV_WORKSPACE_ROOT: &str = "REFLEX_WORKSPACE_ROOT";
pub const ENV_ESCALATION_TIMEOUT_MS: &str = "REFLEX_ESCALATION_TIMEOUT_MS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown gate '{0}'")]
    UnknownGate(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Backend for top-level capsules: `legacy`, `native` or `governed`
    #[serde(default = "default_engine_mode")]
    pub engine_mode: String,

    /// Gate names in evaluation order
    #[serde(default = "default_gates")]
    pub gates: Vec<String>,

    #[serde(default = "Policy::destructive_defaults")]
    pub policy: Policy,

    /// Required shapes checked by the guard gate
    #[serde(default)]
    pub schema: Map<String, Value>,

    #[serde(default)]
    pub manifest: Map<String, Value>,

    #[serde(default)]
    pub domain_filter: DomainFilterConfig,

    #[serde(default)]
    pub governance: GovernanceRules,

    /// Engine the governed backend delegates to
    #[serde(default = "default_governed_inner")]
    pub governed_inner: EngineMode,

    /// JSONL audit log; audit is off when unset
    #[serde(default)]
    pub audit_log: Option<PathBuf>,

    /// Where provisioned agents get their workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default = "default_escalation_timeout")]
    pub escalation_timeout_ms: u64,

    #[serde(default)]
    pub engine_timeout_ms: Option<u64>,

    #[serde(default = "default_provision_validity")]
    pub provision_validity_secs: u64,

    /// Finished capsule records kept in memory before pruning
    #[serde(default = "default_retain_terminal")]
    pub retain_terminal_records: usize,
}

fn default_engine_mode() -> String {
    "legacy".to_string()
}

fn default_gates() -> Vec<String> {
    KNOWN_GATES.iter().map(|g| g.to_string()).collect()
}

fn default_governed_inner() -> EngineMode {
    EngineMode::Native
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".reflex/agents")
}

fn default_escalation_timeout() -> u64 {
    30_000
}

fn default_provision_validity() -> u64 {
    3600
}

fn default_retain_terminal() -> usize {
    1024
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            engine_mode: default_engine_mode(),
            gates: default_gates(),
            policy: Policy::destructive_defaults(),
            schema: Map::new(),
            manifest: Map::new(),
            domain_filter: DomainFilterConfig::default(),
            governance: GovernanceRules::default(),
            governed_inner: default_governed_inner(),
            audit_log: None,
            workspace_root: default_workspace_root(),
            escalation_timeout_ms: default_escalation_timeout(),
            engine_timeout_ms: None,
            provision_validity_secs: default_provision_validity(),
            retain_terminal_records: default_retain_terminal(),
        }
    }
}

impl KernelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// File (or defaults) overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = var(ENV_ENGINE_MODE) {
            self.engine_mode = mode;
        }
        if let Some(path) = var(ENV_AUDIT_LOG) {
            self.audit_log = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(root) = var(ENV_WORKSPACE_ROOT) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(ms) = var(ENV_ESCALATION_TIMEOUT_MS) {
            self.escalation_timeout_ms = ms.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_ESCALATION_TIMEOUT_MS.to_string(),
                value: ms.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject unknown gate names
    pub fn validate(&self) -> Result<()> {
        if let Some(unknown) = self.gates.iter().find(|g| !KNOWN_GATES.contains(&g.as_str())) {
            return Err(ConfigError::UnknownGate(unknown.clone()));
        }
        Ok(())
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_millis(self.escalation_timeout_ms)
    }

    pub fn engine_timeout(&self) -> Option<Duration> {
        self.engine_timeout_ms.map(Duration::from_millis)
    }

    pub fn provision_validity(&self) -> Duration {
        Duration::from_secs(self.provision_validity_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: KernelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.engine_mode, "legacy");
        assert_eq!(config.gates, vec!["boot", "guard", "stabilizer", "domain_filter"]);
        assert_eq!(config.escalation_timeout(), Duration::from_secs(30));
        assert_eq!(config.provision_validity_secs, 3600);
        assert_eq!(config.retain_terminal_records, 1024);
        assert!(config.engine_timeout().is_none());
    }

    #[test]
    fn test_unknown_gate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reflex.json");
        std::fs::write(&path, r#"{"gates": ["guard", "telepathy"]}"#).unwrap();
        let err = KernelConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownGate(g) if g == "telepathy"));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            (ENV_ENGINE_MODE, "native"),
            (ENV_AUDIT_LOG, "/tmp/audit.jsonl"),
            (ENV_ESCALATION_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();
        let mut config = KernelConfig::default();
        config.apply_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.engine_mode, "native");
        assert_eq!(config.audit_log, Some(PathBuf::from("/tmp/audit.jsonl")));
        assert_eq!(config.escalation_timeout_ms, 250);
        assert_eq!(config.workspace_root, default_workspace_root());
    }

    #[test]
    fn test_bad_env_timeout() {
        let mut config = KernelConfig::default();
        let err = config
            .apply_vars(|k| (k == ENV_ESCALATION_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            KernelConfig::from_file("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
