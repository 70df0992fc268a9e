//! Capsule engines - the uniform execution contract and its backends
//!
//! | Mode | Backend | Pass Protocol |
//! |---|---|---|
//! | `legacy` (default) | [`LegacyEngine`] over a [`LegacyModule`] | no |
//! | `native` | [`NativeEngine`] with an in-process skill table | yes |
//! | `governed` | [`GovernedEngine`] wrapping another engine | mirrors inner |

pub mod governed;
pub mod legacy;
pub mod native;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use reflex_types::{AgentId, Capsule, CapsuleResult};

pub use governed::{GovernanceRules, GovernedEngine};
pub use legacy::{LegacyEngine, LegacyModule};
pub use native::{EchoSkill, NativeEngine, Skill, SkillError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    #[default]
    Legacy,
    Native,
    Governed,
}

impl EngineMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "legacy" => Some(Self::Legacy),
            "native" => Some(Self::Native),
            "governed" => Some(Self::Governed),
            _ => None,
        }
    }

    /// Resolve a configured name, falling back to legacy
    pub fn select(name: Option<&str>) -> Self {
        match name {
            None => Self::Legacy,
            Some(name) => Self::parse(name).unwrap_or_else(|| {
                warn!(mode = name, "unknown engine mode, falling back to legacy");
                Self::Legacy
            }),
        }
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Native => write!(f, "native"),
            Self::Governed => write!(f, "governed"),
        }
    }
}

/// Per-attempt execution context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub request_id: String,
    pub level: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Set when executing on behalf of an assisting agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub attempt: u32,
}

impl ExecutionContext {
    pub fn new(request_id: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            level: level.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn for_agent(&self, agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            attempt: 0,
            ..self.clone()
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub mode: EngineMode,
    pub status: HealthStatus,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl EngineHealth {
    pub fn new(mode: EngineMode, status: HealthStatus) -> Self {
        Self {
            mode,
            status,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

#[async_trait]
pub trait CapsuleEngine: Send + Sync {
    fn mode(&self) -> EngineMode;

    /// Never panics or errors: failures are encoded in the result
    async fn execute(&self, capsule: &Capsule, ctx: &ExecutionContext) -> CapsuleResult;

    async fn health(&self, ctx: &ExecutionContext) -> EngineHealth;

    /// Whether this backend may legitimately return `blocked = true`
    fn supports_pass(&self) -> bool;
}

/// Dependencies the engine factory draws from
#[derive(Clone, Default)]
pub struct EngineDeps {
    pub legacy: Option<Arc<dyn LegacyModule>>,
    pub skills: Vec<Arc<dyn Skill>>,
    pub governance: GovernanceRules,
    /// Engine the governed backend delegates to
    pub governed_inner: EngineMode,
}

/// One engine per mode, built once
#[derive(Clone)]
pub struct EngineSet {
    legacy: Arc<LegacyEngine>,
    native: Arc<NativeEngine>,
    governed: Arc<GovernedEngine>,
}

impl EngineSet {
    pub fn build(deps: EngineDeps) -> Self {
        let legacy = Arc::new(LegacyEngine::new(deps.legacy));
        let native = Arc::new(NativeEngine::new());
        for skill in deps.skills {
            native.register_skill(skill);
        }
        let inner: Arc<dyn CapsuleEngine> = match deps.governed_inner {
            EngineMode::Native => native.clone(),
            // governing a governed engine adds nothing
            EngineMode::Legacy | EngineMode::Governed => legacy.clone(),
        };
        let governed = Arc::new(GovernedEngine::new(inner, deps.governance));
        Self {
            legacy,
            native,
            governed,
        }
    }

    pub fn get(&self, mode: EngineMode) -> Arc<dyn CapsuleEngine> {
        match mode {
            EngineMode::Legacy => self.legacy.clone(),
            EngineMode::Native => self.native.clone(),
            EngineMode::Governed => self.governed.clone(),
        }
    }

    /// Resolve an engine by configured name with the legacy fallback
    pub fn by_name(&self, name: &str) -> Arc<dyn CapsuleEngine> {
        self.get(EngineMode::select(Some(name)))
    }

    pub fn native(&self) -> &Arc<NativeEngine> {
        &self.native
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection_falls_back_to_legacy() {
        assert_eq!(EngineMode::select(None), EngineMode::Legacy);
        assert_eq!(EngineMode::select(Some("Native")), EngineMode::Native);
        assert_eq!(EngineMode::select(Some("quantum")), EngineMode::Legacy);
    }

    #[test]
    fn test_engine_set_modes() {
        let set = EngineSet::build(EngineDeps::default());
        assert_eq!(set.get(EngineMode::Legacy).mode(), EngineMode::Legacy);
        assert_eq!(set.get(EngineMode::Native).mode(), EngineMode::Native);
        assert_eq!(set.by_name("governed").mode(), EngineMode::Governed);
        assert!(!set.get(EngineMode::Legacy).supports_pass());
        assert!(set.get(EngineMode::Native).supports_pass());
        // governed mirrors its legacy inner engine
        assert!(!set.get(EngineMode::Governed).supports_pass());
    }
}
