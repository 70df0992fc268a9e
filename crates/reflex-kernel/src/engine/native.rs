//! Native engine - in-process skill table with Pass Protocol support
//!
//! A capsule names its skill through `payload.skill`, falling back to the
//! goal. A missing skill blocks the capsule unless the trace already carries
//! help for the matching `skill.<name>` capability: an assist output merged
//! by the orchestrator, or an agent provisioned for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use reflex_types::{Capsule, CapsuleResult, Need, ReflexError};

use super::{CapsuleEngine, EngineHealth, EngineMode, ExecutionContext, HealthStatus};

/// Trace keys written by the orchestrator when a need gets resolved
pub mod trace_keys {
    pub const ASSIST_CAPABILITY: &str = "assist.capability";
    pub const ASSIST_AGENT_ID: &str = "assist.agent_id";
    pub const ASSIST_OUTPUT: &str = "assist.output";
    pub const PROVISION_CAPABILITY: &str = "provision.capability";
    pub const PROVISION_AGENT_ID: &str = "provision.agent_id";
    pub const PROVISION_WORKSPACE: &str = "provision.workspace_path";
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkillError {
    /// Recoverable: the skill needs something it does not have
    #[error("Skill blocked: {explanation}")]
    Blocked {
        explanation: String,
        need: Option<Need>,
    },

    #[error("Skill failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, capsule: &Capsule, ctx: &ExecutionContext) -> Result<Map<String, Value>, SkillError>;
}

/// Returns the goal and payload it was given
pub struct EchoSkill;

#[async_trait]
impl Skill for EchoSkill {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, capsule: &Capsule, ctx: &ExecutionContext) -> Result<Map<String, Value>, SkillError> {
        let mut out = Map::new();
        out.insert("echo".to_string(), json!(capsule.goal));
        out.insert("payload".to_string(), Value::Object(capsule.payload.clone()));
        out.insert("level".to_string(), json!(ctx.level));
        Ok(out)
    }
}

#[derive(Default)]
pub struct NativeEngine {
    skills: RwLock<HashMap<String, Arc<dyn Skill>>>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations under the same name replace earlier ones
    pub fn register_skill(&self, skill: Arc<dyn Skill>) {
        let name = skill.name().to_string();
        debug!(skill = %name, "skill registered");
        self.skills.write().insert(name, skill);
    }

    pub fn skill_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn find(&self, name: &str) -> Option<Arc<dyn Skill>> {
        let skills = self.skills.read();
        skills
            .get(name)
            .or_else(|| name.strip_prefix("skill.").and_then(|bare| skills.get(bare)))
            .cloned()
    }
}

/// Skill requested by a capsule: `payload.skill`, else the goal
pub fn requested_skill(capsule: &Capsule) -> String {
    capsule
        .payload
        .get("skill")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&capsule.goal)
        .trim()
        .to_string()
}

/// Capability tag for a skill name, e.g. `Translate Text` -> `skill.translate_text`
pub fn skill_capability(name: &str) -> String {
    let bare = name.strip_prefix("skill.").unwrap_or(name);
    let slug: String = bare
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("skill.{}", slug)
}

/// Blocker text for a missing skill. Only the slugged capability is quoted,
/// and it comes first, so goal text can never name the capability the parser
/// picks up.
fn missing_skill_explanation(capability: &str) -> String {
    let bare = capability.strip_prefix("skill.").unwrap_or(capability);
    format!("capability: {}; missing skill: {}", capability, bare)
}

/// Output assembled from help already recorded in the trace
fn resolved_from_trace(capsule: &Capsule, skill: &str, capability: &str) -> Option<Map<String, Value>> {
    let trace = capsule.trace_map();
    let names = |key: &str| {
        trace
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|c| c == capability || c == skill)
    };

    if names(trace_keys::ASSIST_CAPABILITY) {
        let mut out = match trace.get(trace_keys::ASSIST_OUTPUT) {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut m = Map::new();
                m.insert("result".to_string(), other.clone());
                m
            }
            None => Map::new(),
        };
        out.insert("resolved_by".to_string(), json!("assist"));
        if let Some(agent) = trace.get(trace_keys::ASSIST_AGENT_ID) {
            out.insert("agent_id".to_string(), agent.clone());
        }
        return Some(out);
    }

    if names(trace_keys::PROVISION_CAPABILITY) {
        let mut out = Map::new();
        out.insert("resolved_by".to_string(), json!("provision"));
        out.insert("capability".to_string(), json!(capability));
        for (key, field) in [
            (trace_keys::PROVISION_AGENT_ID, "agent_id"),
            (trace_keys::PROVISION_WORKSPACE, "workspace_path"),
        ] {
            if let Some(v) = trace.get(key) {
                out.insert(field.to_string(), v.clone());
            }
        }
        return Some(out);
    }

    None
}

#[async_trait]
impl CapsuleEngine for NativeEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Native
    }

    async fn execute(&self, capsule: &Capsule, ctx: &ExecutionContext) -> CapsuleResult {
        let started = Instant::now();
        let name = requested_skill(capsule);

        let result = match self.find(&name) {
            Some(skill) => match skill.run(capsule, ctx).await {
                Ok(output) => CapsuleResult::success(capsule.id.clone(), output),
                Err(SkillError::Blocked { explanation, need }) => {
                    CapsuleResult::blocked(capsule.id.clone(), explanation, need)
                }
                Err(SkillError::Failed(message)) => {
                    CapsuleResult::failure(capsule.id.clone(), ReflexError::EngineExecution(message).to_string())
                }
            },
            None => {
                let capability = skill_capability(&name);
                match resolved_from_trace(capsule, &name, &capability) {
                    Some(output) => CapsuleResult::success(capsule.id.clone(), output),
                    None => {
                        debug!(capsule_id = %capsule.id, skill = %name, "skill missing, blocking");
                        CapsuleResult::blocked(capsule.id.clone(), missing_skill_explanation(&capability), None)
                    }
                }
            }
        };

        result
            .with_metric("engine", json!("native"))
            .with_metric("skill", json!(name))
            .with_metric("elapsed_ms", json!(started.elapsed().as_millis() as u64))
    }

    async fn health(&self, _ctx: &ExecutionContext) -> EngineHealth {
        let names = self.skill_names();
        EngineHealth::new(EngineMode::Native, HealthStatus::Ok)
            .with_detail("skill_count", json!(names.len()))
            .with_detail("skills", json!(names))
    }

    fn supports_pass(&self) -> bool {
        true
    }
}
