//! Reflex pipeline - runs gates in order, merges context, short-circuits

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use reflex_audit::{AuditLog, AuditRecord};
use reflex_guard::{Gate, GateInput, Policy, Runtime};
use reflex_types::{stable_hash, Decision, DecisionAction};

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_level() -> Value {
    Value::String("L0".to_string())
}

/// A task as submitted by a caller. Fields are raw JSON; the guard gate
/// decides whether their shapes are acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: Value,
    #[serde(default = "empty_object")]
    pub context: Value,
    #[serde(default = "default_level")]
    pub level: Value,
    #[serde(default = "empty_object")]
    pub flags: Value,
    /// Reuse an existing capsule id (retries); a fresh id is generated otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capsule_id: Option<String>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: Value::String(task.into()),
            context: empty_object(),
            level: default_level(),
            flags: empty_object(),
            capsule_id: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_flags(mut self, flags: Value) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Value::String(level.into());
        self
    }

    pub fn with_capsule_id(mut self, id: impl Into<String>) -> Self {
        self.capsule_id = Some(id.into());
        self
    }

    pub fn input_hash(&self) -> String {
        stable_hash(&json!({
            "task": self.task,
            "context": self.context,
            "level": self.level,
            "flags": self.flags,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    /// Terminating decision, or an implicit PASS
    pub decision: Decision,
    /// Working context after MODIFY merges
    pub context: Value,
    /// Gates that ran, in order
    pub gates_run: Vec<String>,
    pub input_hash: String,
    pub elapsed_ms: u64,
}

impl PipelineOutcome {
    pub fn passed(&self) -> bool {
        self.decision.action == DecisionAction::Pass
    }
}

pub struct ReflexPipeline {
    gates: Vec<Arc<dyn Gate>>,
    runtime: Runtime,
    policy: Policy,
    manifest: Map<String, Value>,
    schema: Map<String, Value>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl ReflexPipeline {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            gates: Vec::new(),
            runtime,
            policy: Policy::default(),
            manifest: Map::new(),
            schema: Map::new(),
            audit: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn Gate>) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_manifest(mut self, manifest: Map<String, Value>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_schema(mut self, schema: Map<String, Value>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn gate_names(&self) -> Vec<&str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn run(&self, request: &TaskRequest) -> PipelineOutcome {
        let started = Instant::now();
        let input_hash = request.input_hash();
        let level = request.level.as_str().unwrap_or("unknown").to_string();

        let mut context = request.context.clone();
        let mut gates_run = Vec::with_capacity(self.gates.len());
        let mut terminal: Option<Decision> = None;
        // informative PASS label and last MODIFY reason, carried into the implicit PASS
        let mut pass_label: Option<String> = None;
        let mut modify_reason: Option<String> = None;

        for gate in &self.gates {
            let decision = {
                let input = GateInput {
                    task: &request.task,
                    context: &context,
                    level: &request.level,
                    flags: &request.flags,
                    manifest: &self.manifest,
                    policy: &self.policy,
                    schema: &self.schema,
                };
                match gate.evaluate(&input, &self.runtime) {
                    Ok(decision) => decision,
                    Err(err) => {
                        warn!(gate = gate.name(), error = %err, "gate failed, denying");
                        Decision::deny(level.as_str(), err.code())
                    }
                }
            };
            gates_run.push(gate.name().to_string());
            debug!(gate = gate.name(), action = %decision.action, label = %decision.audit.decision, "gate decided");

            match decision.action {
                DecisionAction::Deny | DecisionAction::Reply => {
                    terminal = Some(decision);
                    break;
                }
                DecisionAction::Modify => {
                    if let Some(delta) = decision.context_delta() {
                        merge_context(&mut context, delta);
                    }
                    modify_reason = decision.audit.reason;
                }
                DecisionAction::Pass => {
                    if decision.audit.decision != "pass" {
                        pass_label = Some(decision.audit.decision);
                    }
                }
            }
        }

        let decision = terminal.unwrap_or_else(|| {
            let mut implicit = Decision::pass_labeled(level.as_str(), pass_label.unwrap_or_else(|| "pass".to_string()));
            implicit.audit.reason = modify_reason;
            implicit
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.observe(&input_hash, &decision, elapsed_ms);

        PipelineOutcome {
            decision,
            context,
            gates_run,
            input_hash,
            elapsed_ms,
        }
    }

    fn observe(&self, input_hash: &str, decision: &Decision, elapsed_ms: u64) {
        let Some(audit) = &self.audit else {
            return;
        };
        let record = AuditRecord {
            input_hash: input_hash.to_string(),
            decision: decision.action,
            audit: decision.audit.clone(),
            elapsed_ms,
        };
        if let Err(err) = audit.append(&record) {
            warn!(error = %err, "audit append failed");
        }
    }
}

/// Shallow key overwrite; a non-object context is replaced by the delta
fn merge_context(context: &mut Value, delta: &Map<String, Value>) {
    if !context.is_object() {
        *context = Value::Object(Map::new());
    }
    if let Value::Object(map) = context {
        for (key, value) in delta {
            map.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_shallow_overwrite() {
        let mut context = json!({"a": {"x": 1}, "b": 2});
        let mut delta = Map::new();
        delta.insert("a".to_string(), json!({"y": 3}));
        delta.insert("c".to_string(), json!(true));
        merge_context(&mut context, &delta);
        assert_eq!(context, json!({"a": {"y": 3}, "b": 2, "c": true}));
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: TaskRequest = serde_json::from_value(json!({"task": "hello"})).unwrap();
        assert_eq!(request.level, json!("L0"));
        assert_eq!(request.context, json!({}));
        assert_eq!(request.flags, json!({}));
        assert!(request.capsule_id.is_none());
    }

    #[test]
    fn test_input_hash_depends_on_flags() {
        let a = TaskRequest::new("t");
        let b = TaskRequest::new("t").with_flags(json!({"stabilizer_seed": true}));
        assert_ne!(a.input_hash(), b.input_hash());
        assert_eq!(a.input_hash(), TaskRequest::new("t").input_hash());
    }
}
