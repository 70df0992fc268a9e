//! ReflexKernel - pipeline in front, orchestrated capsule execution behind

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use reflex_audit::{AuditLog, JsonlAuditLog};
use reflex_capabilities::{CapabilityRegistry, InMemoryCapabilityRegistry};
use reflex_guard::{BootGate, DomainFilterGate, Gate, GuardGate, Runtime, StabilizerGate};
use reflex_types::{Capsule, CapsuleId, CapsuleKind, CapsuleResult, CapsuleState, Decision, DecisionAction, Priority};

use crate::config::{self, ConfigError, KernelConfig};
use crate::engine::{
    CapsuleEngine, EngineDeps, EngineHealth, EngineMode, EngineSet, ExecutionContext, LegacyModule, Skill,
};
use crate::orchestrator::{OrchestratorConfig, PassOrchestrator};
use crate::pipeline::{PipelineOutcome, ReflexPipeline, TaskRequest};
use crate::provision::{AgentCreatorManager, WorkspaceAgentCreator};
use crate::store::CapsuleStore;

/// Collaborators the configuration cannot describe
#[derive(Clone, Default)]
pub struct KernelDeps {
    pub legacy: Option<Arc<dyn LegacyModule>>,
    pub skills: Vec<Arc<dyn Skill>>,
    pub registry: Option<Arc<dyn CapabilityRegistry>>,
    pub creator: Option<Arc<dyn AgentCreatorManager>>,
    /// Overrides the configured audit log
    pub audit: Option<Arc<dyn AuditLog>>,
    pub runtime: Option<Runtime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KernelOutcome {
    Denied {
        reason: String,
        decision: Decision,
    },
    Replied {
        payload: Map<String, Value>,
        decision: Decision,
    },
    Executed {
        result: CapsuleResult,
        state: Option<CapsuleState>,
    },
    /// The worker running this request died
    Aborted { error: String },
}

impl KernelOutcome {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    pub fn result(&self) -> Option<&CapsuleResult> {
        match self {
            Self::Executed { result, .. } => Some(result),
            _ => None,
        }
    }
}

pub struct ReflexKernel {
    config: KernelConfig,
    /// Shared with the blocking pool, where gates and audit writes run
    pipeline: Arc<ReflexPipeline>,
    orchestrator: PassOrchestrator,
    engine: Arc<dyn CapsuleEngine>,
    registry: Arc<dyn CapabilityRegistry>,
}

impl ReflexKernel {
    pub fn from_config(config: KernelConfig, deps: KernelDeps) -> config::Result<Self> {
        config.validate()?;

        let mut pipeline = ReflexPipeline::new(deps.runtime.unwrap_or_default())
            .with_policy(config.policy.clone())
            .with_schema(config.schema.clone())
            .with_manifest(config.manifest.clone());
        for name in &config.gates {
            pipeline = pipeline.with_gate(build_gate(name, &config)?);
        }
        let audit = deps
            .audit
            .or_else(|| config.audit_log.as_ref().map(|p| Arc::new(JsonlAuditLog::new(p)) as Arc<dyn AuditLog>));
        if let Some(audit) = audit {
            pipeline = pipeline.with_audit(audit);
        }

        let engines = EngineSet::build(EngineDeps {
            legacy: deps.legacy,
            skills: deps.skills,
            governance: config.governance.clone(),
            governed_inner: config.governed_inner,
        });
        let engine = engines.by_name(&config.engine_mode);

        let registry = deps
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryCapabilityRegistry::new()));
        let creator = deps.creator.unwrap_or_else(|| {
            Arc::new(
                WorkspaceAgentCreator::new(config.workspace_root.clone(), registry.clone())
                    .with_validity(config.provision_validity()),
            )
        });

        let orchestrator = PassOrchestrator::new(engines, registry.clone(), creator, Arc::new(CapsuleStore::new()))
            .with_config(OrchestratorConfig {
                escalation_timeout: config.escalation_timeout(),
                engine_timeout: config.engine_timeout(),
                retain_terminal: config.retain_terminal_records,
            });

        info!(
            engine = %engine.mode(),
            gates = ?config.gates,
            "reflex kernel ready"
        );
        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
            orchestrator,
            engine,
            registry,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &ReflexPipeline {
        &self.pipeline
    }

    pub fn orchestrator(&self) -> &PassOrchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<dyn CapabilityRegistry> {
        &self.registry
    }

    pub fn engine_mode(&self) -> EngineMode {
        self.engine.mode()
    }

    pub async fn handle(&self, request: TaskRequest) -> KernelOutcome {
        let outcome = match self.gate(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "pipeline worker aborted");
                return KernelOutcome::Aborted { error: err.to_string() };
            }
        };
        match outcome.decision.action {
            DecisionAction::Deny => {
                let reason = outcome.decision.reason().unwrap_or("denied").to_string();
                info!(input_hash = %outcome.input_hash, %reason, "task denied");
                KernelOutcome::Denied {
                    reason,
                    decision: outcome.decision,
                }
            }
            DecisionAction::Reply => KernelOutcome::Replied {
                payload: outcome.decision.payload.clone(),
                decision: outcome.decision,
            },
            // MODIFY never terminates the pipeline
            DecisionAction::Pass | DecisionAction::Modify => self.execute(&request, outcome).await,
        }
    }

    /// Run independent requests concurrently; outcomes keep input order
    pub async fn handle_batch(self: &Arc<Self>, requests: Vec<TaskRequest>) -> Vec<KernelOutcome> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let kernel = Arc::clone(self);
                tokio::spawn(async move { kernel.handle(request).await })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|err| {
                    warn!(error = %err, "kernel worker aborted");
                    KernelOutcome::Aborted { error: err.to_string() }
                })
            })
            .collect()
    }

    /// Gates take locks and the audit log writes files, so the pipeline runs
    /// on the blocking pool rather than on an async worker
    async fn gate(&self, request: &TaskRequest) -> Result<PipelineOutcome, tokio::task::JoinError> {
        let pipeline = Arc::clone(&self.pipeline);
        let request = request.clone();
        tokio::task::spawn_blocking(move || pipeline.run(&request)).await
    }

    pub async fn health(&self) -> EngineHealth {
        let ctx = ExecutionContext::new("health", "L0");
        self.engine
            .health(&ctx)
            .await
            .with_detail("gates", serde_json::json!(self.pipeline.gate_names()))
    }

    async fn execute(&self, request: &TaskRequest, outcome: PipelineOutcome) -> KernelOutcome {
        let capsule = build_capsule(request, &outcome.context);
        let id = capsule.id.clone();
        let level = request.level.as_str().unwrap_or("unknown");
        let ctx = ExecutionContext::new(outcome.input_hash, level).with_context(capsule.payload.clone());

        let (result, state) = self.orchestrator.run_with_state(capsule, self.engine.clone(), &ctx).await;
        KernelOutcome::Executed { result, state }
    }
}

fn build_gate(name: &str, config: &KernelConfig) -> config::Result<Arc<dyn Gate>> {
    let gate: Arc<dyn Gate> = match name {
        "boot" => Arc::new(BootGate::new()),
        "guard" => Arc::new(GuardGate::new()),
        "stabilizer" => Arc::new(StabilizerGate::new()),
        "domain_filter" => Arc::new(DomainFilterGate::new(config.domain_filter.clone())),
        other => return Err(ConfigError::UnknownGate(other.to_string())),
    };
    Ok(gate)
}

/// Capsule for a task that passed the pipeline
fn build_capsule(request: &TaskRequest, context: &Value) -> Capsule {
    let payload = context.as_object().cloned().unwrap_or_default();
    let goal = match &request.task {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let kind = payload
        .get("capsule_kind")
        .and_then(Value::as_str)
        .and_then(CapsuleKind::parse)
        .unwrap_or_default();
    let flags = request.flags.as_object();
    let priority = flags
        .and_then(|f| f.get("priority"))
        .and_then(Value::as_str)
        .and_then(Priority::parse)
        .unwrap_or_default();
    let constraints = flags
        .and_then(|f| f.get("constraints"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    let id = request
        .capsule_id
        .as_deref()
        .map(CapsuleId::from)
        .unwrap_or_default();

    Capsule::builder(kind, goal)
        .id(id)
        .payload(payload)
        .constraints(constraints)
        .priority(priority)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capsule_from_request() {
        let request = TaskRequest::new("fold the protein")
            .with_flags(json!({"priority": "high", "constraints": ["no_network", 7]}))
            .with_capsule_id("cap-fixed");
        let capsule = build_capsule(&request, &json!({"capsule_kind": "teaching", "query": "q"}));

        assert_eq!(capsule.id.as_str(), "cap-fixed");
        assert_eq!(capsule.kind, CapsuleKind::Teaching);
        assert_eq!(capsule.priority, Priority::High);
        assert_eq!(capsule.constraints, vec!["no_network"]);
        assert_eq!(capsule.goal, "fold the protein");
        assert_eq!(capsule.payload["query"], json!("q"));
    }

    #[test]
    fn test_capsule_defaults() {
        let capsule = build_capsule(&TaskRequest::new("x"), &json!({"capsule_kind": "bogus"}));
        assert_eq!(capsule.kind, CapsuleKind::Task);
        assert_eq!(capsule.priority, Priority::Normal);
        assert!(capsule.id.as_str().starts_with("cap_"));
    }

    #[test]
    fn test_unknown_gate_fails_construction() {
        let config = KernelConfig {
            gates: vec!["boot".into(), "oracle".into()],
            ..KernelConfig::default()
        };
        let err = ReflexKernel::from_config(config, KernelDeps::default()).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownGate(_)));
    }
}
