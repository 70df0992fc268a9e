//! Pass-Protocol orchestrator
//!
//! Drives one capsule attempt through the lifecycle:
//!
//! 1. take the capsule's lease and enter `RUNNING`
//! 2. execute; success completes, a local failure fails
//! 3. a blocked result raises a need, either attached by the engine or
//!    classified from its explanation
//! 4. a registered agent assists through a derived sub-capsule (`ASSISTED`),
//!    otherwise an agent is provisioned (`ESCALATED`)
//! 5. exactly one retry with the help recorded in the capsule trace
//!
//! Blocking a second time fails the capsule with `NeedResolutionError`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use reflex_capabilities::{AgentDescriptor, CapabilityRegistry};
use reflex_types::{
    Capsule, CapsuleKind, CapsuleResult, CapsuleState, Need, ReflexError, NEED_RESOLUTION_ERROR,
};

use crate::engine::native::trace_keys;
use crate::engine::{CapsuleEngine, EngineSet, ExecutionContext};
use crate::protocol::ProtocolParser;
use crate::provision::{AgentCreatorManager, ProvisionRequest};
use crate::store::{CapsuleLease, CapsuleStore, StoreError};

/// Error string of a capsule dropped before it started
pub const CANCELLED: &str = "Cancelled";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Bound on one assist or provisioning step
    pub escalation_timeout: Duration,
    /// Bound on a single engine call
    pub engine_timeout: Option<Duration>,
    /// Finished capsule records kept before the store is pruned
    pub retain_terminal: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            escalation_timeout: Duration::from_secs(30),
            engine_timeout: None,
            retain_terminal: 1024,
        }
    }
}

pub struct PassOrchestrator {
    engines: EngineSet,
    registry: Arc<dyn CapabilityRegistry>,
    creator: Arc<dyn AgentCreatorManager>,
    store: Arc<CapsuleStore>,
    parser: ProtocolParser,
    config: OrchestratorConfig,
}

impl PassOrchestrator {
    pub fn new(
        engines: EngineSet,
        registry: Arc<dyn CapabilityRegistry>,
        creator: Arc<dyn AgentCreatorManager>,
        store: Arc<CapsuleStore>,
    ) -> Self {
        Self {
            engines,
            registry,
            creator,
            store,
            parser: ProtocolParser::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_parser(mut self, parser: ProtocolParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn store(&self) -> &Arc<CapsuleStore> {
        &self.store
    }

    pub fn engines(&self) -> &EngineSet {
        &self.engines
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one attempt, waiting for any attempt already active on the id
    pub async fn run(&self, capsule: Capsule, engine: Arc<dyn CapsuleEngine>, ctx: &ExecutionContext) -> CapsuleResult {
        self.run_with_state(capsule, engine, ctx).await.0
    }

    /// Like [`run`](Self::run), also returning the state the attempt left
    /// behind, read before the lease is released
    pub async fn run_with_state(
        &self,
        capsule: Capsule,
        engine: Arc<dyn CapsuleEngine>,
        ctx: &ExecutionContext,
    ) -> (CapsuleResult, Option<CapsuleState>) {
        let lease = self.store.acquire(&capsule.id).await;
        self.drive(lease, capsule, engine, ctx).await
    }

    /// Like [`run`](Self::run), but gives up while still waiting for the
    /// lease once `cancel` turns true. A started attempt always finishes.
    pub async fn run_cancellable(
        &self,
        capsule: Capsule,
        engine: Arc<dyn CapsuleEngine>,
        ctx: &ExecutionContext,
        mut cancel: watch::Receiver<bool>,
    ) -> CapsuleResult {
        if *cancel.borrow() {
            info!(capsule_id = %capsule.id, "capsule cancelled before start");
            return CapsuleResult::failure(capsule.id.clone(), CANCELLED);
        }

        let lease = tokio::select! {
            biased;
            lease = self.store.acquire(&capsule.id) => lease,
            _ = cancelled(&mut cancel) => {
                info!(capsule_id = %capsule.id, "capsule cancelled while waiting for its lease");
                return CapsuleResult::failure(capsule.id.clone(), CANCELLED);
            }
        };
        self.drive(lease, capsule, engine, ctx).await.0
    }

    async fn drive(
        &self,
        lease: CapsuleLease,
        capsule: Capsule,
        engine: Arc<dyn CapsuleEngine>,
        ctx: &ExecutionContext,
    ) -> (CapsuleResult, Option<CapsuleState>) {
        let started = Instant::now();
        let id = capsule.id.clone();

        let result = match self.attempt(&lease, capsule, engine, ctx).await {
            Ok(result) => result,
            Err(err) => {
                error!(capsule_id = %id, error = %err, "capsule lifecycle violated");
                if let Err(close) = self.store.transition(&lease, CapsuleState::Failed) {
                    debug!(capsule_id = %id, error = %close, "could not close capsule");
                }
                CapsuleResult::failure(id.clone(), ReflexError::from(err).to_string())
            }
        };
        let result = result.with_metric("total_ms", json!(started.elapsed().as_millis() as u64));

        if let Err(err) = self.store.record_result(&lease, &result) {
            warn!(capsule_id = %id, error = %err, "could not record capsule result");
        }
        let state = self.store.state(&id);
        lease.release();

        if self.store.len() > self.config.retain_terminal {
            let pruned = self.store.prune_terminal();
            debug!(pruned, remaining = self.store.len(), "pruned finished capsules");
        }
        (result, state)
    }

    async fn attempt(
        &self,
        lease: &CapsuleLease,
        capsule: Capsule,
        engine: Arc<dyn CapsuleEngine>,
        ctx: &ExecutionContext,
    ) -> Result<CapsuleResult, StoreError> {
        let attempt = self.store.begin_attempt(lease)?;
        info!(capsule_id = %capsule.id, engine = %engine.mode(), attempt, "capsule running");

        let first = self.execute(lease, &engine, &capsule, ctx).await.with_metric("attempt", json!(attempt));
        if first.ok {
            self.store.transition(lease, CapsuleState::Completed)?;
            info!(capsule_id = %capsule.id, "capsule completed");
            return Ok(first.with_metric("retried", json!(false)));
        }
        if !first.blocked {
            self.store.transition(lease, CapsuleState::Failed)?;
            warn!(capsule_id = %capsule.id, error = ?first.error, "capsule failed");
            return Ok(first.with_metric("retried", json!(false)));
        }
        if !engine.supports_pass() {
            self.store.transition(lease, CapsuleState::Failed)?;
            error!(capsule_id = %capsule.id, engine = %engine.mode(), "blocked result from an engine without pass support");
            let err = ReflexError::EngineExecution(format!("engine {} cannot block", engine.mode()));
            return Ok(CapsuleResult::failure(capsule.id.clone(), err.to_string())
                .with_metric("attempt", json!(attempt)));
        }

        self.store.transition(lease, CapsuleState::Blocked)?;
        let need = first
            .pass_request
            .clone()
            .unwrap_or_else(|| self.parser.classify(first.error.as_deref().unwrap_or_default()));
        info!(
            capsule_id = %capsule.id,
            need_type = %need.need_type,
            capability = %need.requested_capability,
            confidence = need.confidence,
            "capsule blocked"
        );

        let Some(revised) = self.resolve(lease, &capsule, &need, ctx).await? else {
            self.store.transition(lease, CapsuleState::Failed)?;
            return Ok(unresolved(&capsule, &need, attempt));
        };

        let retry = self
            .execute(lease, &engine, &revised, &ctx.next_attempt())
            .await
            .with_metric("attempt", json!(attempt))
            .with_metric("retried", json!(true))
            .with_metric("need_type", json!(need.need_type))
            .with_metric("revision", json!(revised.revision));

        if retry.ok {
            self.store.transition(lease, CapsuleState::Completed)?;
            info!(capsule_id = %capsule.id, "capsule completed after escalation");
            return Ok(retry);
        }
        self.store.transition(lease, CapsuleState::Failed)?;
        if retry.blocked {
            warn!(capsule_id = %capsule.id, "capsule blocked again after escalation");
            return Ok(unresolved(&revised, &need, attempt).with_metric("retried", json!(true)));
        }
        warn!(capsule_id = %capsule.id, error = ?retry.error, "capsule failed on retry");
        Ok(retry)
    }

    /// Revised capsule carrying the help, or `None` when the need stays open.
    /// On `Some` the capsule is back in `RUNNING`.
    async fn resolve(
        &self,
        lease: &CapsuleLease,
        capsule: &Capsule,
        need: &Need,
        ctx: &ExecutionContext,
    ) -> Result<Option<Capsule>, StoreError> {
        if let Some(candidate) = self.registry.best(&need.requested_capability) {
            self.store.transition(lease, CapsuleState::Assisted)?;
            info!(capsule_id = %capsule.id, agent_id = %candidate.agent_id, "delegating to assisting agent");

            return match self.assist(lease, capsule, need, &candidate, ctx).await {
                Ok(output) => {
                    let revised = capsule.revise([
                        (trace_keys::ASSIST_CAPABILITY.to_string(), json!(need.requested_capability)),
                        (trace_keys::ASSIST_AGENT_ID.to_string(), json!(candidate.agent_id)),
                        (trace_keys::ASSIST_OUTPUT.to_string(), Value::Object(output)),
                    ]);
                    self.store.transition(lease, CapsuleState::Running)?;
                    Ok(Some(revised))
                }
                Err(reason) => {
                    warn!(capsule_id = %capsule.id, agent_id = %candidate.agent_id, %reason, "assist failed");
                    Ok(None)
                }
            };
        }

        if need.is_unknown() {
            warn!(capsule_id = %capsule.id, "unclassified need and no capable agent");
            return Ok(None);
        }

        self.store.transition(lease, CapsuleState::Escalated)?;
        let request = ProvisionRequest::new(need.requested_capability.clone())
            .with_constraints(capsule.constraints.clone())
            .with_context(ctx.context.clone());

        match timeout(self.config.escalation_timeout, self.creator.provision(&request)).await {
            Ok(Ok(response)) => {
                let revised = capsule.revise([
                    (trace_keys::PROVISION_CAPABILITY.to_string(), json!(response.capability)),
                    (trace_keys::PROVISION_AGENT_ID.to_string(), json!(response.agent_id)),
                    (
                        trace_keys::PROVISION_WORKSPACE.to_string(),
                        json!(response.workspace_path.to_string_lossy()),
                    ),
                ]);
                self.store.transition(lease, CapsuleState::Running)?;
                Ok(Some(revised))
            }
            Ok(Err(err)) => {
                warn!(capsule_id = %capsule.id, error = %err, "provisioning failed");
                Ok(None)
            }
            Err(_) => {
                warn!(
                    capsule_id = %capsule.id,
                    timeout_ms = self.config.escalation_timeout.as_millis() as u64,
                    "provisioning timed out"
                );
                Ok(None)
            }
        }
    }

    /// Run a derived skill capsule on the candidate's engine
    async fn assist(
        &self,
        lease: &CapsuleLease,
        capsule: &Capsule,
        need: &Need,
        candidate: &AgentDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, String> {
        let engine = self.engines.by_name(&candidate.engine);
        let capability = need.requested_capability.as_str();
        let skill = capability.strip_prefix("skill.").unwrap_or(capability);

        let mut builder = capsule
            .derive(CapsuleKind::Skill, capsule.goal.clone())
            .payload_entry("skill", json!(skill))
            .payload_entry("need", json!(need))
            .payload_entry("parent_payload", Value::Object(capsule.payload.clone()));
        if let Some(approved) = capsule.payload.get("approved") {
            builder = builder.payload_entry("approved", approved.clone());
        }
        if let Some(workspace) = &candidate.workspace {
            builder = builder
                .trace_entry(trace_keys::PROVISION_CAPABILITY, json!(capability))
                .trace_entry(trace_keys::PROVISION_AGENT_ID, json!(candidate.agent_id))
                .trace_entry(trace_keys::PROVISION_WORKSPACE, json!(workspace));
        }
        let sub = builder.build();
        let sub_ctx = ctx.for_agent(candidate.agent_id.clone());
        debug!(parent = %capsule.id, sub_capsule = %sub.id, engine = %engine.mode(), "assist sub-capsule");

        let limit = self
            .config
            .engine_timeout
            .map_or(self.config.escalation_timeout, |engine| engine.min(self.config.escalation_timeout));
        match self.bounded(lease, &engine, &sub, &sub_ctx, limit).await {
            None => Err(format!("assist timed out after {}ms", limit.as_millis())),
            Some(result) if result.ok => Ok(result.output),
            Some(result) => Err(result.error.unwrap_or_else(|| "assist failed".to_string())),
        }
    }

    async fn execute(
        &self,
        lease: &CapsuleLease,
        engine: &Arc<dyn CapsuleEngine>,
        capsule: &Capsule,
        ctx: &ExecutionContext,
    ) -> CapsuleResult {
        let Some(limit) = self.config.engine_timeout else {
            return engine.execute(capsule, ctx).await;
        };
        self.bounded(lease, engine, capsule, ctx, limit).await.unwrap_or_else(|| {
            let err = ReflexError::EngineExecution(format!("engine timed out after {}ms", limit.as_millis()));
            CapsuleResult::failure(capsule.id.clone(), err.to_string())
        })
    }

    /// Engine call bounded by `limit`; `None` when it expired. An expired call
    /// keeps running on its own task and the lease stays held until it returns.
    async fn bounded(
        &self,
        lease: &CapsuleLease,
        engine: &Arc<dyn CapsuleEngine>,
        capsule: &Capsule,
        ctx: &ExecutionContext,
        limit: Duration,
    ) -> Option<CapsuleResult> {
        let mut call = {
            let engine = Arc::clone(engine);
            let capsule = capsule.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { engine.execute(&capsule, &ctx).await })
        };

        match timeout(limit, &mut call).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(join_err)) => {
                warn!(capsule_id = %capsule.id, error = %join_err, "engine call aborted");
                let err = ReflexError::EngineExecution(format!("engine call aborted: {}", join_err));
                Some(CapsuleResult::failure(capsule.id.clone(), err.to_string()))
            }
            Err(_) => {
                warn!(capsule_id = %capsule.id, timeout_ms = limit.as_millis() as u64, "engine call timed out");
                lease.hold_for(call);
                None
            }
        }
    }
}

fn unresolved(capsule: &Capsule, need: &Need, attempt: u32) -> CapsuleResult {
    CapsuleResult::failure(capsule.id.clone(), NEED_RESOLUTION_ERROR)
        .with_metric("attempt", json!(attempt))
        .with_metric("need", json!(need))
}

/// Resolves once the flag turns true; never if the sender goes away first
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
