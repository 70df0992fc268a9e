//! Reflex Kernel - gated task intake and Pass-Protocol capsule execution
//!
//! A task first runs through the [`ReflexPipeline`]: an ordered list of
//! gates that may pass, deny, reply or modify the working context. Tasks that
//! pass become [`Capsule`](reflex_types::Capsule)s executed by a
//! [`CapsuleEngine`]. When an engine blocks on a missing capability the
//! [`PassOrchestrator`] finds an assisting agent or provisions one, then
//! retries exactly once.
//!
//! [`ReflexKernel`] wires all of it from a [`KernelConfig`].

pub mod config;
pub mod engine;
pub mod kernel;
pub mod orchestrator;
pub mod pipeline;
pub mod protocol;
pub mod provision;
pub mod store;

pub use config::{ConfigError, KernelConfig};
pub use engine::{
    CapsuleEngine, EchoSkill, EngineDeps, EngineHealth, EngineMode, EngineSet, ExecutionContext, GovernanceRules,
    GovernedEngine, HealthStatus, LegacyEngine, LegacyModule, NativeEngine, Skill, SkillError,
};
pub use kernel::{KernelDeps, KernelOutcome, ReflexKernel};
pub use orchestrator::{OrchestratorConfig, PassOrchestrator, CANCELLED};
pub use pipeline::{PipelineOutcome, ReflexPipeline, TaskRequest};
pub use protocol::ProtocolParser;
pub use provision::{
    AgentCreatorManager, ProvisionRequest, ProvisionResponse, ProvisioningError, WorkspaceAgentCreator,
};
pub use store::{CapsuleLease, CapsuleRecord, CapsuleStore, StateChange, StoreError};
