//! Governed engine - rule checks in front of another engine

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use reflex_types::{Capsule, CapsuleKind, CapsuleResult, Priority};

use super::{CapsuleEngine, EngineHealth, EngineMode, ExecutionContext};

/// Error prefix of every rule violation
pub const GOVERNANCE_VIOLATION: &str = "GovernanceViolation";

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_forbidden() -> Vec<String> {
    vec!["unrestricted".to_string(), "bypass_governance".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceRules {
    /// Upper bound on the serialized payload
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_forbidden")]
    pub forbidden_constraints: Vec<String>,
    /// High priority capsules need `payload.approved == true`
    #[serde(default = "default_true")]
    pub require_approval_for_high: bool,
}

impl Default for GovernanceRules {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            forbidden_constraints: default_forbidden(),
            require_approval_for_high: true,
        }
    }
}

impl GovernanceRules {
    /// First violated rule, if any
    pub fn check(&self, capsule: &Capsule) -> Result<(), String> {
        if capsule.goal.trim().is_empty() {
            return Err("goal must not be empty".to_string());
        }
        if capsule.kind == CapsuleKind::Debug && !capsule.has_constraint("allow_debug") {
            return Err("debug capsules require the allow_debug constraint".to_string());
        }
        if self.require_approval_for_high
            && capsule.priority == Priority::High
            && capsule.payload.get("approved") != Some(&Value::Bool(true))
        {
            return Err("high priority capsules require approval".to_string());
        }
        if let Some(forbidden) = capsule
            .constraints
            .iter()
            .find(|c| self.forbidden_constraints.contains(c))
        {
            return Err(format!("constraint '{}' is forbidden", forbidden));
        }
        let size = serde_json::to_vec(&capsule.payload).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > self.max_payload_bytes {
            return Err(format!(
                "payload of {} bytes exceeds limit of {}",
                size, self.max_payload_bytes
            ));
        }
        Ok(())
    }
}

pub struct GovernedEngine {
    inner: Arc<dyn CapsuleEngine>,
    rules: GovernanceRules,
}

impl GovernedEngine {
    pub fn new(inner: Arc<dyn CapsuleEngine>, rules: GovernanceRules) -> Self {
        Self { inner, rules }
    }

    pub fn rules(&self) -> &GovernanceRules {
        &self.rules
    }
}

#[async_trait]
impl CapsuleEngine for GovernedEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Governed
    }

    async fn execute(&self, capsule: &Capsule, ctx: &ExecutionContext) -> CapsuleResult {
        if let Err(violation) = self.rules.check(capsule) {
            warn!(capsule_id = %capsule.id, %violation, "governance violation");
            return CapsuleResult::failure(capsule.id.clone(), format!("{}: {}", GOVERNANCE_VIOLATION, violation))
                .with_metric("engine", json!("governed"));
        }
        self.inner
            .execute(capsule, ctx)
            .await
            .with_metric("governed", json!(true))
    }

    async fn health(&self, ctx: &ExecutionContext) -> EngineHealth {
        let inner = self.inner.health(ctx).await;
        EngineHealth::new(EngineMode::Governed, inner.status)
            .with_detail("inner", json!(inner.mode.to_string()))
            .with_detail("inner_details", Value::Object(inner.details))
    }

    fn supports_pass(&self) -> bool {
        self.inner.supports_pass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EchoSkill, NativeEngine};
    use reflex_types::CapsuleKind;

    fn governed() -> GovernedEngine {
        let native = NativeEngine::new();
        native.register_skill(Arc::new(EchoSkill));
        GovernedEngine::new(Arc::new(native), GovernanceRules::default())
    }

    fn echo(kind: CapsuleKind) -> reflex_types::CapsuleBuilder {
        Capsule::builder(kind, "echo")
    }

    #[tokio::test]
    async fn test_compliant_capsule_reaches_inner() {
        let engine = governed();
        let r = engine.execute(&echo(CapsuleKind::Task).build(), &ExecutionContext::default()).await;
        assert!(r.ok);
        assert_eq!(r.metrics["governed"], json!(true));
        assert!(engine.supports_pass());
    }

    #[tokio::test]
    async fn test_violations() {
        let engine = governed();
        let ctx = ExecutionContext::default();
        let cases = vec![
            Capsule::builder(CapsuleKind::Task, "   ").build(),
            echo(CapsuleKind::Debug).build(),
            echo(CapsuleKind::Task).priority(Priority::High).build(),
            echo(CapsuleKind::Task).constraints(vec!["bypass_governance".into()]).build(),
            echo(CapsuleKind::Task)
                .payload_entry("blob", json!("x".repeat(70 * 1024)))
                .build(),
        ];
        for capsule in cases {
            let r = engine.execute(&capsule, &ctx).await;
            assert!(!r.ok && !r.blocked);
            assert!(r.error.unwrap().starts_with("GovernanceViolation: "));
        }
    }

    #[tokio::test]
    async fn test_approved_high_priority_and_debug_allowed() {
        let engine = governed();
        let ctx = ExecutionContext::default();
        let high = echo(CapsuleKind::Task)
            .priority(Priority::High)
            .payload_entry("approved", json!(true))
            .build();
        assert!(engine.execute(&high, &ctx).await.ok);

        let debug = echo(CapsuleKind::Debug).constraints(vec!["allow_debug".into()]).build();
        assert!(engine.execute(&debug, &ctx).await.ok);
    }
}
