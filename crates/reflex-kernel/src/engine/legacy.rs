//! Legacy engine - delegates to an external monolithic module

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use reflex_types::{Capsule, CapsuleResult, ReflexError};

use super::{CapsuleEngine, EngineHealth, EngineMode, ExecutionContext, HealthStatus};

/// The monolith the legacy engine fronts. Calls are blocking.
pub trait LegacyModule: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, goal: &str, payload: &Map<String, Value>) -> Result<Map<String, Value>, String>;
}

pub struct LegacyEngine {
    module: Option<Arc<dyn LegacyModule>>,
}

impl LegacyEngine {
    pub fn new(module: Option<Arc<dyn LegacyModule>>) -> Self {
        Self { module }
    }
}

#[async_trait]
impl CapsuleEngine for LegacyEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Legacy
    }

    async fn execute(&self, capsule: &Capsule, _ctx: &ExecutionContext) -> CapsuleResult {
        let Some(module) = self.module.clone() else {
            let err = ReflexError::EngineExecution("legacy module not configured".to_string());
            return CapsuleResult::failure(capsule.id.clone(), err.to_string());
        };

        let started = Instant::now();
        let goal = capsule.goal.clone();
        let payload = capsule.payload.clone();
        let joined = tokio::task::spawn_blocking(move || module.handle(&goal, &payload)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match joined {
            Ok(Ok(output)) => CapsuleResult::success(capsule.id.clone(), output),
            Ok(Err(message)) => {
                CapsuleResult::failure(capsule.id.clone(), ReflexError::EngineExecution(message).to_string())
            }
            Err(join_err) => {
                warn!(capsule_id = %capsule.id, error = %join_err, "legacy module panicked");
                CapsuleResult::failure(
                    capsule.id.clone(),
                    ReflexError::EngineExecution(format!("legacy module aborted: {}", join_err)).to_string(),
                )
            }
        };
        result
            .with_metric("engine", json!("legacy"))
            .with_metric("elapsed_ms", json!(elapsed_ms))
    }

    async fn health(&self, _ctx: &ExecutionContext) -> EngineHealth {
        match &self.module {
            Some(module) => EngineHealth::new(EngineMode::Legacy, HealthStatus::Ok)
                .with_detail("module", json!(module.name())),
            None => EngineHealth::new(EngineMode::Legacy, HealthStatus::Degraded)
                .with_detail("module", Value::Null)
                .with_detail("reason", json!("legacy module not configured")),
        }
    }

    fn supports_pass(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_types::CapsuleKind;

    struct Monolith;

    impl LegacyModule for Monolith {
        fn name(&self) -> &str {
            "monolith"
        }

        fn handle(&self, goal: &str, _payload: &Map<String, Value>) -> Result<Map<String, Value>, String> {
            if goal.contains("explode") {
                return Err("segment fault in module".to_string());
            }
            let mut out = Map::new();
            out.insert("answer".to_string(), json!(goal.len()));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_success_and_permanent_failure() {
        let engine = LegacyEngine::new(Some(Arc::new(Monolith)));
        let ctx = ExecutionContext::new("r1", "L1");

        let ok = engine.execute(&Capsule::builder(CapsuleKind::Task, "four").build(), &ctx).await;
        assert!(ok.ok);
        assert_eq!(ok.output.get("answer"), Some(&json!(4)));
        assert_eq!(ok.metrics.get("engine"), Some(&json!("legacy")));

        let failed = engine.execute(&Capsule::builder(CapsuleKind::Task, "explode").build(), &ctx).await;
        assert!(!failed.ok);
        assert!(!failed.blocked);
        assert!(failed.error.unwrap().contains("segment fault"));
    }

    #[tokio::test]
    async fn test_unconfigured_module_is_degraded() {
        let engine = LegacyEngine::new(None);
        let ctx = ExecutionContext::default();
        assert_eq!(engine.health(&ctx).await.status, HealthStatus::Degraded);
        let r = engine.execute(&Capsule::builder(CapsuleKind::Task, "x").build(), &ctx).await;
        assert!(!r.ok && !r.blocked);
    }
}
