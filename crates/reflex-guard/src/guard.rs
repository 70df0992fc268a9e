//! Guard gate - input schema and destructive-request screening
//!
//! The guard treats every task as untrusted. It rejects malformed inputs
//! (`schema_deny`) and tasks containing any policy deny pattern
//! (`destructive_request`). Matching is case-insensitive substring
//! containment on the lower-cased task.

use serde_json::Value;
use tracing::debug;

use reflex_types::Decision;

use crate::gate::{Gate, GateError, GateInput, Result, Runtime};

#[derive(Debug, Default, Clone)]
pub struct GuardGate;

impl GuardGate {
    pub fn new() -> Self {
        Self
    }

    /// Shape checks plus `schema.required_context`
    fn check_schema(&self, input: &GateInput<'_>) -> Result<()> {
        if !input.task.is_string() {
            return Err(schema("task must be a string"));
        }
        let Some(context) = input.context.as_object() else {
            return Err(schema("context must be a mapping"));
        };
        if !input.flags.is_object() {
            return Err(schema("flags must be a mapping"));
        }
        if !input.level.is_string() {
            return Err(schema("level must be a string"));
        }

        if let Some(required) = input.schema.get("required_context").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !context.contains_key(key) {
                    return Err(schema(&format!("missing context key '{}'", key)));
                }
            }
        }
        Ok(())
    }

    fn check_deny_patterns(&self, input: &GateInput<'_>) -> Result<()> {
        let lower = input.task_str().to_lowercase();
        for pattern in &input.policy.deny_patterns {
            let needle = pattern.to_lowercase();
            if !needle.is_empty() && lower.contains(&needle) {
                return Err(GateError::PolicyDeny {
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }
}

fn schema(message: &str) -> GateError {
    GateError::Schema {
        message: message.to_string(),
    }
}

impl Gate for GuardGate {
    fn name(&self) -> &str {
        "guard"
    }

    fn evaluate(&self, input: &GateInput<'_>, _runtime: &Runtime) -> Result<Decision> {
        let level = input.level_str();
        let checked = self
            .check_schema(input)
            .and_then(|_| self.check_deny_patterns(input));

        match checked {
            Ok(()) => Ok(Decision::pass(level)),
            Err(err) => {
                debug!(gate = "guard", error = %err, "task denied");
                Ok(Decision::deny(level, err.code()))
            }
        }
    }
}
