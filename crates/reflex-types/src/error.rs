//! Error types for the reflex kernel
//!
//! Every error carries a stable [`ReflexError::code`] used in DENY reasons,
//! `CapsuleResult.error` strings and audit records.

use thiserror::Error;

use crate::state::CapsuleState;

/// Result type for reflex operations
pub type Result<T> = std::result::Result<T, ReflexError>;

/// Stable reason code for schema denials
pub const SCHEMA_DENY: &str = "schema_deny";
/// Stable reason code for policy denials
pub const DESTRUCTIVE_REQUEST: &str = "destructive_request";
/// Error string of a capsule whose need could not be resolved
pub const NEED_RESOLUTION_ERROR: &str = "NeedResolutionError";

#[derive(Debug, Clone, Error)]
pub enum ReflexError {
    // ========================================================================
    // Gate errors (encoded as DENY, never raised past the pipeline)
    // ========================================================================

    /// Malformed pipeline inputs
    #[error("Schema error: {0}")]
    Schema(String),

    /// A deny pattern matched
    #[error("Policy denied request: matched pattern '{pattern}'")]
    PolicyDeny { pattern: String },

    // ========================================================================
    // Execution errors (encoded in CapsuleResult / capsule state)
    // ========================================================================

    /// Backend-local permanent failure
    #[error("Engine execution error: {0}")]
    EngineExecution(String),

    /// No capable agent and provisioning failed
    #[error("Need resolution failed: {0}")]
    NeedResolution(String),

    /// Surfaced by the agent creator
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Non-fatal cache problem; the lookup proceeds as a miss
    #[error("Cache inconsistency: {0}")]
    CacheInconsistency(String),

    // ========================================================================
    // Contract violations (fatal to the caller)
    // ========================================================================

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid capsule transition {from} -> {to}")]
    InvalidTransition { from: CapsuleState, to: CapsuleState },
}

impl ReflexError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(_) => SCHEMA_DENY,
            Self::PolicyDeny { .. } => DESTRUCTIVE_REQUEST,
            Self::EngineExecution(_) => "EngineExecutionError",
            Self::NeedResolution(_) => NEED_RESOLUTION_ERROR,
            Self::Provisioning(_) => "ProvisioningError",
            Self::CacheInconsistency(_) => "CacheInconsistency",
            Self::Config(_) => "ConfigError",
            Self::InvalidTransition { .. } => "InvalidTransition",
        }
    }

    /// Whether the error must abort the caller instead of being encoded
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InvalidTransition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(ReflexError::Schema("task".into()).code(), "schema_deny");
        assert_eq!(
            ReflexError::PolicyDeny { pattern: "drop table".into() }.code(),
            "destructive_request"
        );
        assert_eq!(ReflexError::NeedResolution("none".into()).code(), "NeedResolutionError");
    }

    #[test]
    fn test_only_contract_violations_are_fatal() {
        assert!(ReflexError::Config("gates".into()).is_fatal());
        assert!(!ReflexError::EngineExecution("boom".into()).is_fatal());
        assert!(!ReflexError::CacheInconsistency("skew".into()).is_fatal());
    }
}
