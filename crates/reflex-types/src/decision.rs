//! Gate decisions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Pass,
    Deny,
    Modify,
    Reply,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Deny => write!(f, "DENY"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Reply => write!(f, "REPLY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionAudit {
    pub level: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What a gate wants done with the task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub audit: DecisionAudit,
}

impl Decision {
    pub fn pass(level: impl Into<String>) -> Self {
        Self::pass_labeled(level, "pass")
    }

    pub fn pass_labeled(level: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Pass,
            payload: Map::new(),
            audit: DecisionAudit {
                level: level.into(),
                decision: label.into(),
                reason: None,
            },
        }
    }

    pub fn deny(level: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut payload = Map::new();
        payload.insert("reason".to_string(), Value::String(reason.clone()));
        Self {
            action: DecisionAction::Deny,
            payload,
            audit: DecisionAudit {
                level: level.into(),
                decision: "deny".to_string(),
                reason: Some(reason),
            },
        }
    }

    pub fn modify(level: impl Into<String>, context_delta: Map<String, Value>, reason: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("context_delta".to_string(), Value::Object(context_delta));
        Self {
            action: DecisionAction::Modify,
            payload,
            audit: DecisionAudit {
                level: level.into(),
                decision: "modify".to_string(),
                reason: Some(reason.into()),
            },
        }
    }

    pub fn reply(level: impl Into<String>, payload: Map<String, Value>, label: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Reply,
            payload,
            audit: DecisionAudit {
                level: level.into(),
                decision: label.into(),
                reason: None,
            },
        }
    }

    /// DENY and REPLY end the pipeline
    pub fn is_terminal(&self) -> bool {
        matches!(self.action, DecisionAction::Deny | DecisionAction::Reply)
    }

    pub fn context_delta(&self) -> Option<&Map<String, Value>> {
        self.payload.get("context_delta").and_then(Value::as_object)
    }

    pub fn reason(&self) -> Option<&str> {
        self.audit.reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deny_carries_reason_in_payload_and_audit() {
        let d = Decision::deny("L1", "destructive_request");
        assert!(d.is_terminal());
        assert_eq!(d.payload.get("reason"), Some(&json!("destructive_request")));
        assert_eq!(d.reason(), Some("destructive_request"));
    }

    #[test]
    fn test_modify_exposes_context_delta() {
        let mut delta = Map::new();
        delta.insert("source_filter".to_string(), json!("pubmed"));
        let d = Decision::modify("L1", delta.clone(), "modified_query");
        assert!(!d.is_terminal());
        assert_eq!(d.context_delta(), Some(&delta));
    }

    #[test]
    fn test_action_wire_format() {
        let d = Decision::pass("L0");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["action"], "PASS");
        assert_eq!(v["audit"]["decision"], "pass");
        assert!(v["audit"].get("reason").is_none());
    }
}
