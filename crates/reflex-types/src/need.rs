//! Capability needs raised by blocked capsules

use serde::{Deserialize, Serialize};

/// Closed set of need categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NeedType {
    MissingSkill,
    MissingData,
    MissingPermission,
    ExternalTool,
    ComputeResource,
    Clarification,
    Unknown,
}

impl NeedType {
    /// Default capability tag requested for this category
    pub fn default_capability(&self) -> &'static str {
        match self {
            Self::MissingSkill => "skill.generic",
            Self::MissingData => "data.retrieval",
            Self::MissingPermission => "authority.grant",
            Self::ExternalTool => "tool.external",
            Self::ComputeResource => "compute.capacity",
            Self::Clarification => "dialogue.clarify",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for NeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingSkill => "MISSING_SKILL",
            Self::MissingData => "MISSING_DATA",
            Self::MissingPermission => "MISSING_PERMISSION",
            Self::ExternalTool => "EXTERNAL_TOOL",
            Self::ComputeResource => "COMPUTE_RESOURCE",
            Self::Clarification => "CLARIFICATION",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A structured description of a capability gap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Need {
    #[serde(rename = "type")]
    pub need_type: NeedType,
    pub description: String,
    pub requested_capability: String,
    /// Classifier confidence in `[0.0, 1.0]`
    pub confidence: f64,
}

impl Need {
    pub fn new(
        need_type: NeedType,
        description: impl Into<String>,
        requested_capability: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            need_type,
            description: description.into(),
            requested_capability: requested_capability.into(),
            confidence,
        }
    }

    /// Unclassifiable need
    pub fn unknown(description: impl Into<String>) -> Self {
        Self::new(NeedType::Unknown, description, NeedType::Unknown.default_capability(), 0.0)
    }

    pub fn is_unknown(&self) -> bool {
        self.need_type == NeedType::Unknown
    }
}
