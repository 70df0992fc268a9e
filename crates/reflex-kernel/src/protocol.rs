//! Need classification for blocked capsules without a structured request
//!
//! Free-text explanations are matched against a rule table. The
//! highest-confidence match wins; ties go to the rule listed first. Text that
//! matches nothing becomes an `UNKNOWN` need with confidence 0.

use std::sync::LazyLock;

use regex::Regex;
use reflex_types::{Need, NeedType};

use crate::engine::native::skill_capability;

struct NeedRule {
    pattern: Regex,
    need_type: NeedType,
    confidence: f64,
}

fn rule(pattern: &str, need_type: NeedType, confidence: f64) -> NeedRule {
    NeedRule {
        pattern: Regex::new(pattern).unwrap(),
        need_type,
        confidence,
    }
}

static BUILTIN_RULES: LazyLock<Vec<NeedRule>> = LazyLock::new(|| {
    vec![
        rule(
            r"(?i)\b(missing|unknown|no|lacks?|unsupported)\s+(skill|ability|handler)\b",
            NeedType::MissingSkill,
            0.9,
        ),
        rule(
            r"(?i)\b(don'?t|do not|cannot|can't)\s+know how to\b",
            NeedType::MissingSkill,
            0.6,
        ),
        rule(
            r"(?i)\b(missing|no|insufficient|lacks?)\s+(data|dataset|input|records?|documents?)\b",
            NeedType::MissingData,
            0.85,
        ),
        rule(r"(?i)\bnot found\b", NeedType::MissingData, 0.4),
        rule(
            r"(?i)(permission|unauthori[sz]ed|forbidden|access denied|not allowed)",
            NeedType::MissingPermission,
            0.85,
        ),
        rule(
            r"(?i)\b(requires?|needs?)\s+(an?\s+)?(external\s+)?(tool|api|service|binary)\b",
            NeedType::ExternalTool,
            0.8,
        ),
        rule(
            r"(?i)(out of memory|\boom\b|timed out|\bgpu\b|insufficient (compute|resources?))",
            NeedType::ComputeResource,
            0.75,
        ),
        rule(
            r"(?i)(ambiguous|unclear|clarif(y|ication)|which one)",
            NeedType::Clarification,
            0.7,
        ),
    ]
});

/// Explicit `capability: x.y` mention
static EXPLICIT_CAPABILITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcapability\s*[:=]\s*([a-z0-9_\-]+(?:\.[a-z0-9_\-*]+)*)").unwrap());

/// `missing skill translate` or `missing skill: translate`
static MISSING_SKILL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bmissing skill\s*:?\s*([a-z0-9_\-]+)").unwrap());

/// Confidence assigned when only an explicit capability identified the need
const NAMESPACE_CONFIDENCE: f64 = 0.5;

#[derive(Default)]
pub struct ProtocolParser {
    extra: Vec<NeedRule>,
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule evaluated after the built-in table
    pub fn with_rule(mut self, pattern: &str, need_type: NeedType, confidence: f64) -> Result<Self, regex::Error> {
        self.extra.push(NeedRule {
            pattern: Regex::new(pattern)?,
            need_type,
            confidence: confidence.clamp(0.0, 1.0),
        });
        Ok(self)
    }

    pub fn classify(&self, text: &str) -> Need {
        let description = text.trim();

        let mut best: Option<&NeedRule> = None;
        for rule in BUILTIN_RULES.iter().chain(self.extra.iter()) {
            if !rule.pattern.is_match(description) {
                continue;
            }
            if best.map_or(true, |b| rule.confidence > b.confidence) {
                best = Some(rule);
            }
        }

        let explicit = EXPLICIT_CAPABILITY
            .captures(description)
            .map(|c| c[1].to_lowercase());

        match (best, explicit) {
            (Some(rule), explicit) => {
                let capability = explicit.unwrap_or_else(|| derived_capability(rule.need_type, description));
                Need::new(rule.need_type, description, capability, rule.confidence)
            }
            (None, Some(capability)) => match namespace_type(&capability) {
                Some(need_type) => Need::new(need_type, description, capability, NAMESPACE_CONFIDENCE),
                None => Need::new(NeedType::Unknown, description, capability, 0.0),
            },
            (None, None) => Need::unknown(description),
        }
    }
}

fn derived_capability(need_type: NeedType, text: &str) -> String {
    if need_type == NeedType::MissingSkill {
        if let Some(caps) = MISSING_SKILL_NAME.captures(text) {
            return skill_capability(&caps[1]);
        }
    }
    need_type.default_capability().to_string()
}

fn namespace_type(capability: &str) -> Option<NeedType> {
    let namespace = capability.split('.').next().unwrap_or_default();
    [
        NeedType::MissingSkill,
        NeedType::MissingData,
        NeedType::MissingPermission,
        NeedType::ExternalTool,
        NeedType::ComputeResource,
        NeedType::Clarification,
    ]
    .into_iter()
    .find(|t| t.default_capability().split('.').next() == Some(namespace))
}
