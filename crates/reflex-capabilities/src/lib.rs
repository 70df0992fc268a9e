//! Reflex Capabilities - Registry of agents able to resolve needs
//!
//! Agents declare capability tags. A blocked capsule's need is matched
//! against those tags to find an assisting agent.
//!
//! # Matching
//!
//! A tag satisfies a requested capability when it is:
//! - identical to it (most specific),
//! - a namespace wildcard such as `skill.*` covering `skill.translate`, or
//! - the catch-all `*` (least specific).
//!
//! Candidates are ordered by specificity, then declared confidence, then
//! registration order (earliest first), so lookups are deterministic.

use std::collections::HashMap;

use parking_lot::RwLock;
use reflex_types::AgentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(AgentId),
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("Agent {0} declares no capability tags")]
    NoTags(AgentId),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

fn default_engine() -> String {
    "native".to_string()
}

/// What an agent offers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    /// Capability tags, e.g. `skill.translate` or `data.*`
    pub tags: Vec<String>,
    /// Declared confidence in `[0.0, 1.0]`
    pub confidence: f64,
    /// Engine mode the agent's work runs on
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub description: String,
    /// Workspace of a provisioned agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<AgentId>, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            confidence: 0.5,
            engine: default_engine(),
            description: String::new(),
            workspace: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Best specificity of any tag against `capability`; `None` if no tag matches
    pub fn specificity(&self, capability: &str) -> Option<u8> {
        self.tags.iter().filter_map(|t| tag_specificity(t, capability)).max()
    }
}

fn tag_specificity(tag: &str, capability: &str) -> Option<u8> {
    if tag == capability {
        return Some(2);
    }
    if tag == "*" {
        return Some(0);
    }
    if let Some(prefix) = tag.strip_suffix(".*") {
        let covered = capability
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false);
        if covered {
            return Some(1);
        }
    }
    None
}

/// Registry lookups consumed by the orchestrator
pub trait CapabilityRegistry: Send + Sync {
    /// Candidates for `capability`, best first
    fn lookup(&self, capability: &str) -> Vec<AgentDescriptor>;

    fn register(&self, descriptor: AgentDescriptor) -> Result<()>;

    fn unregister(&self, agent_id: &AgentId) -> Result<AgentDescriptor>;

    fn best(&self, capability: &str) -> Option<AgentDescriptor> {
        self.lookup(capability).into_iter().next()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_seq: u64,
    agents: HashMap<AgentId, (u64, AgentDescriptor)>,
}

/// Lock-protected in-memory registry
#[derive(Debug, Default)]
pub struct InMemoryCapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl InMemoryCapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().agents.is_empty()
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentDescriptor> {
        self.inner.read().agents.get(agent_id).map(|(_, d)| d.clone())
    }
}

impl CapabilityRegistry for InMemoryCapabilityRegistry {
    fn lookup(&self, capability: &str) -> Vec<AgentDescriptor> {
        let inner = self.inner.read();
        let mut candidates: Vec<(u8, u64, &AgentDescriptor)> = inner
            .agents
            .values()
            .filter_map(|(seq, d)| d.specificity(capability).map(|s| (s, *seq, d)))
            .collect();

        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.2.confidence.total_cmp(&a.2.confidence))
                .then_with(|| a.1.cmp(&b.1))
        });
        candidates.into_iter().map(|(_, _, d)| d.clone()).collect()
    }

    fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        if descriptor.tags.is_empty() {
            return Err(RegistryError::NoTags(descriptor.agent_id));
        }
        let mut inner = self.inner.write();
        if inner.agents.contains_key(&descriptor.agent_id) {
            return Err(RegistryError::DuplicateAgent(descriptor.agent_id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        info!(agent_id = %descriptor.agent_id, tags = ?descriptor.tags, "agent registered");
        inner.agents.insert(descriptor.agent_id.clone(), (seq, descriptor));
        Ok(())
    }

    fn unregister(&self, agent_id: &AgentId) -> Result<AgentDescriptor> {
        self.inner
            .write()
            .agents
            .remove(agent_id)
            .map(|(_, d)| d)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_beats_wildcard() {
        let registry = InMemoryCapabilityRegistry::new();
        registry
            .register(AgentDescriptor::new("generalist", ["skill.*"]).with_confidence(0.99))
            .unwrap();
        registry
            .register(AgentDescriptor::new("translator", ["skill.translate"]).with_confidence(0.6))
            .unwrap();

        let found = registry.lookup("skill.translate");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].agent_id.as_str(), "translator");
    }

    #[test]
    fn test_confidence_then_registration_order() {
        let registry = InMemoryCapabilityRegistry::new();
        registry.register(AgentDescriptor::new("a", ["data.fetch"]).with_confidence(0.5)).unwrap();
        registry.register(AgentDescriptor::new("b", ["data.fetch"]).with_confidence(0.8)).unwrap();
        registry.register(AgentDescriptor::new("c", ["data.fetch"]).with_confidence(0.8)).unwrap();

        let ids: Vec<String> = registry
            .lookup("data.fetch")
            .into_iter()
            .map(|d| d.agent_id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_wildcard_requires_namespace_boundary() {
        let d = AgentDescriptor::new("x", ["skill.*"]);
        assert_eq!(d.specificity("skill.summarize"), Some(1));
        assert_eq!(d.specificity("skillful.thing"), None);
        assert_eq!(AgentDescriptor::new("y", ["*"]).specificity("anything"), Some(0));
    }

    #[test]
    fn test_duplicate_and_unregister() {
        let registry = InMemoryCapabilityRegistry::new();
        registry.register(AgentDescriptor::new("a", ["t"])).unwrap();
        assert_eq!(
            registry.register(AgentDescriptor::new("a", ["t"])),
            Err(RegistryError::DuplicateAgent(AgentId::from("a")))
        );
        registry.unregister(&AgentId::from("a")).unwrap();
        assert!(registry.best("t").is_none());
        assert!(registry.register(AgentDescriptor::new("b", Vec::<String>::new())).is_err());
    }
}
