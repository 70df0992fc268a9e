//! Capsules and capsule results
//!
//! A [`Capsule`] is an immutable unit of work. Revisions never mutate a capsule
//! in place: [`Capsule::revise`] returns a new value with the same id, a bumped
//! revision number and additional [`TraceRecord`]s appended to the trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::CapsuleId;
use crate::need::Need;

/// What a capsule is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleKind {
    #[default]
    Task,
    Skill,
    Debug,
    Teaching,
}

impl CapsuleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "task" => Some(Self::Task),
            "skill" => Some(Self::Skill),
            "debug" => Some(Self::Debug),
            "teaching" => Some(Self::Teaching),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapsuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Skill => write!(f, "skill"),
            Self::Debug => write!(f, "debug"),
            Self::Teaching => write!(f, "teaching"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// One provenance entry in a capsule trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Capsule revision that appended this record
    pub revision: u32,
    pub key: String,
    pub value: Value,
    pub recorded_at: DateTime<Utc>,
}

/// An immutable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub id: CapsuleId,
    pub kind: CapsuleKind,
    pub goal: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Append-only provenance records
    #[serde(default)]
    pub trace: Vec<TraceRecord>,
    /// Revision number, starting at 0
    #[serde(default)]
    pub revision: u32,
    /// Capsule this one was derived from (sub-capsules only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CapsuleId>,
}

impl Capsule {
    /// Start building a capsule with a fresh id
    pub fn builder(kind: CapsuleKind, goal: impl Into<String>) -> CapsuleBuilder {
        CapsuleBuilder {
            id: None,
            kind,
            goal: goal.into(),
            payload: Map::new(),
            constraints: Vec::new(),
            priority: Priority::Normal,
            trace: Vec::new(),
            parent: None,
        }
    }

    /// Produce the next revision with `records` appended to the trace.
    pub fn revise(&self, records: impl IntoIterator<Item = (String, Value)>) -> Capsule {
        let revision = self.revision + 1;
        let now = Utc::now();
        let mut next = self.clone();
        next.revision = revision;
        next.trace.extend(records.into_iter().map(|(key, value)| TraceRecord {
            revision,
            key,
            value,
            recorded_at: now,
        }));
        next
    }

    /// Derive a sub-capsule linked back to this one
    pub fn derive(&self, kind: CapsuleKind, goal: impl Into<String>) -> CapsuleBuilder {
        Capsule::builder(kind, goal)
            .constraints(self.constraints.clone())
            .priority(self.priority)
            .parent(self.id.clone())
            .trace_entry("parent_capsule", Value::String(self.id.to_string()))
    }

    /// Mapping view of the trace; later records overwrite earlier keys
    pub fn trace_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for record in &self.trace {
            map.insert(record.key.clone(), record.value.clone());
        }
        map
    }

    /// Latest value recorded under `key`
    pub fn trace_value(&self, key: &str) -> Option<&Value> {
        self.trace.iter().rev().find(|r| r.key == key).map(|r| &r.value)
    }

    pub fn has_constraint(&self, constraint: &str) -> bool {
        self.constraints.iter().any(|c| c == constraint)
    }
}

pub struct CapsuleBuilder {
    id: Option<CapsuleId>,
    kind: CapsuleKind,
    goal: String,
    payload: Map<String, Value>,
    constraints: Vec<String>,
    priority: Priority,
    trace: Vec<(String, Value)>,
    parent: Option<CapsuleId>,
}

impl CapsuleBuilder {
    pub fn id(mut self, id: impl Into<CapsuleId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent: CapsuleId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn trace_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.trace.push((key.into(), value));
        self
    }

    pub fn build(self) -> Capsule {
        let now = Utc::now();
        Capsule {
            id: self.id.unwrap_or_default(),
            kind: self.kind,
            goal: self.goal,
            payload: self.payload,
            constraints: self.constraints,
            priority: self.priority,
            trace: self
                .trace
                .into_iter()
                .map(|(key, value)| TraceRecord {
                    revision: 0,
                    key,
                    value,
                    recorded_at: now,
                })
                .collect(),
            revision: 0,
            parent: self.parent,
        }
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleResult {
    pub ok: bool,
    pub capsule_id: CapsuleId,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_request: Option<Need>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl CapsuleResult {
    pub fn success(capsule_id: CapsuleId, output: Map<String, Value>) -> Self {
        Self {
            ok: true,
            capsule_id,
            output,
            error: None,
            blocked: false,
            pass_request: None,
            metrics: Map::new(),
        }
    }

    /// Permanent local failure
    pub fn failure(capsule_id: CapsuleId, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            capsule_id,
            output: Map::new(),
            error: Some(error.into()),
            blocked: false,
            pass_request: None,
            metrics: Map::new(),
        }
    }

    /// Recoverable block; `explanation` feeds need classification when no
    /// structured need is attached.
    pub fn blocked(capsule_id: CapsuleId, explanation: impl Into<String>, need: Option<Need>) -> Self {
        Self {
            ok: false,
            capsule_id,
            output: Map::new(),
            error: Some(explanation.into()),
            blocked: true,
            pass_request: need,
            metrics: Map::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}
