//! Gate contract shared by every reflex

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use reflex_types::{SCHEMA_DENY, DESTRUCTIVE_REQUEST};

use crate::cache::ResponseCache;
use crate::clock::{Clock, SystemClock};

/// Errors a gate may raise; the pipeline turns them into DENY decisions
#[derive(Error, Debug, Clone)]
pub enum GateError {
    #[error("Schema violation: {message}")]
    Schema { message: String },

    #[error("Deny pattern matched: {pattern}")]
    PolicyDeny { pattern: String },

    #[error("Gate failure: {message}")]
    Internal { message: String },
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema { .. } => SCHEMA_DENY,
            Self::PolicyDeny { .. } => DESTRUCTIVE_REQUEST,
            Self::Internal { .. } => "gate_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

/// Policy consulted by the gates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Substrings that mark a task as destructive (case-insensitive)
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Policy {
    pub fn with_deny_patterns(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            deny_patterns: patterns.into_iter().map(Into::into).collect(),
            extra: Map::new(),
        }
    }

    /// A conservative deny list for destructive operations
    pub fn destructive_defaults() -> Self {
        Self::with_deny_patterns([
            "delete all",
            "drop table",
            "drop database",
            "rm -rf",
            "format disk",
            "wipe all",
            "truncate table",
        ])
    }
}

/// Everything a gate may look at. Fields stay raw JSON so the guard gate can
/// reject malformed shapes instead of the caller failing to deserialize.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub task: &'a Value,
    pub context: &'a Value,
    pub level: &'a Value,
    pub flags: &'a Value,
    pub manifest: &'a Map<String, Value>,
    pub policy: &'a Policy,
    pub schema: &'a Map<String, Value>,
}

impl<'a> GateInput<'a> {
    /// Task text, empty when the task is not a string
    pub fn task_str(&self) -> &'a str {
        self.task.as_str().unwrap_or("")
    }

    /// Level label used in decision audits
    pub fn level_str(&self) -> &'a str {
        self.level.as_str().unwrap_or("unknown")
    }

    pub fn context_map(&self) -> Option<&'a Map<String, Value>> {
        self.context.as_object()
    }

    pub fn flag(&self, key: &str) -> Option<&'a Value> {
        self.flags.as_object().and_then(|f| f.get(key))
    }
}

/// Shared mutable state a gate is explicitly granted
#[derive(Clone)]
pub struct Runtime {
    cache: Arc<ResponseCache>,
    clock: Arc<dyn Clock>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(ResponseCache::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_parts(cache: Arc<ResponseCache>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}

/// A reflex: a pure decision over one task
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, input: &GateInput<'_>, runtime: &Runtime) -> Result<reflex_types::Decision>;
}

/// JSON truthiness used for boolean-ish flags
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
