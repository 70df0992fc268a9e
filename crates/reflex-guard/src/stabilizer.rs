//! Stabilizer gate - replays recent answers for identical requests
//!
//! Flags:
//! - `stabilizer_ttl`: seconds a cached response stays valid (default 60)
//! - `stabilizer_seed`: when truthy, store `stabilizer_response`
//! - `stabilizer_response`: the response to seed

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use reflex_types::{stable_hash, Decision, ReflexError};

use crate::cache::CacheLookup;
use crate::gate::{is_truthy, Gate, GateInput, Result, Runtime};

pub const DEFAULT_TTL_SECS: f64 = 60.0;

#[derive(Debug, Default, Clone)]
pub struct StabilizerGate;

impl StabilizerGate {
    pub fn new() -> Self {
        Self
    }

    /// Cache key over `{task, context}`
    pub fn cache_key(input: &GateInput<'_>) -> String {
        stable_hash(&json!({
            "task": input.task,
            "context": input.context,
        }))
    }

    fn ttl_ms(input: &GateInput<'_>) -> i64 {
        let secs = input
            .flag("stabilizer_ttl")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite())
            .unwrap_or(DEFAULT_TTL_SECS)
            .max(0.0);
        (secs * 1000.0) as i64
    }
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

impl Gate for StabilizerGate {
    fn name(&self) -> &str {
        "stabilizer"
    }

    fn evaluate(&self, input: &GateInput<'_>, runtime: &Runtime) -> Result<Decision> {
        let level = input.level_str();
        let key = Self::cache_key(input);
        let now = runtime.now();

        match runtime.cache().lookup(&key, now, Self::ttl_ms(input)) {
            CacheLookup::Hit(entry) => {
                debug!(gate = "stabilizer", key = %key, "cache hit");
                let mut payload = Map::new();
                payload.insert("response".to_string(), entry.response);
                return Ok(Decision::reply(level, payload, "cache_hit"));
            }
            CacheLookup::Inconsistent { stored_at } => {
                let err = ReflexError::CacheInconsistency(format!(
                    "entry {} stored at {} is newer than {}",
                    key, stored_at, now
                ));
                warn!(gate = "stabilizer", error = %err, "evicted inconsistent entry");
            }
            CacheLookup::Expired => debug!(gate = "stabilizer", key = %key, "cache entry expired"),
            CacheLookup::Miss => {}
        }

        let seed = input.flag("stabilizer_seed").map(is_truthy).unwrap_or(false);
        if seed {
            if let Some(response) = input.flag("stabilizer_response").filter(|v| is_non_empty(v)) {
                runtime.cache().store(key, response.clone(), now);
                return Ok(Decision::pass_labeled(level, "cache_seeded"));
            }
        }

        Ok(Decision::pass(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::clock::ManualClock;
    use crate::gate::Policy;
    use chrono::{Duration, Utc};
    use reflex_types::DecisionAction;
    use std::sync::Arc;

    struct Fixture {
        clock: Arc<ManualClock>,
        runtime: Runtime,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let runtime = Runtime::with_parts(Arc::new(ResponseCache::new()), clock.clone());
        Fixture { clock, runtime }
    }

    fn run(runtime: &Runtime, task: &str, flags: Value) -> Decision {
        let (task, context, level) = (json!(task), json!({"user": "u1"}), json!("L1"));
        let manifest = Map::new();
        let schema = Map::new();
        let policy = Policy::default();
        let input = GateInput {
            task: &task,
            context: &context,
            level: &level,
            flags: &flags,
            manifest: &manifest,
            policy: &policy,
            schema: &schema,
        };
        StabilizerGate::new().evaluate(&input, runtime).unwrap()
    }

    #[test]
    fn test_seed_then_hit() {
        let f = fixture();
        let seeded = run(
            &f.runtime,
            "what is six times seven",
            json!({"stabilizer_ttl": 60, "stabilizer_seed": true, "stabilizer_response": "42"}),
        );
        assert_eq!(seeded.action, DecisionAction::Pass);
        assert_eq!(seeded.audit.decision, "cache_seeded");

        f.clock.advance(Duration::seconds(30));
        let hit = run(&f.runtime, "what is six times seven", json!({}));
        assert_eq!(hit.action, DecisionAction::Reply);
        assert_eq!(hit.audit.decision, "cache_hit");
        assert_eq!(hit.payload.get("response"), Some(&json!("42")));
    }

    #[test]
    fn test_expired_entry_misses() {
        let f = fixture();
        run(&f.runtime, "q", json!({"stabilizer_seed": true, "stabilizer_response": "a"}));
        f.clock.advance(Duration::seconds(10));
        let miss = run(&f.runtime, "q", json!({"stabilizer_ttl": 10}));
        assert_eq!(miss.action, DecisionAction::Pass);
        assert_eq!(miss.audit.decision, "pass");
    }

    #[test]
    fn test_zero_ttl_caller_leaves_entry_for_others() {
        let f = fixture();
        run(&f.runtime, "q", json!({"stabilizer_seed": true, "stabilizer_response": "a"}));
        f.clock.advance(Duration::seconds(1));

        assert_eq!(run(&f.runtime, "q", json!({"stabilizer_ttl": 0})).action, DecisionAction::Pass);
        let hit = run(&f.runtime, "q", json!({}));
        assert_eq!(hit.action, DecisionAction::Reply);
        assert_eq!(hit.payload["response"], json!("a"));
    }

    #[test]
    fn test_empty_seed_response_is_ignored() {
        let f = fixture();
        let d = run(&f.runtime, "q", json!({"stabilizer_seed": true, "stabilizer_response": ""}));
        assert_eq!(d.audit.decision, "pass");
        assert!(f.runtime.cache().is_empty());
    }

    #[test]
    fn test_clock_skew_treated_as_miss() {
        let f = fixture();
        run(&f.runtime, "q", json!({"stabilizer_seed": true, "stabilizer_response": "a"}));
        f.clock.advance(Duration::seconds(-5));
        let d = run(&f.runtime, "q", json!({}));
        assert_eq!(d.action, DecisionAction::Pass);
        assert!(f.runtime.cache().is_empty());
    }

    #[test]
    fn test_different_context_different_key() {
        let f = fixture();
        run(&f.runtime, "q", json!({"stabilizer_seed": true, "stabilizer_response": "a"}));
        let other = run(&f.runtime, "q2", json!({}));
        assert_eq!(other.action, DecisionAction::Pass);
    }
}
