use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use reflex_audit::{AuditError, AuditLog, AuditRecord, MemoryAuditLog};
use reflex_guard::{
    BootGate, DomainFilterConfig, DomainFilterGate, Gate, GateError, GateInput, GuardGate, ManualClock, Policy,
    ResponseCache, Runtime, StabilizerGate,
};
use reflex_kernel::{ReflexPipeline, TaskRequest};
use reflex_types::{Decision, DecisionAction};

/// Passes and counts how often it ran
struct Recorder {
    name: String,
    calls: AtomicUsize,
}

impl Recorder {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Gate for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, input: &GateInput<'_>, _runtime: &Runtime) -> reflex_guard::Result<Decision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Decision::pass(input.level_str()))
    }
}

struct Denier;

impl Gate for Denier {
    fn name(&self) -> &str {
        "denier"
    }

    fn evaluate(&self, input: &GateInput<'_>, _runtime: &Runtime) -> reflex_guard::Result<Decision> {
        Ok(Decision::deny(input.level_str(), "nope"))
    }
}

struct Broken;

impl Gate for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn evaluate(&self, _input: &GateInput<'_>, _runtime: &Runtime) -> reflex_guard::Result<Decision> {
        Err(GateError::Internal {
            message: "lost the manifest".to_string(),
        })
    }
}

struct FailingAudit;

impl AuditLog for FailingAudit {
    fn append(&self, _record: &AuditRecord) -> reflex_audit::Result<()> {
        Err(AuditError::Io {
            path: "/dev/full".into(),
            source: std::io::Error::other("disk full"),
        })
    }
}

fn standard_pipeline(runtime: Runtime, policy: Policy) -> ReflexPipeline {
    ReflexPipeline::new(runtime)
        .with_policy(policy)
        .with_gate(Arc::new(BootGate::new()))
        .with_gate(Arc::new(GuardGate::new()))
        .with_gate(Arc::new(StabilizerGate::new()))
        .with_gate(Arc::new(DomainFilterGate::new(DomainFilterConfig::biomedical())))
}

#[test]
fn test_destructive_request_denied() {
    let audit = Arc::new(MemoryAuditLog::new());
    let pipeline = standard_pipeline(Runtime::new(), Policy::with_deny_patterns(["delete all"])).with_audit(audit.clone());

    let outcome = pipeline.run(&TaskRequest::new("please delete all production data").with_level("L1"));

    assert_eq!(outcome.decision.action, DecisionAction::Deny);
    assert_eq!(outcome.decision.reason(), Some("destructive_request"));
    assert_eq!(outcome.decision.payload["reason"], json!("destructive_request"));
    assert_eq!(outcome.gates_run, vec!["boot", "guard"]);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, DecisionAction::Deny);
    assert_eq!(records[0].input_hash, outcome.input_hash);
    assert_eq!(records[0].audit.level, "L1");
}

#[test]
fn test_stabilizer_seed_then_hit_then_expiry() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let runtime = Runtime::with_parts(Arc::new(ResponseCache::new()), clock.clone());
    let pipeline = standard_pipeline(runtime, Policy::destructive_defaults());
    let context = json!({"user": "u1"});

    let seeded = pipeline.run(
        &TaskRequest::new("what is six times seven")
            .with_context(context.clone())
            .with_flags(json!({"stabilizer_ttl": 60, "stabilizer_seed": true, "stabilizer_response": "42"})),
    );
    assert_eq!(seeded.decision.action, DecisionAction::Pass);
    assert_eq!(seeded.decision.audit.decision, "cache_seeded");

    clock.advance(Duration::seconds(30));
    let replay = TaskRequest::new("what is six times seven").with_context(context);
    let hit = pipeline.run(&replay);
    assert_eq!(hit.decision.action, DecisionAction::Reply);
    assert_eq!(hit.decision.audit.decision, "cache_hit");
    assert_eq!(hit.decision.payload["response"], json!("42"));
    // domain filter never ran
    assert_eq!(hit.gates_run, vec!["boot", "guard", "stabilizer"]);

    clock.advance(Duration::seconds(30));
    let expired = pipeline.run(&replay);
    assert_eq!(expired.decision.action, DecisionAction::Pass);
    assert_eq!(expired.decision.audit.decision, "pass");
}

#[test]
fn test_gates_after_terminal_decision_never_run() {
    let before = Recorder::new("before");
    let after = Recorder::new("after");
    let audit = Arc::new(MemoryAuditLog::new());
    let pipeline = ReflexPipeline::new(Runtime::new())
        .with_gate(before.clone())
        .with_gate(Arc::new(Denier))
        .with_gate(after.clone())
        .with_audit(audit.clone());

    let outcome = pipeline.run(&TaskRequest::new("anything"));

    assert_eq!(outcome.decision.action, DecisionAction::Deny);
    assert_eq!(before.calls(), 1);
    assert_eq!(after.calls(), 0);
    assert_eq!(audit.len(), 1);
}

#[test]
fn test_gate_error_becomes_deny() {
    let after = Recorder::new("after");
    let pipeline = ReflexPipeline::new(Runtime::new())
        .with_gate(Arc::new(Broken))
        .with_gate(after.clone());

    let outcome = pipeline.run(&TaskRequest::new("anything"));
    assert_eq!(outcome.decision.action, DecisionAction::Deny);
    assert_eq!(outcome.decision.reason(), Some("gate_error"));
    assert_eq!(after.calls(), 0);
}

#[test]
fn test_schema_violation_denied() {
    let pipeline = standard_pipeline(Runtime::new(), Policy::default())
        .with_schema(json!({"required_context": ["tenant"]}).as_object().cloned().unwrap());

    let outcome = pipeline.run(&TaskRequest::new("summarize").with_context(json!({"user": "u1"})));
    assert_eq!(outcome.decision.reason(), Some("schema_deny"));

    let bad_task: TaskRequest = serde_json::from_value(json!({"task": 17})).unwrap();
    assert_eq!(pipeline.run(&bad_task).decision.reason(), Some("schema_deny"));
}

#[test]
fn test_modify_merges_into_working_context() {
    let pipeline = standard_pipeline(Runtime::new(), Policy::default());
    let outcome = pipeline.run(
        &TaskRequest::new("find papers on protein misfolding").with_context(json!({"query": "misfolding", "k": 5})),
    );

    assert!(outcome.passed());
    assert_eq!(outcome.decision.reason(), Some("modified_query"));
    assert_eq!(
        outcome.context,
        json!({"query": "misfolding", "k": 5, "data_source_filter": "pubmed"})
    );
}

#[test]
fn test_audit_failure_does_not_abort() {
    let pipeline = standard_pipeline(Runtime::new(), Policy::default()).with_audit(Arc::new(FailingAudit));
    let outcome = pipeline.run(&TaskRequest::new("hello"));
    assert!(outcome.passed());
    assert_eq!(outcome.gates_run.len(), 4);
}

proptest! {
    #[test]
    fn prop_pipeline_stops_at_first_deny(passes_before in 0usize..6, passes_after in 0usize..6) {
        let before: Vec<_> = (0..passes_before).map(|i| Recorder::new(&format!("b{}", i))).collect();
        let after: Vec<_> = (0..passes_after).map(|i| Recorder::new(&format!("a{}", i))).collect();

        let mut pipeline = ReflexPipeline::new(Runtime::new());
        for gate in &before {
            pipeline = pipeline.with_gate(gate.clone());
        }
        pipeline = pipeline.with_gate(Arc::new(Denier));
        for gate in &after {
            pipeline = pipeline.with_gate(gate.clone());
        }

        let outcome = pipeline.run(&TaskRequest::new("t").with_context(Value::Null));
        prop_assert_eq!(outcome.decision.action, DecisionAction::Deny);
        prop_assert_eq!(outcome.gates_run.len(), passes_before + 1);
        prop_assert!(after.iter().all(|p| p.calls() == 0));
    }
}
