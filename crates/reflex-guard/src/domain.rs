//! Domain-filter gate - injects a data-source filter for domain queries

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use reflex_types::Decision;

use crate::gate::{Gate, GateInput, Result, Runtime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainFilterConfig {
    /// Keywords that mark a task as belonging to the domain (case-insensitive)
    pub triggers: Vec<String>,
    /// Context key the filter is injected under
    pub filter_key: String,
    pub filter_value: Value,
    /// Context key holding the downstream query text
    #[serde(default = "default_query_key")]
    pub query_key: String,
}

fn default_query_key() -> String {
    "query".to_string()
}

impl DomainFilterConfig {
    /// Biomedical precision preset
    pub fn biomedical() -> Self {
        Self {
            triggers: [
                "biomedical",
                "clinical",
                "protein",
                "gene",
                "genomic",
                "mutation",
                "drug",
                "disease",
                "pathway",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            filter_key: "data_source_filter".to_string(),
            filter_value: Value::String("pubmed".to_string()),
            query_key: default_query_key(),
        }
    }
}

impl Default for DomainFilterConfig {
    fn default() -> Self {
        Self::biomedical()
    }
}

#[derive(Debug, Clone)]
pub struct DomainFilterGate {
    config: DomainFilterConfig,
}

impl DomainFilterGate {
    pub fn new(config: DomainFilterConfig) -> Self {
        Self { config }
    }

    fn haystack(input: &GateInput<'_>) -> String {
        let mut text = input.task_str().to_lowercase();
        if let Some(context) = input.context_map() {
            for value in context.values().filter_map(Value::as_str) {
                text.push(' ');
                text.push_str(&value.to_lowercase());
            }
        }
        text
    }

    fn triggered(&self, input: &GateInput<'_>) -> bool {
        let text = Self::haystack(input);
        self.config
            .triggers
            .iter()
            .any(|t| !t.is_empty() && text.contains(&t.to_lowercase()))
    }

    /// The filter is present as its own context key or already in the query
    fn filter_present(&self, input: &GateInput<'_>) -> bool {
        let Some(context) = input.context_map() else {
            return false;
        };
        if context.contains_key(&self.config.filter_key) {
            return true;
        }
        match (context.get(&self.config.query_key).and_then(Value::as_str), self.config.filter_value.as_str()) {
            (Some(query), Some(filter)) => query.to_lowercase().contains(&filter.to_lowercase()),
            _ => false,
        }
    }
}

impl Gate for DomainFilterGate {
    fn name(&self) -> &str {
        "domain_filter"
    }

    fn evaluate(&self, input: &GateInput<'_>, _runtime: &Runtime) -> Result<Decision> {
        let level = input.level_str();
        if !self.triggered(input) || self.filter_present(input) {
            return Ok(Decision::pass(level));
        }
        let mut delta = Map::new();
        delta.insert(self.config.filter_key.clone(), self.config.filter_value.clone());
        Ok(Decision::modify(level, delta, "modified_query"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Policy;
    use reflex_types::DecisionAction;
    use serde_json::json;

    fn run(task: &str, context: Value) -> Decision {
        let (task, level, flags) = (json!(task), json!("L2"), json!({}));
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
        DomainFilterGate::new(DomainFilterConfig::biomedical())
            .evaluate(&input, &Runtime::new())
            .unwrap()
    }

    #[test]
    fn test_biomedical_query_gets_filter() {
        let d = run("find papers on BRCA1 gene variants", json!({"query": "BRCA1 variants"}));
        assert_eq!(d.action, DecisionAction::Modify);
        assert_eq!(d.reason(), Some("modified_query"));
        assert_eq!(
            d.context_delta().and_then(|c| c.get("data_source_filter")),
            Some(&json!("pubmed"))
        );
    }

    #[test]
    fn test_trigger_in_context_counts() {
        let d = run("look this up", json!({"topic": "Clinical trials for asthma"}));
        assert_eq!(d.action, DecisionAction::Modify);
    }

    #[test]
    fn test_existing_filter_passes() {
        let d = run("gene expression", json!({"data_source_filter": "pubmed"}));
        assert_eq!(d.action, DecisionAction::Pass);
        let d = run("gene expression", json!({"query": "gene expression site:PubMed"}));
        assert_eq!(d.action, DecisionAction::Pass);
    }

    #[test]
    fn test_unrelated_task_passes() {
        let d = run("book a flight to Oslo", json!({}));
        assert_eq!(d.action, DecisionAction::Pass);
    }
}
