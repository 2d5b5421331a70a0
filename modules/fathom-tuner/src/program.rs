//! Ruleset programs and the labeled pages they are scored against.

use std::collections::BTreeMap;

use fathom_common::{CoefficientVector, DocumentRef, Fact, FactType, Ruleset};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TunerError};

/// Entry point returning the ruleset's declared default coefficients.
pub const INITIAL_COEFFICIENTS_CALL: &str = "return window.ruleset.initialCoefficients();";

/// Entry point extracting facts; reads `[factKeys, coefficients]` from `arguments`.
pub const EXTRACT_FACTS_CALL: &str =
    "return window.ruleset.extractFacts(window.document, arguments[0], arguments[1]);";

#[derive(Debug, Clone, PartialEq)]
pub struct FactSpec {
    pub key: String,
    pub fact_type: FactType,
}

/// A ruleset's source plus the ordered facts of its fact set.
#[derive(Debug, Clone)]
pub struct RulesetProgram {
    pub ruleset_id: Uuid,
    pub fact_set_id: Uuid,
    code: String,
    facts: Vec<FactSpec>,
}

impl RulesetProgram {
    pub fn new(ruleset: &Ruleset, facts: &[Fact]) -> Result<Self> {
        let fact_set_id = ruleset.fact_set_id.ok_or_else(|| {
            TunerError::PreconditionViolation(format!(
                "ruleset {} has no fact set to train against",
                ruleset.id
            ))
        })?;
        if facts.is_empty() {
            return Err(TunerError::PreconditionViolation(format!(
                "fact set {fact_set_id} has no facts"
            )));
        }

        Ok(Self {
            ruleset_id: ruleset.id,
            fact_set_id,
            code: ruleset.code.clone(),
            facts: facts
                .iter()
                .map(|f| FactSpec {
                    key: f.key.clone(),
                    fact_type: f.fact_type,
                })
                .collect(),
        })
    }

    pub fn facts(&self) -> &[FactSpec] {
        &self.facts
    }

    pub fn fact_keys(&self) -> Vec<&str> {
        self.facts.iter().map(|f| f.key.as_str()).collect()
    }

    pub fn initial_coefficients_script(&self) -> String {
        format!("{}\n{INITIAL_COEFFICIENTS_CALL}", self.code)
    }

    pub fn extract_facts_script(&self) -> String {
        format!("{}\n{EXTRACT_FACTS_CALL}", self.code)
    }

    /// Arguments for [`EXTRACT_FACTS_CALL`], serialized as JSON arrays.
    pub fn extract_facts_args(&self, coefficients: &CoefficientVector) -> Vec<Value> {
        vec![
            Value::from(self.fact_keys()),
            Value::from(coefficients.as_slice().to_vec()),
        ]
    }
}

/// Parse the value returned by `initialCoefficients()`.
pub fn parse_coefficients(value: &Value) -> Result<CoefficientVector> {
    let items = value.as_array().ok_or_else(|| {
        TunerError::ExecutionFault(format!(
            "initialCoefficients() must return an array, got {value}"
        ))
    })?;

    items
        .iter()
        .map(|item| {
            item.as_f64().ok_or_else(|| {
                TunerError::ExecutionFault(format!(
                    "initialCoefficients() returned a non-numeric element: {item}"
                ))
            })
        })
        .collect::<Result<Vec<f64>>>()
        .map(CoefficientVector::new)
}

/// A page plus its ground-truth answers for the active fact set.
#[derive(Debug, Clone)]
pub struct LabeledPage {
    pub webpage_id: Uuid,
    pub document: DocumentRef,
    /// Fact key to JSON-encoded answer. Facts without an entry are not checked.
    pub answers: BTreeMap<String, String>,
}

impl LabeledPage {
    pub fn new(webpage_id: Uuid, document: DocumentRef) -> Self {
        Self {
            webpage_id,
            document,
            answers: BTreeMap::new(),
        }
    }

    pub fn with_answer(mut self, fact_key: &str, encoded: &str) -> Self {
        self.answers
            .insert(fact_key.to_string(), encoded.to_string());
        self
    }
}
