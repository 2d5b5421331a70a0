use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AnswerError;

// --- Facts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    String,
    Number,
    Boolean,
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactType::String => write!(f, "string"),
            FactType::Number => write!(f, "number"),
            FactType::Boolean => write!(f, "boolean"),
        }
    }
}

impl FactType {
    /// Whether a decoded JSON value is of this type.
    pub fn admits(&self, value: &serde_json::Value) -> bool {
        matches!(
            (self, value),
            (FactType::String, serde_json::Value::String(_))
                | (FactType::Number, serde_json::Value::Number(_))
                | (FactType::Boolean, serde_json::Value::Bool(_))
        )
    }
}

/// A named, typed question answerable about a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    /// Unique key the ruleset uses in its extraction result.
    pub key: String,
    pub question: String,
    #[serde(rename = "type")]
    pub fact_type: FactType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSet {
    pub id: Uuid,
    pub fact_ids: Vec<Uuid>,
}

// --- Rulesets ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    pub id: Uuid,
    /// Script source. Evaluated inside the page, it must define
    /// `window.ruleset.initialCoefficients()` and
    /// `window.ruleset.extractFacts(document, factKeys, coefficients)`.
    pub code: String,
    pub fact_set_id: Option<Uuid>,
}

// --- Webpages ---

/// How a page document is presented to the execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentRef {
    /// An empty document, used to ask a ruleset for its defaults.
    Blank,
    /// A live page loaded over the network.
    Url { url: String },
    /// A previously frozen snapshot. `url` is where it was captured and is
    /// used as the base for its relative links.
    Frozen { url: String, html: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webpage {
    pub id: Uuid,
    pub url: String,
    #[serde(default)]
    pub frozen_html: String,
}

impl Webpage {
    /// Prefer the frozen snapshot so repeated evaluations see identical markup.
    pub fn document(&self) -> DocumentRef {
        if self.frozen_html.is_empty() {
            DocumentRef::Url {
                url: self.url.clone(),
            }
        } else {
            DocumentRef::Frozen {
                url: self.url.clone(),
                html: self.frozen_html.clone(),
            }
        }
    }
}

/// Ground-truth answer for one fact on one page, stored JSON-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebpageFact {
    pub webpage_id: Uuid,
    pub fact_id: Uuid,
    pub fact_answer: String,
}

/// Decode a stored answer and check it against the fact's declared type.
pub fn decode_answer(
    fact_key: &str,
    fact_type: FactType,
    encoded: &str,
) -> Result<serde_json::Value, AnswerError> {
    let value: serde_json::Value =
        serde_json::from_str(encoded).map_err(|e| AnswerError::Undecodable {
            fact_key: fact_key.to_string(),
            reason: e.to_string(),
        })?;

    if !fact_type.admits(&value) {
        return Err(AnswerError::WrongType {
            fact_key: fact_key.to_string(),
            expected: fact_type,
            found: value.to_string(),
        });
    }
    Ok(value)
}

// --- Training runs ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: Uuid,
    pub ruleset_id: Uuid,
    pub training_page_ids: Vec<Uuid>,
    #[serde(default)]
    pub testing_page_ids: Vec<Uuid>,
    #[serde(default)]
    pub coefficients: Option<CoefficientVector>,
    #[serde(default)]
    pub training_cost: Option<f64>,
    #[serde(default)]
    pub testing_cost: Option<f64>,
    #[serde(default)]
    pub trained_at: Option<DateTime<Utc>>,
}

impl TrainingRun {
    pub fn new(ruleset_id: Uuid, training_page_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ruleset_id,
            training_page_ids,
            testing_page_ids: Vec::new(),
            coefficients: None,
            training_cost: None,
            testing_cost: None,
            trained_at: None,
        }
    }
}

// --- Coefficients ---

/// Tunable parameters of a ruleset.
///
/// Equality and hashing compare the exact bit pattern of every element, so two
/// vectors are the same cache key only when they are numerically identical.
/// `-0.0` is treated as `0.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoefficientVector(Vec<f64>);

impl CoefficientVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    /// Copy of this vector with `delta` added to one element.
    pub fn nudged(&self, index: usize, delta: f64) -> Self {
        let mut values = self.0.clone();
        values[index] += delta;
        Self(values)
    }

    /// Index of the first element that is NaN or infinite.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.0.iter().position(|v| !v.is_finite())
    }

    fn key_bits(&self) -> impl Iterator<Item = u64> + '_ {
        self.0
            .iter()
            .map(|v| if *v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
    }
}

impl PartialEq for CoefficientVector {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.key_bits().eq(other.key_bits())
    }
}

impl Eq for CoefficientVector {}

impl Hash for CoefficientVector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        for bits in self.key_bits() {
            bits.hash(state);
        }
    }
}

impl From<Vec<f64>> for CoefficientVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl fmt::Display for CoefficientVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

/// Parses a comma-separated list such as `"1, 2.5, -3"`.
impl FromStr for CoefficientVector {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('[').trim_end_matches(']');
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        s.split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}
