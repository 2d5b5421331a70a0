//! Cost of a coefficient vector: the fraction of labeled pages a ruleset gets wrong.

use std::time::Duration;

use async_trait::async_trait;
use fathom_common::{decode_answer, CoefficientVector};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::environment::ExecutionEnvironment;
use crate::error::{Result, TunerError};
use crate::program::{LabeledPage, RulesetProgram};

/// Anything that can score a candidate solution. Lower is better.
#[async_trait]
pub trait CostFunction: Send {
    async fn cost(&mut self, solution: &CoefficientVector) -> Result<f64>;
}

/// Scores coefficients by running a ruleset against every labeled page.
pub struct CostEvaluator<'a, E: ExecutionEnvironment + ?Sized> {
    env: &'a mut E,
    program: &'a RulesetProgram,
    pages: &'a [LabeledPage],
    timeout: Duration,
    evaluations: u64,
}

impl<'a, E: ExecutionEnvironment + ?Sized> CostEvaluator<'a, E> {
    pub fn new(
        env: &'a mut E,
        program: &'a RulesetProgram,
        pages: &'a [LabeledPage],
        timeout: Duration,
    ) -> Result<Self> {
        if pages.is_empty() {
            return Err(TunerError::PreconditionViolation(
                "cannot compute cost over zero labeled pages".to_string(),
            ));
        }
        Ok(Self {
            env,
            program,
            pages,
            timeout,
            evaluations: 0,
        })
    }

    /// Number of page executions performed so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// `(pages - succeeding pages) / pages`, evaluated in page order.
    pub async fn evaluate(&mut self, coefficients: &CoefficientVector) -> Result<f64> {
        let total = self.pages.len();
        let mut successes = 0usize;

        for page in self.pages {
            let extracted = self.extract(page, coefficients).await?;
            if page_matches(self.program, page, &extracted) {
                successes += 1;
            }
        }

        let cost = (total - successes) as f64 / total as f64;
        debug!(
            coefficients = %coefficients,
            successes,
            total,
            cost,
            "Evaluated coefficients"
        );
        Ok(cost)
    }

    async fn extract(
        &mut self,
        page: &LabeledPage,
        coefficients: &CoefficientVector,
    ) -> Result<Map<String, Value>> {
        self.env.load(&page.document).await?;
        self.evaluations += 1;

        let result = self
            .env
            .run(
                &self.program.extract_facts_script(),
                &self.program.extract_facts_args(coefficients),
                self.timeout,
            )
            .await?;

        match result {
            Value::Object(map) => Ok(map),
            other => Err(TunerError::ExecutionFault(format!(
                "extractFacts() on page {} returned {other} instead of an object",
                page.webpage_id
            ))),
        }
    }
}

#[async_trait]
impl<'a, E: ExecutionEnvironment + ?Sized> CostFunction for CostEvaluator<'a, E> {
    async fn cost(&mut self, solution: &CoefficientVector) -> Result<f64> {
        self.evaluate(solution).await
    }
}

/// Whether every recorded answer on the page matches the extracted facts.
///
/// Pages with no recorded answers succeed vacuously. Answers that can't be
/// decoded fail the page instead of aborting the run.
pub fn page_matches(
    program: &RulesetProgram,
    page: &LabeledPage,
    extracted: &Map<String, Value>,
) -> bool {
    for fact in program.facts() {
        let Some(encoded) = page.answers.get(&fact.key) else {
            continue;
        };

        let expected = match decode_answer(&fact.key, fact.fact_type, encoded) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    webpage_id = %page.webpage_id,
                    error = %e,
                    "Malformed answer, counting page as failed"
                );
                return false;
            }
        };

        let actual = extracted.get(&fact.key).unwrap_or(&Value::Null);
        if !values_match(&expected, actual) {
            return false;
        }
    }
    true
}

/// Typed equality. Numbers compare by value, so `5` matches `5.0`.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => expected == actual,
    }
}
