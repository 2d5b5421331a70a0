// Test doubles for the tuner.
//
// - ScriptedEnvironment (ExecutionEnvironment): per-document extraction closures, call log
// - LandscapeCost (CostFunction): closed-form cost over coefficients, call counter
// - Fixture: builds a MemoryStore holding one ruleset, fact set, pages and a run

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fathom_common::{
    CoefficientVector, DocumentRef, Fact, FactSet, FactType, Ruleset, TrainingRun, Webpage,
    WebpageFact,
};
use serde_json::Value;
use uuid::Uuid;

use crate::cost::CostFunction;
use crate::environment::ExecutionEnvironment;
use crate::error::{ExecutionError, Result, TunerError};
use crate::program::{EXTRACT_FACTS_CALL, INITIAL_COEFFICIENTS_CALL};
use crate::store::{MemoryStore, StoreData};

// ---------------------------------------------------------------------------
// ScriptedEnvironment
// ---------------------------------------------------------------------------

type ExtractFn = dyn Fn(&[f64]) -> std::result::Result<Value, ExecutionError> + Send + Sync;

/// Everything a [`ScriptedEnvironment`] was asked to do.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentLog {
    pub loads: Vec<DocumentRef>,
    pub extract_calls: usize,
    pub default_calls: usize,
    pub last_timeout: Option<Duration>,
    pub closed: bool,
}

/// Fake execution environment. Each page URL maps to a closure from
/// coefficients to the extraction result; unknown URLs are a fault.
pub struct ScriptedEnvironment {
    defaults: Value,
    pages: HashMap<String, Arc<ExtractFn>>,
    current: Option<DocumentRef>,
    log: Arc<Mutex<EnvironmentLog>>,
}

impl ScriptedEnvironment {
    pub fn new(defaults: Vec<f64>) -> Self {
        Self {
            defaults: Value::from(defaults),
            pages: HashMap::new(),
            current: None,
            log: Arc::new(Mutex::new(EnvironmentLog::default())),
        }
    }

    /// Raw value returned by `initialCoefficients()`.
    pub fn with_raw_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn on_page<F>(mut self, url: &str, extract: F) -> Self
    where
        F: Fn(&[f64]) -> std::result::Result<Value, ExecutionError> + Send + Sync + 'static,
    {
        self.pages.insert(url.to_string(), Arc::new(extract));
        self
    }

    /// Shared view of the call log, still readable after the environment is consumed.
    pub fn log(&self) -> Arc<Mutex<EnvironmentLog>> {
        self.log.clone()
    }

    fn current_url(&self) -> Option<&str> {
        match self.current.as_ref()? {
            DocumentRef::Blank => None,
            DocumentRef::Url { url } | DocumentRef::Frozen { url, .. } => Some(url),
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ScriptedEnvironment {
    async fn load(&mut self, document: &DocumentRef) -> std::result::Result<(), ExecutionError> {
        self.log.lock().unwrap().loads.push(document.clone());
        self.current = Some(document.clone());
        Ok(())
    }

    async fn run(
        &mut self,
        program: &str,
        args: &[Value],
        timeout: Duration,
    ) -> std::result::Result<Value, ExecutionError> {
        if self.log.lock().unwrap().closed {
            return Err(ExecutionError::Fault("session closed".to_string()));
        }
        self.log.lock().unwrap().last_timeout = Some(timeout);

        if program.ends_with(INITIAL_COEFFICIENTS_CALL) {
            self.log.lock().unwrap().default_calls += 1;
            return Ok(self.defaults.clone());
        }

        if program.ends_with(EXTRACT_FACTS_CALL) {
            self.log.lock().unwrap().extract_calls += 1;
            let coefficients: Vec<f64> = args
                .get(1)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .ok_or_else(|| ExecutionError::Fault("bad coefficient argument".to_string()))?;
            let url = self
                .current_url()
                .ok_or_else(|| ExecutionError::Fault("no page loaded".to_string()))?;
            let extract = self
                .pages
                .get(url)
                .ok_or_else(|| ExecutionError::Fault(format!("no script for {url}")))?;
            return extract(&coefficients);
        }

        Err(ExecutionError::Fault(format!("unexpected program: {program}")))
    }

    async fn close(&mut self) -> std::result::Result<(), ExecutionError> {
        self.log.lock().unwrap().closed = true;
        self.current = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// LandscapeCost
// ---------------------------------------------------------------------------

type LandscapeFn = dyn Fn(&[f64]) -> Result<f64> + Send;

/// Cost function defined by a closure over the coefficient values.
pub struct LandscapeCost {
    f: Box<LandscapeFn>,
    calls: usize,
}

impl LandscapeCost {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + 'static,
    {
        Self {
            f: Box::new(move |v| Ok(f(v))),
            calls: 0,
        }
    }

    /// A cost function whose every call fails.
    pub fn failing<F>(err: F) -> Self
    where
        F: Fn() -> TunerError + Send + 'static,
    {
        Self {
            f: Box::new(move |_| Err(err())),
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

#[async_trait]
impl CostFunction for LandscapeCost {
    async fn cost(&mut self, solution: &CoefficientVector) -> Result<f64> {
        self.calls += 1;
        (self.f)(solution.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// Builds store contents for one training run.
pub struct Fixture {
    ruleset: Ruleset,
    facts: Vec<Fact>,
    fact_set: Option<FactSet>,
    training_pages: Vec<Webpage>,
    testing_pages: Vec<Webpage>,
    answers: Vec<WebpageFact>,
}

/// Ids of the records a [`Fixture`] created.
pub struct FixtureIds {
    pub run_id: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        let fact_set = FactSet {
            id: Uuid::new_v4(),
            fact_ids: Vec::new(),
        };
        Self {
            ruleset: Ruleset {
                id: Uuid::new_v4(),
                code: "window.ruleset = makeRuleset();".to_string(),
                fact_set_id: Some(fact_set.id),
            },
            facts: Vec::new(),
            fact_set: Some(fact_set),
            training_pages: Vec::new(),
            testing_pages: Vec::new(),
            answers: Vec::new(),
        }
    }

    /// Ruleset with no fact set attached.
    pub fn without_fact_set(mut self) -> Self {
        self.ruleset.fact_set_id = None;
        self.fact_set = None;
        self
    }

    pub fn fact(mut self, key: &str, fact_type: FactType) -> Self {
        let fact = Fact {
            id: Uuid::new_v4(),
            key: key.to_string(),
            question: format!("What is the {key}?"),
            fact_type,
        };
        if let Some(set) = self.fact_set.as_mut() {
            set.fact_ids.push(fact.id);
        }
        self.facts.push(fact);
        self
    }

    /// Training page with `(fact key, encoded answer)` labels.
    pub fn training_page(mut self, url: &str, answers: &[(&str, &str)]) -> Self {
        let page = self.page(url, answers);
        self.training_pages.push(page);
        self
    }

    pub fn testing_page(mut self, url: &str, answers: &[(&str, &str)]) -> Self {
        let page = self.page(url, answers);
        self.testing_pages.push(page);
        self
    }

    fn page(&mut self, url: &str, answers: &[(&str, &str)]) -> Webpage {
        let page = Webpage {
            id: Uuid::new_v4(),
            url: url.to_string(),
            frozen_html: format!("<html><body data-url=\"{url}\"></body></html>"),
        };
        for (key, encoded) in answers {
            let fact = self
                .facts
                .iter()
                .find(|f| f.key == *key)
                .unwrap_or_else(|| panic!("fixture fact {key} must be declared first"));
            self.answers.push(WebpageFact {
                webpage_id: page.id,
                fact_id: fact.id,
                fact_answer: encoded.to_string(),
            });
        }
        page
    }

    pub fn build(self) -> (MemoryStore, FixtureIds) {
        let run = TrainingRun {
            testing_page_ids: self.testing_pages.iter().map(|p| p.id).collect(),
            ..TrainingRun::new(
                self.ruleset.id,
                self.training_pages.iter().map(|p| p.id).collect(),
            )
        };
        let ids = FixtureIds { run_id: run.id };

        let data = StoreData {
            facts: self.facts,
            fact_sets: self.fact_set.into_iter().collect(),
            rulesets: vec![self.ruleset],
            webpages: self
                .training_pages
                .into_iter()
                .chain(self.testing_pages)
                .collect(),
            webpage_facts: self.answers,
            training_runs: vec![run],
        };
        (MemoryStore::new(data), ids)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
