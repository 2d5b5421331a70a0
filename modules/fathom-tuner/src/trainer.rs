//! Training run orchestration: assemble inputs, anneal, write back the result.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fathom_common::config::DEFAULT_EXECUTION_TIMEOUT_SECS;
use fathom_common::{CoefficientVector, DocumentRef, TrainingRun};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::anneal::{AnnealingConfig, AnnealingOutcome, AnnealingStats, Annealer};
use crate::cost::CostEvaluator;
use crate::environment::ExecutionEnvironment;
use crate::error::{Result, TunerError};
use crate::program::{parse_coefficients, LabeledPage, RulesetProgram};
use crate::store::{TrainingResult, TrainingStore};

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub annealing: AnnealingConfig,
    /// Bound on each execution-environment call.
    pub execution_timeout: Duration,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            annealing: AnnealingConfig::default(),
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
        }
    }
}

/// Outcome of a completed training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run_id: Uuid,
    pub coefficients: CoefficientVector,
    pub training_cost: f64,
    pub testing_cost: Option<f64>,
    pub stats: AnnealingStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Everything read from the store for one run.
struct TrainingInputs {
    run: TrainingRun,
    program: RulesetProgram,
    training_pages: Vec<LabeledPage>,
    testing_pages: Vec<LabeledPage>,
}

/// The single entry point for running a training job against a store.
pub struct Trainer<S: TrainingStore> {
    store: S,
    options: TrainingOptions,
    cancelled: Arc<AtomicBool>,
}

impl<S: TrainingStore> Trainer<S> {
    pub fn new(store: S, options: TrainingOptions) -> Self {
        Self {
            store,
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Set this flag to stop the run between candidate moves.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Train one run to completion and write the result back.
    ///
    /// `env` is owned for the whole run and closed on every exit path.
    /// Nothing is written unless the run completes. When `initial` is `None`
    /// the ruleset's declared defaults are the starting point.
    pub async fn train<E: ExecutionEnvironment>(
        &self,
        run_id: Uuid,
        mut env: E,
        initial: Option<CoefficientVector>,
    ) -> Result<TrainingReport> {
        let started_at = Utc::now();
        info!(run_id = %run_id, environment = env.name(), "Starting training run");

        let outcome = match self.assemble(run_id).await {
            Ok(inputs) => self
                .run_with(&mut env, &inputs, initial)
                .await
                .map(|result| (inputs, result)),
            Err(e) => Err(e),
        };

        if let Err(e) = env.close().await {
            warn!(run_id = %run_id, error = %e, "Failed to close execution environment");
        }

        let (inputs, (annealed, testing_cost)) = match outcome {
            Ok(done) => done,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Training run failed, nothing written");
                return Err(e);
            }
        };

        let finished_at = Utc::now();
        let result = TrainingResult {
            coefficients: annealed.best.clone(),
            training_cost: annealed.best_cost,
            testing_cost,
            trained_at: finished_at,
        };
        self.store.save_result(inputs.run.id, &result).await?;

        info!(
            run_id = %run_id,
            coefficients = %result.coefficients,
            training_cost = result.training_cost,
            testing_cost = ?result.testing_cost,
            "Training run complete"
        );

        Ok(TrainingReport {
            run_id,
            coefficients: annealed.best,
            training_cost: annealed.best_cost,
            testing_cost,
            stats: annealed.stats,
            started_at,
            finished_at,
        })
    }

    /// Read the run and its labeled pages, checking preconditions that
    /// need no execution environment.
    async fn assemble(&self, run_id: Uuid) -> Result<TrainingInputs> {
        let run = self.store.training_run(run_id).await?;
        if run.training_page_ids.is_empty() {
            return Err(TunerError::PreconditionViolation(format!(
                "training run {run_id} has no training pages"
            )));
        }

        let ruleset = self.store.ruleset(run.ruleset_id).await?;
        let facts = match ruleset.fact_set_id {
            Some(fact_set_id) => self.store.facts(fact_set_id).await?,
            None => Vec::new(),
        };
        let program = RulesetProgram::new(&ruleset, &facts)?;

        let fact_ids: Vec<Uuid> = facts.iter().map(|f| f.id).collect();
        let keys_by_id: HashMap<Uuid, String> =
            facts.iter().map(|f| (f.id, f.key.clone())).collect();

        let mut training_pages = Vec::with_capacity(run.training_page_ids.len());
        for page_id in &run.training_page_ids {
            training_pages.push(self.labeled_page(*page_id, &fact_ids, &keys_by_id).await?);
        }
        let mut testing_pages = Vec::with_capacity(run.testing_page_ids.len());
        for page_id in &run.testing_page_ids {
            testing_pages.push(self.labeled_page(*page_id, &fact_ids, &keys_by_id).await?);
        }

        info!(
            run_id = %run_id,
            facts = program.facts().len(),
            training_pages = training_pages.len(),
            testing_pages = testing_pages.len(),
            "Assembled training inputs"
        );

        Ok(TrainingInputs {
            run,
            program,
            training_pages,
            testing_pages,
        })
    }

    async fn labeled_page(
        &self,
        page_id: Uuid,
        fact_ids: &[Uuid],
        keys_by_id: &HashMap<Uuid, String>,
    ) -> Result<LabeledPage> {
        let webpage = self.store.webpage(page_id).await?;
        let mut page = LabeledPage::new(webpage.id, webpage.document());
        for answer in self.store.webpage_facts(page_id, fact_ids).await? {
            if let Some(key) = keys_by_id.get(&answer.fact_id) {
                page = page.with_answer(key, &answer.fact_answer);
            }
        }
        Ok(page)
    }

    async fn run_with<E: ExecutionEnvironment>(
        &self,
        env: &mut E,
        inputs: &TrainingInputs,
        initial: Option<CoefficientVector>,
    ) -> Result<(AnnealingOutcome, Option<f64>)> {
        let declared = self.declared_coefficients(env, &inputs.program).await?;
        let initial = match initial {
            Some(supplied) if supplied.len() != declared.len() => {
                return Err(TunerError::PreconditionViolation(format!(
                    "ruleset declares {} coefficients but {} were supplied",
                    declared.len(),
                    supplied.len()
                )));
            }
            Some(supplied) => supplied,
            None => declared,
        };

        let timeout = self.options.execution_timeout;
        let mut annealer =
            Annealer::new(self.options.annealing.clone()).with_cancel_flag(self.cancelled.clone());

        let annealed = {
            let mut evaluator = CostEvaluator::new(
                &mut *env,
                &inputs.program,
                &inputs.training_pages,
                timeout,
            )?;
            let annealed = annealer.anneal(initial, &mut evaluator).await?;
            info!(
                page_executions = evaluator.evaluations(),
                "Training corpus evaluation finished"
            );
            annealed
        };

        let testing_cost = if inputs.testing_pages.is_empty() {
            None
        } else {
            let mut evaluator = CostEvaluator::new(
                &mut *env,
                &inputs.program,
                &inputs.testing_pages,
                timeout,
            )?;
            Some(evaluator.evaluate(&annealed.best).await?)
        };

        Ok((annealed, testing_cost))
    }

    /// Ask the ruleset for its default coefficients on a blank document.
    async fn declared_coefficients<E: ExecutionEnvironment>(
        &self,
        env: &mut E,
        program: &RulesetProgram,
    ) -> Result<CoefficientVector> {
        env.load(&DocumentRef::Blank).await?;
        let value = env
            .run(
                &program.initial_coefficients_script(),
                &[],
                self.options.execution_timeout,
            )
            .await?;
        parse_coefficients(&value)
    }
}
