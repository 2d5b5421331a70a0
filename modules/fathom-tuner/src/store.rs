//! Read/write access to rulesets, facts, pages and training runs.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_common::{
    CoefficientVector, Fact, FactSet, FathomError, Ruleset, TrainingRun, Webpage, WebpageFact,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Final result of a completed run, written back in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub coefficients: CoefficientVector,
    pub training_cost: f64,
    pub testing_cost: Option<f64>,
    pub trained_at: DateTime<Utc>,
}

/// The data store as seen by the tuner. Reads are point-in-time snapshots;
/// `save_result` is the only write.
#[async_trait]
pub trait TrainingStore: Send + Sync {
    async fn training_run(&self, id: Uuid) -> Result<TrainingRun, FathomError>;

    async fn ruleset(&self, id: Uuid) -> Result<Ruleset, FathomError>;

    /// Facts of a fact set, in the fact set's order.
    async fn facts(&self, fact_set_id: Uuid) -> Result<Vec<Fact>, FathomError>;

    async fn webpage(&self, id: Uuid) -> Result<Webpage, FathomError>;

    /// Recorded answers for a page, restricted to the given facts.
    async fn webpage_facts(
        &self,
        webpage_id: Uuid,
        fact_ids: &[Uuid],
    ) -> Result<Vec<WebpageFact>, FathomError>;

    async fn save_result(&self, run_id: Uuid, result: &TrainingResult)
        -> Result<(), FathomError>;
}

// --- MemoryStore ---

/// Serializable contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub fact_sets: Vec<FactSet>,
    #[serde(default)]
    pub rulesets: Vec<Ruleset>,
    #[serde(default)]
    pub webpages: Vec<Webpage>,
    #[serde(default)]
    pub webpage_facts: Vec<WebpageFact>,
    #[serde(default)]
    pub training_runs: Vec<TrainingRun>,
}

/// In-memory store, optionally backed by a JSON file. Thread-safe.
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new(data: StoreData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn load(path: &Path) -> Result<Self, FathomError> {
        let json = std::fs::read_to_string(path)?;
        let data: StoreData = serde_json::from_str(&json)?;
        Ok(Self::new(data))
    }

    pub fn save(&self, path: &Path) -> Result<(), FathomError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Copy of the current contents (for persistence and test assertions).
    pub fn snapshot(&self) -> StoreData {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreData> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreData::default())
    }
}

fn not_found(kind: &str, id: Uuid) -> FathomError {
    FathomError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl TrainingStore for MemoryStore {
    async fn training_run(&self, id: Uuid) -> Result<TrainingRun, FathomError> {
        self.lock()
            .training_runs
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| not_found("training run", id))
    }

    async fn ruleset(&self, id: Uuid) -> Result<Ruleset, FathomError> {
        self.lock()
            .rulesets
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| not_found("ruleset", id))
    }

    async fn facts(&self, fact_set_id: Uuid) -> Result<Vec<Fact>, FathomError> {
        let data = self.lock();
        let fact_set = data
            .fact_sets
            .iter()
            .find(|s| s.id == fact_set_id)
            .ok_or_else(|| not_found("fact set", fact_set_id))?;

        fact_set
            .fact_ids
            .iter()
            .map(|fact_id| {
                data.facts
                    .iter()
                    .find(|f| f.id == *fact_id)
                    .cloned()
                    .ok_or_else(|| not_found("fact", *fact_id))
            })
            .collect()
    }

    async fn webpage(&self, id: Uuid) -> Result<Webpage, FathomError> {
        self.lock()
            .webpages
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| not_found("webpage", id))
    }

    async fn webpage_facts(
        &self,
        webpage_id: Uuid,
        fact_ids: &[Uuid],
    ) -> Result<Vec<WebpageFact>, FathomError> {
        Ok(self
            .lock()
            .webpage_facts
            .iter()
            .filter(|wf| wf.webpage_id == webpage_id && fact_ids.contains(&wf.fact_id))
            .cloned()
            .collect())
    }

    async fn save_result(
        &self,
        run_id: Uuid,
        result: &TrainingResult,
    ) -> Result<(), FathomError> {
        let mut data = self.lock();
        let run = data
            .training_runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| not_found("training run", run_id))?;

        run.coefficients = Some(result.coefficients.clone());
        run.training_cost = Some(result.training_cost);
        run.testing_cost = result.testing_cost;
        run.trained_at = Some(result.trained_at);
        Ok(())
    }
}
