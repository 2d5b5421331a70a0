//! Coefficient tuning for Fathom rulesets.
//!
//! A ruleset is scored by running it against a corpus of labeled pages in an
//! [`ExecutionEnvironment`]; its cost is the fraction of pages it gets wrong.
//! [`Annealer`] walks the integer lattice of coefficient vectors to minimise
//! that cost, and [`Trainer`] wires a stored training run through the search
//! and writes the best vector back.

pub mod anneal;
pub mod browserless;
pub mod cache;
pub mod cost;
pub mod environment;
pub mod error;
pub mod program;
pub mod store;
pub mod trainer;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use anneal::{AnnealingConfig, AnnealingOutcome, AnnealingStats, Annealer};
pub use browserless::BrowserlessEnvironment;
pub use cache::SolutionCache;
pub use cost::{CostEvaluator, CostFunction};
pub use environment::ExecutionEnvironment;
pub use error::{ExecutionError, TunerError};
pub use program::{LabeledPage, RulesetProgram};
pub use store::{MemoryStore, StoreData, TrainingResult, TrainingStore};
pub use trainer::{Trainer, TrainingOptions, TrainingReport};
