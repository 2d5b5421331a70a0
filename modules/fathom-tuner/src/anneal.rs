//! Simulated annealing over the integer lattice of coefficient vectors.
//!
//! Classic Kirkpatrick schedule: a geometric cooling of the temperature, a
//! bounded number of single-coordinate ±1 moves per temperature, Metropolis
//! acceptance of non-improving moves, and memoized cost lookups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fathom_common::CoefficientVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::SolutionCache;
use crate::cost::CostFunction;
use crate::error::{Result, TunerError};

/// Boltzmann's constant. Changing it changes which worse moves get accepted.
pub const BOLTZMANN_CONSTANT: f64 = 1.3806485279e-23;

/// Schedule parameters for one annealing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingConfig {
    pub initial_temperature: f64,
    pub cooling_steps: u32,
    /// Multiplicative decay applied to the temperature after each cooling step.
    pub cooling_fraction: f64,
    pub steps_per_temp: u32,
    pub boltzmann_constant: f64,
    /// Fixed RNG seed for reproducible runs. Seeded from the OS when unset.
    pub seed: Option<u64>,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            initial_temperature: 5000.0,
            cooling_steps: 5000,
            cooling_fraction: 0.95,
            steps_per_temp: 1000,
            boltzmann_constant: BOLTZMANN_CONSTANT,
            seed: None,
        }
    }
}

impl AnnealingConfig {
    fn validate(&self) -> Result<()> {
        if !(self.initial_temperature.is_finite() && self.initial_temperature > 0.0) {
            return Err(TunerError::PreconditionViolation(format!(
                "initial temperature must be positive, got {}",
                self.initial_temperature
            )));
        }
        if !(self.cooling_fraction > 0.0 && self.cooling_fraction <= 1.0) {
            return Err(TunerError::PreconditionViolation(format!(
                "cooling fraction must be in (0, 1], got {}",
                self.cooling_fraction
            )));
        }
        if !(self.boltzmann_constant.is_finite() && self.boltzmann_constant > 0.0) {
            return Err(TunerError::PreconditionViolation(format!(
                "boltzmann constant must be positive, got {}",
                self.boltzmann_constant
            )));
        }
        Ok(())
    }
}

/// Counters collected over one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnealingStats {
    pub cooling_steps_run: u32,
    pub transitions: u64,
    pub accepted_worse: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Best cost after each cooling step. Never increases.
    pub best_cost_history: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnealingOutcome {
    pub best: CoefficientVector,
    pub best_cost: f64,
    pub stats: AnnealingStats,
}

/// Mutable walk state. Lives only inside [`Annealer::anneal`].
struct AnnealingState {
    temperature: f64,
    current: CoefficientVector,
    current_cost: f64,
    best: CoefficientVector,
    best_cost: f64,
}

impl AnnealingState {
    fn accept(&mut self, candidate: CoefficientVector, cost: f64) {
        if cost < self.best_cost {
            self.best = candidate.clone();
            self.best_cost = cost;
        }
        self.current = candidate;
        self.current_cost = cost;
    }
}

/// Probability of moving to a candidate that is not an improvement.
///
/// `delta` is `current_cost - candidate_cost` and so is never positive here.
/// Equal-cost moves always have probability 1.
pub fn acceptance_probability(delta: f64, boltzmann_constant: f64, temperature: f64) -> f64 {
    (delta / (boltzmann_constant * temperature)).exp()
}

pub struct Annealer {
    config: AnnealingConfig,
    rng: StdRng,
    cancelled: Arc<AtomicBool>,
}

impl Annealer {
    pub fn new(config: AnnealingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            rng,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag. Checked before every candidate move.
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Copy of `solution` with one uniformly chosen element moved by ±1.
    pub fn random_transition(&mut self, solution: &CoefficientVector) -> CoefficientVector {
        let index = self.rng.random_range(0..solution.len());
        let direction = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
        solution.nudged(index, direction)
    }

    /// Search for the lowest-cost solution reachable from `initial`.
    ///
    /// Returns the best solution seen, which may differ from where the walk ended.
    pub async fn anneal<C>(
        &mut self,
        initial: CoefficientVector,
        cost_fn: &mut C,
    ) -> Result<AnnealingOutcome>
    where
        C: CostFunction + ?Sized,
    {
        self.config.validate()?;
        if initial.is_empty() {
            return Err(TunerError::PreconditionViolation(
                "cannot anneal an empty coefficient vector".to_string(),
            ));
        }
        if let Some(index) = initial.first_non_finite() {
            return Err(TunerError::PreconditionViolation(format!(
                "initial coefficient {index} is not finite: {initial}"
            )));
        }

        info!(
            initial = %initial,
            dimensions = initial.len(),
            initial_temperature = self.config.initial_temperature,
            cooling_steps = self.config.cooling_steps,
            steps_per_temp = self.config.steps_per_temp,
            "Starting annealing run"
        );

        let mut cache = SolutionCache::new();
        let mut stats = AnnealingStats::default();

        let initial_cost = cache.get_or_compute(&initial, cost_fn).await?;
        let mut state = AnnealingState {
            temperature: self.config.initial_temperature,
            current: initial.clone(),
            current_cost: initial_cost,
            best: initial,
            best_cost: initial_cost,
        };

        for step in 0..self.config.cooling_steps {
            let start_cost = state.current_cost;

            for _ in 0..self.config.steps_per_temp {
                if self.cancelled.load(Ordering::Relaxed) {
                    info!(cooling_step = step, "Annealing run cancelled");
                    return Err(TunerError::Cancelled);
                }

                let candidate = self.random_transition(&state.current);
                let candidate_cost = cache.get_or_compute(&candidate, cost_fn).await?;
                stats.transitions += 1;

                if candidate_cost < state.current_cost {
                    state.accept(candidate, candidate_cost);
                } else {
                    let delta = state.current_cost - candidate_cost;
                    let merit = acceptance_probability(
                        delta,
                        self.config.boltzmann_constant,
                        state.temperature,
                    );
                    if merit > self.rng.random::<f64>() {
                        if candidate_cost > state.current_cost {
                            stats.accepted_worse += 1;
                        }
                        state.accept(candidate, candidate_cost);
                    }
                }

                // Not moving at this temperature.
                if state.current_cost == start_cost {
                    break;
                }
            }

            state.temperature *= self.config.cooling_fraction;
            stats.cooling_steps_run += 1;
            stats.best_cost_history.push(state.best_cost);

            debug!(
                cooling_step = step,
                temperature = state.temperature,
                current_cost = state.current_cost,
                best_cost = state.best_cost,
                "Cooling step complete"
            );
        }

        stats.cache_hits = cache.hits();
        stats.cache_misses = cache.misses();

        info!(
            best = %state.best,
            best_cost = state.best_cost,
            transitions = stats.transitions,
            cache_entries = cache.len(),
            cache_hits = stats.cache_hits,
            "Annealing run complete"
        );

        Ok(AnnealingOutcome {
            best: state.best,
            best_cost: state.best_cost,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LandscapeCost;

    fn seeded(seed: u64) -> AnnealingConfig {
        AnnealingConfig {
            seed: Some(seed),
            ..AnnealingConfig::default()
        }
    }

    #[test]
    fn defaults_are_the_classic_schedule() {
        let config = AnnealingConfig::default();
        assert_eq!(config.initial_temperature, 5000.0);
        assert_eq!(config.cooling_steps, 5000);
        assert_eq!(config.cooling_fraction, 0.95);
        assert_eq!(config.steps_per_temp, 1000);
        assert_eq!(config.boltzmann_constant, 1.3806485279e-23);
    }

    #[test]
    fn transition_moves_one_coordinate_by_one() {
        let mut annealer = Annealer::new(seeded(11));
        let v = CoefficientVector::new(vec![3.0, -1.0, 0.5, 10.0]);

        for _ in 0..500 {
            let next = annealer.random_transition(&v);
            assert_eq!(next.len(), v.len());
            let changed: Vec<f64> = v
                .as_slice()
                .iter()
                .zip(next.as_slice())
                .map(|(a, b)| b - a)
                .filter(|d| *d != 0.0)
                .collect();
            assert_eq!(changed.len(), 1);
            assert_eq!(changed[0].abs(), 1.0);
        }
    }

    #[test]
    fn transition_reaches_every_index_and_both_directions() {
        let mut annealer = Annealer::new(seeded(5));
        let v = CoefficientVector::new(vec![0.0, 0.0, 0.0]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            seen.insert(annealer.random_transition(&v));
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn acceptance_of_equal_and_worse_moves() {
        assert_eq!(acceptance_probability(0.0, BOLTZMANN_CONSTANT, 5000.0), 1.0);
        assert_eq!(
            acceptance_probability(-1.0 / 3.0, BOLTZMANN_CONSTANT, 5000.0),
            0.0
        );
        let p = acceptance_probability(-1.0, 1.0, 2.0);
        assert!((p - (-0.5f64).exp()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn descends_to_the_minimum() {
        // V-shaped landscape around [5, -2].
        let mut cost = LandscapeCost::new(|v| {
            ((v[0] - 5.0).abs() + (v[1] + 2.0).abs()).min(10.0) / 10.0
        });
        let mut annealer = Annealer::new(AnnealingConfig {
            cooling_steps: 200,
            steps_per_temp: 50,
            ..seeded(42)
        });

        let outcome = annealer
            .anneal(CoefficientVector::new(vec![2.0, 1.0]), &mut cost)
            .await
            .unwrap();

        assert_eq!(outcome.best.as_slice(), &[5.0, -2.0]);
        assert_eq!(outcome.best_cost, 0.0);
    }

    #[tokio::test]
    async fn best_cost_never_increases() {
        // Accept worse moves often so the current cost wanders.
        let mut cost = LandscapeCost::new(|v| ((v[0] * 0.7).sin() + 1.0) / 2.0);
        let mut annealer = Annealer::new(AnnealingConfig {
            initial_temperature: 1.0,
            boltzmann_constant: 1.0,
            cooling_steps: 300,
            steps_per_temp: 20,
            ..seeded(3)
        });

        let outcome = annealer
            .anneal(CoefficientVector::new(vec![0.0]), &mut cost)
            .await
            .unwrap();

        let history = &outcome.stats.best_cost_history;
        assert_eq!(history.len(), 300);
        assert!(history.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*history.last().unwrap(), outcome.best_cost);
        assert!(outcome.stats.accepted_worse > 0);
        assert!((0.0..=1.0).contains(&outcome.best_cost));
    }

    #[tokio::test]
    async fn revisits_are_served_from_cache() {
        let mut cost = LandscapeCost::new(|_| 0.5);
        let mut annealer = Annealer::new(AnnealingConfig {
            cooling_steps: 100,
            steps_per_temp: 10,
            ..seeded(9)
        });

        let outcome = annealer
            .anneal(CoefficientVector::new(vec![0.0]), &mut cost)
            .await
            .unwrap();

        assert_eq!(cost.calls() as u64, outcome.stats.cache_misses);
        assert_eq!(
            outcome.stats.cache_hits + outcome.stats.cache_misses,
            outcome.stats.transitions + 1
        );
        assert!(outcome.stats.cache_hits > 0);
    }

    #[tokio::test]
    async fn flat_landscape_breaks_after_one_move_per_temperature() {
        // Every move is accepted but the cost never changes, so each
        // temperature stops after a single move.
        let mut cost = LandscapeCost::new(|_| 1.0);
        let mut annealer = Annealer::new(AnnealingConfig {
            cooling_steps: 25,
            ..seeded(1)
        });

        let outcome = annealer
            .anneal(CoefficientVector::new(vec![0.0, 0.0]), &mut cost)
            .await
            .unwrap();

        assert_eq!(outcome.stats.transitions, 25);
        assert_eq!(outcome.best.as_slice(), &[0.0, 0.0]);
    }

    #[tokio::test]
    async fn empty_vector_is_rejected_before_evaluation() {
        let mut cost = LandscapeCost::new(|_| 0.0);
        let mut annealer = Annealer::new(seeded(0));

        let err = annealer
            .anneal(CoefficientVector::default(), &mut cost)
            .await
            .unwrap_err();

        assert!(matches!(err, TunerError::PreconditionViolation(_)));
        assert_eq!(cost.calls(), 0);
    }

    #[tokio::test]
    async fn non_finite_coefficients_are_rejected() {
        let mut cost = LandscapeCost::new(|_| 0.0);
        let mut annealer = Annealer::new(seeded(0));

        let err = annealer
            .anneal(CoefficientVector::new(vec![1.0, f64::NAN]), &mut cost)
            .await
            .unwrap_err();

        assert!(matches!(err, TunerError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected() {
        let mut cost = LandscapeCost::new(|_| 0.0);
        let mut annealer = Annealer::new(AnnealingConfig {
            cooling_fraction: 1.5,
            ..seeded(0)
        });

        let err = annealer
            .anneal(CoefficientVector::new(vec![1.0]), &mut cost)
            .await
            .unwrap_err();

        assert!(matches!(err, TunerError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn cost_errors_abort_the_run() {
        let mut cost = LandscapeCost::failing(|| TunerError::ExecutionTimeout {
            timeout: std::time::Duration::from_secs(120),
        });
        let mut annealer = Annealer::new(seeded(0));

        let err = annealer
            .anneal(CoefficientVector::new(vec![1.0]), &mut cost)
            .await
            .unwrap_err();

        assert!(matches!(err, TunerError::ExecutionTimeout { .. }));
    }

    #[tokio::test]
    async fn cancelled_flag_stops_the_run() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut cost = LandscapeCost::new(|_| 0.5);
        let mut annealer = Annealer::new(seeded(0)).with_cancel_flag(flag);

        let err = annealer
            .anneal(CoefficientVector::new(vec![1.0]), &mut cost)
            .await
            .unwrap_err();

        assert!(matches!(err, TunerError::Cancelled));
    }
}
