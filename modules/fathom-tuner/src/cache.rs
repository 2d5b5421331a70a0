//! Per-run memo of already-scored solutions.

use std::collections::HashMap;

use fathom_common::CoefficientVector;

use crate::cost::CostFunction;
use crate::error::Result;

/// Costs keyed by the exact value of a coefficient vector.
///
/// Owned by one annealing run and dropped with it. The walk revisits the same
/// lattice points constantly, so a hit here saves a full pass over the corpus.
#[derive(Debug, Default)]
pub struct SolutionCache {
    costs: HashMap<CoefficientVector, f64>,
    hits: u64,
    misses: u64,
}

impl SolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached cost, or compute it once and remember it.
    /// Errors are propagated and nothing is stored for the solution.
    pub async fn get_or_compute<C>(
        &mut self,
        solution: &CoefficientVector,
        compute: &mut C,
    ) -> Result<f64>
    where
        C: CostFunction + ?Sized,
    {
        if let Some(cost) = self.costs.get(solution) {
            self.hits += 1;
            return Ok(*cost);
        }

        let cost = compute.cost(solution).await?;
        self.misses += 1;
        self.costs.insert(solution.clone(), cost);
        Ok(cost)
    }

    pub fn len(&self) -> usize {
        self.costs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunerError;
    use crate::testing::LandscapeCost;

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let mut cost = LandscapeCost::new(|v| v[0] / 10.0);
        let mut cache = SolutionCache::new();
        let v = CoefficientVector::new(vec![3.0]);

        let first = cache.get_or_compute(&v, &mut cost).await.unwrap();
        let second = cache.get_or_compute(&v, &mut cost).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cost.calls(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn distinct_but_equal_vectors_share_an_entry() {
        let mut cost = LandscapeCost::new(|v| v.iter().sum::<f64>() / 100.0);
        let mut cache = SolutionCache::new();

        let a = CoefficientVector::new(vec![1.0, 2.0]);
        let b = CoefficientVector::new(vec![1.0, 2.0]);
        cache.get_or_compute(&a, &mut cost).await.unwrap();
        cache.get_or_compute(&b, &mut cost).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cost.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let mut cost = LandscapeCost::failing(|| {
            TunerError::ExecutionFault("renderer crashed".to_string())
        });
        let mut cache = SolutionCache::new();
        let v = CoefficientVector::new(vec![1.0]);

        assert!(cache.get_or_compute(&v, &mut cost).await.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 0);

        // Nothing was remembered, so the retry computes again.
        assert!(cache.get_or_compute(&v, &mut cost).await.is_err());
        assert_eq!(cost.calls(), 2);
    }
}
