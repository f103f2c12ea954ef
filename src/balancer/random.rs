/// Weighted random selection
use super::{available, LoadBalancingAlgorithm, Members};
use crate::core::NodeAttribute;
use rand::Rng;
use std::sync::Arc;

/// Draws one point from the cumulative weight domain of the available members.
///
/// When every available member has weight 0 the draw is uniform.
#[derive(Debug, Clone, Default)]
pub struct WeightRandom;

impl WeightRandom {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingAlgorithm for WeightRandom {
    fn select(&self, members: &Members) -> Option<Arc<NodeAttribute>> {
        let candidates = available(members);
        match candidates.len() {
            0 => return None,
            1 => return Some(Arc::clone(candidates[0])),
            _ => {}
        }

        let mut rng = rand::thread_rng();
        let total_weight: u64 = candidates.iter().map(|c| c.weight() as u64).sum();
        if total_weight == 0 {
            let index = rng.gen_range(0..candidates.len());
            return Some(Arc::clone(candidates[index]));
        }

        let point = rng.gen_range(0..total_weight);
        let mut cumulative = 0u64;
        for candidate in &candidates {
            cumulative += candidate.weight() as u64;
            if point < cumulative {
                return Some(Arc::clone(candidate));
            }
        }

        // Weights changed between the sum and the scan
        candidates.last().map(|c| Arc::clone(c))
    }
}
