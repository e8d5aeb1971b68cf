//! Containers for assignment pools and their exhaustive solutions.

use serde::{Deserialize, Serialize};

/// A maximal connected component of the distribution/observation
/// candidacy graph.
///
/// No distribution in the pool has a candidate observation outside
/// `observations`, and no listed observation is a candidate of a
/// distribution outside `distributions`. This closure property is what
/// allows pools to be solved independently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentPool {
    /// Distribution unit indices, in discovery order.
    pub distributions: Vec<usize>,
    /// Observation indices reachable from the pool's distributions.
    pub observations: Vec<usize>,
}

impl AssignmentPool {
    pub fn n_distributions(&self) -> usize {
        self.distributions.len()
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }
}

/// Exhaustive solution of a single assignment pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSolution {
    /// Discovery index of the pool (stable under selective execution).
    pub index: usize,
    pub pool: AssignmentPool,
    /// Unique canonical global assignments, one observation index per pool
    /// distribution, in lexicographic order.
    pub assignments: Vec<Vec<usize>>,
    /// Normalized probability per assignment; sums to one over the pool.
    pub probabilities: Vec<f64>,
    /// Equivalence groups as indices local to the pool, one list per member.
    pub equivalence: Vec<Vec<usize>>,
}

/// Result of a full probabilistic assignment run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbabilisticAssignment {
    /// Expanded unit labels, aligned with all pool distribution indices.
    pub unit_labels: Vec<String>,
    /// Solved pools in discovery order; skipped pools are absent.
    pub pools: Vec<PoolSolution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes() {
        let pool = AssignmentPool {
            distributions: vec![0, 2, 3],
            observations: vec![1, 0],
        };
        assert_eq!(pool.n_distributions(), 3);
        assert_eq!(pool.n_observations(), 2);
    }
}
