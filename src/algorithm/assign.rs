//! Top-level orchestration of the probabilistic assignment pipeline.
//!
//! Expands equivalence-composite labels into search units, partitions the
//! units into independent pools, runs the exhaustive generator per pool
//! (in parallel, since pools are disjoint candidate closures), and folds
//! the raw assignment lists into deduplicated, normalized solutions.

use log::debug;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::algorithm::partition::extract_pool;
use crate::algorithm::prune::{prune_candidates, PruneOpts};
use crate::algorithm::search::{generate_global_assignments, BranchOrder, SearchOpts};
use crate::algorithm::utility::{inverse_permutation, kahan_sum};
use crate::data::label::{
    expand_equivalent_labels, observation_coordinates, Coordinate, ExpandedUnits,
};
use crate::data::pool::{AssignmentPool, PoolSolution, ProbabilisticAssignment};
use crate::error::{AssignmentError, Result};

/// Orchestration configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssignOpts {
    /// Order in which pool distributions enter the search tree.
    pub order: BranchOrder,
    pub search: SearchOpts,
    /// Solve only these pools (by discovery index); `None` solves all.
    /// Unselected pools are still partitioned and consumed.
    pub pool_selection: Option<Vec<usize>>,
}

/// Run the full assignment given per-distribution candidate sets.
///
/// Candidate sets are per raw label (pre-expansion), as produced by
/// [`prune_candidates`]. Returns one [`PoolSolution`] per solved pool, in
/// discovery order, together with the expanded unit label list.
pub fn probabilistic_assignment(
    scores: &DMatrix<f64>,
    candidates: &[Vec<usize>],
    labels: &[String],
    observation_labels: &[String],
    opts: &AssignOpts,
) -> Result<ProbabilisticAssignment> {
    if scores.nrows() != labels.len()
        || scores.ncols() != observation_labels.len()
        || candidates.len() != labels.len()
    {
        return Err(AssignmentError::ShapeMismatch {
            rows: scores.nrows(),
            cols: scores.ncols(),
            labels: labels.len(),
            observations: observation_labels.len(),
        });
    }

    let units = expand_equivalent_labels(labels);
    let obs_coords = observation_coordinates(observation_labels);

    // Unit-level views: equivalent units share their raw label's row.
    let unit_candidates: Vec<Vec<usize>> = units
        .source_rows
        .iter()
        .map(|&row| candidates[row].clone())
        .collect();
    let unit_scores = scores.select_rows(units.source_rows.iter());

    // Partition everything first; selection only decides what gets solved.
    let mut assigned = vec![false; units.len()];
    let mut pools: Vec<AssignmentPool> = Vec::new();
    while assigned.iter().any(|&done| !done) {
        let pool = extract_pool(&unit_candidates, &assigned);
        for &u in &pool.distributions {
            assigned[u] = true;
        }
        pools.push(pool);
    }

    let solutions: Vec<PoolSolution> = pools
        .par_iter()
        .enumerate()
        .filter(|(index, _)| {
            opts.pool_selection
                .as_ref()
                .map_or(true, |selected| selected.contains(index))
        })
        .map(|(index, pool)| {
            solve_pool(
                index,
                pool,
                &unit_candidates,
                &unit_scores,
                &units,
                &obs_coords,
                opts,
            )
        })
        .collect();

    Ok(ProbabilisticAssignment {
        unit_labels: units.labels,
        pools: solutions,
    })
}

/// Prune, then assign: the convenience entry over raw scores and labels.
pub fn probabilistic_assignment_end_to_end(
    scores: &DMatrix<f64>,
    labels: &[String],
    observation_labels: &[String],
    prune_opts: &PruneOpts,
    assign_opts: &AssignOpts,
) -> Result<ProbabilisticAssignment> {
    let pruned = prune_candidates(scores, labels, observation_labels, prune_opts);
    probabilistic_assignment(
        scores,
        &pruned.candidates,
        labels,
        observation_labels,
        assign_opts,
    )
}

fn solve_pool(
    index: usize,
    pool: &AssignmentPool,
    unit_candidates: &[Vec<usize>],
    unit_scores: &DMatrix<f64>,
    units: &ExpandedUnits,
    obs_coords: &[Vec<String>],
    opts: &AssignOpts,
) -> PoolSolution {
    let local_candidates: Vec<Vec<usize>> = pool
        .distributions
        .iter()
        .map(|&u| unit_candidates[u].clone())
        .collect();

    // Single sort-key strategy plus a permutation table; results are mapped
    // back to caller order below.
    let perm = opts.order.permutation(&local_candidates);
    let inverse = inverse_permutation(&perm);

    let ordered_units: Vec<usize> = perm.iter().map(|&p| pool.distributions[p]).collect();
    let ordered_candidates: Vec<Vec<usize>> =
        perm.iter().map(|&p| local_candidates[p].clone()).collect();
    let ordered_scores = unit_scores.select_rows(ordered_units.iter());
    let ordered_coordinates: Vec<Vec<Coordinate>> = ordered_units
        .iter()
        .map(|&u| units.coordinates[u].clone())
        .collect();
    let ordered_equivalence: Vec<Vec<usize>> = ordered_units
        .iter()
        .map(|&u| {
            units.equivalence[u]
                .iter()
                .map(|&member| position_of(&ordered_units, member))
                .collect()
        })
        .collect();

    debug!(
        "assigning {} distributions to {} observations in pool {}",
        pool.n_distributions(),
        pool.n_observations(),
        index
    );

    let raw = generate_global_assignments(
        &ordered_candidates,
        &ordered_scores,
        pool.n_observations(),
        &ordered_coordinates,
        obs_coords,
        &ordered_equivalence,
        &opts.search,
    );

    let mut assignments: Vec<Vec<usize>> = raw
        .into_iter()
        .map(|assignment| {
            (0..assignment.len())
                .map(|position| assignment[inverse[position]])
                .collect()
        })
        .collect();
    assignments.sort_unstable();
    assignments.dedup();

    let raw_scores: Vec<f64> = assignments
        .iter()
        .map(|assignment| {
            assignment
                .iter()
                .enumerate()
                .map(|(i, &a)| unit_scores[(pool.distributions[i], a)])
                .product()
        })
        .collect();
    let total = kahan_sum(&raw_scores);
    let probabilities: Vec<f64> = if total > 0.0 {
        raw_scores.iter().map(|score| score / total).collect()
    } else {
        vec![0.0; raw_scores.len()]
    };

    debug!(
        "{} unique global assignments in pool {}",
        assignments.len(),
        index
    );

    let equivalence: Vec<Vec<usize>> = pool
        .distributions
        .iter()
        .map(|&u| {
            units.equivalence[u]
                .iter()
                .map(|&member| position_of(&pool.distributions, member))
                .collect()
        })
        .collect();

    PoolSolution {
        index,
        pool: pool.clone(),
        assignments,
        probabilities,
        equivalence,
    }
}

#[inline]
fn position_of(list: &[usize], value: usize) -> usize {
    list.iter()
        .position(|&x| x == value)
        .expect("equivalent units must share one pool")
}

/// Accumulated per-multiplet assignment probabilities.
///
/// For every unit, the total probability of each canonical observation
/// tuple taken by the unit's equivalence multiplet across all global
/// assignments of its pool. Units of the same multiplet share identical
/// maps. Input for individual-probability reporting downstream.
pub fn split_assignment_probabilities(
    result: &ProbabilisticAssignment,
) -> Vec<BTreeMap<Vec<usize>, f64>> {
    let mut per_unit: Vec<BTreeMap<Vec<usize>, f64>> =
        vec![BTreeMap::new(); result.unit_labels.len()];

    for solution in &result.pools {
        let mut done: HashSet<usize> = HashSet::new();
        for group in &solution.equivalence {
            if done.contains(&group[0]) {
                continue;
            }
            done.extend(group.iter().copied());

            for (assignment, &probability) in
                solution.assignments.iter().zip(&solution.probabilities)
            {
                let tuple: Vec<usize> =
                    group.iter().map(|&member| assignment[member]).collect();
                for &member in group {
                    let unit = solution.pool.distributions[member];
                    *per_unit[unit].entry(tuple.clone()).or_insert(0.0) += probability;
                }
            }
        }
    }

    per_unit
}
