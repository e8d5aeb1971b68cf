//! Exhaustive generation of valid global assignments within one pool.
//!
//! Depth-first enumeration over distribution ranks: at each rank every
//! still-plausible candidate observation is scored against the partial
//! assignment, invalid or zero-score branches are dropped, and the
//! remainder is explored best-first. The traversal keeps an explicit frame
//! stack instead of recursing, so pool size never threatens the call
//! stack.

use itertools::Itertools;
use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::str::FromStr;

use crate::data::label::Coordinate;
use crate::error::AssignmentError;

/// Search configuration for one pool.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SearchOpts {
    /// Keep only the `max_asn` best-scoring candidates per rank. A greedy
    /// beam restriction that trades completeness for tractability on wide
    /// pools.
    pub max_asn: Option<usize>,
    /// Rank from which the breadth cap applies.
    pub r_max_asn: usize,
    /// No single observation may take more than `max_excess + 1`
    /// distributions.
    pub max_excess: Option<usize>,
}

/// Order in which a pool's distributions are fed to the generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchOrder {
    /// Keep the caller-supplied distribution order.
    #[default]
    AsGiven,
    /// Most constrained first: fewest candidates at the top of the tree.
    Increasing,
    /// Widest first: most candidates at the top of the tree.
    Decreasing,
}

impl BranchOrder {
    /// Permutation of pool-local positions realizing this order.
    pub fn permutation(&self, candidates: &[Vec<usize>]) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..candidates.len()).collect();
        match self {
            BranchOrder::AsGiven => {}
            BranchOrder::Increasing => perm.sort_by_key(|&i| candidates[i].len()),
            BranchOrder::Decreasing => perm.sort_by_key(|&i| Reverse(candidates[i].len())),
        }
        perm
    }
}

impl FromStr for BranchOrder {
    type Err = AssignmentError;

    fn from_str(s: &str) -> Result<BranchOrder, AssignmentError> {
        match s {
            "default" => Ok(BranchOrder::AsGiven),
            "increase" => Ok(BranchOrder::Increasing),
            "decrease" => Ok(BranchOrder::Decreasing),
            _ => Err(AssignmentError::UnknownBranchOrder(s.to_string())),
        }
    }
}

/// Generate every valid complete assignment for one pool.
///
/// `candidates` holds the ordered candidate observations per pool
/// distribution, `scores` the matching score rows (columns indexed by
/// global observation index), `n_observations` the pool's observation
/// count, and `equivalence` the pool-local group member lists. Returned
/// assignments are canonicalized; duplicates from permuted equivalence
/// branches are left for the caller to collapse.
pub fn generate_global_assignments(
    candidates: &[Vec<usize>],
    scores: &DMatrix<f64>,
    n_observations: usize,
    coordinates: &[Vec<Coordinate>],
    observation_coords: &[Vec<String>],
    equivalence: &[Vec<usize>],
    opts: &SearchOpts,
) -> Vec<Vec<usize>> {
    let n_dist = candidates.len();
    if n_dist == 0 {
        return Vec::new();
    }
    // Tolerable many-to-one overlap; capped at zero when observations
    // outnumber distributions.
    let excess_capacity = n_dist.saturating_sub(n_observations);

    struct Frame {
        choices: Vec<usize>,
        next: usize,
    }

    let mut results: Vec<Vec<usize>> = Vec::new();
    let mut partial: Vec<usize> = Vec::with_capacity(n_dist);
    let mut stack: Vec<Frame> = Vec::with_capacity(n_dist);

    stack.push(Frame {
        choices: ranked_choices(
            0,
            &partial,
            candidates,
            scores,
            excess_capacity,
            coordinates,
            observation_coords,
            opts,
        ),
        next: 0,
    });

    while let Some(frame) = stack.last_mut() {
        if frame.next >= frame.choices.len() {
            stack.pop();
            partial.pop();
            continue;
        }
        let choice = frame.choices[frame.next];
        frame.next += 1;
        partial.push(choice);

        if partial.len() == n_dist {
            results.push(canonicalize_assignment(&partial, equivalence));
            partial.pop();
            continue;
        }

        let rank = partial.len();
        stack.push(Frame {
            choices: ranked_choices(
                rank,
                &partial,
                candidates,
                scores,
                excess_capacity,
                coordinates,
                observation_coords,
                opts,
            ),
            next: 0,
        });
    }

    results
}

/// Feasible candidates for `rank`, best partial score first, zero-score
/// branches dropped, truncated to the breadth cap when it applies.
fn ranked_choices(
    rank: usize,
    partial: &[usize],
    candidates: &[Vec<usize>],
    scores: &DMatrix<f64>,
    excess_capacity: usize,
    coordinates: &[Vec<Coordinate>],
    observation_coords: &[Vec<String>],
    opts: &SearchOpts,
) -> Vec<usize> {
    let mut trial = Vec::with_capacity(partial.len() + 1);
    trial.extend_from_slice(partial);
    trial.push(0);

    let mut scored: Vec<(usize, f64)> = Vec::with_capacity(candidates[rank].len());
    for &candidate in &candidates[rank] {
        *trial.last_mut().unwrap() = candidate;
        if !partial_is_valid(
            &trial,
            excess_capacity,
            opts.max_excess,
            coordinates,
            observation_coords,
        ) {
            continue;
        }
        let score: f64 = trial
            .iter()
            .enumerate()
            .map(|(i, &a)| scores[(i, a)])
            .product();
        if score > 0.0 {
            scored.push((candidate, score));
        }
    }

    scored.sort_by_key(|&(_, score)| Reverse(OrderedFloat(score)));
    if let Some(cap) = opts.max_asn {
        if rank >= opts.r_max_asn {
            scored.truncate(cap);
        }
    }
    scored.into_iter().map(|(candidate, _)| candidate).collect()
}

/// Excess and cross-coordinate consistency checks for a partial assignment.
fn partial_is_valid(
    partial: &[usize],
    excess_capacity: usize,
    max_excess: Option<usize>,
    coordinates: &[Vec<Coordinate>],
    observation_coords: &[Vec<String>],
) -> bool {
    let counts = partial.iter().copied().counts();
    let excess: usize = counts.values().map(|&c| c - 1).sum();
    if excess > excess_capacity {
        return false;
    }
    if let Some(cap) = max_excess {
        let individual_excess = counts.values().map(|&c| c - 1).max().unwrap_or(0);
        if individual_excess > cap {
            return false;
        }
    }

    // Units addressing the same physical site on some coordinate must agree
    // on that coordinate of their assigned observations.
    for i in 0..partial.len() {
        for j in (i + 1)..partial.len() {
            let n_coords = coordinates[i].len().min(coordinates[j].len());
            for k in 0..n_coords {
                if coordinates[i][k].same_site(&coordinates[j][k])
                    && observation_coords[partial[i]].get(k)
                        != observation_coords[partial[j]].get(k)
                {
                    return false;
                }
            }
        }
    }
    true
}

/// Sort each equivalence group's assigned observations into a fixed order,
/// so permuted assignments of interchangeable units collapse to one
/// representative.
pub fn canonicalize_assignment(assignment: &[usize], equivalence: &[Vec<usize>]) -> Vec<usize> {
    let mut canonical = assignment.to_vec();
    let mut done: HashSet<usize> = HashSet::new();
    for group in equivalence {
        if group.len() > 1 && !done.contains(&group[0]) {
            let values: Vec<usize> = group
                .iter()
                .map(|&member| assignment[member])
                .sorted_unstable()
                .collect();
            for (&member, value) in group.iter().zip(values) {
                canonical[member] = value;
            }
            done.extend(group.iter().copied());
        }
    }
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::label::unit_coordinates;

    fn coords(names: &[&str]) -> Vec<Vec<Coordinate>> {
        names.iter().map(|n| unit_coordinates(n)).collect()
    }

    fn obs_coords(labels: &[&str]) -> Vec<Vec<String>> {
        labels
            .iter()
            .map(|l| l.split('\\').map(|p| p.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_two_by_two_enumeration() {
        let candidates = vec![vec![0, 1], vec![0, 1]];
        let scores = DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]);
        let assignments = generate_global_assignments(
            &candidates,
            &scores,
            2,
            &coords(&["A1", "B2"]),
            &obs_coords(&["10.0", "20.0"]),
            &[vec![0], vec![1]],
            &SearchOpts::default(),
        );
        // Best-first: (0,1) with score 0.72 precedes (1,0) with score 0.02
        assert_eq!(assignments, vec![vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn test_excess_bound_forces_distinct_observations() {
        // Two interchangeable units over three observations: zero excess
        // capacity, so every valid assignment uses two distinct
        // observations and is canonically sorted.
        let candidates = vec![vec![0, 1, 2], vec![0, 1, 2]];
        let scores = DMatrix::from_row_slice(2, 3, &[0.5, 0.3, 0.2, 0.5, 0.3, 0.2]);
        let assignments = generate_global_assignments(
            &candidates,
            &scores,
            3,
            &coords(&["A", "B"]),
            &obs_coords(&["1", "2", "3"]),
            &[vec![0, 1], vec![0, 1]],
            &SearchOpts::default(),
        );
        assert_eq!(assignments.len(), 6);
        for assignment in &assignments {
            assert_ne!(assignment[0], assignment[1]);
            assert!(assignment[0] < assignment[1]);
        }
    }

    #[test]
    fn test_coordinate_consistency_prunes_branches() {
        // Both units address site 1 on their first coordinate, so their
        // observations must agree on that coordinate.
        let candidates = vec![vec![0, 1, 2], vec![0, 1, 2]];
        let scores = DMatrix::from_element(2, 3, 1.0);
        let assignments = generate_global_assignments(
            &candidates,
            &scores,
            3,
            &coords(&["C1-H2", "C1-H3"]),
            &obs_coords(&["5.0\\1.0", "5.0\\2.0", "6.0\\3.0"]),
            &[vec![0], vec![1]],
            &SearchOpts::default(),
        );
        assert_eq!(assignments, vec![vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn test_individual_excess_cap() {
        // One observation, three distributions: total excess capacity allows
        // the pile-up, the individual cap of 1 forbids it.
        let candidates = vec![vec![0], vec![0], vec![0]];
        let scores = DMatrix::from_element(3, 1, 0.5);
        let unconstrained = generate_global_assignments(
            &candidates,
            &scores,
            1,
            &coords(&["A1", "B2", "C3"]),
            &obs_coords(&["1"]),
            &[vec![0], vec![1], vec![2]],
            &SearchOpts::default(),
        );
        assert_eq!(unconstrained, vec![vec![0, 0, 0]]);

        let capped = generate_global_assignments(
            &candidates,
            &scores,
            1,
            &coords(&["A1", "B2", "C3"]),
            &obs_coords(&["1"]),
            &[vec![0], vec![1], vec![2]],
            &SearchOpts {
                max_excess: Some(1),
                ..Default::default()
            },
        );
        assert!(capped.is_empty());
    }

    #[test]
    fn test_breadth_cap_reduces_to_greedy_path() {
        let candidates = vec![vec![0, 1], vec![0, 1]];
        let scores = DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]);
        let assignments = generate_global_assignments(
            &candidates,
            &scores,
            2,
            &coords(&["A1", "B2"]),
            &obs_coords(&["10.0", "20.0"]),
            &[vec![0], vec![1]],
            &SearchOpts {
                max_asn: Some(1),
                r_max_asn: 0,
                max_excess: None,
            },
        );
        assert_eq!(assignments, vec![vec![0, 1]]);
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let equivalence = vec![vec![0, 2], vec![1], vec![0, 2]];
        let canonical = canonicalize_assignment(&[5, 3, 1], &equivalence);
        assert_eq!(canonical, vec![1, 3, 5]);
        assert_eq!(canonicalize_assignment(&canonical, &equivalence), canonical);
    }

    #[test]
    fn test_canonicalization_collapses_permutations() {
        let equivalence = vec![vec![0, 1], vec![0, 1]];
        let a = canonicalize_assignment(&[2, 7], &equivalence);
        let b = canonicalize_assignment(&[7, 2], &equivalence);
        assert_eq!(a, b);
    }

    #[test]
    fn test_branch_order_permutations() {
        let candidates = vec![vec![0, 1], vec![0], vec![0, 1, 2]];
        assert_eq!(
            BranchOrder::AsGiven.permutation(&candidates),
            vec![0, 1, 2]
        );
        assert_eq!(
            BranchOrder::Increasing.permutation(&candidates),
            vec![1, 0, 2]
        );
        assert_eq!(
            BranchOrder::Decreasing.permutation(&candidates),
            vec![2, 0, 1]
        );
    }

    #[test]
    fn test_branch_order_parse() {
        assert_eq!("default".parse::<BranchOrder>().unwrap(), BranchOrder::AsGiven);
        assert_eq!(
            "increase".parse::<BranchOrder>().unwrap(),
            BranchOrder::Increasing
        );
        assert_eq!(
            "decrease".parse::<BranchOrder>().unwrap(),
            BranchOrder::Decreasing
        );
        assert!("random".parse::<BranchOrder>().is_err());
    }
}
