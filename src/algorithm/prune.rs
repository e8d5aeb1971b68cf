//! Candidate pruning and constraint propagation.
//!
//! Reduces a dense score matrix to a per-distribution list of plausible
//! observation indices. A relative threshold discards scores far below the
//! row maximum, unique-claim propagation pins forced assignments early, and
//! the threshold grows until every distribution and every observation stays
//! reachable.

use log::{debug, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::data::label::{
    observation_coordinates, COORDINATE_SEPARATOR, EQUIVALENCE_SEPARATOR,
};
use crate::error::AssignmentError;

/// How the relative threshold grows when pruning leaves the problem
/// infeasible. Parsed from the descriptors `"xN"` (multiply by N) and
/// `"+N"` (add N).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ThresholdGrowth {
    Multiply(f64),
    Add(f64),
}

impl ThresholdGrowth {
    #[inline]
    pub fn apply(&self, thresh: f64) -> f64 {
        match self {
            ThresholdGrowth::Multiply(factor) => thresh * factor,
            ThresholdGrowth::Add(increment) => thresh + increment,
        }
    }
}

impl FromStr for ThresholdGrowth {
    type Err = AssignmentError;

    fn from_str(s: &str) -> Result<ThresholdGrowth, AssignmentError> {
        if let Some(rest) = s.strip_prefix('x') {
            if let Ok(factor) = rest.parse::<f64>() {
                return Ok(ThresholdGrowth::Multiply(factor));
            }
        }
        if let Some(rest) = s.strip_prefix('+') {
            if let Ok(increment) = rest.parse::<f64>() {
                return Ok(ThresholdGrowth::Add(increment));
            }
        }
        Err(AssignmentError::UnknownThresholdGrowth(s.to_string()))
    }
}

/// Pruning configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PruneOpts {
    /// Relative probability threshold: per row, scores below
    /// `row_max / thresh` are zeroed. Negative disables pruning entirely
    /// (the search then scales factorially).
    pub thresh: f64,
    /// Growth rule applied whenever pruning leaves the problem infeasible.
    pub growth: ThresholdGrowth,
}

impl Default for PruneOpts {
    fn default() -> Self {
        Self {
            thresh: 100.0,
            growth: ThresholdGrowth::Multiply(2.0),
        }
    }
}

/// Candidate sets per distribution plus the possibly-grown threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PruneResult {
    pub candidates: Vec<Vec<usize>>,
    pub thresh: f64,
}

/// Prune the score matrix into per-distribution candidate observation sets.
///
/// The threshold grows per the configured rule until every distribution
/// keeps at least one candidate and every observation is claimed by at
/// least one distribution.
pub fn prune_candidates(
    scores: &DMatrix<f64>,
    labels: &[String],
    observation_labels: &[String],
    opts: &PruneOpts,
) -> PruneResult {
    let n_obs = scores.ncols();

    if opts.thresh < 0.0 {
        warn!("no pruning threshold set, assignment search scales factorially");
        let candidates = vec![(0..n_obs).collect::<Vec<usize>>(); scores.nrows()];
        return PruneResult {
            candidates,
            thresh: opts.thresh,
        };
    }

    let mut thresh = opts.thresh;
    let candidates = loop {
        let mut cleaned = scores.clone();
        for mut row in cleaned.row_iter_mut() {
            let row_max = row.max();
            for value in row.iter_mut() {
                if *value < row_max / thresh {
                    *value = 0.0;
                }
            }
        }

        let mut candidates: Vec<Vec<usize>> = cleaned
            .row_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|&(_, &value)| value > 0.0)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();

        propagate_unique_claims(&mut cleaned, &mut candidates, labels);

        // A starved row and a starved column each grow the threshold once
        // within the same pass.
        let mut feasible = true;
        if cleaned.row_iter().any(|row| row.sum() == 0.0) {
            feasible = false;
            thresh = opts.growth.apply(thresh);
        }
        if cleaned.column_iter().any(|col| col.sum() == 0.0) {
            feasible = false;
            thresh = opts.growth.apply(thresh);
        }
        if feasible {
            break candidates;
        }
    };

    debug!("scores cleaned up, threshold set to {}", thresh);

    let candidates = if labels
        .first()
        .map_or(false, |label| label.contains(COORDINATE_SEPARATOR))
    {
        merge_equivalent_dimension_candidates(candidates, labels, observation_labels)
    } else {
        candidates
    };

    PruneResult { candidates, thresh }
}

/// Unique-claim constraint propagation to a fixed point.
///
/// A distribution with several candidates (and no equivalence partners) is
/// pinned to any candidate that appears in no other distribution's list.
fn propagate_unique_claims(
    cleaned: &mut DMatrix<f64>,
    candidates: &mut [Vec<usize>],
    labels: &[String],
) {
    loop {
        let mut pin: Option<(usize, usize)> = None;
        'scan: for (i, list) in candidates.iter().enumerate() {
            if list.len() <= 1 || labels[i].contains(EQUIVALENCE_SEPARATOR) {
                continue;
            }
            for &ai in list {
                let claimed_elsewhere = candidates
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && other.contains(&ai));
                if !claimed_elsewhere {
                    pin = Some((i, ai));
                    break 'scan;
                }
            }
        }
        match pin {
            Some((i, ai)) => {
                for &aj in &candidates[i] {
                    if aj != ai {
                        cleaned[(i, aj)] = 0.0;
                    }
                }
                candidates[i] = vec![ai];
            }
            None => break,
        }
    }
}

/// Propagate dimensional identity across permuted equivalence labels.
///
/// When two members of an equivalence label share a verbatim component at
/// coordinate `k`, every observation matching a current candidate on that
/// coordinate becomes a candidate as well (deduplicated by observation
/// label, grown to transitive closure).
fn merge_equivalent_dimension_candidates(
    mut candidates: Vec<Vec<usize>>,
    labels: &[String],
    observation_labels: &[String],
) -> Vec<Vec<usize>> {
    let obs_coords = observation_coordinates(observation_labels);

    for (i, label) in labels.iter().enumerate() {
        if !label.contains(EQUIVALENCE_SEPARATOR) {
            continue;
        }
        let members: Vec<Vec<&str>> = label
            .split(EQUIVALENCE_SEPARATOR)
            .map(|member| member.split(COORDINATE_SEPARATOR).collect())
            .collect();

        let mut seen: HashSet<String> = candidates[i]
            .iter()
            .map(|&a| observation_labels[a].clone())
            .collect();

        for m1 in 0..members.len() {
            for m2 in (m1 + 1)..members.len() {
                let n_coords = members[m1].len().min(members[m2].len());
                for k in 0..n_coords {
                    if members[m1][k] != members[m2][k] {
                        continue;
                    }
                    let mut pos = 0;
                    while pos < candidates[i].len() {
                        let ai = candidates[i][pos];
                        pos += 1;
                        let Some(pattern) = obs_coords[ai].get(k) else {
                            continue;
                        };
                        for (j, obs_label) in observation_labels.iter().enumerate() {
                            if obs_coords[j].get(k) == Some(pattern) && !seen.contains(obs_label) {
                                seen.insert(obs_label.clone());
                                candidates[i].push(j);
                            }
                        }
                    }
                }
            }
        }
    }

    for list in candidates.iter_mut() {
        list.sort_unstable();
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize, values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(rows, cols, values)
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_threshold_growth_parse() {
        assert_eq!(
            "x2".parse::<ThresholdGrowth>().unwrap(),
            ThresholdGrowth::Multiply(2.0)
        );
        assert_eq!(
            "+10".parse::<ThresholdGrowth>().unwrap(),
            ThresholdGrowth::Add(10.0)
        );
        assert!("2x".parse::<ThresholdGrowth>().is_err());
        assert!("%5".parse::<ThresholdGrowth>().is_err());
    }

    #[test]
    fn test_threshold_growth_apply() {
        assert_eq!(ThresholdGrowth::Multiply(2.0).apply(100.0), 200.0);
        assert_eq!(ThresholdGrowth::Add(50.0).apply(100.0), 150.0);
    }

    #[test]
    fn test_prune_keeps_plausible_candidates() {
        let scores = matrix(2, 2, &[0.9, 0.1, 0.2, 0.8]);
        let result = prune_candidates(
            &scores,
            &labels(&["A1", "B2"]),
            &labels(&["10.0", "20.0"]),
            &PruneOpts::default(),
        );
        assert_eq!(result.candidates, vec![vec![0, 1], vec![0, 1]]);
        assert_eq!(result.thresh, 100.0);
    }

    #[test]
    fn test_prune_negative_threshold_disables_pruning() {
        let scores = matrix(2, 3, &[0.9, 0.0, 0.0, 0.0, 0.8, 0.0]);
        let result = prune_candidates(
            &scores,
            &labels(&["A1", "B2"]),
            &labels(&["1", "2", "3"]),
            &PruneOpts {
                thresh: -1.0,
                ..Default::default()
            },
        );
        assert_eq!(result.candidates, vec![vec![0, 1, 2], vec![0, 1, 2]]);
        assert_eq!(result.thresh, -1.0);
    }

    #[test]
    fn test_unique_claim_is_pinned() {
        // Observation 0 is only plausible for the first distribution, so
        // propagation must pin it there before any search runs.
        let scores = matrix(2, 2, &[0.9, 0.3, 1e-6, 0.8]);
        let result = prune_candidates(
            &scores,
            &labels(&["A1", "B2"]),
            &labels(&["10.0", "20.0"]),
            &PruneOpts::default(),
        );
        assert_eq!(result.candidates, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_threshold_grows_until_feasible() {
        // Observation 1 only carries scores 2e-6; the default threshold
        // starves its column until growth reaches 1e6.
        let scores = matrix(2, 2, &[1.0, 2e-6, 1.0, 2e-6]);
        let result = prune_candidates(
            &scores,
            &labels(&["A1", "B2"]),
            &labels(&["10.0", "20.0"]),
            &PruneOpts {
                thresh: 100.0,
                growth: ThresholdGrowth::Multiply(10.0),
            },
        );
        assert_eq!(result.candidates, vec![vec![0, 1], vec![0, 1]]);
        assert!((result.thresh - 1e6).abs() < 1e-9);
    }

    #[test]
    fn test_feasibility_invariant_after_pruning() {
        let scores = matrix(3, 3, &[0.9, 0.05, 1e-7, 0.1, 0.8, 1e-7, 1e-7, 0.2, 0.9]);
        let result = prune_candidates(
            &scores,
            &labels(&["A1", "B2", "C3"]),
            &labels(&["1", "2", "3"]),
            &PruneOpts::default(),
        );
        // Every distribution keeps a candidate
        assert!(result.candidates.iter().all(|list| !list.is_empty()));
        // Every observation is claimed by someone
        for obs in 0..3 {
            assert!(result.candidates.iter().any(|list| list.contains(&obs)));
        }
    }

    #[test]
    fn test_dimension_merge_for_equivalent_labels() {
        // The two equivalence members share their first component, so any
        // observation matching a candidate on that coordinate is pulled in.
        let scores = matrix(
            3,
            3,
            &[0.9, 1e-6, 1e-6, 1e-6, 0.9, 1e-6, 1e-6, 1e-6, 0.9],
        );
        let result = prune_candidates(
            &scores,
            &labels(&["A1-X1/A1-X2", "B2-Y1", "B3-Y2"]),
            &labels(&["o1\\p1", "o1\\p2", "o2\\p3"]),
            &PruneOpts::default(),
        );
        assert_eq!(result.candidates[0], vec![0, 1]);
        assert_eq!(result.candidates[1], vec![1]);
        assert_eq!(result.candidates[2], vec![2]);
    }
}
