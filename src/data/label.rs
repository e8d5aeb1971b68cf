//! Label model for distributions and observations.
//!
//! A raw distribution label may be a union of physically equivalent members
//! (joined by `/`) and each member may be composite across coordinate
//! dimensions (joined by `-`), e.g. `"C1-H2/C1-H3"`. Observation labels use
//! `\` between coordinate components of multi-dimensional data.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Separator between physically equivalent members of one label.
pub const EQUIVALENCE_SEPARATOR: char = '/';
/// Separator between coordinate components of a composite unit label.
pub const COORDINATE_SEPARATOR: char = '-';
/// Separator between coordinate components of a composite observation label.
pub const OBSERVATION_SEPARATOR: char = '\\';

/// One coordinate component of a unit label.
///
/// The site number is the first integer appearing in the component, e.g.
/// `"C5"` parses to site 5. Components without a number keep `site = None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate {
    pub name: String,
    pub site: Option<i64>,
}

impl Coordinate {
    pub fn parse(component: &str) -> Coordinate {
        let pattern = Regex::new(r"\d+").unwrap();
        let site = pattern
            .find(component)
            .and_then(|m| m.as_str().parse::<i64>().ok());
        Coordinate {
            name: component.to_string(),
            site,
        }
    }

    /// Whether two components address the same physical site.
    ///
    /// Parsed site numbers decide when both are present (so `C5` and `H5`
    /// refer to site 5 of the same entity); otherwise the verbatim
    /// components must match.
    #[inline]
    pub fn same_site(&self, other: &Coordinate) -> bool {
        match (self.site, other.site) {
            (Some(a), Some(b)) => a == b,
            _ => self.name == other.name,
        }
    }
}

/// Parse all coordinate components of one unit label.
pub fn unit_coordinates(unit_label: &str) -> Vec<Coordinate> {
    unit_label
        .split(COORDINATE_SEPARATOR)
        .map(Coordinate::parse)
        .collect()
}

/// Split observation labels into their coordinate components.
pub fn observation_coordinates(observation_labels: &[String]) -> Vec<Vec<String>> {
    observation_labels
        .iter()
        .map(|label| {
            label
                .split(OBSERVATION_SEPARATOR)
                .map(|part| part.to_string())
                .collect()
        })
        .collect()
}

/// Equivalence-expanded view of the raw distribution labels.
///
/// Every `/`-separated member of a raw label becomes one search unit. Units
/// of the same raw label share its score row and form one equivalence group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandedUnits {
    /// One label per search unit.
    pub labels: Vec<String>,
    /// Row of the raw score matrix backing each unit.
    pub source_rows: Vec<usize>,
    /// Parsed coordinate components of each unit label.
    pub coordinates: Vec<Vec<Coordinate>>,
    /// Equivalence group membership, one full member list per unit.
    pub equivalence: Vec<Vec<usize>>,
}

impl ExpandedUnits {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Expand every equivalence-composite label into individual search units.
pub fn expand_equivalent_labels(labels: &[String]) -> ExpandedUnits {
    let mut unit_labels = Vec::new();
    let mut source_rows = Vec::new();
    let mut coordinates = Vec::new();
    let mut equivalence = Vec::new();

    for (row, label) in labels.iter().enumerate() {
        let mut members = Vec::new();
        for member in label.split(EQUIVALENCE_SEPARATOR) {
            members.push(unit_labels.len());
            unit_labels.push(member.to_string());
            source_rows.push(row);
            coordinates.push(unit_coordinates(member));
        }
        for _ in &members {
            equivalence.push(members.clone());
        }
    }

    ExpandedUnits {
        labels: unit_labels,
        source_rows,
        coordinates,
        equivalence,
    }
}
