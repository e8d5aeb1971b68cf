//! Error types for the assignment pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssignmentError {
    #[error("unknown threshold update: {0}")]
    UnknownThresholdGrowth(String),

    #[error("unknown order: {0}")]
    UnknownBranchOrder(String),

    #[error("score matrix shape mismatch: {rows} rows x {cols} columns for {labels} labels and {observations} observations")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        labels: usize,
        observations: usize,
    },
}

pub type Result<T> = std::result::Result<T, AssignmentError>;
