use thiserror::Error;

use crate::solver::Stage;

/// Fatal conditions that end an optimization run.
///
/// Telemetry failures are deliberately absent: recorder sinks return
/// `anyhow::Error` and the driver absorbs them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MtoError {
    #[error("{stage} diverged at iteration {iteration}: {reason} (last objective: {})", fmt_objective(.last_objective))]
    SolverDivergence {
        stage: Stage,
        iteration: usize,
        reason: String,
        last_objective: Option<f64>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("design update rejected at iteration {iteration}: {reason} (last objective: {})", fmt_objective(.last_objective))]
    UpdaterRejection {
        iteration: usize,
        reason: String,
        last_objective: Option<f64>,
    },
}

impl MtoError {
    pub fn config(msg: impl Into<String>) -> Self {
        MtoError::Configuration(msg.into())
    }

    /// Outer iteration at which the run stopped, if the failure happened inside the loop.
    pub fn iteration(&self) -> Option<usize> {
        match self {
            MtoError::SolverDivergence { iteration, .. }
            | MtoError::UpdaterRejection { iteration, .. } => Some(*iteration),
            MtoError::Configuration(_) => None,
        }
    }

    pub fn last_objective(&self) -> Option<f64> {
        match self {
            MtoError::SolverDivergence { last_objective, .. }
            | MtoError::UpdaterRejection { last_objective, .. } => *last_objective,
            MtoError::Configuration(_) => None,
        }
    }
}

fn fmt_objective(value: &Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.6e}", v),
        None => "none".to_string(),
    }
}

/// Failure reported by a delegated field solve.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct Diverged(pub String);

impl Diverged {
    pub fn new(reason: impl Into<String>) -> Self {
        Diverged(reason.into())
    }
}

/// Failure reported by the design updater.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct Rejected(pub String);

/// A delegated solve failure tagged with the stage that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage}: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: Diverged,
}
