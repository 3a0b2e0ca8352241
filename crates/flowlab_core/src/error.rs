//! Error taxonomy shared by every analysis routine in the crate.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// The oracle values at the bracket ends do not enclose the target period.
    #[error("Parameter range [{low}, {high}] does not bracket period {period}.")]
    InvalidBracket { period: usize, low: f64, high: f64 },

    /// A deviation vector collapsed during reorthonormalization.
    #[error("Deviation vector {column} lost linear independence at iteration {iteration}.")]
    DegenerateBasis { column: usize, iteration: usize },

    /// A bounded search ran out of budget before its stopping condition held.
    #[error("{operation} exhausted its limit of {limit} without converging.")]
    NonConvergence { operation: &'static str, limit: usize },

    /// The state left the finite floating-point range.
    #[error("State became non-finite at step {step}.")]
    NumericOverflow { step: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Computation was cancelled.")]
    Cancelled,

    #[error("Linear algebra failure: {0}")]
    Linear(String),
}

impl AnalysisError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AnalysisError::InvalidInput(message.into())
    }

    /// Errors a sweep can absorb as a gap instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalysisError::NonConvergence { .. }
                | AnalysisError::NumericOverflow { .. }
                | AnalysisError::DegenerateBasis { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Fails with `InvalidInput` unless `condition` holds.
macro_rules! ensure_input {
    ($condition:expr, $($arg:tt)+) => {
        if !$condition {
            return Err($crate::error::AnalysisError::InvalidInput(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_input;
