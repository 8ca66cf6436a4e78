use crate::search::SearchDiagnostics;

/// Errors produced while preparing data, fitting surrogates or optimizing
/// the acquisition function.
///
/// Recoverable anomalies (outliers, clipped noise, padded snapshots) are
/// never returned as errors; they are logged and the fit continues.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when a bound has `min >= max` or a non-finite limit.
    #[error("invalid bounds for '{name}': min ({low}) must be less than max ({high})")]
    InvalidBounds {
        /// Name of the input dimension.
        name: String,
        /// The lower bound value.
        low: f64,
        /// The upper bound value.
        high: f64,
    },

    /// Returned when array shapes cannot be reconciled.
    #[error("shape mismatch in {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which array (or pair of arrays) disagrees.
        what: &'static str,
        /// The expected extent.
        expected: usize,
        /// The extent actually found.
        got: usize,
    },

    /// Returned when a surrogate is asked to fit with no points at all.
    #[error("no training points available for output '{0}'")]
    EmptyTrainingSet(String),

    /// Returned when the hyperparameter fit exhausted its attempt budget.
    #[error("fitting output '{output}' failed after {attempts} attempts: {reason}")]
    FitFailed {
        /// The output whose surrogate could not be fitted.
        output: String,
        /// Number of attempts made.
        attempts: usize,
        /// The last failure observed.
        reason: String,
    },

    /// Returned when no optimizer in the configured chain produced a candidate.
    #[error("acquisition optimization failed: {reason}")]
    AcquisitionFailed {
        /// Why the chain failed.
        reason: String,
        /// Everything the chain recorded before giving up.
        diagnostics: Box<SearchDiagnostics>,
    },

    /// Returned when an optimization step operation is called out of order.
    #[error("optimization step is {found}, expected {expected}")]
    InvalidPhase {
        /// The phase the operation requires.
        expected: &'static str,
        /// The phase the step is in.
        found: &'static str,
    },

    /// Returned when a configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned when an output name is not part of the problem.
    #[error("unknown output '{0}'")]
    UnknownOutput(String),

    /// Returned when an acquisition key is not recognised.
    #[error("unknown acquisition type '{0}'")]
    UnknownAcquisition(String),

    /// Returned when an optimizer token in a chain is not recognised.
    #[error("unknown optimizer '{0}'")]
    UnknownOptimizer(String),

    /// Returned when the snapshot store cannot be parsed or encoded.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Returned when an external evaluation fails.
    #[error("evaluation of point {point} failed: {reason}")]
    Evaluation {
        /// Index of the point in the submitted batch.
        point: usize,
        /// The evaluator's explanation.
        reason: String,
    },

    /// Returned when reading or writing artifacts fails.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Snapshot(e.to_string())
    }
}
