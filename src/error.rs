#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when the input dimension is zero.
    #[error("invalid input dimension: {0} (must be at least 1)")]
    InvalidDimension(usize),

    /// Returned when a query holds fewer than two items.
    #[error("invalid batch size: {0} items per query (at least 2 required)")]
    InvalidBatchSize(usize),

    /// Returned when a trial range has its first index after its last.
    #[error("invalid bounds: low ({low}) must be less than or equal to high ({high})")]
    InvalidBounds {
        /// The first trial index.
        low: usize,
        /// The last trial index.
        high: usize,
    },

    /// Returned when a query coordinate lies outside `[0, 1]` or is not finite.
    #[error("point coordinate {index} = {value} lies outside the unit box")]
    PointOutOfBounds {
        /// Index of the offending coordinate.
        index: usize,
        /// The offending value.
        value: f64,
    },

    /// Returned when the items of a query or dataset disagree on their shape.
    #[error("dimension mismatch: expected {expected} but got {got}")]
    DimensionMismatch {
        /// The expected length.
        expected: usize,
        /// The actual length.
        got: usize,
    },

    /// Returned when a configuration value is rejected at load or build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned when model fitting kept producing non-finite objectives
    /// after every re-initialization.
    #[error("model fitting diverged after {attempts} attempts")]
    FitDivergence {
        /// Total number of fitting attempts made.
        attempts: usize,
    },

    /// Returned when no acquisition restart produced a finite score.
    #[error("acquisition optimization found no finite candidate in the box")]
    AcquisitionOptimization,

    /// Returned when the comparison oracle fails to produce a valid winner.
    #[error("comparison oracle failed: {0}")]
    Oracle(String),

    /// Returned when persisted history does not match the requested run.
    #[error("state consistency error: {0}")]
    StateConsistency(String),

    /// Returned when a storage operation fails.
    #[error("storage error: {0}")]
    Storage(String),

    /// Returned when an internal invariant is violated.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Returned when an async task fails.
    #[cfg(feature = "async")]
    #[error("async task error: {0}")]
    TaskError(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Whether the error belongs to the configuration class (fatal, never retried).
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidDimension(_)
                | Error::InvalidBatchSize(_)
                | Error::InvalidBounds { .. }
                | Error::PointOutOfBounds { .. }
                | Error::DimensionMismatch { .. }
                | Error::InvalidConfig(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
