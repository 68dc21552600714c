//! Error types for the estimator

use crate::slam::ConstraintKind;

/// Result type alias
pub type Result<T> = std::result::Result<T, SlamError>;

/// Precondition failures raised by the estimator.
///
/// Solver non-convergence is not an error: it is reported through
/// [`SolverStatus`](crate::slam::SolverStatus).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SlamError {
    /// A noise parameter is non-finite or non-positive
    #[error("invalid noise parameter `{name}`: {value}")]
    InvalidNoiseParameter {
        /// Parameter name as it appears in [`NoiseModel`](crate::slam::NoiseModel)
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// The covariance built for a constraint is not positive-definite
    #[error("singular covariance for {kind} constraint (displacement {distance})")]
    SingularCovariance {
        /// Constraint kind being built
        kind: ConstraintKind,
        /// Realized displacement of the measurement
        distance: f64,
    },

    /// Landmark id outside of the range declared at construction
    #[error("landmark id {id} out of range (landmark count {count})")]
    LandmarkOutOfRange {
        /// Offending id
        id: usize,
        /// Number of landmark slots
        count: usize,
    },

    /// The same landmark was observed twice in one step
    #[error("landmark {id} observed more than once in a single step")]
    DuplicateObservation {
        /// Offending id
        id: usize,
    },

    /// A measurement contains NaN or infinity
    #[error("non-finite {what} measurement")]
    NonFiniteMeasurement {
        /// Which input was rejected
        what: &'static str,
    },

    /// A flat state vector does not match the expected layout
    #[error("state vector of length {len} cannot hold {landmark_count} landmarks and whole poses")]
    StateLength {
        /// Length of the rejected vector
        len: usize,
        /// Landmark count used for unpacking
        landmark_count: usize,
    },
}
