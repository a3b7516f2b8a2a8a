use thiserror::Error;

/// Errors surfaced by the resource partitioner.
///
/// Configuration errors are unrecoverable: the partitioner is left in a state that is safe to
/// drop but must not be reused. The dynamic pool operations leave the partitioner internally
/// consistent when they fail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The partitioner observed an inconsistency between the hardware topology and the
    /// process affinity, or its lifecycle rules were violated (e.g. a second instance).
    #[error("{operation}: {problem}")]
    InvalidStatus {
        /// The operation that detected the problem.
        operation: &'static str,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// The caller passed an argument the partitioner cannot act on: an unknown or duplicate
    /// pool name, a PU index out of range, or a dynamic-pool operation without dynamic pools
    /// enabled.
    #[error("{operation}: {problem}")]
    BadParameter {
        /// The operation that rejected the argument.
        operation: &'static str,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// The configured scheduler string does not prefix-match any known scheduling policy.
    #[error("bad value for configuration entry 'hpx.scheduler': {problem}")]
    CommandLine {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// A runtime constraint was violated: the OS-thread budget was exceeded, or a pool ended
    /// up empty of resources.
    #[error("{operation}: {problem}")]
    Runtime {
        /// The operation that detected the violation.
        operation: &'static str,

        /// A human-readable description of the problem.
        problem: String,
    },
}

/// A specialized `Result` type for partitioner operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
