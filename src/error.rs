use core::fmt;

/// Result alias for `bhc`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the clustering engine.
///
/// Configuration errors (`InvalidInput`, `InvalidHyperparameter`,
/// `Unsupported`) are raised before any computation starts; no partial
/// dendrogram is ever produced. `NumericFailure` aborts the run at the
/// point where a non-finite intermediate appears.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Input data was rejected (empty, ragged, non-finite, or a
    /// degenerate value domain).
    InvalidInput {
        /// What was wrong with the input.
        reason: String,
    },

    /// A hyperparameter was outside its admissible range.
    InvalidHyperparameter {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
        /// Constraint that was violated.
        constraint: &'static str,
    },

    /// A numeric intermediate became non-finite or a kernel matrix was
    /// singular. Carries the cluster/hyperparameter context.
    NumericFailure {
        /// Where the failure happened.
        context: String,
    },

    /// The requested mode does not apply to the provided data kind.
    Unsupported {
        /// Description of the mismatch.
        reason: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            Error::InvalidHyperparameter {
                name,
                value,
                constraint,
            } => {
                write!(f, "invalid hyperparameter '{name}' = {value}: {constraint}")
            }
            Error::NumericFailure { context } => write!(f, "numeric failure: {context}"),
            Error::Unsupported { reason } => write!(f, "unsupported: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Convenience constructor for input rejections.
    pub(crate) fn input(reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for numeric aborts.
    pub(crate) fn numeric(context: impl Into<String>) -> Self {
        Error::NumericFailure {
            context: context.into(),
        }
    }
}
