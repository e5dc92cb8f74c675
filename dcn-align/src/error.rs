use thiserror::Error;

/// The error type for deformable alignment operations.
///
/// Every variant is a precondition violation: it is reported before any
/// tensor arithmetic runs and is fatal for that call. Numerical health
/// issues are deliberately not errors; they are reported through the logging
/// channel and never interrupt a forward pass.
#[derive(Error, Debug)]
pub enum DcnAlignError {
    /// Error for when the module configuration is logically inconsistent.
    #[error("Invalid alignment configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when an input tensor has an invalid shape.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },

    /// Error for when a configured input was not supplied.
    #[error("Missing input: {input}")]
    MissingInput {
        /// The name of the missing input.
        input: String,
    },

    /// Error for when an input was supplied that the configuration does not
    /// consume.
    #[error("Unexpected input: {input}")]
    UnexpectedInput {
        /// The name of the unexpected input.
        input: String,
    },
}

/// A specialized `Result` type for deformable alignment operations.
pub type DcnAlignResult<T> = Result<T, DcnAlignError>;
