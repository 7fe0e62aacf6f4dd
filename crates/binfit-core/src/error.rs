//! Error types for binfit

use thiserror::Error;

/// binfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-finite or structurally inconsistent histogram input.
    ///
    /// Not recoverable; raised during tensor building.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Duplicate names, axis mismatches, signal/background overlap and
    /// similar build-time configuration problems.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The optimizer exhausted its iteration budget without meeting the
    /// convergence criteria. The partial minimum is not returned.
    #[error("Convergence failure: {0}")]
    ConvergenceFailure(String),

    /// The Hessian at the minimum could not be inverted; the covariance is
    /// undefined even though the minimum itself may be meaningful.
    #[error("Singular Hessian: {0}")]
    SingularHessian(String),

    /// Explicitly unimplemented operation (e.g. 2D contour tracing).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::ConvergenceFailure("budget exhausted after 50 iterations".into());
        assert!(e.to_string().contains("Convergence failure"));

        let e = Error::SingularHessian("Cholesky and LU both failed".into());
        assert!(e.to_string().contains("Singular Hessian"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
