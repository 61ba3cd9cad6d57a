//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Admission denial is not represented here: a denied request is a normal
/// [`Decision`](crate::ratelimit::Decision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A category with no registered policy, or an unparseable category name
    #[error("Unknown rate limit category: {0}")]
    UnknownCategory(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

impl From<TollgateError> for tonic::Status {
    fn from(err: TollgateError) -> Self {
        match err {
            TollgateError::Config(_) | TollgateError::ConfigSource(_) => {
                tonic::Status::failed_precondition(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_category_maps_to_internal() {
        let status = tonic::Status::from(TollgateError::UnknownCategory("bulk".to_string()));
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("bulk"));
    }
}
