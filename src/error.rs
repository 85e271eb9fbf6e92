//! Error types for the delta proxy

use thiserror::Error;

/// Result type alias for delta proxy operations
pub type Result<T> = std::result::Result<T, DeltaError>;

/// Error types that can occur while serving a time range query
///
/// The type is `Clone` so that every caller collapsed onto one upstream fetch
/// can receive the identical error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeltaError {
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Extents {a} and {b} are not contiguous")]
    NonContiguousExtents { a: String, b: String },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Upstream fetch from {host} failed: {message}")]
    UpstreamFetchFailed { host: String, message: String },

    #[error("All {attempts} upstream fetches failed, last error: {last_error}")]
    AllUpstreamsFailed { attempts: usize, last_error: String },

    #[error("Series hash collision: {0}")]
    MergeAmbiguity(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Upstream returned 4xx error: {status} - {message}")]
    OriginClientError { status: u16, message: String },

    #[error("Upstream returned 5xx error: {status} - {message}")]
    OriginServerError { status: u16, message: String },

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for DeltaError {
    fn from(err: std::io::Error) -> Self {
        DeltaError::IoError(err.to_string())
    }
}

impl From<bincode::Error> for DeltaError {
    fn from(err: bincode::Error) -> Self {
        DeltaError::CodecError(err.to_string())
    }
}

impl DeltaError {
    /// Determine if this error should trigger a retry of an upstream fetch
    ///
    /// Transient failures (5xx, timeouts, transport errors) are retried.
    /// Client errors and anything caused by the query itself are not.
    pub fn should_retry(&self) -> bool {
        match self {
            DeltaError::OriginServerError { .. } => true,
            DeltaError::Timeout(_) => true,
            DeltaError::IoError(_) => true,
            DeltaError::HttpError(_) => true,
            DeltaError::UpstreamFetchFailed { .. } => true,

            DeltaError::OriginClientError { .. } => false,
            DeltaError::MalformedQuery(_) => false,
            DeltaError::NonContiguousExtents { .. } => false,
            DeltaError::ParseError(_) => false,
            DeltaError::ConfigError(_) => false,
            DeltaError::CodecError(_) => false,
            DeltaError::CacheUnavailable(_) => false,
            DeltaError::AllUpstreamsFailed { .. } => false,
            DeltaError::MergeAmbiguity(_) => false,
            DeltaError::InternalError(_) => false,
        }
    }

    /// Convert error to the HTTP status code returned to the client
    pub fn to_http_status(&self) -> u16 {
        match self {
            DeltaError::MalformedQuery(_) => 400,
            DeltaError::ParseError(_) => 400,

            // Pass through 4xx errors from upstream
            DeltaError::OriginClientError { status, .. } => *status,

            DeltaError::OriginServerError { .. } => 502,
            DeltaError::UpstreamFetchFailed { .. } => 502,
            DeltaError::AllUpstreamsFailed { .. } => 502,
            DeltaError::HttpError(_) => 502,
            DeltaError::Timeout(_) => 504,

            DeltaError::NonContiguousExtents { .. } => 500,
            DeltaError::CacheUnavailable(_) => 500,
            DeltaError::MergeAmbiguity(_) => 500,
            DeltaError::CodecError(_) => 500,
            DeltaError::ConfigError(_) => 500,
            DeltaError::IoError(_) => 500,
            DeltaError::InternalError(_) => 500,
        }
    }

    /// Short machine-readable error class, used in Prometheus-style error bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            DeltaError::MalformedQuery(_) | DeltaError::ParseError(_) => "bad_data",
            DeltaError::Timeout(_) => "timeout",
            DeltaError::OriginClientError { .. } => "bad_data",
            DeltaError::OriginServerError { .. }
            | DeltaError::UpstreamFetchFailed { .. }
            | DeltaError::AllUpstreamsFailed { .. }
            | DeltaError::HttpError(_) => "unavailable",
            _ => "internal",
        }
    }

    /// Create an error from an upstream HTTP status code
    ///
    /// Automatically categorizes as 4xx or 5xx error
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            DeltaError::OriginClientError { status, message }
        } else if (500..600).contains(&status) {
            DeltaError::OriginServerError { status, message }
        } else {
            DeltaError::HttpError(format!("HTTP {}: {}", status, message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DeltaError::from_http_status(503, "busy").should_retry());
        assert!(DeltaError::Timeout("slow".into()).should_retry());
        assert!(!DeltaError::from_http_status(400, "bad").should_retry());
        assert!(!DeltaError::MalformedQuery("start > end".into()).should_retry());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(DeltaError::MalformedQuery("x".into()).to_http_status(), 400);
        assert_eq!(DeltaError::from_http_status(422, "x").to_http_status(), 422);
        assert_eq!(
            DeltaError::AllUpstreamsFailed { attempts: 2, last_error: "x".into() }.to_http_status(),
            502
        );
        assert_eq!(DeltaError::Timeout("x".into()).to_http_status(), 504);
    }

    #[test]
    fn test_from_http_status_non_error_code() {
        let err = DeltaError::from_http_status(302, "moved");
        assert!(matches!(err, DeltaError::HttpError(_)));
    }
}
