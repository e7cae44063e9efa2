//! Error types for MiniCDC
//!
//! Defines a unified error type covering every component boundary. The
//! variants form a taxonomy, not a per-module hierarchy: anything that
//! crosses the coordinator boundary is wrapped as `Processing`.

use std::fmt;
use std::io;

/// Unified error type for MiniCDC operations
#[derive(Debug)]
pub enum CdcError {
    /// Required configuration missing or invalid (fatal at startup)
    Configuration(String),
    /// A factory was asked for a variant not in its registry (fatal at startup)
    UnsupportedType(String),
    /// Replication connection or binlog read failure
    DataSource(String),
    /// The sink could not publish a batch (fully or partially)
    Stream(String),
    /// Checkpoint store failure surfaced to a caller
    State(String),
    /// Any error crossing the coordinator boundary
    Processing(String),
}

impl CdcError {
    /// Errors that should terminate the process before the pipeline starts
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            CdcError::Configuration(_) | CdcError::UnsupportedType(_)
        )
    }

    /// Wrap any lower-level error as a processing error for the worker
    pub fn into_processing(self) -> CdcError {
        match self {
            CdcError::Processing(msg) => CdcError::Processing(msg),
            other => CdcError::Processing(other.to_string()),
        }
    }
}

impl fmt::Display for CdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdcError::Configuration(msg) => write!(f, "{}", msg),
            CdcError::UnsupportedType(msg) => write!(f, "{}", msg),
            CdcError::DataSource(msg) => write!(f, "{}", msg),
            CdcError::Stream(msg) => write!(f, "{}", msg),
            CdcError::State(msg) => write!(f, "{}", msg),
            CdcError::Processing(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CdcError {}

impl From<io::Error> for CdcError {
    fn from(e: io::Error) -> Self {
        CdcError::State(e.to_string())
    }
}

impl From<serde_json::Error> for CdcError {
    fn from(e: serde_json::Error) -> Self {
        CdcError::Processing(e.to_string())
    }
}

/// Result type alias for MiniCDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_at_startup_classification() {
        assert!(CdcError::Configuration("x".into()).is_fatal_at_startup());
        assert!(CdcError::UnsupportedType("x".into()).is_fatal_at_startup());
        assert!(!CdcError::DataSource("x".into()).is_fatal_at_startup());
        assert!(!CdcError::Stream("x".into()).is_fatal_at_startup());
        assert!(!CdcError::Processing("x".into()).is_fatal_at_startup());
    }

    #[test]
    fn test_into_processing_preserves_message() {
        let err = CdcError::Stream("3 messages failed".into()).into_processing();
        match err {
            CdcError::Processing(msg) => assert!(msg.contains("3 messages failed")),
            other => panic!("Expected Processing, got {:?}", other),
        }
    }

    #[test]
    fn test_display_prints_message_directly() {
        let err = CdcError::Configuration("SQS_QUEUE_URL is required".into());
        assert_eq!(err.to_string(), "SQS_QUEUE_URL is required");
    }
}
