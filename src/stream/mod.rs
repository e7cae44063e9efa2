//! Output streams
//!
//! A stream accepts ordered, already-processed messages and publishes them
//! to a downstream queue, honoring whatever batch-count and byte-size
//! limits the destination imposes. `send` returns normally only when every
//! message was accepted.

mod sqs;

pub use sqs::{SqsLimits, SqsStream};

use crate::error::{CdcError, Result};
use crate::types::Message;

/// A destination for processed messages
pub trait Stream: Send {
    /// Publish the messages in order. Blocks until every message has been
    /// accepted or definitively rejected; raises a stream error carrying
    /// the failed message identifiers otherwise.
    fn send(&self, messages: &[Message]) -> Result<()>;

    /// Release held resources. Idempotent.
    fn close(&self);
}

/// Factory for creating stream implementations
pub struct StreamFactory;

impl StreamFactory {
    pub const SUPPORTED: &'static [&'static str] = &["sqs"];

    /// Create a stream of the requested type, configured from the
    /// environment.
    pub fn create(kind: &str) -> Result<Box<dyn Stream>> {
        log::debug!("Creating stream of type: {}", kind);
        match kind.to_ascii_lowercase().as_str() {
            "sqs" => Ok(Box::new(SqsStream::from_env()?)),
            other => Err(CdcError::UnsupportedType(format!(
                "Unsupported stream type: {}. Supported types: {:?}",
                other,
                Self::SUPPORTED
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unknown_type() {
        let err = match StreamFactory::create("kinesis") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        match err {
            CdcError::UnsupportedType(msg) => {
                assert!(msg.contains("kinesis"));
                assert!(msg.contains("sqs"));
            }
            other => panic!("Expected UnsupportedType, got {:?}", other),
        }
    }
}
