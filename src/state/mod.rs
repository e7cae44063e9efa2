//! Checkpoint state management
//!
//! A state manager is a remote key-value store keyed by
//! `(datasource_type, datasource_source)` holding the most recently
//! durably-published position. Errors never escape: `store` reports
//! failure through its return value and `read` falls back to the empty
//! position, so a flaky store degrades to re-delivery instead of crashing
//! the pipeline.

mod dynamodb;
mod file;

pub use dynamodb::DynamoStateManager;
pub use file::FileStateManager;

use crate::error::{CdcError, Result};
use crate::types::Position;

/// Durable storage for replication positions
pub trait StateManager: Send {
    /// Upsert the position for a source. Returns `true` only on a confirmed
    /// durable write; errors are logged, never raised.
    fn store(&self, datasource_type: &str, datasource_source: &str, position: &Position) -> bool;

    /// Read the stored position, or the empty position when none exists or
    /// the read fails (failures are logged).
    fn read(&self, datasource_type: &str, datasource_source: &str) -> Position;
}

/// Factory for creating state manager implementations
pub struct StateManagerFactory;

impl StateManagerFactory {
    pub const SUPPORTED: &'static [&'static str] = &["dynamodb", "file"];

    /// Create a state manager of the requested type, configured from the
    /// environment.
    pub fn create(kind: &str) -> Result<Box<dyn StateManager>> {
        log::debug!("Creating state manager of type: {}", kind);
        match kind.to_ascii_lowercase().as_str() {
            "dynamodb" => Ok(Box::new(DynamoStateManager::from_env()?)),
            "file" => Ok(Box::new(FileStateManager::from_env()?)),
            other => Err(CdcError::UnsupportedType(format!(
                "Unsupported state manager type: {}. Supported types: {:?}",
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
        let err = match StateManagerFactory::create("redis") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        match err {
            CdcError::UnsupportedType(msg) => {
                assert!(msg.contains("redis"));
                assert!(msg.contains("dynamodb"));
            }
            other => panic!("Expected UnsupportedType, got {:?}", other),
        }
    }
}
