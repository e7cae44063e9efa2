//! Change data sources
//!
//! A data source tails a database replication log and yields an ordered,
//! lazy sequence of change events with transaction boundaries applied: the
//! position it advertises only ever names a transaction whose events have
//! all been yielded.

mod mysql;

pub use mysql::{MySqlConfig, MySqlDataSource};

use std::time::Duration;

use crate::error::{CdcError, Result};
use crate::types::{ChangeEvent, Position};

/// A live event sequence obtained from [`DataSource::listen`].
///
/// The sequence is lazy and finite-on-disconnect: `next_event` waits up to
/// `max_wait` for the log to produce something, returning `Ok(None)` when
/// it stays quiet. A failed or closed session surfaces as a data-source
/// error, after which the stream is exhausted; callers recover by
/// disconnecting and reconnecting the source.
pub trait EventStream: Send {
    fn next_event(&mut self, max_wait: Duration) -> Result<Option<ChangeEvent>>;
}

/// A replication log reader
pub trait DataSource: Send {
    /// Stable type identifier used as the first checkpoint key component
    fn source_type(&self) -> &str;

    /// Stable instance identifier used as the second checkpoint key component
    fn source_id(&self) -> &str;

    /// Set the resumption token. Idempotent; must be called before
    /// `connect`. The empty position means "start from the current head".
    fn set_start_position(&mut self, position: Position);

    /// Establish a replication session resuming strictly after the start
    /// position. Validates the upstream's replication settings first.
    fn connect(&mut self) -> Result<()>;

    /// Obtain the event sequence for this session. Not restartable within
    /// a session: a second call without `disconnect` + `connect` fails.
    fn listen(&mut self) -> Result<Box<dyn EventStream>>;

    /// Token of the latest transaction whose events have all been yielded,
    /// or the empty position when no transaction has completed yet.
    fn current_position(&self) -> Position;

    /// Close the replication session. Safe to call repeatedly; never fails.
    fn disconnect(&mut self);
}

/// Factory for creating data source implementations
pub struct DataSourceFactory;

impl DataSourceFactory {
    pub const SUPPORTED: &'static [&'static str] = &["mysql"];

    /// Create a data source of the requested type, configured from the
    /// environment.
    pub fn create(kind: &str) -> Result<Box<dyn DataSource>> {
        log::debug!("Creating data source of type: {}", kind);
        match kind.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Box::new(MySqlDataSource::new(MySqlConfig::from_env()?))),
            other => Err(CdcError::UnsupportedType(format!(
                "Unsupported data source type: {}. Supported types: {:?}",
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
        let err = match DataSourceFactory::create("postgres") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        match err {
            CdcError::UnsupportedType(msg) => {
                assert!(msg.contains("postgres"));
                assert!(msg.contains("mysql"));
            }
            other => panic!("Expected UnsupportedType, got {:?}", other),
        }
    }
}
