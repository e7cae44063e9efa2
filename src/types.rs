//! Core types for MiniCDC
//!
//! Defines the raw change event yielded by a data source, the dynamic value
//! tree carried in row images, and the replication position token used for
//! checkpointing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A dynamically typed column value from the replication log.
///
/// Row images are heterogeneous trees; this variant covers everything the
/// upstream can emit. Conversion to the JSON-compatible subset lives in
/// [`crate::serializer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// String value
    Str(String),
    /// Raw bytes (BLOB columns, or text in an unknown charset)
    Bytes(Vec<u8>),
    /// Temporal value (DATETIME / TIMESTAMP columns)
    Time(NaiveDateTime),
    /// Ordered sequence
    Seq(Vec<Value>),
    /// Nested document (JSON columns)
    Map(BTreeMap<String, Value>),
}

/// A single row image: column name to value, in column order.
pub type Row = BTreeMap<String, Value>;

/// The kind of row mutation a change event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "Insert"),
            EventType::Update => write!(f, "Update"),
            EventType::Delete => write!(f, "Delete"),
        }
    }
}

/// Row payload of a change event.
///
/// Updates carry both images; inserts and deletes carry one.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeContent {
    /// Single row image (the new row for Insert, the old row for Delete)
    Row(Row),
    /// Before and after images for Update
    Pair { before: Row, after: Row },
}

/// One row mutation read from the replication log
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub database: String,
    pub table: String,
    pub content: ChangeContent,
    /// Token of the enclosing transaction. Events from one transaction
    /// share the same token.
    pub position: Position,
    /// Seconds since the epoch, as recorded in the log event header
    pub timestamp: u32,
}

/// An opaque, totally ordered replication position token.
///
/// Corresponds to a global transaction identifier (`uuid:gno`). The empty
/// token means "start from the current log head". Comparison is plain
/// string comparison; callers treat tokens as opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(String);

impl Position {
    pub fn new(token: impl Into<String>) -> Self {
        Position(token.into())
    }

    /// The "start from the log head" position
    pub fn empty() -> Self {
        Position(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Position {
    fn from(s: &str) -> Self {
        Position(s.to_string())
    }
}

/// A processed, JSON-compatible message ready for publication
pub type Message = serde_json::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_empty_means_head() {
        assert!(Position::empty().is_empty());
        assert!(Position::default().is_empty());
        assert!(!Position::new("uuid:1").is_empty());
    }

    #[test]
    fn test_position_equality_and_order() {
        let a = Position::new("3e11fa47:1");
        let b = Position::new("3e11fa47:1");
        let c = Position::new("3e11fa47:2");
        assert_eq!(a, b);
        assert!(a < c);
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Insert.to_string(), "Insert");
        assert_eq!(EventType::Update.to_string(), "Update");
        assert_eq!(EventType::Delete.to_string(), "Delete");
    }

    #[test]
    fn test_change_content_pair_holds_both_images() {
        let mut before = Row::new();
        before.insert("id".to_string(), Value::Int(1));
        let mut after = Row::new();
        after.insert("id".to_string(), Value::Int(2));

        let content = ChangeContent::Pair { before, after };
        match content {
            ChangeContent::Pair { before, after } => {
                assert_eq!(before.get("id"), Some(&Value::Int(1)));
                assert_eq!(after.get("id"), Some(&Value::Int(2)));
            }
            _ => unreachable!(),
        }
    }
}
