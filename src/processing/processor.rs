//! Event processor
//!
//! Pure transformation from a raw change event to a publishable message:
//! builds the versioned envelope, then runs the filter chain. The
//! transformation is total; there is no failure path because the value
//! serializer falls back to string forms for anything JSON cannot carry.

use serde_json::json;

use crate::filters::FilterChain;
use crate::serializer::row_to_json;
use crate::types::{ChangeContent, ChangeEvent, Message};

/// Envelope schema tag carried on every message
pub const SCHEMA_VERSION: &str = "mysql-1";

pub struct EventProcessor {
    datasource_type: String,
    datasource_source: String,
    filters: FilterChain,
}

impl EventProcessor {
    pub fn new(datasource_type: &str, datasource_source: &str, filters: FilterChain) -> Self {
        EventProcessor {
            datasource_type: datasource_type.to_string(),
            datasource_source: datasource_source.to_string(),
            filters,
        }
    }

    /// Transform one event into its message form
    pub fn process(&self, event: &ChangeEvent) -> Message {
        let spec = match &event.content {
            ChangeContent::Row(row) => json!({
                "database": event.database,
                "table": event.table,
                "event_type": event.event_type.to_string(),
                "row": row_to_json(row),
            }),
            ChangeContent::Pair { before, after } => json!({
                "database": event.database,
                "table": event.table,
                "event_type": event.event_type.to_string(),
                "before": row_to_json(before),
                "after": row_to_json(after),
            }),
        };

        let envelope = json!({
            "version": SCHEMA_VERSION,
            "metadata": {
                "datasource_type": self.datasource_type,
                "source": self.datasource_source,
                "timestamp": event.timestamp,
                "position": event.position.as_str(),
            },
            "spec": spec,
        });

        self.filters.apply(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::RedactFields;
    use crate::types::{EventType, Position, Row, Value};
    use serde_json::json;

    fn insert_event() -> ChangeEvent {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Int(7));
        row.insert("name".to_string(), Value::Bytes(b"alice".to_vec()));
        ChangeEvent {
            event_type: EventType::Insert,
            database: "shop".to_string(),
            table: "users".to_string(),
            content: ChangeContent::Row(row),
            position: Position::new("uuid:3"),
            timestamp: 1_743_000_000,
        }
    }

    #[test]
    fn test_insert_envelope_shape() {
        let processor = EventProcessor::new("mysql", "db.example.com", FilterChain::new());
        let message = processor.process(&insert_event());

        assert_eq!(message["version"], json!(SCHEMA_VERSION));
        assert_eq!(message["metadata"]["datasource_type"], json!("mysql"));
        assert_eq!(message["metadata"]["source"], json!("db.example.com"));
        assert_eq!(message["metadata"]["position"], json!("uuid:3"));
        assert_eq!(message["metadata"]["timestamp"], json!(1_743_000_000u32));
        assert_eq!(message["spec"]["event_type"], json!("Insert"));
        assert_eq!(message["spec"]["database"], json!("shop"));
        assert_eq!(message["spec"]["table"], json!("users"));
        assert_eq!(message["spec"]["row"], json!({"id": 7, "name": "alice"}));
    }

    #[test]
    fn test_update_envelope_carries_both_images() {
        let mut before = Row::new();
        before.insert("qty".to_string(), Value::Int(1));
        let mut after = Row::new();
        after.insert("qty".to_string(), Value::Int(2));

        let event = ChangeEvent {
            event_type: EventType::Update,
            database: "shop".to_string(),
            table: "orders".to_string(),
            content: ChangeContent::Pair { before, after },
            position: Position::new("uuid:4"),
            timestamp: 0,
        };

        let processor = EventProcessor::new("mysql", "db.example.com", FilterChain::new());
        let message = processor.process(&event);
        assert_eq!(message["spec"]["before"], json!({"qty": 1}));
        assert_eq!(message["spec"]["after"], json!({"qty": 2}));
        assert!(message["spec"].get("row").is_none());
    }

    #[test]
    fn test_filters_run_after_envelope() {
        let mut filters = FilterChain::new();
        filters.add_filter(Box::new(RedactFields::new(&["spec.row.name"])));
        let processor = EventProcessor::new("mysql", "db.example.com", filters);

        let message = processor.process(&insert_event());
        assert_eq!(message["spec"]["row"]["name"], json!("[REDACTED]"));
        assert_eq!(message["spec"]["row"]["id"], json!(7));
    }
}
