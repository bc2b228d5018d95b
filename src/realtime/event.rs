use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};

use crate::data_types::{Operation, Record, SequenceNumber, Value};

/// A committed mutation. Only ever built after the write transaction has
/// committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    /// One of create, update or delete
    pub action: Operation,
    /// Post-write row for create/update, pre-delete snapshot for delete
    pub record: Record,
    pub id: Value,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn payload(&self) -> JsonValue {
        json!({
            "table": self.table,
            "action": self.action.as_ref(),
            "record": self.record.to_json(),
            "id": self.id.to_json(),
            "sequence": self.sequence,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_payload() {
        let mut record = Record::new();
        record.insert("id", Value::Integer(7));
        record.insert("is_closed", Value::Boolean(true));

        let event = ChangeEvent {
            table: "polls".to_string(),
            action: Operation::Update,
            record,
            id: Value::Integer(7),
            sequence: 42,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
        };

        assert_eq!(
            event.payload(),
            json!({
                "table": "polls",
                "action": "update",
                "record": {"id": 7, "is_closed": true},
                "id": 7,
                "sequence": 42,
                "timestamp": "2024-03-01T12:30:00Z",
            })
        );
    }
}
