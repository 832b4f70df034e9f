use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of reasons an inbound event is rejected before being queued.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("failed to parse event: {0}")]
    Malformed(String),
    #[error("event field '{0}' must not be empty")]
    EmptyField(&'static str),
}

/// An event as submitted by a producer and carried through the queue.
///
/// The `(topic, event_id)` pair is the deduplication key: the store persists at most one
/// row per pair no matter how many times the same `NewEvent` is delivered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub topic: String,
    pub event_id: String,
    /// ISO-8601 creation time asserted by the producer. Stored verbatim.
    pub timestamp: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl NewEvent {
    /// Parse and validate an event from a raw JSON body.
    pub fn from_json_slice(body: &[u8]) -> Result<Self, ValidationError> {
        let event: NewEvent = serde_json::from_slice(body)
            .map_err(|error| ValidationError::Malformed(error.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Check the required fields carry a value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.topic.trim().is_empty() {
            return Err(ValidationError::EmptyField("topic"));
        }
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("event_id"));
        }
        if self.timestamp.trim().is_empty() {
            return Err(ValidationError::EmptyField("timestamp"));
        }
        Ok(())
    }

    /// Parse the producer timestamp, returning `None` when it is not valid ISO-8601.
    /// Timestamps without an offset are taken to be UTC.
    pub fn producer_time(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// An event as persisted by the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Persistence order. Serialized as `id`, the row's primary key.
    #[serde(rename = "id")]
    pub sequence_id: i64,
    pub topic: String,
    pub event_id: String,
    pub timestamp: String,
    pub source: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub ingested_at: DateTime<Utc>,
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_valid_event() {
        let body = br#"{
            "topic": "order.created",
            "event_id": "abc",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "publisher-service-01",
            "payload": {"amount": 10}
        }"#;

        let event = NewEvent::from_json_slice(body).expect("failed to parse event");

        assert_eq!(event.topic, "order.created");
        assert_eq!(event.event_id, "abc");
        assert_eq!(event.source.as_deref(), Some("publisher-service-01"));
        assert_eq!(event.payload, Some(serde_json::json!({"amount": 10})));
    }

    #[test]
    fn test_optional_fields_default_to_none() {
        let body = br#"{"topic": "a", "event_id": "x", "timestamp": "2024-05-01T10:00:00"}"#;

        let event = NewEvent::from_json_slice(body).expect("failed to parse event");

        assert_eq!(event.source, None);
        assert_eq!(event.payload, None);
    }

    #[test]
    fn test_missing_required_fields_are_rejected() {
        for body in [
            r#"{"event_id": "x", "timestamp": "2024-05-01T10:00:00Z"}"#,
            r#"{"topic": "a", "timestamp": "2024-05-01T10:00:00Z"}"#,
            r#"{"topic": "a", "event_id": "x"}"#,
            r#"{}"#,
            "not json",
        ] {
            assert!(matches!(
                NewEvent::from_json_slice(body.as_bytes()),
                Err(ValidationError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_empty_required_fields_are_rejected() {
        let body = br#"{"topic": " ", "event_id": "x", "timestamp": "2024-05-01T10:00:00Z"}"#;
        assert_eq!(
            NewEvent::from_json_slice(body),
            Err(ValidationError::EmptyField("topic"))
        );

        let body = br#"{"topic": "a", "event_id": "", "timestamp": "2024-05-01T10:00:00Z"}"#;
        assert_eq!(
            NewEvent::from_json_slice(body),
            Err(ValidationError::EmptyField("event_id"))
        );
    }

    #[test]
    fn test_parse_timestamp() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        assert_eq!(parse_timestamp("2024-05-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 10:00:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_record_serializes_sequence_as_id() {
        let record = EventRecord {
            sequence_id: 42,
            topic: "order.created".to_owned(),
            event_id: "abc".to_owned(),
            timestamp: "2024-05-01T10:00:00Z".to_owned(),
            source: None,
            payload: None,
            ingested_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap(),
        };

        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["id"], 42);
        assert!(json.get("sequence_id").is_none());
    }
}
