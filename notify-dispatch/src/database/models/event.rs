//! Domain event model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// A domain event as produced by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub tenant_id: i64,
    pub event_type: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl NewEvent {
    pub fn new(tenant_id: i64, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            tenant_id,
            event_type: event_type.into(),
            source_id: None,
            payload,
            metadata: None,
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(Error::validation("event_type must not be empty"));
        }
        if !self.payload.is_object() {
            return Err(Error::validation("event payload must be a JSON object"));
        }
        if let Some(metadata) = &self.metadata
            && !metadata.is_object()
        {
            return Err(Error::validation("event metadata must be a JSON object"));
        }
        Ok(())
    }
}

/// Persisted domain event. `processed` flips exactly once.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventDbModel {
    pub id: String,
    pub tenant_id: i64,
    pub event_type: String,
    pub source_id: Option<String>,
    /// JSON object
    pub payload: String,
    /// JSON object
    pub metadata: String,
    pub processed: bool,
    pub processed_at: Option<i64>,
    pub created_at: i64,
}

impl EventDbModel {
    pub fn new(event: &NewEvent) -> Result<Self> {
        event.validate()?;
        Ok(Self {
            id: uuid::Uuid::now_v7().to_string(),
            tenant_id: event.tenant_id,
            event_type: event.event_type.clone(),
            source_id: event.source_id.clone(),
            payload: serde_json::to_string(&event.payload)?,
            metadata: serde_json::to_string(event.metadata.as_ref().unwrap_or(&empty_object()))?,
            processed: false,
            processed_at: None,
            created_at: now_ms(),
        })
    }

    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn metadata_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.metadata)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_defaults() {
        let event = NewEvent::new(7, "order.created", json!({"order_id": 1}));
        let model = EventDbModel::new(&event).unwrap();
        assert_eq!(model.tenant_id, 7);
        assert!(!model.processed);
        assert_eq!(model.metadata, "{}");
        assert_eq!(model.payload_json().unwrap()["order_id"], 1);
    }

    #[test]
    fn test_event_validation() {
        assert!(NewEvent::new(1, " ", json!({})).validate().is_err());
        assert!(NewEvent::new(1, "x", json!([1, 2])).validate().is_err());
        assert!(
            NewEvent::new(1, "x", json!({}))
                .with_metadata(json!("nope"))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_new_event_deserialize_without_optional_fields() {
        let event: NewEvent =
            serde_json::from_str(r#"{"tenant_id": 3, "event_type": "table.reserved"}"#).unwrap();
        assert!(event.payload.is_object());
        assert!(event.source_id.is_none());
    }
}
