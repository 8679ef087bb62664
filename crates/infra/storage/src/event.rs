//! Domain events and snapshots

use crate::error::StorageResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current payload schema written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Event waiting to be appended; the store assigns id and version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event type name, e.g. `OrderAccepted`
    pub event_type: String,
    /// Structured payload
    pub payload: serde_json::Value,
    /// Schema of `payload`
    pub schema_version: u32,
    /// Business time of the event
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    /// Event with a raw JSON payload stamped now
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
        }
    }

    /// Event whose payload is the JSON encoding of `payload`
    pub fn from_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> StorageResult<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    /// Override the event timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Globally unique event id
    pub id: Uuid,
    /// Aggregate this event belongs to
    pub aggregate_id: String,
    /// Event type name
    pub event_type: String,
    /// Structured payload
    pub payload: serde_json::Value,
    /// Schema of `payload`
    pub schema_version: u32,
    /// Business time of the event
    pub timestamp: DateTime<Utc>,
    /// Position in the aggregate's history, starting at 1
    pub version: u64,
}

impl DomainEvent {
    pub(crate) fn stamp(aggregate_id: &str, version: u64, event: NewEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: aggregate_id.to_string(),
            event_type: event.event_type,
            payload: event.payload,
            schema_version: event.schema_version,
            timestamp: event.timestamp,
            version,
        }
    }

    /// Decode the payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Materialized fold of an aggregate up to `version`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate id (at most one snapshot each)
    pub aggregate_id: String,
    /// Serialized aggregate state
    pub data: serde_json::Value,
    /// Last event version folded into `data`
    pub version: u64,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// Snapshot `state` at `version`
    pub fn of<T: Serialize>(aggregate_id: impl Into<String>, state: &T, version: u64) -> StorageResult<Self> {
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            data: serde_json::to_value(state)?,
            version,
            timestamp: Utc::now(),
        })
    }

    /// Decode the snapshot state
    pub fn state<T: DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}
