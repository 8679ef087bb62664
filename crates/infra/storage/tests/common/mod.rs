//! Shared helpers for event store integration tests

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Once};
use storage::{Aggregate, DomainEvent, EventStore, MemoryEventStore, NewEvent, SqliteEventStore, StorageError, StorageResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "storage=debug,warn".into()))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

/// Backends exercised by the contract tests
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub async fn open(backend: Backend) -> anyhow::Result<Arc<dyn EventStore>> {
    init_test_logging();
    Ok(match backend {
        Backend::Memory => Arc::new(MemoryEventStore::new()),
        Backend::Sqlite => Arc::new(SqliteEventStore::connect("sqlite::memory:").await?),
    })
}

pub fn added(n: i64) -> NewEvent {
    NewEvent::new("Added", json!({ "n": n }))
}

pub fn opened(start: i64) -> NewEvent {
    NewEvent::new("Opened", json!({ "start": start }))
}

/// Minimal aggregate: a running total
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total: i64,
    pub applied: u64,
}

#[derive(Deserialize)]
struct Opened {
    start: i64,
}

#[derive(Deserialize)]
struct Added {
    n: i64,
}

impl Aggregate for Tally {
    fn genesis(event: &DomainEvent) -> StorageResult<Self> {
        match event.event_type.as_str() {
            "Opened" => Ok(Self {
                total: event.payload_as::<Opened>()?.start,
                applied: 1,
            }),
            other => Err(StorageError::corrupt(&event.aggregate_id, format!("genesis {other}"))),
        }
    }

    fn apply(&mut self, event: &DomainEvent) -> StorageResult<()> {
        match event.event_type.as_str() {
            "Added" => {
                self.total += event.payload_as::<Added>()?.n;
                self.applied += 1;
                Ok(())
            }
            other => Err(StorageError::corrupt(&event.aggregate_id, format!("unexpected {other}"))),
        }
    }
}
