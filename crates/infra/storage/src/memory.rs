//! In-process event store backend

use crate::error::{StorageError, StorageResult};
use crate::event::{DomainEvent, NewEvent, Snapshot};
use crate::store::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    events: FxHashMap<String, Vec<DomainEvent>>,
    snapshots: FxHashMap<String, Snapshot>,
}

/// Event store kept in memory.
///
/// Version assignment happens under the write lock, so the read of the
/// current version and the append are one atomic step.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
    offline: AtomicBool,
}

impl MemoryEventStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all aggregates
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.read().events.values().map(Vec::len).sum()
    }

    /// Make every write fail with [`StorageError::Unavailable`] until
    /// switched back. Reads keep working.
    pub fn set_offline(&self, offline: bool) {
        if offline {
            warn!("Memory event store taken offline");
        }
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn append_locked(
        inner: &mut Inner,
        aggregate_id: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<DomainEvent>> {
        let history = inner.events.entry(aggregate_id.to_string()).or_default();
        let current = history.last().map_or(0, |e| e.version);
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StorageError::VersionConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected,
                    actual: current,
                });
            }
        }

        let stored: Vec<DomainEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(event, version)| DomainEvent::stamp(aggregate_id, version, event))
            .collect();
        history.extend(stored.iter().cloned());
        debug!("Appended {} events to {} (now v{})", stored.len(), aggregate_id, current + stored.len() as u64);
        Ok(stored)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<DomainEvent>> {
        self.check_online()?;
        let mut inner = self.inner.write();
        Self::append_locked(&mut inner, aggregate_id, Some(expected_version), events)
    }

    async fn save_events(&self, aggregate_id: &str, events: Vec<NewEvent>) -> StorageResult<Vec<DomainEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.check_online()?;
        let mut inner = self.inner.write();
        Self::append_locked(&mut inner, aggregate_id, None, events)
    }

    async fn get_events_from_version(&self, aggregate_id: &str, from_version: u64) -> StorageResult<Vec<DomainEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(aggregate_id)
            .map(|history| history.iter().filter(|e| e.version >= from_version).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_events_since(&self, aggregate_id: &str, since: DateTime<Utc>) -> StorageResult<Vec<DomainEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(aggregate_id)
            .map(|history| history.iter().filter(|e| e.timestamp >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn current_version(&self, aggregate_id: &str) -> StorageResult<u64> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(aggregate_id)
            .and_then(|history| history.last())
            .map_or(0, |e| e.version))
    }

    async fn aggregate_ids(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner
            .events
            .iter()
            .filter(|(id, history)| id.starts_with(prefix) && !history.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> StorageResult<()> {
        self.check_online()?;
        self.inner
            .write()
            .snapshots
            .insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn get_latest_snapshot(&self, aggregate_id: &str) -> StorageResult<Option<Snapshot>> {
        Ok(self.inner.read().snapshots.get(aggregate_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_batch_is_noop() -> StorageResult<()> {
        let store = MemoryEventStore::new();
        assert!(store.save_events("a", Vec::new()).await?.is_empty());
        assert_eq!(store.current_version("a").await?, 0);
        assert!(store.aggregate_ids("").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_append_leaves_history_untouched() -> StorageResult<()> {
        let store = MemoryEventStore::new();
        store.save_events("a", vec![NewEvent::new("E", json!(1))]).await?;

        let err = store
            .append("a", 0, vec![NewEvent::new("E", json!(2)), NewEvent::new("E", json!(3))])
            .await;
        assert!(matches!(err, Err(StorageError::VersionConflict { expected: 0, actual: 1, .. })));
        assert_eq!(store.event_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_offline_refuses_writes_but_serves_reads() -> StorageResult<()> {
        let store = MemoryEventStore::new();
        store.save_events("a", vec![NewEvent::new("E", json!(1))]).await?;

        store.set_offline(true);
        let err = store.save_events("a", vec![NewEvent::new("E", json!(2))]).await;
        assert!(matches!(err, Err(StorageError::Unavailable(_))));
        assert_eq!(store.get_events("a").await?.len(), 1);

        store.set_offline(false);
        assert_eq!(store.save_events("a", vec![NewEvent::new("E", json!(2))]).await?[0].version, 2);
        Ok(())
    }
}
