//! The event store contract

use crate::error::StorageResult;
use crate::event::{DomainEvent, NewEvent, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Append-only, versioned, snapshot-capable event log.
///
/// For every aggregate the stored versions are exactly `1..=N`. Reads are
/// ordered by version ascending.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append `events` only if the aggregate is currently at `expected_version`.
    ///
    /// Either every event is committed with versions
    /// `expected_version + 1 ..` or none is. A mismatch fails with
    /// [`StorageError::VersionConflict`](crate::StorageError::VersionConflict).
    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<DomainEvent>>;

    /// Append `events` after whatever version is current, in one unit of work
    async fn save_events(&self, aggregate_id: &str, events: Vec<NewEvent>) -> StorageResult<Vec<DomainEvent>>;

    /// Events with `version >= from_version`
    async fn get_events_from_version(&self, aggregate_id: &str, from_version: u64) -> StorageResult<Vec<DomainEvent>>;

    /// Events with `timestamp >= since`
    async fn get_events_since(&self, aggregate_id: &str, since: DateTime<Utc>) -> StorageResult<Vec<DomainEvent>>;

    /// Highest stored version, 0 when the aggregate has no events
    async fn current_version(&self, aggregate_id: &str) -> StorageResult<u64>;

    /// Ids of all aggregates with events whose id starts with `prefix`
    async fn aggregate_ids(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Insert or replace the aggregate's snapshot
    async fn save_snapshot(&self, snapshot: Snapshot) -> StorageResult<()>;

    /// The aggregate's snapshot, `None` when none was taken
    async fn get_latest_snapshot(&self, aggregate_id: &str) -> StorageResult<Option<Snapshot>>;

    /// Full history
    async fn get_events(&self, aggregate_id: &str) -> StorageResult<Vec<DomainEvent>> {
        self.get_events_from_version(aggregate_id, 1).await
    }
}
