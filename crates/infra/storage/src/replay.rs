//! Aggregate reconstruction from snapshots and events

use crate::error::{StorageError, StorageResult};
use crate::event::{DomainEvent, Snapshot};
use crate::store::EventStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// State folded from an event history
pub trait Aggregate: Sized + Serialize + DeserializeOwned {
    /// Build the initial state from the first event (version 1)
    fn genesis(event: &DomainEvent) -> StorageResult<Self>;

    /// Fold one subsequent event into the state
    fn apply(&mut self, event: &DomainEvent) -> StorageResult<()>;
}

/// Result of a replay
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<A> {
    /// Reconstructed state
    pub state: A,
    /// Version of the last event folded in
    pub version: u64,
    /// Events replayed on top of the starting point
    pub replayed: usize,
    /// Whether replay started from a snapshot
    pub from_snapshot: bool,
}

/// When to take snapshots, in events per aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Snapshot whenever the version crosses a multiple of this; 0 disables
    pub every: u64,
}

impl SnapshotPolicy {
    /// Never snapshot on count
    pub const DISABLED: Self = Self { every: 0 };

    /// True if moving from `previous` to `current` crosses a snapshot boundary
    #[must_use]
    pub const fn due(&self, previous: u64, current: u64) -> bool {
        self.every > 0 && current / self.every > previous / self.every
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self { every: 100 }
    }
}

fn fold<A: Aggregate>(aggregate_id: &str, mut state: Option<A>, events: &[DomainEvent]) -> StorageResult<Option<A>> {
    for event in events {
        state = Some(match state {
            None if event.version == 1 => A::genesis(event)?,
            None => {
                return Err(StorageError::corrupt(
                    aggregate_id,
                    format!("history starts at v{} without a snapshot", event.version),
                ));
            }
            Some(mut current) => {
                current.apply(event)?;
                current
            }
        });
    }
    Ok(state)
}

/// Load the latest snapshot, then replay events after its version
pub async fn load_aggregate<A: Aggregate>(
    store: &dyn EventStore,
    aggregate_id: &str,
) -> StorageResult<Option<Loaded<A>>> {
    let snapshot: Option<Snapshot> = store.get_latest_snapshot(aggregate_id).await?;
    let (start, base_version) = match &snapshot {
        Some(snapshot) => (Some(snapshot.state::<A>()?), snapshot.version),
        None => (None, 0),
    };

    let events = store.get_events_from_version(aggregate_id, base_version + 1).await?;
    let version = events.last().map_or(base_version, |e| e.version);
    debug!(
        "Replaying {} events for {} from v{}",
        events.len(),
        aggregate_id,
        base_version
    );

    Ok(fold(aggregate_id, start, &events)?.map(|state| Loaded {
        state,
        version,
        replayed: events.len(),
        from_snapshot: snapshot.is_some(),
    }))
}

/// Replay the full history from version 1, ignoring snapshots
pub async fn replay_all<A: Aggregate>(store: &dyn EventStore, aggregate_id: &str) -> StorageResult<Option<Loaded<A>>> {
    let events = store.get_events(aggregate_id).await?;
    let version = events.last().map_or(0, |e| e.version);
    Ok(fold(aggregate_id, None, &events)?.map(|state| Loaded {
        state,
        version,
        replayed: events.len(),
        from_snapshot: false,
    }))
}
