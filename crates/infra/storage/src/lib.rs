//! Event-sourced persistence for the execution core
//!
//! Every order and position is an aggregate whose history is an
//! append-only, gap-free, versioned sequence of [`DomainEvent`]s. A
//! [`Snapshot`] caches a fold of the history so recovery replays only the
//! tail.
//!
//! Backends:
//! - [`MemoryEventStore`]: in-process, for tests and ephemeral runs
//! - [`SqliteEventStore`]: durable, `sqlx` on SQLite

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod memory;
pub mod replay;
pub mod sqlite;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use event::{DomainEvent, NewEvent, SCHEMA_VERSION, Snapshot};
pub use memory::MemoryEventStore;
pub use replay::{Aggregate, Loaded, SnapshotPolicy, load_aggregate, replay_all};
pub use sqlite::SqliteEventStore;
pub use store::EventStore;
