//! SQLite event store backend

use crate::error::{StorageError, StorageResult};
use crate::event::{DomainEvent, NewEvent, Snapshot};
use crate::store::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

const MIGRATIONS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS events (
        id TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        schema_version INTEGER NOT NULL,
        payload TEXT NOT NULL,
        timestamp_ns INTEGER NOT NULL,
        PRIMARY KEY (aggregate_id, version)
    )",
    r"CREATE INDEX IF NOT EXISTS idx_events_time ON events (aggregate_id, timestamp_ns)",
    r"CREATE TABLE IF NOT EXISTS snapshots (
        aggregate_id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        data TEXT NOT NULL,
        timestamp_ns INTEGER NOT NULL
    )",
];

/// Event store on SQLite through `sqlx`.
///
/// The `(aggregate_id, version)` primary key is the collision detector: a
/// writer holding a stale version hits a unique violation and its whole
/// transaction is rolled back.
pub struct SqliteEventStore {
    pool: SqlitePool,
    // Serializes writers within this process so they queue instead of
    // tripping SQLITE_BUSY on lock upgrade.
    write_lock: Mutex<()>,
}

impl SqliteEventStore {
    /// Connect to `url` (`sqlite::memory:` or `sqlite://path`) and run migrations
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let options = if in_memory {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };

        // Every connection to a private in-memory database sees its own
        // empty database, so those pools are pinned to one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { MAX_CONNECTIONS })
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        info!("Event store connected to {}", url);
        Ok(store)
    }

    /// Wrap an existing pool; call [`run_migrations`](Self::run_migrations) before use
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Create tables and indexes
    pub async fn run_migrations(&self) -> StorageResult<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn version_in(tx: &mut Transaction<'_, Sqlite>, aggregate_id: &str) -> StorageResult<u64> {
        let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&mut **tx)
            .await?;
        from_db_version(aggregate_id, current)
    }

    async fn insert_all(
        &self,
        aggregate_id: &str,
        expected_version: Option<u64>,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<DomainEvent>> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = Self::version_in(&mut tx, aggregate_id).await?;
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StorageError::VersionConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected,
                    actual: current,
                });
            }
        }

        let mut stored = Vec::with_capacity(events.len());
        for (event, version) in events.into_iter().zip(current + 1..) {
            let event = DomainEvent::stamp(aggregate_id, version, event);
            let result = sqlx::query(
                "INSERT INTO events (id, aggregate_id, version, event_type, schema_version, payload, timestamp_ns)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.id.to_string())
            .bind(&event.aggregate_id)
            .bind(to_db_version(version))
            .bind(&event.event_type)
            .bind(i64::from(event.schema_version))
            .bind(serde_json::to_string(&event.payload)?)
            .bind(to_nanos(event.timestamp))
            .execute(&mut *tx)
            .await;

            if let Err(err) = result {
                let unique_violation = matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation());
                if unique_violation {
                    warn!("Version collision on {} at v{}", aggregate_id, version);
                    return Err(StorageError::VersionConflict {
                        aggregate_id: aggregate_id.to_string(),
                        expected: current,
                        actual: version,
                    });
                }
                return Err(err.into());
            }
            stored.push(event);
        }

        tx.commit().await?;
        debug!("Committed {} events to {}", stored.len(), aggregate_id);
        Ok(stored)
    }

    async fn select_events(&self, sql: &str, aggregate_id: &str, bound: i64) -> StorageResult<Vec<DomainEvent>> {
        let rows = sqlx::query(sql)
            .bind(aggregate_id)
            .bind(bound)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> StorageResult<Vec<DomainEvent>> {
        self.insert_all(aggregate_id, Some(expected_version), events).await
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn save_events(&self, aggregate_id: &str, events: Vec<NewEvent>) -> StorageResult<Vec<DomainEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.insert_all(aggregate_id, None, events).await
    }

    async fn get_events_from_version(&self, aggregate_id: &str, from_version: u64) -> StorageResult<Vec<DomainEvent>> {
        self.select_events(
            "SELECT id, aggregate_id, version, event_type, schema_version, payload, timestamp_ns
             FROM events WHERE aggregate_id = ? AND version >= ? ORDER BY version ASC",
            aggregate_id,
            to_db_version(from_version),
        )
        .await
    }

    async fn get_events_since(&self, aggregate_id: &str, since: DateTime<Utc>) -> StorageResult<Vec<DomainEvent>> {
        self.select_events(
            "SELECT id, aggregate_id, version, event_type, schema_version, payload, timestamp_ns
             FROM events WHERE aggregate_id = ? AND timestamp_ns >= ? ORDER BY version ASC",
            aggregate_id,
            to_nanos(since),
        )
        .await
    }

    async fn current_version(&self, aggregate_id: &str) -> StorageResult<u64> {
        let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await?;
        from_db_version(aggregate_id, current)
    }

    async fn aggregate_ids(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT aggregate_id FROM events WHERE substr(aggregate_id, 1, length(?)) = ? ORDER BY aggregate_id",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO snapshots (aggregate_id, version, data, timestamp_ns) VALUES (?, ?, ?, ?)
             ON CONFLICT (aggregate_id) DO UPDATE SET
                version = excluded.version,
                data = excluded.data,
                timestamp_ns = excluded.timestamp_ns",
        )
        .bind(&snapshot.aggregate_id)
        .bind(to_db_version(snapshot.version))
        .bind(serde_json::to_string(&snapshot.data)?)
        .bind(to_nanos(snapshot.timestamp))
        .execute(&self.pool)
        .await?;
        debug!("Snapshot of {} saved at v{}", snapshot.aggregate_id, snapshot.version);
        Ok(())
    }

    async fn get_latest_snapshot(&self, aggregate_id: &str) -> StorageResult<Option<Snapshot>> {
        let row = sqlx::query("SELECT aggregate_id, version, data, timestamp_ns FROM snapshots WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> StorageResult<Snapshot> {
            let aggregate_id: String = row.try_get("aggregate_id")?;
            let version = from_db_version(&aggregate_id, row.try_get("version")?)?;
            let data: String = row.try_get("data")?;
            Ok(Snapshot {
                data: serde_json::from_str(&data)?,
                version,
                timestamp: DateTime::from_timestamp_nanos(row.try_get("timestamp_ns")?),
                aggregate_id,
            })
        })
        .transpose()
    }
}

fn row_to_event(row: &SqliteRow) -> StorageResult<DomainEvent> {
    let aggregate_id: String = row.try_get("aggregate_id")?;
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let schema_version: i64 = row.try_get("schema_version")?;

    Ok(DomainEvent {
        id: Uuid::parse_str(&id).map_err(|e| StorageError::corrupt(&aggregate_id, format!("event id {id}: {e}")))?,
        version: from_db_version(&aggregate_id, row.try_get("version")?)?,
        event_type: row.try_get("event_type")?,
        payload: serde_json::from_str(&payload)?,
        schema_version: u32::try_from(schema_version)
            .map_err(|_| StorageError::corrupt(&aggregate_id, format!("schema version {schema_version}")))?,
        timestamp: DateTime::from_timestamp_nanos(row.try_get("timestamp_ns")?),
        aggregate_id,
    })
}

fn to_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_db_version(aggregate_id: &str, version: i64) -> StorageResult<u64> {
    u64::try_from(version).map_err(|_| StorageError::corrupt(aggregate_id, format!("negative version {version}")))
}
