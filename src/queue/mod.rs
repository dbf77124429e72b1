//! Durable local queue shared by the collector (writer) and the dispatcher
//! (reader). SQLite in WAL mode gives one writer and one reader transactional
//! row visibility across processes; no other synchronization is used.

pub mod entity;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlxSqliteConnector,
};
use uuid::Uuid;

pub use entity::{Model as QueuedReading, QueueStatus};
pub use schema::LegacyMigration;

use entity::{ActiveModel, Column, Entity};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Failed to open queue database: {0}")]
    Open(#[from] sea_orm::sqlx::Error),

    #[error("Failed to create queue directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Legacy queue table found; run `edge-relay migrate-legacy` first")]
    LegacySchema,

    #[error("Legacy migration copied {copied} rows, expected {expected}")]
    MigrationMismatch { expected: u64, copied: u64 },
}

/// A successful sample on its way into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_key: String,
    pub sensor_type: String,
    pub pin: String,
    pub sampled_at: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
}

/// Row counts per delivery state, for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub sent: u64,
    pub error: u64,
    /// `error` rows that exhausted their attempts and are no longer drained.
    pub dead: u64,
}

#[derive(Clone)]
pub struct LocalQueue {
    db: DatabaseConnection,
}

impl LocalQueue {
    /// Open (creating if needed) the queue database at `path`.
    ///
    /// Does not touch the schema; call `ensure_schema` or `migrate_legacy`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the database cannot be created.
    pub async fn connect(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        // One connection per process: the collector only appends, the
        // dispatcher runs one cycle at a time.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self::from_connection(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool)))
    }

    /// Open the queue at `path` and make sure its schema exists.
    ///
    /// # Errors
    ///
    /// See `connect` and `ensure_schema`.
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        let queue = Self::connect(path).await?;
        queue.ensure_schema().await?;
        Ok(queue)
    }

    #[must_use]
    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// # Errors
    ///
    /// Returns `QueueError::LegacySchema` if the table must be migrated first.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        schema::ensure_schema(&self.db).await
    }

    /// # Errors
    ///
    /// Returns an error if the migration fails; nothing is committed then.
    pub async fn migrate_legacy(&self) -> Result<Option<LegacyMigration>, QueueError> {
        schema::migrate_legacy(&self.db).await
    }

    /// Append one reading as `pending` with a fresh delivery token.
    ///
    /// A single INSERT: the row is either fully visible to the dispatcher or
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn append(&self, reading: NewReading) -> Result<QueuedReading, QueueError> {
        let row = ActiveModel {
            reading_uuid: Set(Uuid::new_v4().to_string()),
            device_key: Set(reading.device_key),
            sensor_type: Set(reading.sensor_type),
            pin: Set(reading.pin),
            sampled_at: Set(reading.sampled_at),
            temperature: Set(Some(reading.temperature)),
            humidity: Set(Some(reading.humidity)),
            status: Set(QueueStatus::Pending),
            attempt_count: Set(0),
            last_error: Set(None),
            last_attempt_at: Set(None),
            ..Default::default()
        };

        Ok(row.insert(&self.db).await?)
    }

    /// Up to `limit` rows in one of `statuses`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn fetch_batch(
        &self,
        limit: u64,
        statuses: &[QueueStatus],
    ) -> Result<Vec<QueuedReading>, QueueError> {
        Ok(Entity::find()
            .filter(Column::Status.is_in(statuses.iter().copied()))
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Up to `limit` rows the dispatcher should try next, oldest first:
    /// every `pending` row plus `error` rows below `max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn fetch_retryable(
        &self,
        limit: u64,
        max_attempts: i32,
    ) -> Result<Vec<QueuedReading>, QueueError> {
        Ok(Entity::find()
            .filter(
                Condition::any()
                    .add(Column::Status.eq(QueueStatus::Pending))
                    .add(
                        Condition::all()
                            .add(Column::Status.eq(QueueStatus::Error))
                            .add(Column::AttemptCount.lt(max_attempts)),
                    ),
            )
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Mark a row delivered. Returns `false` if it was already `sent` (or
    /// does not exist); that is not an error.
    ///
    /// `attempt_count` is incremented here too, so it counts the successful
    /// attempt along with every failed one.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_sent(&self, local_id: i64) -> Result<bool, QueueError> {
        let result = Entity::update_many()
            .set(ActiveModel {
                status: Set(QueueStatus::Sent),
                last_error: Set(None),
                last_attempt_at: Set(Some(Utc::now())),
                ..Default::default()
            })
            .col_expr(Column::AttemptCount, Expr::col(Column::AttemptCount).add(1))
            .filter(Column::Id.eq(local_id))
            .filter(Column::Status.ne(QueueStatus::Sent))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Record a failed delivery attempt. A `sent` row is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_error(&self, local_id: i64, message: &str) -> Result<bool, QueueError> {
        let result = Entity::update_many()
            .set(ActiveModel {
                status: Set(QueueStatus::Error),
                last_error: Set(Some(message.to_string())),
                last_attempt_at: Set(Some(Utc::now())),
                ..Default::default()
            })
            .col_expr(Column::AttemptCount, Expr::col(Column::AttemptCount).add(1))
            .filter(Column::Id.eq(local_id))
            .filter(Column::Status.ne(QueueStatus::Sent))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, local_id: i64) -> Result<Option<QueuedReading>, QueueError> {
        Ok(Entity::find_by_id(local_id).one(&self.db).await?)
    }

    /// # Errors
    ///
    /// Returns an error if a count query fails.
    pub async fn counts(&self, max_attempts: i32) -> Result<QueueCounts, QueueError> {
        let count_status = |status: QueueStatus| {
            Entity::find()
                .filter(Column::Status.eq(status))
                .count(&self.db)
        };

        Ok(QueueCounts {
            pending: count_status(QueueStatus::Pending).await?,
            sent: count_status(QueueStatus::Sent).await?,
            error: count_status(QueueStatus::Error).await?,
            dead: Entity::find()
                .filter(Column::Status.eq(QueueStatus::Error))
                .filter(Column::AttemptCount.gte(max_attempts))
                .count(&self.db)
                .await?,
        })
    }
}
