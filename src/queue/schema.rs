//! Local queue schema: self-provisioning plus the one-time legacy migration.
//!
//! The legacy collector wrote to a `queue_readings` table without a `status`
//! column, tracking delivery with `synced`/`dead` flags. Some of those tables
//! already carry a `reading_uuid` per row, older ones do not.
//! Such a table is never modified in place: `migrate_legacy` renames it to an
//! inert `queue_readings_legacy_<timestamp>` table and copies every row into a
//! fresh table, keeping an existing delivery token or minting one.

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DatabaseTransaction, EntityTrait,
    FromQueryResult, PaginatorTrait, Set, Statement, TransactionTrait,
};
use uuid::Uuid;

use super::entity::{self, QueueStatus};
use super::QueueError;

pub const TABLE: &str = "queue_readings";

/// Rows copied per INSERT while migrating.
const COPY_BATCH_SIZE: usize = 500;

// language=sql
const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS queue_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        reading_uuid TEXT NOT NULL UNIQUE,
        device_key TEXT NOT NULL,
        sensor_type TEXT NOT NULL,
        pin TEXT NOT NULL,
        sampled_at TEXT NOT NULL,
        temperature REAL,
        humidity REAL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'sent', 'error')),
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        last_attempt_at TEXT
    )
";

// language=sql
const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_queue_readings_status_id ON queue_readings (status, id)";

#[derive(Debug, FromQueryResult)]
struct NameRow {
    name: String,
}

/// Outcome of `migrate_legacy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMigration {
    pub legacy_table: String,
    pub rows_copied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Missing,
    Current,
    Legacy,
}

async fn table_state<C: ConnectionTrait>(db: &C) -> Result<TableState, QueueError> {
    let tables = NameRow::find_by_statement(Statement::from_sql_and_values(
        DatabaseBackend::Sqlite,
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        [TABLE.into()],
    ))
    .all(db)
    .await?;

    if tables.is_empty() {
        return Ok(TableState::Missing);
    }

    // `reading_uuid` alone is not enough: legacy tables may have it too
    let columns = table_columns(db, TABLE).await?;
    if columns.iter().any(|c| c == "status") {
        Ok(TableState::Current)
    } else {
        Ok(TableState::Legacy)
    }
}

async fn table_columns<C: ConnectionTrait>(db: &C, table: &str) -> Result<Vec<String>, QueueError> {
    let rows = NameRow::find_by_statement(Statement::from_sql_and_values(
        DatabaseBackend::Sqlite,
        "SELECT name FROM pragma_table_info(?)",
        [table.into()],
    ))
    .all(db)
    .await?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

async fn create_current<C: ConnectionTrait>(db: &C) -> Result<(), QueueError> {
    db.execute_unprepared(CREATE_TABLE).await?;
    db.execute_unprepared(CREATE_STATUS_INDEX).await?;
    Ok(())
}

/// Create the queue table and its index if absent.
///
/// Safe to call from the collector and the dispatcher at the same time: every
/// statement is `IF NOT EXISTS` and SQLite runs each one atomically.
///
/// # Errors
///
/// Returns `QueueError::LegacySchema` if a pre-idempotency table is present;
/// it must be migrated explicitly with `migrate_legacy` first.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), QueueError> {
    match table_state(db).await? {
        TableState::Legacy => return Err(QueueError::LegacySchema),
        TableState::Missing => {
            create_current(db).await?;
            tracing::info!(table = TABLE, "Created local queue table");
        }
        TableState::Current => {
            // Older builds may predate the index
            db.execute_unprepared(CREATE_STATUS_INDEX).await?;
        }
    }
    Ok(())
}

/// Move a legacy queue table aside and copy its rows into the current schema.
///
/// Returns `Ok(None)` when there is nothing to migrate (no table, or the table
/// is already current). The legacy table is renamed, never dropped, and the
/// copy keeps every row's local id.
///
/// # Errors
///
/// Returns an error if any statement fails or the copied row count differs
/// from the legacy row count; in both cases nothing is committed.
pub async fn migrate_legacy(db: &DatabaseConnection) -> Result<Option<LegacyMigration>, QueueError> {
    let txn = db.begin().await?;

    if table_state(&txn).await? != TableState::Legacy {
        txn.rollback().await?;
        return Ok(None);
    }

    let legacy_table = format!("{TABLE}_legacy_{}", Utc::now().format("%Y%m%d%H%M%S"));
    txn.execute_unprepared(&format!("ALTER TABLE {TABLE} RENAME TO {legacy_table}"))
        .await?;
    create_current(&txn).await?;

    let legacy_rows = read_legacy_rows(&txn, &legacy_table).await?;
    let expected = legacy_rows.len() as u64;

    let models: Vec<entity::ActiveModel> = legacy_rows.into_iter().map(LegacyRow::into_active).collect();
    for chunk in models.chunks(COPY_BATCH_SIZE) {
        entity::Entity::insert_many(chunk.to_vec())
            .exec_without_returning(&txn)
            .await?;
    }

    let copied = entity::Entity::find().count(&txn).await?;
    if copied != expected {
        txn.rollback().await?;
        return Err(QueueError::MigrationMismatch { expected, copied });
    }

    txn.commit().await?;

    tracing::info!(
        legacy_table = %legacy_table,
        rows = copied,
        "Migrated legacy queue table"
    );

    Ok(Some(LegacyMigration {
        legacy_table,
        rows_copied: copied,
    }))
}

/// A row of the legacy table. Only the identity, timestamp and payload columns
/// are required; bookkeeping columns missing from older variants read as NULL.
#[derive(Debug, FromQueryResult)]
struct LegacyRow {
    id: i64,
    reading_uuid: Option<String>,
    device_key: String,
    sensor_type: String,
    pin: String,
    ts_epoch_utc: i64,
    temperature_c: Option<f64>,
    humidity_pct: Option<f64>,
    ok: Option<i32>,
    error_msg: Option<String>,
    synced: Option<i32>,
    dead: Option<i32>,
    attempts: Option<i32>,
    last_attempt_utc: Option<String>,
}

const LEGACY_OPTIONAL_COLUMNS: &[&str] = &[
    "reading_uuid",
    "ok",
    "error_msg",
    "synced",
    "dead",
    "attempts",
    "last_attempt_utc",
];

async fn read_legacy_rows(
    txn: &DatabaseTransaction,
    legacy_table: &str,
) -> Result<Vec<LegacyRow>, QueueError> {
    let present = table_columns(txn, legacy_table).await?;

    let mut select = vec![
        "id".to_string(),
        "device_key".to_string(),
        "sensor_type".to_string(),
        "pin".to_string(),
        "ts_epoch_utc".to_string(),
        "temperature_c".to_string(),
        "humidity_pct".to_string(),
    ];
    for column in LEGACY_OPTIONAL_COLUMNS {
        if present.iter().any(|c| c == column) {
            select.push((*column).to_string());
        } else {
            select.push(format!("NULL AS {column}"));
        }
    }

    let sql = format!(
        "SELECT {} FROM {legacy_table} ORDER BY id ASC",
        select.join(", ")
    );

    Ok(
        LegacyRow::find_by_statement(Statement::from_string(DatabaseBackend::Sqlite, sql))
            .all(txn)
            .await?,
    )
}

impl LegacyRow {
    fn into_active(self) -> entity::ActiveModel {
        let complete = self.temperature_c.is_some() && self.humidity_pct.is_some();
        let (status, last_error) = if self.synced == Some(1) {
            (QueueStatus::Sent, None)
        } else if self.ok == Some(0) || !complete {
            (
                QueueStatus::Error,
                Some(
                    self.error_msg
                        .unwrap_or_else(|| "legacy sample without payload".to_string()),
                ),
            )
        } else if self.dead == Some(1) {
            (
                QueueStatus::Error,
                Some("dead-lettered before migration".to_string()),
            )
        } else {
            (QueueStatus::Pending, None)
        };

        let sampled_at = DateTime::from_timestamp(self.ts_epoch_utc, 0).unwrap_or_else(Utc::now);
        let last_attempt_at = self
            .last_attempt_utc
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
            .map(|naive| naive.and_utc());

        // Rows may already have reached the store under their old token
        let reading_uuid = self
            .reading_uuid
            .as_deref()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);

        entity::ActiveModel {
            id: Set(self.id),
            reading_uuid: Set(reading_uuid.to_string()),
            device_key: Set(self.device_key),
            sensor_type: Set(self.sensor_type),
            pin: Set(self.pin),
            sampled_at: Set(sampled_at),
            temperature: Set(self.temperature_c),
            humidity: Set(self.humidity_pct),
            status: Set(status),
            attempt_count: Set(self.attempts.unwrap_or(0)),
            last_error: Set(last_error),
            last_attempt_at: Set(last_attempt_at),
        }
    }
}
