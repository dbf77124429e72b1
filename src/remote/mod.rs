//! Access to the central store: the only code allowed to write remote rows.

pub mod store;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{DbErr, RuntimeErr, SqlErr};
use uuid::Uuid;

pub use store::SeaOrmRemote;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The store could not be reached, or a call exceeded its timeout.
    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    /// A uniqueness constraint rejected the write.
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// Any other refusal (constraint, schema, permission, payload).
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<DbErr> for RemoteError {
    fn from(e: DbErr) -> Self {
        if is_connectivity(&e) {
            return Self::Unreachable(e.to_string());
        }
        match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => Self::Duplicate(msg),
            _ => Self::Rejected(e.to_string()),
        }
    }
}

fn is_connectivity(e: &DbErr) -> bool {
    use sea_orm::sqlx::Error as SqlxError;

    match e {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(RuntimeErr::SqlxError(inner)) | DbErr::Query(RuntimeErr::SqlxError(inner)) => {
            matches!(
                inner,
                SqlxError::Io(_)
                    | SqlxError::Tls(_)
                    | SqlxError::PoolTimedOut
                    | SqlxError::PoolClosed
                    | SqlxError::WorkerCrashed
            )
        }
        _ => false,
    }
}

/// Bound a remote call by `limit`. An expired call is indistinguishable from
/// an unreachable store.
///
/// # Errors
///
/// Returns the call's own error, or `RemoteError::Unreachable` on timeout.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Unreachable(format!(
            "call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// A reading ready for the remote `readings` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReading {
    pub sensor_id: i32,
    pub reading_uuid: Uuid,
    pub sampled_at: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
}

/// Metadata reported alongside a device upsert. A `None` field keeps the
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDetails {
    pub location: Option<String>,
    pub ip: Option<String>,
}

/// Operations the dispatcher needs from the central store.
///
/// Implementations report constraint conflicts as `RemoteError::Duplicate`
/// and transport failures as `RemoteError::Unreachable`; callers rely on
/// that split.
pub trait RemoteStore: Send + Sync {
    /// Make sure the remote schema exists. Called before the first drain
    /// cycle that has work, and again until it succeeds once.
    fn prepare(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Insert the device if absent and return its id. Fields present in
    /// `details` replace the stored ones.
    fn upsert_device(
        &self,
        device_key: &str,
        details: &DeviceDetails,
    ) -> impl Future<Output = Result<i32, RemoteError>> + Send;

    fn find_sensor(
        &self,
        device_id: i32,
        sensor_type: &str,
        pin: &str,
    ) -> impl Future<Output = Result<Option<i32>, RemoteError>> + Send;

    fn create_sensor(
        &self,
        device_id: i32,
        sensor_type: &str,
        pin: &str,
    ) -> impl Future<Output = Result<i32, RemoteError>> + Send;

    fn insert_reading(
        &self,
        reading: &RemoteReading,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
