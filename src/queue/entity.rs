use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Delivery state of a queued reading. Only the dispatcher moves a row out of
/// `Pending`, and nothing moves a row out of `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "sent")]
    Sent,
    #[sea_orm(string_value = "error")]
    Error,
}

/// One sampled reading waiting for (or done with) delivery.
///
/// `temperature`/`humidity` are only null on rows carried over from the
/// legacy table, which also recorded failed samples.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "queue_readings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub reading_uuid: String,
    pub device_key: String,
    pub sensor_type: String,
    pub pin: String,
    pub sampled_at: DateTimeUtc,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: QueueStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// The logical sensor identity this reading belongs to.
    #[must_use]
    pub fn sensor_key(&self) -> crate::sync::identity::SensorKey {
        crate::sync::identity::SensorKey::new(&self.device_key, &self.sensor_type, &self.pin)
    }
}
