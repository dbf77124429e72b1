use std::time::Duration;

use sea_orm::sea_query::OnConflict;
use sea_orm::sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect,
    Set, SqlxPostgresConnector,
};
use sea_orm_migration::MigratorTrait;

use super::{DeviceDetails, RemoteError, RemoteReading, RemoteStore};
use crate::config::RemoteConfig;
use crate::entity::{devices, readings, sensors};

/// `RemoteStore` backed by the central relational database.
#[derive(Clone)]
pub struct SeaOrmRemote {
    db: DatabaseConnection,
}

impl SeaOrmRemote {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Build a lazily connected PostgreSQL pool: nothing is dialed until the
    /// first call, so an unreachable store never blocks startup.
    #[must_use]
    pub fn connect_lazy(config: &RemoteConfig, acquire_timeout: Duration) -> Self {
        let ssl_mode = if config.insecure {
            PgSslMode::Disable
        } else {
            PgSslMode::Require
        };

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(ssl_mode)
            .options([("timezone", "UTC")]);

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(options);

        Self::new(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn find_device_id(&self, device_key: &str) -> Result<Option<i32>, DbErr> {
        devices::Entity::find()
            .select_only()
            .column(devices::Column::Id)
            .filter(devices::Column::DeviceKey.eq(device_key))
            .into_tuple::<i32>()
            .one(&self.db)
            .await
    }
}

impl RemoteStore for SeaOrmRemote {
    async fn prepare(&self) -> Result<(), RemoteError> {
        migration::Migrator::up(&self.db, None).await?;
        Ok(())
    }

    async fn upsert_device(
        &self,
        device_key: &str,
        details: &DeviceDetails,
    ) -> Result<i32, RemoteError> {
        let reported = |value: &Option<String>| {
            value
                .as_ref()
                .map_or(ActiveValue::NotSet, |v| Set(Some(v.clone())))
        };
        let device = devices::ActiveModel {
            device_key: Set(device_key.to_string()),
            location: reported(&details.location),
            ip: reported(&details.ip),
            ..Default::default()
        };

        // Only overwrite what this call actually reports
        let updated: Vec<devices::Column> = [
            (devices::Column::Location, details.location.is_some()),
            (devices::Column::Ip, details.ip.is_some()),
        ]
        .into_iter()
        .filter_map(|(column, present)| present.then_some(column))
        .collect();

        let mut on_conflict = OnConflict::column(devices::Column::DeviceKey);
        if updated.is_empty() {
            on_conflict.do_nothing();
        } else {
            on_conflict.update_columns(updated);
        }

        match devices::Entity::insert(device)
            .on_conflict(on_conflict)
            .exec_without_returning(&self.db)
            .await
        {
            // DO NOTHING on an existing key
            Ok(_) | Err(DbErr::RecordNotInserted) => {}
            Err(e) => return Err(e.into()),
        }

        self.find_device_id(device_key).await?.ok_or_else(|| {
            RemoteError::Rejected(format!("device {device_key} missing after upsert"))
        })
    }

    async fn find_sensor(
        &self,
        device_id: i32,
        sensor_type: &str,
        pin: &str,
    ) -> Result<Option<i32>, RemoteError> {
        Ok(sensors::Entity::find()
            .select_only()
            .column(sensors::Column::Id)
            .filter(sensors::Column::DeviceId.eq(device_id))
            .filter(sensors::Column::SensorType.eq(sensor_type))
            .filter(sensors::Column::Pin.eq(pin))
            .into_tuple::<i32>()
            .one(&self.db)
            .await?)
    }

    async fn create_sensor(
        &self,
        device_id: i32,
        sensor_type: &str,
        pin: &str,
    ) -> Result<i32, RemoteError> {
        let sensor = sensors::ActiveModel {
            device_id: Set(device_id),
            sensor_type: Set(sensor_type.to_string()),
            pin: Set(pin.to_string()),
            label: Set(Some(format!("{sensor_type}@{pin}"))),
            ..Default::default()
        };

        let result = sensors::Entity::insert(sensor).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    async fn insert_reading(&self, reading: &RemoteReading) -> Result<(), RemoteError> {
        let row = readings::ActiveModel {
            sensor_id: Set(reading.sensor_id),
            reading_uuid: Set(reading.reading_uuid),
            sampled_at: Set(reading.sampled_at.into()),
            temperature: Set(reading.temperature),
            humidity: Set(reading.humidity),
            ..Default::default()
        };

        readings::Entity::insert(row)
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}
