//! Shared fixtures: a file-backed local queue and a SQLite-backed central
//! store wrapped with call counters and fault injection.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sea_orm::{
    ColumnTrait, ConnectOptions, Database, EntityTrait, PaginatorTrait, QueryFilter, QuerySelect,
};
use sea_orm_migration::MigratorTrait;
use tempfile::TempDir;
use uuid::Uuid;

use edge_relay::entity::{devices, readings, sensors};
use edge_relay::queue::{LocalQueue, NewReading};
use edge_relay::remote::{DeviceDetails, RemoteError, RemoteReading, RemoteStore, SeaOrmRemote};
use edge_relay::sync::{
    Backoff, BackoffPolicy, DispatchSettings, Dispatcher, IdentityCache, IdentityResolver,
};

pub const DEVICE: &str = "edge-01";
pub const SENSOR_TYPE: &str = "DHT22";

pub async fn temp_queue() -> (TempDir, LocalQueue) {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = LocalQueue::open(&dir.path().join("queue.db"))
        .await
        .expect("open queue");
    (dir, queue)
}

pub fn reading(pin: &str, minute: u32) -> NewReading {
    NewReading {
        device_key: DEVICE.to_string(),
        sensor_type: SENSOR_TYPE.to_string(),
        pin: pin.to_string(),
        sampled_at: Utc
            .with_ymd_and_hms(2026, 10, 19, 8, minute, 0)
            .single()
            .expect("valid timestamp"),
        temperature: 21.5,
        humidity: 48.0,
    }
}

/// A migrated central store in its own SQLite file.
pub async fn central_store(dir: &TempDir) -> SeaOrmRemote {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("central.db").display());
    let mut options = ConnectOptions::new(url);
    options.max_connections(1).sqlx_logging(false);

    let db = Database::connect(options).await.expect("connect central store");
    migration::Migrator::up(&db, None)
        .await
        .expect("migrate central store");
    SeaOrmRemote::new(db)
}

#[derive(Debug, Default)]
pub struct Calls {
    pub prepare: AtomicUsize,
    pub upsert_device: AtomicUsize,
    pub find_sensor: AtomicUsize,
    pub create_sensor: AtomicUsize,
    pub insert_reading: AtomicUsize,
}

impl Calls {
    pub fn total(&self) -> usize {
        [
            &self.prepare,
            &self.upsert_device,
            &self.find_sensor,
            &self.create_sensor,
            &self.insert_reading,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// `RemoteStore` that counts calls and can simulate outages, hung inserts,
/// stale reads and per-sensor rejections.
pub struct TestRemote {
    inner: SeaOrmRemote,
    pub calls: Calls,
    offline: AtomicBool,
    hang_inserts: AtomicBool,
    stale_lookups: AtomicUsize,
    rejected_pin: Mutex<Option<String>>,
    inserts_before_outage: Mutex<Option<usize>>,
}

impl TestRemote {
    pub fn new(inner: SeaOrmRemote) -> Self {
        Self {
            inner,
            calls: Calls::default(),
            offline: AtomicBool::new(false),
            hang_inserts: AtomicBool::new(false),
            stale_lookups: AtomicUsize::new(0),
            rejected_pin: Mutex::new(None),
            inserts_before_outage: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &SeaOrmRemote {
        &self.inner
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reading inserts never answer, like a store that accepted the
    /// connection and then stalled.
    pub fn hang_inserts(&self, hang: bool) {
        self.hang_inserts.store(hang, Ordering::SeqCst);
    }

    /// The next `n` sensor lookups report nothing, as if they raced a
    /// concurrent creation.
    pub fn stale_lookups(&self, n: usize) {
        self.stale_lookups.store(n, Ordering::SeqCst);
    }

    pub fn reject_sensors_on(&self, pin: &str) {
        *self.rejected_pin.lock().unwrap() = Some(pin.to_string());
    }

    /// Go offline after `n` more successful reading inserts.
    pub fn outage_after_inserts(&self, n: usize) {
        *self.inserts_before_outage.lock().unwrap() = Some(n);
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    pub async fn device_count(&self) -> u64 {
        devices::Entity::find()
            .count(self.inner.connection())
            .await
            .unwrap()
    }

    pub async fn sensor_count(&self) -> u64 {
        sensors::Entity::find()
            .count(self.inner.connection())
            .await
            .unwrap()
    }

    /// `(sensor_id, reading_uuid)` of every stored reading.
    pub async fn readings(&self) -> Vec<(i32, Uuid)> {
        readings::Entity::find()
            .select_only()
            .column(readings::Column::SensorId)
            .column(readings::Column::ReadingUuid)
            .into_tuple::<(i32, Uuid)>()
            .all(self.inner.connection())
            .await
            .unwrap()
    }

    pub async fn device_location(&self, device_key: &str) -> Option<String> {
        devices::Entity::find()
            .select_only()
            .column(devices::Column::Location)
            .filter(devices::Column::DeviceKey.eq(device_key))
            .into_tuple::<Option<String>>()
            .one(self.inner.connection())
            .await
            .unwrap()
            .flatten()
    }

    pub async fn device_ip(&self, device_key: &str) -> Option<String> {
        devices::Entity::find()
            .select_only()
            .column(devices::Column::Ip)
            .filter(devices::Column::DeviceKey.eq(device_key))
            .into_tuple::<Option<String>>()
            .one(self.inner.connection())
            .await
            .unwrap()
            .flatten()
    }
}

impl RemoteStore for TestRemote {
    async fn prepare(&self) -> Result<(), RemoteError> {
        self.calls.prepare.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.inner.prepare().await
    }

    async fn upsert_device(
        &self,
        device_key: &str,
        details: &DeviceDetails,
    ) -> Result<i32, RemoteError> {
        self.calls.upsert_device.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.inner.upsert_device(device_key, details).await
    }

    async fn find_sensor(
        &self,
        device_id: i32,
        sensor_type: &str,
        pin: &str,
    ) -> Result<Option<i32>, RemoteError> {
        self.calls.find_sensor.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let stale = self
            .stale_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stale {
            return Ok(None);
        }
        self.inner.find_sensor(device_id, sensor_type, pin).await
    }

    async fn create_sensor(
        &self,
        device_id: i32,
        sensor_type: &str,
        pin: &str,
    ) -> Result<i32, RemoteError> {
        self.calls.create_sensor.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let rejected = self.rejected_pin.lock().unwrap().as_deref() == Some(pin);
        if rejected {
            return Err(RemoteError::Rejected(format!(
                "value too long for column pin: {pin}"
            )));
        }
        self.inner.create_sensor(device_id, sensor_type, pin).await
    }

    async fn insert_reading(&self, reading: &RemoteReading) -> Result<(), RemoteError> {
        self.calls.insert_reading.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.hang_inserts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let outage = {
            let mut remaining = self.inserts_before_outage.lock().unwrap();
            match *remaining {
                Some(0) => true,
                Some(ref mut n) => {
                    *n -= 1;
                    false
                }
                None => false,
            }
        };
        if outage {
            self.set_offline(true);
            return Err(RemoteError::Unreachable("connection reset".to_string()));
        }
        self.inner.insert_reading(reading).await
    }
}

pub fn test_policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_secs(2),
        max: Duration::from_secs(60),
        jitter: 0.0,
    }
}

pub fn resolver(remote: &Arc<TestRemote>) -> IdentityResolver<TestRemote> {
    IdentityResolver::new(
        remote.clone(),
        Arc::new(IdentityCache::new()),
        Duration::from_secs(5),
    )
}

pub fn dispatcher(
    queue: &LocalQueue,
    remote: &Arc<TestRemote>,
    batch_size: u64,
    max_attempts: i32,
) -> Dispatcher<TestRemote> {
    dispatcher_with_settings(
        queue,
        remote,
        DispatchSettings {
            batch_size,
            max_attempts,
            call_timeout: Duration::from_secs(5),
        },
    )
}

pub fn dispatcher_with_settings(
    queue: &LocalQueue,
    remote: &Arc<TestRemote>,
    settings: DispatchSettings,
) -> Dispatcher<TestRemote> {
    Dispatcher::new(
        queue.clone(),
        remote.clone(),
        resolver(remote),
        Backoff::new(test_policy()),
        settings,
    )
}
