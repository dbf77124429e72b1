//! Mapping of a logical (device, sensor type, pin) triple to remote surrogate
//! keys, creating the remote rows on first sight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;

use crate::remote::{DeviceDetails, RemoteError, RemoteStore, with_timeout};

/// Natural key of a remote sensor, as denormalized on every queued row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorKey {
    pub device_key: String,
    pub sensor_type: String,
    pub pin: String,
}

impl SensorKey {
    #[must_use]
    pub fn new(device_key: &str, sensor_type: &str, pin: &str) -> Self {
        Self {
            device_key: device_key.to_string(),
            sensor_type: sensor_type.to_string(),
            pin: pin.to_string(),
        }
    }
}

impl std::fmt::Display for SensorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.device_key, self.sensor_type, self.pin)
    }
}

/// Resolved identities for the lifetime of one dispatcher.
///
/// Remote identities are append-only, so entries are never invalidated; a
/// restart starts from an empty cache.
pub struct IdentityCache {
    sensors: Cache<SensorKey, i32>,
    devices: Cache<String, i32>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IdentityCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sensors: Cache::builder().build(),
            devices: Cache::builder().build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn sensor(&self, key: &SensorKey) -> Option<i32> {
        let found = self.sensors.get(key).await;
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub async fn insert_sensor(&self, key: SensorKey, sensor_id: i32) {
        self.sensors.insert(key, sensor_id).await;
    }

    pub async fn device(&self, device_key: &str) -> Option<i32> {
        self.devices.get(device_key).await
    }

    pub async fn insert_device(&self, device_key: String, device_id: i32) {
        self.devices.insert(device_key, device_id).await;
    }

    /// Sensor lookups answered from memory.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Sensor lookups that needed the remote store.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub async fn sensor_count(&self) -> u64 {
        self.sensors.run_pending_tasks().await;
        self.sensors.entry_count()
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IdentityResolver<R> {
    remote: Arc<R>,
    cache: Arc<IdentityCache>,
    call_timeout: Duration,
    /// Details reported for this edge device's own key.
    local_device: Option<(String, DeviceDetails)>,
}

impl<R: RemoteStore> IdentityResolver<R> {
    #[must_use]
    pub fn new(remote: Arc<R>, cache: Arc<IdentityCache>, call_timeout: Duration) -> Self {
        Self {
            remote,
            cache,
            call_timeout,
            local_device: None,
        }
    }

    /// Report `details` whenever `device_key` is upserted. Other device keys
    /// are upserted without details.
    #[must_use]
    pub fn with_device_details(mut self, device_key: &str, details: DeviceDetails) -> Self {
        self.local_device = Some((device_key.to_string(), details));
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Remote sensor id for `key`, creating the device and sensor rows if
    /// needed.
    ///
    /// Concurrent resolvers may both miss the lookup and race to insert; the
    /// loser's insert hits the natural-key constraint and it re-reads the
    /// winner's row instead.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::Unreachable` on transport failure or timeout and
    /// `RemoteError::Rejected` for anything the store refuses.
    pub async fn resolve(&self, key: &SensorKey) -> Result<i32, RemoteError> {
        if let Some(sensor_id) = self.cache.sensor(key).await {
            return Ok(sensor_id);
        }

        let device_id = self.device_id(&key.device_key).await?;

        let existing = with_timeout(
            self.call_timeout,
            self.remote.find_sensor(device_id, &key.sensor_type, &key.pin),
        )
        .await?;

        let sensor_id = match existing {
            Some(id) => id,
            None => self.create_sensor(device_id, key).await?,
        };

        self.cache.insert_sensor(key.clone(), sensor_id).await;
        Ok(sensor_id)
    }

    async fn device_id(&self, device_key: &str) -> Result<i32, RemoteError> {
        if let Some(device_id) = self.cache.device(device_key).await {
            return Ok(device_id);
        }

        let unreported = DeviceDetails::default();
        let details = self
            .local_device
            .as_ref()
            .filter(|(key, _)| key == device_key)
            .map_or(&unreported, |(_, details)| details);

        let device_id = with_timeout(
            self.call_timeout,
            self.remote.upsert_device(device_key, details),
        )
        .await?;

        self.cache.insert_device(device_key.to_string(), device_id).await;
        Ok(device_id)
    }

    async fn create_sensor(&self, device_id: i32, key: &SensorKey) -> Result<i32, RemoteError> {
        let created = with_timeout(
            self.call_timeout,
            self.remote.create_sensor(device_id, &key.sensor_type, &key.pin),
        )
        .await;

        match created {
            Ok(sensor_id) => {
                tracing::info!(sensor = %key, sensor_id, "Created remote sensor");
                Ok(sensor_id)
            }
            Err(RemoteError::Duplicate(_)) => {
                tracing::debug!(sensor = %key, "Sensor created concurrently, re-reading");
                with_timeout(
                    self.call_timeout,
                    self.remote.find_sensor(device_id, &key.sensor_type, &key.pin),
                )
                .await?
                .ok_or_else(|| {
                    RemoteError::Rejected(format!("sensor {key} conflicted but cannot be read"))
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_counts_hits_and_misses() {
        tokio_test::block_on(async {
            let cache = IdentityCache::new();
            let key = SensorKey::new("edge-01", "DHT22", "GPIO4");

            assert_eq!(cache.sensor(&key).await, None);
            cache.insert_sensor(key.clone(), 7).await;
            assert_eq!(cache.sensor(&key).await, Some(7));
            assert_eq!(cache.sensor(&key).await, Some(7));

            assert_eq!(cache.hits(), 2);
            assert_eq!(cache.misses(), 1);
            assert_eq!(cache.sensor_count().await, 1);
        });
    }

    #[test]
    fn device_lookups_do_not_touch_sensor_counters() {
        tokio_test::block_on(async {
            let cache = IdentityCache::new();
            assert_eq!(cache.device("edge-01").await, None);
            cache.insert_device("edge-01".to_string(), 3).await;
            assert_eq!(cache.device("edge-01").await, Some(3));
            assert_eq!(cache.hits() + cache.misses(), 0);
        });
    }

    #[test]
    fn sensor_key_display() {
        let key = SensorKey::new("edge-01", "DHT22", "GPIO4");
        assert_eq!(key.to_string(), "edge-01/DHT22@GPIO4");
    }
}
