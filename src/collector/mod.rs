//! The writer side: samples the sensor on a timer and appends successful
//! samples to the local queue. It never talks to the central store.

pub mod iio;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::queue::{LocalQueue, NewReading, QueueError, QueuedReading};

pub use iio::IioSampler;

/// One complete measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("Sensor read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sensor returned an unreadable value: {0}")]
    Parse(String),

    #[error("Sample out of range: {0}")]
    OutOfRange(String),
}

/// Source of measurements. Physical protocol handling lives behind this
/// trait; the collector only sees complete samples or failures.
pub trait Sampler: Send {
    fn read(&mut self) -> impl Future<Output = Result<Sample, SamplingError>> + Send;

    /// Reinitialize the sensor after a long run of failures.
    fn reset(&mut self) -> impl Future<Output = Result<(), SamplingError>> + Send {
        async { Ok(()) }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub device_key: String,
    pub sensor_type: String,
    pub pin: String,
    pub interval: Duration,
    /// Read attempts per interval before the interval is skipped.
    pub read_retries: u32,
    pub retry_sleep: Duration,
    /// Consecutive failed attempts that trigger a sampler reset.
    pub max_consecutive_failures: u32,
}

#[derive(Debug)]
pub enum SampleOutcome {
    Appended(QueuedReading),
    Skipped { attempts: u32, last_error: String },
}

pub struct Collector<S> {
    queue: LocalQueue,
    sampler: S,
    settings: CollectorSettings,
    consecutive_failures: u32,
}

impl<S: Sampler> Collector<S> {
    #[must_use]
    pub fn new(queue: LocalQueue, sampler: S, settings: CollectorSettings) -> Self {
        Self {
            queue,
            sampler,
            settings,
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Sample once, retrying up to `read_retries` times. Appends exactly one
    /// row on success and nothing otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error only if the append itself fails.
    pub async fn sample_once(&mut self) -> Result<SampleOutcome, QueueError> {
        let attempts = self.settings.read_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.sampler.read().await.and_then(validate) {
                Ok(sample) => {
                    self.consecutive_failures = 0;
                    let row = self
                        .queue
                        .append(NewReading {
                            device_key: self.settings.device_key.clone(),
                            sensor_type: self.settings.sensor_type.clone(),
                            pin: self.settings.pin.clone(),
                            sampled_at: sample.sampled_at,
                            temperature: sample.temperature,
                            humidity: sample.humidity,
                        })
                        .await?;

                    tracing::info!(
                        local_id = row.id,
                        reading_uuid = %row.reading_uuid,
                        temperature = sample.temperature,
                        humidity = sample.humidity,
                        attempt,
                        "Sample queued"
                    );
                    return Ok(SampleOutcome::Appended(row));
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    last_error = e.to_string();
                    tracing::warn!(
                        attempt,
                        attempts,
                        consecutive_failures = self.consecutive_failures,
                        error = %e,
                        "Sample failed"
                    );

                    if self.consecutive_failures >= self.settings.max_consecutive_failures {
                        self.reset_sampler().await;
                    }

                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_sleep).await;
                    }
                }
            }
        }

        tracing::warn!(attempts, error = %last_error, "Skipping sampling interval");
        Ok(SampleOutcome::Skipped {
            attempts,
            last_error,
        })
    }

    async fn reset_sampler(&mut self) {
        tracing::warn!(
            consecutive_failures = self.consecutive_failures,
            "Too many consecutive failures, resetting sensor"
        );
        if let Err(e) = self.sampler.reset().await {
            tracing::error!(error = %e, "Sensor reset failed");
        }
        self.consecutive_failures = 0;
    }

    /// Sample every `interval` until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            device = %self.settings.device_key,
            sensor_type = %self.settings.sensor_type,
            pin = %self.settings.pin,
            interval_secs = self.settings.interval.as_secs(),
            "Starting collector"
        );

        let mut next_tick = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.sample_once().await {
                tracing::error!(error = %e, "Failed to queue sample");
            }

            // Fixed cadence; a slow interval does not shift the ones after it
            next_tick += self.settings.interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }

            tokio::select! {
                () = tokio::time::sleep_until(next_tick) => {}
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Collector stopped");
    }
}

/// Reject readings no DHT-family sensor can produce.
fn validate(sample: Sample) -> Result<Sample, SamplingError> {
    if !sample.temperature.is_finite() || !(-40.0..=80.0).contains(&sample.temperature) {
        return Err(SamplingError::OutOfRange(format!(
            "temperature {}",
            sample.temperature
        )));
    }
    if !sample.humidity.is_finite() || !(0.0..=100.0).contains(&sample.humidity) {
        return Err(SamplingError::OutOfRange(format!("humidity {}", sample.humidity)));
    }
    Ok(sample)
}
