//! Tests for the sampling loop and the IIO sampler.
//!
//! Run with: cargo test --test collector_test

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use common::temp_queue;
use edge_relay::collector::{
    Collector, CollectorSettings, IioSampler, Sample, SampleOutcome, Sampler, SamplingError,
};
use edge_relay::queue::QueueStatus;

/// Plays back a fixed script of results, then keeps returning good samples.
struct ScriptedSampler {
    script: VecDeque<Result<(f64, f64), &'static str>>,
    resets: Arc<AtomicUsize>,
}

impl ScriptedSampler {
    fn new(script: Vec<Result<(f64, f64), &'static str>>) -> Self {
        Self {
            script: script.into(),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Sampler for ScriptedSampler {
    async fn read(&mut self) -> Result<Sample, SamplingError> {
        match self.script.pop_front().unwrap_or(Ok((22.0, 45.0))) {
            Ok((temperature, humidity)) => Ok(Sample {
                temperature,
                humidity,
                sampled_at: Utc::now(),
            }),
            Err(message) => Err(SamplingError::Parse(message.to_string())),
        }
    }

    async fn reset(&mut self) -> Result<(), SamplingError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn settings() -> CollectorSettings {
    CollectorSettings {
        device_key: "edge-01".to_string(),
        sensor_type: "DHT22".to_string(),
        pin: "GPIO4".to_string(),
        interval: Duration::from_secs(10),
        read_retries: 3,
        retry_sleep: Duration::ZERO,
        max_consecutive_failures: 10,
    }
}

#[tokio::test]
async fn successful_sample_appends_one_pending_row() {
    let (_dir, queue) = temp_queue().await;
    let mut collector = Collector::new(
        queue.clone(),
        ScriptedSampler::new(vec![Ok((23.4, 51.2))]),
        settings(),
    );

    let SampleOutcome::Appended(row) = collector.sample_once().await.unwrap() else {
        panic!("expected an appended sample");
    };

    assert_eq!(row.device_key, "edge-01");
    assert_eq!(row.sensor_type, "DHT22");
    assert_eq!(row.pin, "GPIO4");
    assert_eq!(row.temperature, Some(23.4));
    assert_eq!(row.humidity, Some(51.2));
    assert_eq!(row.status, QueueStatus::Pending);
    assert_eq!(queue.counts(50).await.unwrap().pending, 1);
}

#[tokio::test]
async fn failed_attempts_are_retried_within_the_interval() {
    let (_dir, queue) = temp_queue().await;
    let mut collector = Collector::new(
        queue.clone(),
        ScriptedSampler::new(vec![Err("checksum"), Err("timeout"), Ok((20.0, 40.0))]),
        settings(),
    );

    let outcome = collector.sample_once().await.unwrap();
    assert!(matches!(outcome, SampleOutcome::Appended(_)));
    assert_eq!(queue.counts(50).await.unwrap().pending, 1);
    assert_eq!(collector.consecutive_failures(), 0);
}

#[tokio::test]
async fn exhausted_retries_skip_the_interval_without_a_row() {
    let (_dir, queue) = temp_queue().await;
    let mut collector = Collector::new(
        queue.clone(),
        ScriptedSampler::new(vec![Err("checksum"), Err("checksum"), Err("timeout")]),
        settings(),
    );

    let SampleOutcome::Skipped {
        attempts,
        last_error,
    } = collector.sample_once().await.unwrap()
    else {
        panic!("expected a skipped interval");
    };

    assert_eq!(attempts, 3);
    assert!(last_error.contains("timeout"));
    assert_eq!(queue.counts(50).await.unwrap(), Default::default());
    assert_eq!(collector.consecutive_failures(), 3);
}

#[tokio::test]
async fn implausible_values_are_treated_as_failures() {
    let (_dir, queue) = temp_queue().await;
    let mut collector = Collector::new(
        queue.clone(),
        ScriptedSampler::new(vec![
            Ok((f64::NAN, 50.0)),
            Ok((21.0, 140.0)),
            Ok((-120.0, 50.0)),
        ]),
        settings(),
    );

    let outcome = collector.sample_once().await.unwrap();
    assert!(matches!(outcome, SampleOutcome::Skipped { attempts: 3, .. }));
    assert_eq!(queue.counts(50).await.unwrap().pending, 0);
}

#[tokio::test]
async fn sensor_is_reset_after_too_many_consecutive_failures() {
    let (_dir, queue) = temp_queue().await;
    let sampler = ScriptedSampler::new(vec![Err("checksum"); 6]);
    let resets = sampler.resets.clone();
    let mut collector = Collector::new(
        queue,
        sampler,
        CollectorSettings {
            max_consecutive_failures: 4,
            ..settings()
        },
    );

    collector.sample_once().await.unwrap();
    assert_eq!(resets.load(Ordering::SeqCst), 0);
    assert_eq!(collector.consecutive_failures(), 3);

    // Fourth failure triggers the reset, the next two start a new run
    collector.sample_once().await.unwrap();
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(collector.consecutive_failures(), 2);
}

#[tokio::test]
async fn run_samples_on_schedule_until_shutdown() {
    let (_dir, queue) = temp_queue().await;
    let collector = Collector::new(
        queue.clone(),
        ScriptedSampler::new(Vec::new()),
        CollectorSettings {
            interval: Duration::from_millis(50),
            ..settings()
        },
    );

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(collector.run(rx));

    tokio::time::sleep(Duration::from_millis(180)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("collector stopped")
        .unwrap();

    let pending = queue.counts(50).await.unwrap().pending;
    assert!((2..=5).contains(&pending), "pending = {pending}");
}

fn iio_fixture(temperature: &str, humidity: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in_temp_input"), temperature).unwrap();
    std::fs::write(dir.path().join("in_humidityrelative_input"), humidity).unwrap();
    dir
}

#[tokio::test]
async fn iio_sampler_converts_milli_units() {
    let dir = iio_fixture("23450\n", "51200\n");
    let mut sampler = IioSampler::new(dir.path());

    let sample = sampler.read().await.unwrap();
    assert!((sample.temperature - 23.45).abs() < 1e-9);
    assert!((sample.humidity - 51.2).abs() < 1e-9);
    assert!(sampler.reset().await.is_ok());
}

#[tokio::test]
async fn iio_sampler_reports_unreadable_channels() {
    let garbled = iio_fixture("23450", "");
    let mut sampler = IioSampler::new(garbled.path());
    assert!(matches!(
        sampler.read().await,
        Err(SamplingError::Parse(_))
    ));

    let missing = tempfile::tempdir().unwrap();
    let mut sampler = IioSampler::new(missing.path().join("iio:device0"));
    assert!(matches!(sampler.read().await, Err(SamplingError::Io(_))));
    assert!(sampler.reset().await.is_err());
}
