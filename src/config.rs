use std::env;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::backoff::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Settings shared by the collector and the dispatcher.
#[derive(Debug, Clone)]
pub struct Config {
    // Identity of this edge device and its sensor
    pub device_key: String,
    pub device_location: Option<String>,
    /// Reported to the central store; detected from the routing table when
    /// `DEVICE_IP` is unset.
    pub device_ip: Option<String>,
    pub sensor_type: String,
    pub sensor_pin: String,
    pub sensor_iio_dir: PathBuf,

    // Local queue
    pub queue_path: PathBuf,

    // Collector settings
    pub read_interval_seconds: u64,
    pub read_retry_sleep_seconds: u64,
    pub read_retries: u32,
    pub max_consecutive_read_failures: u32,

    // Sync settings
    pub sync_interval_seconds: u64,
    pub sync_batch_size: u64,
    pub sync_max_attempts: i32,
    pub sync_call_timeout_seconds: u64,

    // Backoff
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    pub backoff_jitter: f64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if a required variable is not set and
    /// `ConfigError::Invalid` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let device_key = required("DEVICE_KEY")?;
        if device_key.trim().is_empty() {
            return Err(ConfigError::Invalid("DEVICE_KEY", device_key));
        }

        let config = Self {
            device_key,
            device_location: optional("DEVICE_LOCATION"),
            device_ip: optional("DEVICE_IP").or_else(local_ip),
            sensor_type: env::var("SENSOR_TYPE")
                .unwrap_or_else(|_| "DHT22".to_string())
                .trim()
                .to_uppercase(),
            sensor_pin: normalize_pin(
                &env::var("SENSOR_PIN").unwrap_or_else(|_| "D4".to_string()),
            ),
            sensor_iio_dir: PathBuf::from(
                env::var("SENSOR_IIO_DIR")
                    .unwrap_or_else(|_| "/sys/bus/iio/devices/iio:device0".to_string()),
            ),

            queue_path: PathBuf::from(
                env::var("QUEUE_PATH").unwrap_or_else(|_| "data/queue.db".to_string()),
            ),

            read_interval_seconds: parse_or("READ_INTERVAL_SECONDS", 10)?,
            read_retry_sleep_seconds: parse_or("READ_RETRY_SLEEP_SECONDS", 2)?,
            read_retries: parse_or("READ_RETRIES", 3)?,
            max_consecutive_read_failures: parse_or("MAX_CONSECUTIVE_READ_FAILURES", 10)?,

            sync_interval_seconds: parse_or("SYNC_INTERVAL_SECONDS", 5)?,
            sync_batch_size: parse_or("SYNC_BATCH_SIZE", 200)?,
            sync_max_attempts: parse_or("SYNC_MAX_ATTEMPTS", 50)?,
            sync_call_timeout_seconds: parse_or("SYNC_CALL_TIMEOUT_SECONDS", 5)?,

            backoff_base_seconds: parse_or("BACKOFF_BASE_SECONDS", 2)?,
            backoff_max_seconds: parse_or("BACKOFF_MAX_SECONDS", 300)?,
            backoff_jitter: parse_or("BACKOFF_JITTER", 0.2)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_interval_seconds == 0 {
            return Err(ConfigError::Invalid("READ_INTERVAL_SECONDS", "0".to_string()));
        }
        if self.sync_batch_size == 0 {
            return Err(ConfigError::Invalid("SYNC_BATCH_SIZE", "0".to_string()));
        }
        if self.sync_call_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "SYNC_CALL_TIMEOUT_SECONDS",
                "0".to_string(),
            ));
        }
        if self.sync_max_attempts <= 0 {
            return Err(ConfigError::Invalid(
                "SYNC_MAX_ATTEMPTS",
                self.sync_max_attempts.to_string(),
            ));
        }
        if self.backoff_max_seconds < self.backoff_base_seconds {
            return Err(ConfigError::Invalid(
                "BACKOFF_MAX_SECONDS",
                format!("{} < BACKOFF_BASE_SECONDS", self.backoff_max_seconds),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Invalid(
                "BACKOFF_JITTER",
                self.backoff_jitter.to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.read_interval_seconds)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_call_timeout_seconds)
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.backoff_base_seconds),
            max: Duration::from_secs(self.backoff_max_seconds),
            jitter: self.backoff_jitter,
        }
    }
}

/// Connection parameters of the central store. Only the dispatcher needs them.
#[derive(Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Plaintext transport for stores on a trusted internal network.
    pub insecure: bool,
}

impl RemoteConfig {
    /// Load the remote store settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if a required variable is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: required("REMOTE_HOST")?,
            port: parse_or("REMOTE_PORT", 5432)?,
            database: required("REMOTE_DB")?,
            user: required("REMOTE_USER")?,
            password: required("REMOTE_PASSWORD")?,
            insecure: parse_or("REMOTE_INSECURE", false)?,
        })
    }
}

// Keep the password out of logs.
impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<set>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Canonical pin name stored remotely: `D4` and `gpio4` both become `GPIO4`.
#[must_use]
pub fn normalize_pin(pin: &str) -> String {
    let s = pin.trim().to_uppercase();
    if s.starts_with("GPIO") {
        return s;
    }
    match s.strip_prefix('D') {
        Some(n) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => format!("GPIO{n}"),
        _ => s,
    }
}

/// Address of the interface used for outbound traffic. Connecting a UDP
/// socket sends no packet.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, raw)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
