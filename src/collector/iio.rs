use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{Sample, Sampler, SamplingError};

/// Reads a DHT sensor through the Linux industrial I/O interface.
///
/// The kernel `dht11` driver (which also handles DHT22) exposes
/// `in_temp_input` in milli-degrees Celsius and `in_humidityrelative_input`
/// in milli-percent. A checksum or timing failure surfaces as an I/O error.
pub struct IioSampler {
    dir: PathBuf,
}

impl IioSampler {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_milli(&self, channel: &str) -> Result<f64, SamplingError> {
        let raw = tokio::fs::read_to_string(self.dir.join(channel)).await?;
        let value: i64 = raw
            .trim()
            .parse()
            .map_err(|_| SamplingError::Parse(format!("{channel}: {:?}", raw.trim())))?;
        Ok(value as f64 / 1000.0)
    }
}

impl Sampler for IioSampler {
    async fn read(&mut self) -> Result<Sample, SamplingError> {
        let temperature = self.read_milli("in_temp_input").await?;
        let humidity = self.read_milli("in_humidityrelative_input").await?;
        Ok(Sample {
            temperature,
            humidity,
            sampled_at: Utc::now(),
        })
    }

    async fn reset(&mut self) -> Result<(), SamplingError> {
        // Each read re-triggers the sensor; just make sure the device is back
        if tokio::fs::metadata(&self.dir).await.is_err() {
            return Err(SamplingError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not present", self.dir.display()),
            )));
        }
        Ok(())
    }
}
