use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::queue::{LocalQueue, QueueError, QueuedReading};
use crate::remote::{RemoteError, RemoteReading, RemoteStore, with_timeout};
use crate::sync::backoff::Backoff;
use crate::sync::identity::{IdentityResolver, SensorKey};

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub batch_size: u64,
    /// Rows that reached this many attempts stay `error` for manual inspection.
    pub max_attempts: i32,
    pub call_timeout: Duration,
}

/// Counters of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub drained: usize,
    /// Distinct sensor triples resolved (from cache or remotely).
    pub resolved: usize,
    pub sent: usize,
    /// Subset of `sent` the store already had from an earlier attempt.
    pub duplicates: usize,
    pub errored: usize,
    /// The batch was full, so more rows are probably waiting.
    pub full_batch: bool,
}

impl CycleReport {
    /// Whether the cycle reached the store and got something done.
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.resolved > 0 || self.sent > 0
    }

    /// A full batch that delivered rows. A full batch of failures does not
    /// count: those rows wait for the regular interval.
    #[must_use]
    pub fn has_backlog(&self) -> bool {
        self.full_batch && self.sent > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing to send; no remote call was made.
    Idle,
    Completed(CycleReport),
    /// The store could not be reached. No local row was touched.
    Unreachable { error: String, retry_in: Duration },
}

/// What to write back to the local row once the cycle has finished talking to
/// the store.
enum Settlement {
    Sent { duplicate: bool },
    Failed(String),
}

/// Drains the local queue into the central store, one cycle at a time.
pub struct Dispatcher<R> {
    queue: LocalQueue,
    remote: Arc<R>,
    resolver: IdentityResolver<R>,
    backoff: Backoff,
    settings: DispatchSettings,
    remote_ready: bool,
}

impl<R: RemoteStore> Dispatcher<R> {
    #[must_use]
    pub fn new(
        queue: LocalQueue,
        remote: Arc<R>,
        resolver: IdentityResolver<R>,
        backoff: Backoff,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            remote,
            resolver,
            backoff,
            settings,
            remote_ready: false,
        }
    }

    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver<R> {
        &self.resolver
    }

    #[must_use]
    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    /// Run one drain cycle: fetch, resolve, insert, settle.
    ///
    /// Local rows are only written in the settle step, after every remote call
    /// of the cycle succeeded or failed for row-scoped reasons. If the store
    /// becomes unreachable midway, readings already inserted stay pending and
    /// come back as duplicates next cycle.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local queue itself fails.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, QueueError> {
        let rows = self
            .queue
            .fetch_retryable(self.settings.batch_size, self.settings.max_attempts)
            .await?;

        if rows.is_empty() {
            tracing::debug!("Local queue empty, nothing to dispatch");
            return Ok(CycleOutcome::Idle);
        }

        let mut report = CycleReport {
            drained: rows.len(),
            full_batch: rows.len() as u64 >= self.settings.batch_size,
            ..CycleReport::default()
        };

        let settlements = match self.deliver(&rows, &mut report).await {
            Ok(settlements) => settlements,
            Err(error) => return Ok(self.unreachable(&error, &report)),
        };

        for (row, settlement) in rows.iter().zip(settlements) {
            match settlement {
                Settlement::Sent { duplicate } => {
                    self.queue.mark_sent(row.id).await?;
                    report.sent += 1;
                    if duplicate {
                        report.duplicates += 1;
                    }
                }
                Settlement::Failed(message) => {
                    tracing::warn!(
                        local_id = row.id,
                        reading_uuid = %row.reading_uuid,
                        attempt = row.attempt_count + 1,
                        error = %message,
                        "Reading not delivered"
                    );
                    self.queue.mark_error(row.id, &message).await?;
                    report.errored += 1;
                }
            }
        }

        if report.made_progress() {
            self.backoff.reset();
        }

        tracing::info!(
            drained = report.drained,
            resolved = report.resolved,
            sent = report.sent,
            duplicates = report.duplicates,
            errored = report.errored,
            "Dispatch cycle completed"
        );

        Ok(CycleOutcome::Completed(report))
    }

    /// Talk to the store for every row of the batch. Returns one settlement
    /// per row, in row order, or the connectivity error that aborted the cycle.
    async fn deliver(
        &mut self,
        rows: &[QueuedReading],
        report: &mut CycleReport,
    ) -> Result<Vec<Settlement>, RemoteError> {
        self.prepare_remote().await?;

        // Resolve each distinct triple once, in order of first appearance
        let mut identities: HashMap<SensorKey, Result<i32, RemoteError>> = HashMap::new();
        for row in rows {
            let key = row.sensor_key();
            if identities.contains_key(&key) {
                continue;
            }
            let resolved = match self.resolver.resolve(&key).await {
                Err(e) if e.is_unreachable() => return Err(e),
                Err(e) => {
                    tracing::warn!(sensor = %key, error = %e, "Identity resolution failed");
                    Err(e)
                }
                Ok(sensor_id) => {
                    report.resolved += 1;
                    Ok(sensor_id)
                }
            };
            identities.insert(key, resolved);
        }

        let mut settlements = Vec::with_capacity(rows.len());
        for row in rows {
            let sensor_id = match &identities[&row.sensor_key()] {
                Ok(sensor_id) => *sensor_id,
                Err(e) => {
                    settlements.push(Settlement::Failed(format!(
                        "identity resolution failed: {e}"
                    )));
                    continue;
                }
            };

            let reading = match to_remote(row, sensor_id) {
                Ok(reading) => reading,
                Err(message) => {
                    settlements.push(Settlement::Failed(message));
                    continue;
                }
            };

            let inserted = with_timeout(
                self.settings.call_timeout,
                self.remote.insert_reading(&reading),
            )
            .await;

            settlements.push(match inserted {
                Ok(()) => Settlement::Sent { duplicate: false },
                Err(RemoteError::Duplicate(_)) => {
                    tracing::debug!(
                        reading_uuid = %reading.reading_uuid,
                        "Reading already delivered"
                    );
                    Settlement::Sent { duplicate: true }
                }
                Err(e) if e.is_unreachable() => return Err(e),
                Err(e) => Settlement::Failed(format!("insert failed: {e}")),
            });
        }

        Ok(settlements)
    }

    async fn prepare_remote(&mut self) -> Result<(), RemoteError> {
        if self.remote_ready {
            return Ok(());
        }

        match with_timeout(self.settings.call_timeout, self.remote.prepare()).await {
            Ok(()) => {
                self.remote_ready = true;
                tracing::info!("Remote schema ready");
                Ok(())
            }
            Err(e) if e.is_unreachable() => Err(e),
            Err(e) => {
                // Another device may be migrating concurrently; inserts will
                // tell whether the schema is usable.
                tracing::warn!(error = %e, "Remote schema preparation failed, retrying next cycle");
                Ok(())
            }
        }
    }

    fn unreachable(&mut self, error: &RemoteError, report: &CycleReport) -> CycleOutcome {
        let retry_in = self.backoff.record_failure();
        tracing::warn!(
            error = %error,
            drained = report.drained,
            failures = self.backoff.failures(),
            retry_in_ms = retry_in.as_millis() as u64,
            "Remote store unreachable, cycle aborted"
        );
        CycleOutcome::Unreachable {
            error: error.to_string(),
            retry_in,
        }
    }
}

fn to_remote(row: &QueuedReading, sensor_id: i32) -> Result<RemoteReading, String> {
    let reading_uuid = Uuid::parse_str(&row.reading_uuid)
        .map_err(|e| format!("invalid reading_uuid {:?}: {e}", row.reading_uuid))?;

    let (Some(temperature), Some(humidity)) = (row.temperature, row.humidity) else {
        return Err("incomplete payload: missing temperature or humidity".to_string());
    };

    Ok(RemoteReading {
        sensor_id,
        reading_uuid,
        sampled_at: row.sampled_at,
        temperature,
        humidity,
    })
}
