use std::time::Duration;

use tokio::sync::watch;

use crate::remote::RemoteStore;
use crate::sync::worker::{CycleOutcome, Dispatcher};

/// Run the dispatcher until `shutdown` flips.
///
/// Cycles never overlap. After a full batch that delivered rows the loop
/// drains again immediately. After a connectivity failure it waits whatever
/// the backoff decided. Every other cycle is followed by `idle_interval`.
pub async fn run_dispatcher<R: RemoteStore>(
    mut dispatcher: Dispatcher<R>,
    idle_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        idle_interval_secs = idle_interval.as_secs(),
        "Starting dispatcher"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Shutdown may abandon in-flight remote calls; rows already marked
        // sent are committed individually and stay sent.
        let outcome = tokio::select! {
            outcome = dispatcher.run_cycle() => outcome,
            _ = shutdown.changed() => break,
        };

        let wait = match outcome {
            Ok(CycleOutcome::Idle) => idle_interval,
            Ok(CycleOutcome::Completed(report)) if report.has_backlog() => Duration::ZERO,
            Ok(CycleOutcome::Completed(_)) => idle_interval,
            Ok(CycleOutcome::Unreachable { retry_in, .. }) => retry_in,
            Err(e) => {
                tracing::error!(error = %e, "Local queue error during dispatch cycle");
                idle_interval
            }
        };

        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Dispatcher stopped");
}
