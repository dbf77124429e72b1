use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_relay::collector::{Collector, CollectorSettings, IioSampler};
use edge_relay::config::{Config, LogFormat, RemoteConfig};
use edge_relay::error::AppResult;
use edge_relay::queue::LocalQueue;
use edge_relay::remote::{DeviceDetails, SeaOrmRemote};
use edge_relay::sync::{
    Backoff, DispatchSettings, Dispatcher, IdentityCache, IdentityResolver, scheduler,
};

#[derive(Parser)]
#[command(name = "edge-relay", version, about)]
struct Cli {
    /// `text` or `json`
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample the sensor and append readings to the local queue
    Collect,
    /// Forward queued readings to the central store
    Dispatch,
    /// Collect and dispatch in one process
    Run,
    /// Convert a legacy queue table to the current schema
    MigrateLegacy,
    /// Print local queue counts
    Status,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(LogFormat::parse(&cli.log_format));

    // Load configuration (fail-fast)
    let config = Config::from_env()?;
    tracing::info!(
        device = %config.device_key,
        sensor_type = %config.sensor_type,
        pin = %config.sensor_pin,
        ip = config.device_ip.as_deref().unwrap_or("unknown"),
        queue = %config.queue_path.display(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Collect => {
            let queue = LocalQueue::open(&config.queue_path).await?;
            let shutdown = spawn_shutdown_listener();
            build_collector(&config, queue).run(shutdown).await;
        }
        Command::Dispatch => {
            let remote_config = RemoteConfig::from_env()?;
            let queue = LocalQueue::open(&config.queue_path).await?;
            let shutdown = spawn_shutdown_listener();
            let dispatcher = build_dispatcher(&config, &remote_config, queue);
            scheduler::run_dispatcher(dispatcher, config.sync_interval(), shutdown).await;
        }
        Command::Run => {
            let remote_config = RemoteConfig::from_env()?;
            let queue = LocalQueue::open(&config.queue_path).await?;
            let shutdown = spawn_shutdown_listener();

            let collector = build_collector(&config, queue.clone());
            let dispatcher = build_dispatcher(&config, &remote_config, queue);

            let collecting = tokio::spawn(collector.run(shutdown.clone()));
            let dispatching = tokio::spawn(scheduler::run_dispatcher(
                dispatcher,
                config.sync_interval(),
                shutdown,
            ));

            for (task, result) in [
                ("collector", collecting.await),
                ("dispatcher", dispatching.await),
            ] {
                if let Err(e) = result {
                    tracing::error!(task, error = %e, "Task ended abnormally");
                }
            }
        }
        Command::MigrateLegacy => {
            let queue = LocalQueue::connect(&config.queue_path).await?;
            match queue.migrate_legacy().await? {
                Some(migration) => tracing::info!(
                    legacy_table = %migration.legacy_table,
                    rows_copied = migration.rows_copied,
                    "Legacy queue migrated"
                ),
                None => tracing::info!("No legacy queue table found, nothing to migrate"),
            }
        }
        Command::Status => {
            let queue = LocalQueue::open(&config.queue_path).await?;
            let counts = queue.counts(config.sync_max_attempts).await?;
            println!("pending: {}", counts.pending);
            println!("sent:    {}", counts.sent);
            println!(
                "error:   {} ({} past {} attempts)",
                counts.error, counts.dead, config.sync_max_attempts
            );
        }
    }

    tracing::info!("Shut down gracefully");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_relay=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn build_collector(config: &Config, queue: LocalQueue) -> Collector<IioSampler> {
    let settings = CollectorSettings {
        device_key: config.device_key.clone(),
        sensor_type: config.sensor_type.clone(),
        pin: config.sensor_pin.clone(),
        interval: config.read_interval(),
        read_retries: config.read_retries,
        retry_sleep: Duration::from_secs(config.read_retry_sleep_seconds),
        max_consecutive_failures: config.max_consecutive_read_failures,
    };
    tracing::info!(iio_dir = %config.sensor_iio_dir.display(), "Sensor initialized");
    Collector::new(queue, IioSampler::new(&config.sensor_iio_dir), settings)
}

fn build_dispatcher(
    config: &Config,
    remote_config: &RemoteConfig,
    queue: LocalQueue,
) -> Dispatcher<SeaOrmRemote> {
    tracing::info!(
        host = %remote_config.host,
        port = remote_config.port,
        database = %remote_config.database,
        insecure = remote_config.insecure,
        "Remote store configured"
    );

    let remote = Arc::new(SeaOrmRemote::connect_lazy(remote_config, config.call_timeout()));
    let resolver = IdentityResolver::new(
        remote.clone(),
        Arc::new(IdentityCache::new()),
        config.call_timeout(),
    )
    .with_device_details(
        &config.device_key,
        DeviceDetails {
            location: config.device_location.clone(),
            ip: config.device_ip.clone(),
        },
    );

    Dispatcher::new(
        queue,
        remote,
        resolver,
        Backoff::new(config.backoff_policy()),
        DispatchSettings {
            batch_size: config.sync_batch_size,
            max_attempts: config.sync_max_attempts,
            call_timeout: config.call_timeout(),
        },
    )
}

/// Flip the returned receiver to `true` on Ctrl+C or SIGTERM.
fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        // Every receiver may already be gone when the loops finished first
        tx.send(true).ok();
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
