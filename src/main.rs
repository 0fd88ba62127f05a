//! Devicehub server
//!
//! Run with: cargo run -- serve --config config.toml
//!
//! # Configuration
//!
//! Settings come from a TOML file (see `devicehub config`) with
//! `DEVICEHUB_*` environment overrides. `RUST_LOG` overrides the log level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use devicehub::api::{serve, shutdown_signal, AppState};
use devicehub::cache::DeviceStateCache;
use devicehub::config::{generate_default_config, Config};
use devicehub::events::EventBroker;
use devicehub::notification::{
    CompositeNotificationClient, HttpNotificationClient, LogNotificationClient, NotificationClient,
    NotificationConfig,
};
use devicehub::repository::{
    MemoryCommandRepository, MemoryDeviceRepository, MemoryScheduledTaskRepository,
    MemoryTaskRepository, MemoryTenantConfigurationRepository,
};
use devicehub::telemetry::{init_logging, Metrics};
use devicehub::worker::{
    BrokerCommandPublisher, CommandWorker, Consumer, ConsumerLoop, LoopOptions, LoopState,
    MetricPublisherWorker, MetricWorkerFactory, NotificationWorker, ScheduledTaskRepositories,
    ScheduledTaskWorker,
};

#[derive(Parser)]
#[command(name = "devicehub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "IoT device backend: event broker, workers and WebSocket hubs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and background workers
    Serve {
        /// Config file (default: searched in the usual locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print a default config file
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            print!("{}", generate_default_config());
            Ok(())
        }
        Commands::Serve { config } => {
            let config = match config {
                Some(path) => Config::load_with_env(&path)?,
                None => Config::load_default(),
            };
            run(config).await
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config.logging);
    tracing::info!("Starting devicehub v{}", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(Metrics::new().context("registering metrics")?);
    let broker = Arc::new(
        EventBroker::new(config.broker.clone()).with_drop_counter(metrics.broker_dropped.clone()),
    );
    let cache = Arc::new(DeviceStateCache::new());

    // Repositories
    let commands = Arc::new(MemoryCommandRepository::new());
    let tasks = Arc::new(MemoryTaskRepository::new(Arc::clone(&commands)));
    let devices = Arc::new(MemoryDeviceRepository::new());
    let tenants = Arc::new(MemoryTenantConfigurationRepository::new());
    let scheduled_tasks = Arc::new(MemoryScheduledTaskRepository::new());

    let root = CancellationToken::new();
    let tracker = TaskTracker::new();
    let options = LoopOptions {
        max_in_flight: config.workers.max_in_flight,
    };

    let mut state = AppState::new(
        Arc::clone(&broker),
        Arc::clone(&cache),
        Arc::clone(&metrics),
        config.hubs.clone(),
        config.api.clone(),
    );

    // Workers
    let command_worker = Arc::new(CommandWorker::new(
        config.workers.command_interval(),
        commands.clone(),
        Arc::new(BrokerCommandPublisher::new(Arc::clone(&broker))),
        Arc::clone(&broker),
        Arc::clone(&metrics),
    ));
    let loop_state = spawn_consumer(&tracker, &root, command_worker, &broker, &options);
    state = state.with_worker("command_worker", loop_state);

    let scheduled_task_worker = Arc::new(ScheduledTaskWorker::new(
        config.workers.scheduled_task_interval(),
        ScheduledTaskRepositories {
            scheduled_tasks,
            tasks: tasks.clone(),
            devices: devices.clone(),
            tenants: tenants.clone(),
        },
        Arc::clone(&broker),
        Arc::clone(&metrics),
    ));
    let loop_state = spawn_consumer(&tracker, &root, scheduled_task_worker, &broker, &options);
    state = state.with_worker("scheduled_task_worker", loop_state);

    if config.workers.notifications_enabled {
        let client = notification_client(&config.notifications)?;
        let notification_worker = Arc::new(NotificationWorker::new(
            tasks,
            devices,
            tenants,
            client,
            Arc::clone(&metrics),
        ));
        let loop_state = spawn_consumer(&tracker, &root, notification_worker, &broker, &options);
        state = state.with_worker("notification_worker", loop_state);
    } else {
        tracing::info!("Notification worker disabled");
    }

    let publisher = Arc::new(MetricPublisherWorker::new(Arc::clone(&metrics)));
    let loop_state = spawn_consumer(&tracker, &root, publisher, &broker, &options);
    state = state.with_worker("metric_publisher", loop_state);

    let metric_workers = MetricWorkerFactory::new(Arc::clone(&metrics))
        .create_workers(&config.metric_workers)
        .context("creating metric workers")?;
    for (worker, worker_config) in metric_workers.into_iter().zip(&config.metric_workers) {
        let loop_state = spawn_consumer(&tracker, &root, Arc::new(worker), &broker, &options);
        state = state.with_worker(format!("metric_worker:{}", worker_config.name), loop_state);
    }

    // WebSocket hubs
    tracker.spawn(Arc::clone(&state.device_messages).run(Arc::clone(&broker), root.child_token()));
    tracker.spawn(Arc::clone(&state.device_specific).run(Arc::clone(&broker), root.child_token()));

    let signal_token = root.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let served = serve(state, &config.api, root.child_token()).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "API server failed");
    }

    // Stop workers and hubs even when the server never came up
    root.cancel();
    tracker.close();
    tracker.wait().await;
    broker.stop();

    tracing::info!("Devicehub stopped");
    served.map_err(Into::into)
}

/// Run a consumer on the tracker and hand back its state for health checks
fn spawn_consumer<C>(
    tracker: &TaskTracker,
    root: &CancellationToken,
    consumer: Arc<C>,
    broker: &Arc<EventBroker>,
    options: &LoopOptions,
) -> watch::Receiver<LoopState>
where
    C: Consumer<Event = devicehub::events::Event>,
{
    let name = consumer.name();
    let consumer_loop = ConsumerLoop::new(consumer, Arc::clone(broker), options.clone());
    let state = consumer_loop.state();

    tracker.spawn(consumer_loop.run(root.child_token(), move || {
        tracing::info!(worker = name, "Worker finished");
    }));
    state
}

/// HTTP delivery per channel that has an endpoint, log-only otherwise
fn notification_client(config: &NotificationConfig) -> anyhow::Result<Arc<dyn NotificationClient>> {
    if config.email_endpoint.is_none() && config.push_endpoint.is_none() {
        tracing::info!("No notification endpoints configured, notifications are logged only");
        return Ok(Arc::new(LogNotificationClient));
    }

    let http: Arc<dyn NotificationClient> = Arc::new(
        HttpNotificationClient::new(config.clone()).context("building notification client")?,
    );
    let log: Arc<dyn NotificationClient> = Arc::new(LogNotificationClient);

    let email = if config.email_endpoint.is_some() { Arc::clone(&http) } else { Arc::clone(&log) };
    let push = if config.push_endpoint.is_some() { http } else { log };

    Ok(Arc::new(CompositeNotificationClient::new(email, push)))
}
