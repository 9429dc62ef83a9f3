mod alerts;
mod collectors;
mod config;
mod http;
mod layout;
mod metrics;
mod notify;
mod poller;
mod rates;
mod sensors;
mod state;
mod storage;

use alerts::RuleError;
use axum::serve;
use clap::{Parser, Subcommand};
use collectors::disk::DiskMonitor;
use collectors::network::{NetworkMonitor, SysinfoNetworkSource};
use collectors::process::{ProcessMonitor, SysinfoProcessSource};
use config::{BackendChoice, Config};
use layout::LayoutStore;
use metrics::Metrics;
use notify::LogNotifier;
use poller::PollingOrchestrator;
use sensors::lhm::LhmBackend;
use sensors::native::NativeBackend;
use sensors::{SensorBackend, SensorReader, SysinfoCounters};
use state::SharedState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use storage::{StorageEngine, StorageError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hwmonitord")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll sensors and serve the dashboard API (default).
    Run,
    /// Print stored snapshots for a range as CSV.
    History {
        #[arg(long, default_value = "1h")]
        range: String,
    },
    /// Write stored snapshots for a range to a CSV file.
    Export {
        #[arg(long, default_value = "1h")]
        range: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Delete snapshots older than N days (storage.retention_days by default).
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print the effective dashboard layout.
    Layout,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error("metrics init failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("history storage is disabled in the config")]
    StorageDisabled,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_or_default(&cli.config) {
        Ok((cfg, found)) => {
            if !found {
                warn!(path = %cli.config, "config file not found, using defaults");
            }
            cfg
        }
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cfg).await,
        Command::History { range } => print_history(&cfg, &range),
        Command::Export { range, out } => export(&cfg, &range, &out),
        Command::Cleanup { days } => cleanup(&cfg, days.unwrap_or(cfg.storage.retention_days)),
        Command::Layout => print_layout(&cfg),
    };
    if let Err(err) = result {
        error!(error = %err, "command failed");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<(), AppError> {
    info!(
        listen = %cfg.listen,
        interval_ms = cfg.polling.interval_ms,
        backend = ?cfg.sensors.backend,
        "starting hwmonitord"
    );

    let state = SharedState::new(metrics::now_unix());
    let metrics = Metrics::new()?;
    let layout = Arc::new(LayoutStore::new(&cfg.layout.path));
    let storage = if cfg.storage.enabled {
        match StorageEngine::open(&cfg.storage.path) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(error = %err, path = %cfg.storage.path.display(), "history storage unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let stale = cfg.polling.stale_after_ticks;
    let matchers = cfg.matchers();
    for field in matchers.uncovered() {
        warn!(field = ?field, "no sensor matcher for field, it will read 0");
    }
    let reader = Arc::new(SensorReader::new(matchers, Some(Box::new(SysinfoCounters::new()))));
    let mut orchestrator = PollingOrchestrator::new(reader.clone(), cfg.alert_engine()?)
        .with_disks(DiskMonitor::new(reader.clone()))
        .with_network(NetworkMonitor::new(
            Box::new(SysinfoNetworkSource::new()),
            cfg.counter_width(),
            stale,
        ))
        .with_processes(ProcessMonitor::new(Box::new(SysinfoProcessSource::new()), stale))
        .with_observer(Arc::new(state.clone()))
        .with_observer(metrics.clone())
        .with_observer(Arc::new(LogNotifier));
    if let Some(store) = &storage {
        orchestrator = orchestrator.with_storage(store.clone(), Some(cfg.retention()));
    }
    let (alerts_tx, alerts_rx) = mpsc::channel(16);
    let orchestrator = orchestrator.with_commands(alerts_rx);

    let (settings_tx, settings_rx) = watch::channel(cfg.tick_settings());
    let settings_tx = Arc::new(settings_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app = http::build_router(http::HttpAppState {
            metrics: metrics.clone(),
            state: state.clone(),
            storage: storage.clone(),
            layout,
            settings: Some(settings_tx),
            alerts: Some(alerts_tx),
        });
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let poller_task = tokio::spawn(orchestrator.run(
        backend_candidates(cfg.sensors.backend),
        settings_rx,
        shutdown_rx,
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match poller_task.await {
        Ok(status) => info!(status = ?status, "poller stopped"),
        Err(err) => error!(error = %err, "poller task failed"),
    }
    if let Err(err) = http_task.await {
        error!(error = %err, "HTTP task failed");
    }
    Ok(())
}

fn backend_candidates(choice: BackendChoice) -> Vec<Box<dyn SensorBackend>> {
    match choice {
        BackendChoice::Lhm => vec![Box::new(LhmBackend::new())],
        BackendChoice::Native => vec![Box::new(NativeBackend::new())],
        BackendChoice::Auto if cfg!(target_os = "windows") => {
            vec![Box::new(LhmBackend::new()), Box::new(NativeBackend::new())]
        }
        BackendChoice::Auto => vec![Box::new(NativeBackend::new())],
    }
}

fn open_storage(cfg: &Config) -> Result<StorageEngine, AppError> {
    if !cfg.storage.enabled {
        return Err(AppError::StorageDisabled);
    }
    Ok(StorageEngine::open(&cfg.storage.path)?)
}

fn print_history(cfg: &Config, range: &str) -> Result<(), AppError> {
    let store = open_storage(cfg)?;
    let (from, to) = storage::time_range(range, chrono::Utc::now());
    let records = store.query(from, to)?;
    print!("{}", storage::csv::serialize(&records));
    Ok(())
}

fn export(cfg: &Config, range: &str, out: &std::path::Path) -> Result<(), AppError> {
    let store = open_storage(cfg)?;
    let (from, to) = storage::time_range(range, chrono::Utc::now());
    let rows = store.export_csv(from, to, out)?;
    info!(rows, path = %out.display(), "history exported");
    Ok(())
}

fn cleanup(cfg: &Config, days: u32) -> Result<(), AppError> {
    let store = open_storage(cfg)?;
    let deleted = store.cleanup_old_data(days)?;
    info!(deleted, days, "old snapshots removed");
    Ok(())
}

fn print_layout(cfg: &Config) -> Result<(), AppError> {
    let layout = LayoutStore::new(&cfg.layout.path).load();
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
