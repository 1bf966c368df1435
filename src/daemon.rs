//! Daemon wiring.
//!
//! `run` owns the process lifecycle: open and probe the store, build the
//! source registry, spawn the worker pool and the request loop, then park
//! until a shutdown signal flips the flag every loop observes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{parse_address, Config, ConfigError};
use crate::metrics::Metrics;
use crate::model::{ChangeNotification, WorkItem};
use crate::server::{Server, ServerError};
use crate::source::SourceRegistry;
use crate::store::{SqliteStore, Store, StoreError};
use crate::worker::{LockTable, Reconciler, WorkerConfig, WorkerError, WorkerPool};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store unreachable: {0}")]
    Store(#[from] StoreError),
    #[error("server failed to start: {0}")]
    Server(#[from] ServerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl DaemonError {
    /// Process exit code: 1 for fatal config errors, 2 when the store is
    /// unreachable at startup.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Config(_) => 1,
            DaemonError::Store(_) | DaemonError::Server(ServerError::Store(_)) => 2,
            DaemonError::Server(_) | DaemonError::Worker(_) => 1,
        }
    }
}

/// Run the server and workers until a shutdown signal.
pub fn run(config: Config) -> Result<(), DaemonError> {
    let policy = config.merge_policy()?;
    let listen_addr = parse_address(&config.server.address)?;
    let registry = Arc::new(SourceRegistry::from_config(&config)?);

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store.dsn)?);
    // Probe a handle so store trouble is fatal now, not at the first item.
    store.handle()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    register_signals(&shutdown);

    let metrics = Metrics::new();
    let worker_count = config.worker_count();
    let worker_config = WorkerConfig {
        registry: Arc::clone(&registry),
        policy,
        locks: LockTable::new(),
        metrics: metrics.clone(),
        reconcile_timeout: config.reconcile_timeout(),
        retry_cap: config.source.retry_cap,
        shutdown: Arc::clone(&shutdown),
    };

    let workers = WorkerPool::spawn(Arc::clone(&store), worker_config, worker_count);
    let server = Server::new(
        listen_addr,
        Arc::clone(&store),
        registry,
        metrics.clone(),
        Arc::clone(&shutdown),
    );
    let handle = server.start()?;
    tracing::info!(address = %handle.local_addr(), workers = worker_count, "retcond running");

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(SHUTDOWN_POLL);
    }
    tracing::info!("shutdown signal received");

    handle.join();
    workers.join();

    for (name, value) in metrics.counter_values() {
        tracing::debug!(counter = %name, value, "final count");
    }
    tracing::info!("retcond stopped");
    Ok(())
}

/// Run exactly one Process cycle synchronously, without the queue.
pub fn run_once(config: &Config, notification: ChangeNotification) -> Result<(), DaemonError> {
    let policy = config.merge_policy()?;
    let registry = Arc::new(SourceRegistry::from_config(config)?);
    let store = SqliteStore::open(&config.store.dsn)?;
    let handle = store.handle()?;

    let worker_config = WorkerConfig {
        registry,
        policy,
        locks: LockTable::new(),
        metrics: Metrics::new(),
        reconcile_timeout: config.reconcile_timeout(),
        retry_cap: config.source.retry_cap,
        shutdown: Arc::new(AtomicBool::new(false)),
    };
    let mut reconciler = Reconciler::new(handle, worker_config);
    reconciler.run(&WorkItem::Process(notification))?;
    Ok(())
}

fn register_signals(shutdown: &Arc<AtomicBool>) {
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(shutdown));
}
