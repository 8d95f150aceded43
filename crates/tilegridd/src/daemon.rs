//! Daemon assembly: logging, store, worker pool, hub and ingress.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tilegrid_core::{LogConfig, TileGridConfig, WorkerConfig};
use tilegrid_scheduler::{
    ConnectorCache, InProcessSpawner, SchedulerContext, SchedulerHub, SchedulerSettings,
};
use tilegrid_state::{StateStore, WorkerInfo, epoch_secs};
use tilegrid_worker::{HttpWorkerClient, WorkerClient, WorkerPool};

use crate::ingress::{self, IngressState};

const DEFAULT_FILTER: &str = "info,tilegridd=debug,tilegrid=debug";

/// Install the global tracing subscriber. `RUST_LOG` wins over the config
/// file's filter.
pub fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log.filter.as_deref().unwrap_or(DEFAULT_FILTER))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

pub fn worker_info(config: &WorkerConfig) -> WorkerInfo {
    WorkerInfo {
        id: config.id.clone(),
        address: config.address.clone(),
        port: config.port,
        local_work_capacity: config.local_work_capacity,
        cluster_work_capacity: config.cluster_work_capacity,
        is_in_scheduler_pool: config.is_in_scheduler_pool,
        is_cluster_proxy: config.is_cluster_proxy,
        updated_at: epoch_secs(),
    }
}

/// Persist configured workers, then load every stored worker into the pool.
pub async fn seed_workers(
    store: &StateStore,
    pool: &WorkerPool,
    workers: &[WorkerConfig],
) -> anyhow::Result<usize> {
    for config in workers {
        store.put_worker(&worker_info(config))?;
    }
    let known = store.list_workers()?;
    let count = known.len();
    pool.sync(known).await;
    Ok(count)
}

/// Keep the pool's worker set in step with the store.
async fn sync_workers_loop(
    store: StateStore,
    pool: Arc<WorkerPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match store.list_workers() {
                    Ok(workers) => {
                        debug!(count = workers.len(), "worker pool synced");
                        pool.sync(workers).await;
                    }
                    Err(e) => error!(error = %e, "worker sync failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: TileGridConfig) -> anyhow::Result<()> {
    info!("tilegrid daemon starting");

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.data_dir.join("tilegrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let sched = &config.scheduler;
    let pool = Arc::new(WorkerPool::new(sched.worker_retry()));
    let workers = seed_workers(&store, &pool, &config.workers).await?;
    info!(workers, "worker pool initialized");

    let connectors = Arc::new(ConnectorCache::new(store.clone()));
    let client: Arc<dyn WorkerClient> = Arc::new(HttpWorkerClient::new(sched.worker_timeout()));
    let settings = SchedulerSettings::from_config(sched);
    let chunk_size = settings.chunk_size;
    let ctx = SchedulerContext {
        store: store.clone(),
        connectors: Arc::clone(&connectors),
        pool: Arc::clone(&pool),
        client,
        settings,
    };
    let hub = Arc::new(SchedulerHub::new(
        store.clone(),
        Arc::clone(&connectors),
        Arc::new(InProcessSpawner::new(ctx)),
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let hub_interval = sched.hub_interval();
    let hub_handle = {
        let hub = Arc::clone(&hub);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            hub.run(hub_interval, shutdown).await;
        })
    };
    let sync_handle = tokio::spawn(sync_workers_loop(
        store.clone(),
        Arc::clone(&pool),
        hub_interval,
        shutdown_rx,
    ));

    // ── Start ingress ──────────────────────────────────────────

    let router = ingress::build_router(IngressState {
        store,
        connectors,
        pool,
        chunk_size,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.ingress.port));
    info!(%addr, "ingress starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Wait for background tasks.
    let _ = hub_handle.await;
    let _ = sync_handle.await;

    info!("tilegrid daemon stopped");
    Ok(())
}
