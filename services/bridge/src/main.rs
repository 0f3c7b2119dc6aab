//! kbind bridge
//!
//! Watches the cluster, mirrors its state, and binds workload units to the
//! nodes an assignment engine picks.

use std::sync::Arc;

use anyhow::{bail, Result};
use kbind_bridge::{
    binder::Binder,
    client::{ApiServerClient, ClusterClient, EmulatedCluster},
    config::Config,
    db::Database,
    engine::{run_assignment_loop, RoundRobinEngine},
    mirror::{MemoryMirror, MirrorReader, MirrorWriter},
    pool::{DispatchOrdering, WorkerPool},
    sync::StateSync,
};
use kbind_events::NodeSnapshot;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EMULATED_NODES: usize = 3;
const EMULATED_REPLICAS: u32 = 5;
/// Units the emulated deployment creates per second.
const EMULATED_CREATION_RATE: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to KBIND_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        emulate = config.emulate,
        scheduler_name = %config.scheduler_name,
        "Starting kbind bridge"
    );

    if config.emulate {
        let cluster = EmulatedCluster::new();
        seed_emulation(&cluster, &config.scheduler_name);
        return with_mirror(config, Arc::new(cluster)).await;
    }

    let client = match ApiServerClient::new(&config.api_server_config()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build cluster client");
            return Err(e.into());
        }
    };
    with_mirror(config, Arc::new(client)).await
}

/// Pick the mirror backend, then run.
async fn with_mirror<C: ClusterClient>(config: Config, client: Arc<C>) -> Result<()> {
    let Some(db_config) = config.database.clone() else {
        if !config.emulate {
            bail!("DATABASE_URL is required outside emulation mode");
        }
        warn!("DATABASE_URL not set; mirroring in memory");
        return run(config, client, Arc::new(MemoryMirror::new())).await;
    };

    let db = match Database::connect(&db_config).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };
    if let Err(e) = db.run_migrations().await {
        error!(error = %e, "Failed to run migrations");
        return Err(e.into());
    }
    db.health_check().await?;
    info!("Database ready");

    run(config, client, Arc::new(db.mirror())).await
}

async fn run<C, M>(config: Config, client: Arc<C>, mirror: Arc<M>) -> Result<()>
where
    C: ClusterClient,
    M: MirrorWriter + MirrorReader,
{
    let dispatch_pool = WorkerPool::new(
        "dispatch",
        config.dispatch_workers,
        config.dispatch_ordering,
    );
    let mut sync = StateSync::new(client.clone(), dispatch_pool, config.sync_config());
    let events = sync.configure(mirror.clone())?;

    let binder = Arc::new(Binder::new(
        client,
        WorkerPool::new("binder", config.bind_workers, DispatchOrdering::Unordered),
        config.binder_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = RoundRobinEngine::new(mirror, config.scheduler_name.clone());
    let engine_handle = tokio::spawn({
        let binder = binder.clone();
        async move {
            match run_assignment_loop(events, engine, binder, shutdown_rx).await {
                Ok(submitted) => info!(submitted, "Assignment loop finished"),
                Err(e) => error!(error = %e, "Assignment loop failed"),
            }
        }
    });

    if let Err(e) = sync.start().await {
        error!(error = %e, "Failed to start state sync");
        let _ = shutdown_tx.send(true);
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let report = sync.stop().await?;
    info!(
        completed = report.completed,
        aborted = report.aborted,
        "State sync stopped"
    );

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.shutdown_timeout, engine_handle)
        .await
        .is_err()
    {
        warn!("Assignment loop did not stop in time");
    }

    let report = binder.shutdown(config.shutdown_timeout).await;
    info!(
        completed = report.completed,
        aborted = report.aborted,
        "Binder drained"
    );

    info!("kbind bridge stopped");
    Ok(())
}

/// Give the emulated cluster a few nodes and a deployment to place.
fn seed_emulation(cluster: &EmulatedCluster, scheduler_name: &str) {
    for i in 0..EMULATED_NODES {
        let name = format!("emulated-node-{i}");
        let mut node = NodeSnapshot::new(name, cluster.next_uid());
        node.cpu_allocatable_millis = 4_000;
        node.memory_allocatable_bytes = 8 * 1024 * 1024 * 1024;
        node.pods_allocatable = 110;
        cluster.apply_node(node);
    }

    let cluster = cluster.clone();
    let scheduler_name = scheduler_name.to_string();
    tokio::spawn(async move {
        cluster
            .start_deployment_paced(
                "default",
                "demo",
                EMULATED_REPLICAS,
                &scheduler_name,
                EMULATED_CREATION_RATE,
            )
            .await;
    });
}
