//! regpool - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use regpool::{
    api::{ApiServer, ApiState},
    config::Config,
    job::Workspace,
    orchestrator::{DockerRuntime, LogRelay, Scheduler, connect_docker},
};

#[derive(Parser, Debug)]
#[command(name = "regpool")]
#[command(about = "Bounded container job scheduler with live log streaming")]
#[command(version)]
struct Args {
    /// Listen port (overrides REGPOOL_LISTEN_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Number of concurrent worker containers (overrides REGPOOL_WORKER_MAXNUM)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("regpool=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting regpool v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }
        config.pool.max_workers = workers;
        config.pool.queue_capacity = config.pool.queue_capacity.max(workers);
    }
    tracing::info!(
        workdir = %config.pool.base_workdir.display(),
        workers = config.pool.max_workers,
        image = %config.worker.image,
        volume = %config.worker.volume,
        network = %config.worker.network,
        "Configuration loaded"
    );

    let docker = connect_docker().await?;
    let runtime = Arc::new(DockerRuntime::with_client(
        docker,
        config.worker.stop_timeout(),
    ));
    tracing::info!("Connected to Docker daemon");

    let workspace = Workspace::new(&config.pool.base_workdir);
    let template = config.worker.container_template(workspace.root());
    let scheduler = Arc::new(Scheduler::start(
        config.pool.scheduler_config(),
        runtime.clone(),
        workspace,
        template,
    ));
    let relay = Arc::new(LogRelay::new(runtime, config.streaming.relay_config()));

    let state = ApiState {
        scheduler: Arc::clone(&scheduler),
        relay,
    };
    let router = ApiServer::router(state, &config.server);

    ApiServer::serve(router, config.server.port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown requested");
    })
    .await?;

    match Arc::try_unwrap(scheduler) {
        Ok(scheduler) => {
            tracing::info!(
                queued = scheduler.queued(),
                tracked = scheduler.registry().len().await,
                "Draining job queue"
            );
            scheduler.shutdown().await;
        }
        Err(_) => tracing::warn!("Scheduler still referenced, skipping drain"),
    }

    tracing::info!("regpool shutdown complete");
    Ok(())
}
