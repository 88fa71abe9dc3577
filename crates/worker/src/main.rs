mod cli;
mod process;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use poolhand_engine::{
    HttpOrchestration, Infrastructure, Worker, WorkerConfig, WorkerEvent, WorkerTypeRegistry,
};

use crate::cli::Cli;
use crate::process::ProcessInfrastructure;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut registry = WorkerTypeRegistry::new();
    registry.register("process", || {
        Arc::new(ProcessInfrastructure) as Arc<dyn Infrastructure>
    });

    let Some(infrastructure) = registry.create(&cli.worker_type) else {
        let known: Vec<&str> = registry.kinds().collect();
        anyhow::bail!(
            "unknown worker type {:?} (known types: {})",
            cli.worker_type,
            known.join(", ")
        );
    };

    let api = Arc::new(HttpOrchestration::new(
        cli.api_url.clone(),
        cli.api_key.clone(),
    )?);

    // Snapshot of the settings every launched job inherits.
    let mut base_env = BTreeMap::new();
    base_env.insert("PREFECT_API_URL".to_string(), cli.api_url.to_string());
    if let Some(key) = &cli.api_key {
        base_env.insert("PREFECT_API_KEY".to_string(), key.clone());
    }

    let config = WorkerConfig {
        work_pool_name: cli.pool.clone(),
        work_queues: cli.work_queues.clone(),
        name: cli.name.clone(),
        prefetch_seconds: cli.prefetch_seconds,
        create_pool_if_not_found: !cli.no_create_pool,
        limit: cli.limit,
        base_env,
    };

    let mut worker = Worker::new(config, api.clone(), infrastructure, api)?;
    let events = worker.subscribe();
    tokio::spawn(log_events(events));

    worker.setup().await;
    info!(
        "worker {:?} started, polling work pool {:?} every {}s",
        worker.name(),
        cli.pool,
        cli.query_seconds
    );

    let mut poll = tokio::time::interval(Duration::from_secs_f64(cli.query_seconds.max(1.0)));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(
                    "stop requested; waiting for in-flight flow runs to finish \
                     (press CTRL+C again to exit immediately)"
                );
                break;
            }
            _ = poll.tick() => {
                if let Err(err) = worker.get_and_submit_flow_runs().await {
                    error!("failed to poll for scheduled flow runs: {err:#}");
                }
            }
        }
    }

    tokio::select! {
        _ = worker.teardown() => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Stop requested again; exiting immediately.");
            std::process::exit(130);
        }
    }

    info!("worker stopped");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<WorkerEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Emitted(event)) => {
                let resource_id = event
                    .resource
                    .get("prefect.resource.id")
                    .cloned()
                    .unwrap_or_default();
                info!(event = %event.event, resource = %resource_id, "emitted worker event");
            }
            Ok(WorkerEvent::Warning { message }) => warn!("{message}"),
            Ok(WorkerEvent::Error { message }) => error!("{message}"),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
