//! cirrus conductor
//!
//! Serves the compute task API. With `CIRRUS_DEV=1` it runs against
//! in-memory stores, a static inventory of `CIRRUS_DEV_HOSTS` and a
//! compute transport that only records calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use cirrus_conductor::{
    api,
    compute::{ComputeAgentClient, HttpComputeRpc, RecordingComputeRpc},
    config::Config,
    coordinator::ComputeTaskManager,
    db::{Database, MemoryStore},
    hosts::{ComputeNodeInfo, PgHostRegistry, StaticHostRegistry},
    images::{HttpImageService, MemoryImageService},
    model::Flavor,
    notifier::{InstanceStateNotifier, LogNotifier},
    scheduler::{HostSelector, HostState, HttpSchedulerClient, InventoryScheduler},
    state::AppState,
    tasks::Collaborators,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEV_FREE_RAM_MB: u64 = 16_384;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over CIRRUS_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cirrus conductor");
    info!(listen_addr = %config.listen_addr, dev_mode = config.dev_mode, "Configuration loaded");

    let (services, db) = if config.dev_mode {
        (dev_collaborators(&config), None)
    } else {
        let db = match Database::connect(&config.database).await {
            Ok(db) => {
                info!("Database connection established");
                db
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to database");
                return Err(e.into());
            }
        };
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
        (collaborators(&config, &db)?, Some(db))
    };

    let state = AppState::new(ComputeTaskManager::new(services), db);
    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Conductor shutdown complete");
    Ok(())
}

fn collaborators(config: &Config, db: &Database) -> Result<Collaborators> {
    let store = Arc::new(db.store());
    let scheduler = Arc::new(HttpSchedulerClient::new(&config.scheduler)?);
    let rpc = Arc::new(HttpComputeRpc::new(
        config.compute.clone(),
        config.migration.precheck_timeout,
    )?);
    let images = Arc::new(HttpImageService::new(&config.image)?);
    let hosts = Arc::new(PgHostRegistry::new(
        db.pool().clone(),
        config.service_group.service_down_time,
    ));

    Ok(Collaborators {
        instances: store.clone(),
        migrations: store.clone(),
        flavors: store.clone(),
        images,
        hosts,
        selector: HostSelector::new(scheduler, store.clone(), config.scheduler.clone()),
        compute: ComputeAgentClient::new(rpc, config.migration.precheck_timeout),
        notifier: InstanceStateNotifier::new(store, Arc::new(LogNotifier), config.host.clone()),
        migration: config.migration.clone(),
    })
}

fn dev_collaborators(config: &Config) -> Collaborators {
    let store = Arc::new(MemoryStore::new());
    store.insert_flavor(Flavor {
        id: 1,
        flavorid: "1".to_string(),
        name: "m1.small".to_string(),
        memory_mb: 2048,
        vcpus: 1,
        root_gb: 20,
        ephemeral_gb: 0,
        extra_specs: BTreeMap::new(),
    });

    let hosts = Arc::new(StaticHostRegistry::new());
    for host in &config.dev_hosts {
        hosts.add(ComputeNodeInfo {
            host: host.clone(),
            hypervisor_type: "qemu".to_string(),
            hypervisor_version: 1,
            free_ram_mb: DEV_FREE_RAM_MB as i64,
        });
    }
    let scheduler = Arc::new(InventoryScheduler::new(
        config
            .dev_hosts
            .iter()
            .map(|host| HostState::new(host.clone(), DEV_FREE_RAM_MB, 16, 500)),
    ));
    let rpc = Arc::new(RecordingComputeRpc::new());

    Collaborators {
        instances: store.clone(),
        migrations: store.clone(),
        flavors: store.clone(),
        images: Arc::new(MemoryImageService::new()),
        hosts,
        selector: HostSelector::new(scheduler, store.clone(), config.scheduler.clone()),
        compute: ComputeAgentClient::new(rpc, config.migration.precheck_timeout),
        notifier: InstanceStateNotifier::new(store, Arc::new(LogNotifier), config.host.clone()),
        migration: config.migration.clone(),
    }
}
