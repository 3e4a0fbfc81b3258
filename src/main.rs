//! monitor-core binary: `serve` runs the control plane; the other
//! subcommands are thin admin-API clients.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use monitor_core::alerts::AlertManager;
use monitor_core::allocator::{CoordinationNodeRegistry, NodeAllocator};
use monitor_core::api::{admin, grpc::IngestServiceImpl, proto::ingest_service_server::IngestServiceServer, push};
use monitor_core::cli::{handle_admin_command, parse_args, Commands};
use monitor_core::coordination::EtcdCoordinationStore;
use monitor_core::core::{self, config::get_config};
use monitor_core::lock::DistributedLock;
use monitor_core::notifiers::{AlertNotificationAdapter, Dispatcher};
use monitor_core::storage::MetricStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    std::env::set_var(
        "RUST_LOG",
        match cli.verbosity() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        },
    );
    core::initialize_default_logging()?;
    core::config::init_config().await?;

    match &cli.command {
        Commands::Serve { grpc_addr, http_addr } => serve(grpc_addr, http_addr).await,
        other => handle_admin_command(other).await.map_err(Into::into),
    }
}

async fn serve(grpc_addr: &str, http_addr: &str) -> Result<()> {
    let config = get_config().await?;

    let store = MetricStore::open(&config.storage.data_dir, config.storage.retention_days)?;
    store.clone().spawn_retention_task();

    let coordination = Arc::new(EtcdCoordinationStore::connect(&config.coordination.endpoints).await?);

    let node_registry = Arc::new(CoordinationNodeRegistry::new(
        coordination.clone(),
        "/monitor/nodes",
        chrono::Duration::seconds(config.allocator.heartbeat_ttl_secs as i64),
    ));
    let allocator = Arc::new(NodeAllocator::new(node_registry));

    let alert_manager = AlertManager::new(
        store.clone(),
        coordination.clone(),
        config.coordination.etcd_alert_prefix.clone(),
    )
    .await?;
    if config.coordination.enable_watcher {
        alert_manager.spawn_watch_task();
    }
    alert_manager.spawn_evaluation_task();

    let dispatcher = Dispatcher::new(
        coordination.clone(),
        config.coordination.etcd_notifier_prefix.clone(),
        Duration::from_secs(config.notifier.send_timeout_secs),
    )
    .await?;
    if config.coordination.enable_watcher {
        dispatcher.spawn_watch_task();
    }
    alert_manager
        .add_observer(Arc::new(AlertNotificationAdapter::new(dispatcher.clone())))
        .await;

    let _lock = DistributedLock::connect(
        &config.coordination.endpoints,
        Duration::from_secs(config.lock.default_ttl_secs),
        Duration::from_millis(config.lock.try_acquire_budget_ms),
        Duration::from_secs(config.lock.backoff_initial_secs),
        Duration::from_secs(config.lock.backoff_max_secs),
    )
    .await?;

    let grpc_addr: std::net::SocketAddr = grpc_addr.parse()?;
    let ingest_service = IngestServiceImpl::new(store.clone(), allocator.clone());
    let grpc_server = tonic::transport::Server::builder()
        .add_service(IngestServiceServer::new(ingest_service))
        .serve(grpc_addr);

    let http_routes =
        admin::routes(alert_manager.clone(), dispatcher.clone(), store.clone()).or(push::routes(store.clone()));
    let http_addr: std::net::SocketAddr = http_addr.parse()?;

    tracing::info!(%grpc_addr, %http_addr, "monitor-core control plane starting");

    tokio::select! {
        result = grpc_server => {
            result?;
        }
        _ = warp::serve(http_routes).run(http_addr) => {}
    }

    Ok(())
}
