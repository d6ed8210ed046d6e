use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use vault_queue::db::DbPool;
use vault_queue::handlers::{
    register_handlers, ChainSnapshotBuilder, NetworkClients, PgRescrapeSink, RpcBlockLocator,
};
use vault_queue::queue::{Clock, PgQueueStore, QueueScope, QueueStore, SystemClock};
use vault_queue::recovery::{Alerter, ErrorRecoveryDispatcher, SnapshotBuilder, TracingAlerter};
use vault_queue::rpc::{RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig};
use vault_queue::scheduling::EligibilityGate;
use vault_queue::types::config::{NetworkConfig, QueueConfig};
use vault_queue::worker::telemetry::{spawn_reporter, DEFAULT_REPORT_INTERVAL};
use vault_queue::worker::{
    HandlerRegistry, LockRecovery, PoolSettings, QueueTelemetry, TaskPool, Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = QueueConfig::load(Path::new("config/config.json"))?;
    load_required_env_vars(&config)?;

    tracing::info!(
        "Loaded config with {} protocol(s) over {} network(s)",
        config.protocols.len(),
        config.networks.len()
    );

    let database_url = env::var(&config.database_url_env_var)
        .with_context(|| format!("env var {} not set", config.database_url_env_var))?;
    let db = DbPool::new(&database_url, config.max_connections)
        .await
        .context("failed to create database pool")?;
    db.run_migrations(Path::new("migrations"))
        .await
        .context("failed to run database migrations")?;
    let db = Arc::new(db);
    tracing::info!("Database pool initialized and migrations complete");

    let mut clients = NetworkClients::new();
    for network in &config.networks {
        let client = build_rpc_client(network)?;
        clients.insert(&network.name, Arc::new(client));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alerter: Arc<dyn Alerter> = Arc::new(TracingAlerter);
    let snapshots: Arc<dyn SnapshotBuilder> =
        Arc::new(ChainSnapshotBuilder::new(clients.clone(), db.clone()));

    let dispatcher = Arc::new(ErrorRecoveryDispatcher::new(
        snapshots.clone(),
        Arc::new(PgRescrapeSink::new(db.clone(), clock.clone())),
        Arc::new(RpcBlockLocator::new(clients.clone())),
        alerter.clone(),
        clock.clone(),
        config.recovery_settings(),
    ));

    let mut registry = HandlerRegistry::new();
    register_handlers(&mut registry, &clients, db.clone(), snapshots);
    let registry = Arc::new(registry);
    tracing::info!(
        "Registered {} handlers: {:?}",
        registry.handler_count(),
        registry.registered_types()
    );

    let scheduling = &config.scheduling;
    let telemetry = Arc::new(QueueTelemetry::default());
    let mut pool = TaskPool::new(PoolSettings {
        max_concurrent_tasks: scheduling.maximum_concurrent_tasks,
        poll_interval: scheduling.poll_interval(),
        sort: scheduling.lease_sort,
        ..Default::default()
    });

    let mut stores: Vec<Arc<dyn QueueStore>> = Vec::new();
    for protocol in &config.protocols {
        for network in &config.networks {
            let store: Arc<dyn QueueStore> = Arc::new(PgQueueStore::new(
                db.clone(),
                QueueScope::new(protocol.as_str(), network.name.as_str()),
                clock.clone(),
            ));
            let worker = Worker::new(
                store.clone(),
                registry.clone(),
                dispatcher.clone(),
                EligibilityGate::new(scheduling.eligibility_gating),
                clock.clone(),
                telemetry.clone(),
            );
            pool.add_worker(Arc::new(worker), scheduling.policy, &scheduling.types);
            stores.push(store);
        }
    }

    let lock_recovery = LockRecovery::new(stores, clock.clone(), alerter)
        .with_interval(config.lock_recovery.interval())
        .with_staleness(config.lock_recovery.staleness());

    let shutdown = CancellationToken::new();
    let reporter = spawn_reporter(telemetry, shutdown.clone(), DEFAULT_REPORT_INTERVAL);

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await.context("task pool failed") }
    });
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            lock_recovery
                .run(shutdown)
                .await
                .context("lock recovery failed")
        }
    });
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    tracing::info!("Shutdown requested, draining in-flight work");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
            Ok(())
        }
    });

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result.context("queue task panicked").and_then(|r| r) {
            shutdown.cancel();
            return Err(e);
        }
    }
    reporter.await.context("telemetry reporter panicked")?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

fn build_rpc_client(network: &NetworkConfig) -> anyhow::Result<RpcClient> {
    let url = network.rpc_url()?;
    let url = Url::parse(&url)
        .with_context(|| format!("invalid RPC url in {}", network.rpc_url_env_var))?;

    let mut rpc_config = RpcClientConfig::new(url);
    if let Some(rate_limit) = network
        .rpc_requests_per_second
        .and_then(RateLimitConfig::per_second)
    {
        rpc_config = rpc_config.with_rate_limit(rate_limit);
    }
    if let Some(max_retries) = network.rpc_max_retries {
        rpc_config = rpc_config.with_retry(RetryConfig::new(max_retries));
    }

    RpcClient::new(rpc_config)
        .with_context(|| format!("failed to create RPC client for {}", network.name))
}

/// Ensures all required env vars are set, loading .env if needed.
fn load_required_env_vars(config: &QueueConfig) -> anyhow::Result<()> {
    let required: Vec<&str> = config
        .networks
        .iter()
        .map(|n| n.rpc_url_env_var.as_str())
        .chain(std::iter::once(config.database_url_env_var.as_str()))
        .collect();

    let missing: Vec<&&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    dotenvy::dotenv().with_context(|| {
        format!(
            "Missing env vars {:?} and failed to load .env file",
            missing
        )
    })?;

    let still_missing: Vec<&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .copied()
        .collect();

    anyhow::ensure!(
        still_missing.is_empty(),
        "Missing required env vars after loading .env: {:?}",
        still_missing
    );

    Ok(())
}
