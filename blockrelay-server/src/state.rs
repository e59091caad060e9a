//! Shared state of the relay server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blockrelay_service::load::LoadTracker;
use blockrelay_service::pool::WorkerPool;
use blockrelay_service::registry::{Registry, StaticRegistry};
use blockrelay_service::source;
use secrecy::ExposeSecret;

use crate::config::Config;

/// Shared reference to the relay [services](Services).
pub type ServiceState = Arc<Services>;

/// The relay's business logic.
///
/// Created during server startup and shared with all HTTP request handlers. In request handlers,
/// use `axum::extract::State<ServiceState>` to retrieve a shared reference to this structure.
#[derive(Debug)]
pub struct Services {
    /// The server configuration.
    pub config: Config,
    /// Workers and the least-loaded dispatcher.
    pub pool: WorkerPool,
    /// Resolves object references of download URLs.
    pub registry: Box<dyn Registry>,
}

impl Services {
    /// Provisions the worker pool, loads the registry and spawns background tasks.
    ///
    /// Workers whose credentials are rejected are left out of the pool. An empty pool is not an
    /// error; the server then reports not ready.
    pub async fn spawn(config: Config) -> Result<ServiceState> {
        let registry = load_registry(&config).await?;
        tracing::info!(objects = registry.len(), "loaded object registry");

        let connector = source::connector(config.upstream.as_connector_config())
            .context("failed to create upstream connector")?;
        let credentials: Vec<&str> = config
            .workers
            .iter()
            .map(|secret| secret.expose_secret().as_str())
            .collect();
        let pool =
            WorkerPool::provision(connector.as_ref(), &credentials, config.relay.options()).await;

        if pool.is_empty() {
            tracing::warn!("no upstream worker available, downloads will fail");
        }

        tokio::spawn(track_worker_loads(
            pool.loads().clone(),
            config.runtime.metrics_interval,
        ));

        Ok(Arc::new(Self {
            config,
            pool,
            registry: Box::new(registry),
        }))
    }
}

async fn load_registry(config: &Config) -> Result<StaticRegistry> {
    let mut records = match &config.registry.path {
        Some(path) => StaticRegistry::read_records(path)
            .await
            .with_context(|| format!("failed to load registry from {}", path.display()))?,
        None => Default::default(),
    };
    records.extend(config.registry.objects.clone());

    StaticRegistry::new(records).context("invalid registry entry")
}

/// Periodically reports the load of every worker.
async fn track_worker_loads(loads: LoadTracker, interval: Duration) {
    loads
        .run_emitter(interval, |loads| async move {
            tracing::trace!("Capturing worker loads");
            for (worker, load) in loads {
                merni::gauge!("pool.worker_load": load, "worker" => worker.0);
            }
        })
        .await;
}
