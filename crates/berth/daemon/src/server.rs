//! Server setup and lifecycle management

use std::sync::Arc;

use berth_control::FleetEngine;
use berth_runtime::{RuntimeClient, RuntimeTemplate, SimulatedRuntime};
use berth_store::{FleetStore, InMemoryFleetStore};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::{DaemonConfig, RuntimeConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::scheduler::Scheduler;

/// berth daemon server
pub struct Server {
    config: DaemonConfig,
    engine: FleetEngine,
}

impl Server {
    /// Connect storage and runtime, and assemble the engine
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        config.validate()?;

        let store = build_store(&config).await?;
        let runtime = build_runtime(&config)?;

        let engine = FleetEngine::builder()
            .with_store(store)
            .with_runtime(runtime)
            .with_plans(config.plan_table()?)
            .with_template(RuntimeTemplate::from(&config.template))
            .with_provisioning_config(config.provisioning.clone())
            .with_reconciler_config(config.reconciler_config())
            .build()?;

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &FleetEngine {
        &self.engine
    }

    /// Serve until Ctrl-C or SIGTERM, then stop the background sweeps
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = AppState::new(self.engine.clone(), shutdown_tx.clone());
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("berth daemon listening on {}", addr);

        let scheduler = Scheduler::new(self.config.scheduler.clone(), self.engine.clone());
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

        tokio::spawn(forward_signals(shutdown_tx.clone()));

        let mut server_rx = shutdown_rx;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("berth daemon shutting down");

        let _ = shutdown_tx.send(true);
        if let Err(e) = scheduler_handle.await {
            tracing::warn!(error = %e, "Scheduler task ended abnormally");
        }

        Ok(())
    }
}

async fn build_store(config: &DaemonConfig) -> DaemonResult<Arc<dyn FleetStore>> {
    match &config.storage {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory storage");
            Ok(Arc::new(InMemoryFleetStore::new(config.pool.clone())?))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            tracing::info!(max_connections, "Using PostgreSQL storage");
            let store = berth_store::PostgresFleetStore::connect(
                url,
                *max_connections,
                *connect_timeout_secs,
                config.pool.clone(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "postgres storage requires the `postgres` feature".into(),
        )),
    }
}

fn build_runtime(config: &DaemonConfig) -> DaemonResult<Arc<dyn RuntimeClient>> {
    match &config.runtime {
        RuntimeConfig::Simulated => {
            tracing::warn!("Using the simulated runtime; no real containers will run");
            Ok(Arc::new(SimulatedRuntime::new()))
        }
        #[cfg(feature = "docker")]
        RuntimeConfig::Docker {
            request_timeout_secs,
            stop_timeout_secs,
        } => {
            let runtime = berth_runtime::DockerRuntime::connect(
                std::time::Duration::from_secs(*request_timeout_secs),
                std::time::Duration::from_secs(*stop_timeout_secs),
            )
            .map_err(|e| DaemonError::Runtime(e.to_string()))?;
            Ok(Arc::new(runtime))
        }
        #[cfg(not(feature = "docker"))]
        RuntimeConfig::Docker { .. } => Err(DaemonError::Config(
            "docker runtime requires the `docker` feature".into(),
        )),
    }
}

/// Flip the shutdown channel on Ctrl-C or SIGTERM
async fn forward_signals(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_builds_engine() {
        let server = Server::new(DaemonConfig::default()).await.unwrap();
        let usage = server.engine().store().pool_usage().await.unwrap();
        assert_eq!(usage.capacity, 35);
        assert_eq!(usage.free, 35);
    }

    #[tokio::test]
    async fn test_invalid_pool_is_rejected() {
        let mut config = DaemonConfig::default();
        config.pool.min_port = 30000;
        config.pool.max_port = 20000;
        assert!(matches!(
            Server::new(config).await,
            Err(DaemonError::Config(_))
        ));
    }
}
