//! Server setup and lifecycle management

use crate::api::{create_router, AppState};
use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use concord_engine::{oracle, spawn_change_consumer, AgentRunnerPool, Engine, Scheduler};
use concord_storage::{ConcordStore, InMemoryConcordStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Concord daemon server
pub struct Server {
    config: DaemonConfig,
    engine: Arc<Engine>,
    /// Background tasks owned by the storage backend, e.g. the Postgres
    /// notification listener.
    store_tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Connect storage and build the engine.
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let (store, store_tasks) = build_store(&config.storage).await?;
        let engine = Arc::new(
            Engine::new(store, config.engine.clone())
                .with_scheduler_config(config.scheduler.clone()),
        );
        Ok(Self {
            config,
            engine,
            store_tasks,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run until a shutdown signal, then stop background loops.
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = vec![spawn_change_consumer(
            self.engine.clone(),
            self.engine.store().subscribe(),
            shutdown_rx.clone(),
        )];
        tasks.extend(Scheduler::new(self.engine.clone()).start(shutdown_rx.clone()));

        if self.config.runner.enabled {
            let oracle = oracle::from_config(&self.config.oracle)?;
            let pool = Arc::new(AgentRunnerPool::new(
                self.engine.clone(),
                Arc::from(oracle),
                self.config.runner.clone(),
            ));
            tasks.push(pool.start(self.engine.subscribe_events(), shutdown_rx.clone()));
        } else {
            tracing::info!("Agent runners disabled");
        }

        let app = create_router(AppState::new(self.engine.clone()), &self.config.server);
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Concord daemon listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("Concord daemon shutting down");
        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        for task in self.store_tasks {
            task.abort();
        }
        Ok(())
    }
}

async fn build_store(
    config: &StorageConfig,
) -> DaemonResult<(Arc<dyn ConcordStore>, Vec<JoinHandle<()>>)> {
    match config {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory storage");
            Ok((Arc::new(InMemoryConcordStore::new()), Vec::new()))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = concord_storage::PostgresConcordStore::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
            )
            .await?;
            let listener = store.spawn_change_listener().await?;
            tracing::info!(max_connections, "Using PostgreSQL storage");
            Ok((Arc::new(store), vec![listener]))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "postgres storage requested but concordd was built without the `postgres` feature"
                .to_string(),
        )),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install terminate handler");
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
}
