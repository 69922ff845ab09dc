//! Warehouse scheduling core
//!
//! The orchestrator owns the process-wide mutable state (in-progress
//! registry, worker hub, global upload slots) and wires the backend-config
//! feed into the router supervisor. One router runs per destination type;
//! workers serialise uploads per destination instance and namespace.

pub mod gate;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod worker;

use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backendconfig::BackendConfigSubscriber;
use crate::config::Config;
use crate::notifier::{spawn_slave_listeners, StagingFileHandler};
use manager::DriverRegistry;
use registry::InProgressRegistry;
use store::UploadStore;
use supervisor::RouterSupervisor;
use worker::WorkerHub;

/// Process-wide scheduling state, constructed once and shared into the
/// supervisor, routers, and workers
pub struct Orchestrator {
    config: Config,
    store: UploadStore,
    registry: Arc<InProgressRegistry>,
    hub: Arc<WorkerHub>,
    drivers: DriverRegistry,
    slave_handler: Option<Arc<dyn StagingFileHandler>>,
}

impl Orchestrator {
    pub fn new(config: Config, pool: PgPool, drivers: DriverRegistry) -> Self {
        let store = UploadStore::new(
            pool,
            config.warehouse.staging_files_schema_pagination_size,
        );
        let registry = Arc::new(InProgressRegistry::new());
        let hub = Arc::new(WorkerHub::new(
            config.warehouse.no_of_workers,
            config.warehouse.worker_retry_sleep(),
            registry.clone(),
            store.clone(),
        ));

        Self {
            config,
            store,
            registry,
            hub,
            drivers,
            slave_handler: None,
        }
    }

    /// Attach the external parse-task consumer used by slave-bearing modes
    pub fn with_slave_handler(mut self, handler: Arc<dyn StagingFileHandler>) -> Self {
        self.slave_handler = Some(handler);
        self
    }

    pub fn store(&self) -> &UploadStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<InProgressRegistry> {
        &self.registry
    }

    /// Start the roles this mode calls for and return their task handles
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mode = self.config.warehouse.mode;
        let mut handles = Vec::new();

        if mode.includes_master() {
            let (snapshots, poll_handle) =
                BackendConfigSubscriber::new(&self.config.backend).start();
            handles.push(poll_handle);

            let supervisor = RouterSupervisor::new(
                self.config.warehouse.clone(),
                self.store.clone(),
                self.registry.clone(),
                self.hub.clone(),
                self.drivers.clone(),
            );
            handles.push(tokio::spawn(supervisor.run(snapshots)));
        }

        if mode.includes_slave() {
            handles.extend(spawn_slave_listeners(
                self.store.pool().clone(),
                self.config.warehouse.no_of_slave_worker_routines,
                self.slave_handler.clone(),
            ));
        }

        info!(mode = %mode, tasks = handles.len(), "warehouse orchestrator started");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarehouseMode;
    use sqlx::postgres::PgPoolOptions;

    fn orchestrator(mode: WarehouseMode) -> Orchestrator {
        let mut config = Config::default();
        config.warehouse.mode = mode;
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/stagehand_test")
            .unwrap();
        Orchestrator::new(config, pool, DriverRegistry::new())
    }

    #[tokio::test]
    async fn test_master_mode_starts_feed_and_supervisor() {
        let handles = orchestrator(WarehouseMode::Master).start();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_slave_mode_starts_listener_routines() {
        let handles = orchestrator(WarehouseMode::Slave).start();
        assert_eq!(handles.len(), 4);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_embedded_mode_runs_both_roles() {
        let handles = orchestrator(WarehouseMode::Embedded).start();
        assert_eq!(handles.len(), 6);
        for handle in handles {
            handle.abort();
        }
    }
}
