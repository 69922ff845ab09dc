//! Warehouse-manager facade
//!
//! Typed handle to a destination-specific driver. The capability set the
//! scheduler relies on is narrow: crash recovery and running one upload job.
//! The router one-shots additionally use connection tests, delivery-status
//! syncs, and identity-table setup, all default-implemented so drivers only
//! supply what their warehouse supports. Driver implementations live outside
//! this crate and are registered at startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::jobs::UploadJob;
use super::models::{DestinationType, Upload, WarehouseBinding};
use stagehand_common::{Result, StagehandError};

/// Capability set of a destination-specific driver
#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    /// Re-enter an upload interrupted mid-export in a prior run. Must be
    /// idempotent; failures leave the pair quarantined for the next tick.
    async fn crash_recover(&self, binding: &WarehouseBinding) -> Result<()>;

    /// Run one upload job through the warehouse pipeline, driving the upload
    /// row through its states
    async fn run(&self, job: &UploadJob) -> Result<()>;

    /// One-shot connection test for destinations flagged for it
    async fn test_connection(&self, _binding: &WarehouseBinding) -> Result<()> {
        Ok(())
    }

    /// One-shot delivery-status sync over recently finished uploads
    async fn sync_delivery_status(
        &self,
        _binding: &WarehouseBinding,
        _uploads: &[Upload],
    ) -> Result<()> {
        Ok(())
    }

    /// Create identity-resolution side tables for destinations that enable
    /// the feature
    async fn setup_identity_tables(&self, _binding: &WarehouseBinding) -> Result<()> {
        Ok(())
    }
}

/// Drivers registered for this process, keyed by destination type
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<DestinationType, Arc<dyn WarehouseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dest_type: DestinationType, driver: Arc<dyn WarehouseDriver>) {
        self.drivers.insert(dest_type, driver);
    }

    pub fn get(&self, dest_type: DestinationType) -> Option<Arc<dyn WarehouseDriver>> {
        self.drivers.get(&dest_type).cloned()
    }
}

/// Facade handed to routers and workers: a destination type plus its driver
#[derive(Clone)]
pub struct WarehouseManager {
    dest_type: DestinationType,
    driver: Arc<dyn WarehouseDriver>,
}

impl WarehouseManager {
    /// Select a driver by destination type name. An unknown name or an
    /// unregistered type fails the selection; an upload routed to it fails
    /// as fatal.
    pub fn new(dest_type: &str, registry: &DriverRegistry) -> Result<Self> {
        let dest_type: DestinationType = dest_type.parse()?;
        let driver = registry
            .get(dest_type)
            .ok_or_else(|| StagehandError::UnknownDestination(dest_type.as_str().to_string()))?;
        Ok(Self { dest_type, driver })
    }

    pub fn dest_type(&self) -> DestinationType {
        self.dest_type
    }

    pub async fn crash_recover(&self, binding: &WarehouseBinding) -> Result<()> {
        self.driver.crash_recover(binding).await
    }

    pub async fn run(&self, job: &UploadJob) -> Result<()> {
        self.driver.run(job).await
    }

    pub async fn test_connection(&self, binding: &WarehouseBinding) -> Result<()> {
        self.driver.test_connection(binding).await
    }

    pub async fn sync_delivery_status(
        &self,
        binding: &WarehouseBinding,
        uploads: &[Upload],
    ) -> Result<()> {
        self.driver.sync_delivery_status(binding, uploads).await
    }

    pub async fn setup_identity_tables(&self, binding: &WarehouseBinding) -> Result<()> {
        self.driver.setup_identity_tables(binding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver;

    #[async_trait]
    impl WarehouseDriver for NoopDriver {
        async fn crash_recover(&self, _binding: &WarehouseBinding) -> Result<()> {
            Ok(())
        }

        async fn run(&self, _job: &UploadJob) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_manager_selection_by_name() {
        let mut registry = DriverRegistry::new();
        registry.register(DestinationType::Postgres, Arc::new(NoopDriver));

        let manager = WarehouseManager::new("POSTGRES", &registry).unwrap();
        assert_eq!(manager.dest_type(), DestinationType::Postgres);
    }

    #[test]
    fn test_manager_rejects_unknown_name() {
        let registry = DriverRegistry::new();
        assert!(WarehouseManager::new("MYSQL", &registry).is_err());
    }

    #[test]
    fn test_manager_rejects_unregistered_type() {
        let registry = DriverRegistry::new();
        assert!(WarehouseManager::new("SNOWFLAKE", &registry).is_err());
    }
}
