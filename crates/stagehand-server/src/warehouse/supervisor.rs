//! Router supervisor
//!
//! Watches the backend-config feed and keeps one router alive per
//! destination type seen in it. Routers are spun up on first sight and then
//! only enabled or disabled; they are never stopped mid-run. The flag is
//! honoured by the router at the top of its next tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::manager::{DriverRegistry, WarehouseManager};
use super::models::DestinationType;
use super::registry::InProgressRegistry;
use super::router::Router;
use super::store::UploadStore;
use super::worker::WorkerHub;
use crate::backendconfig::ConfigSnapshot;
use crate::config::WarehouseConfig;
use crate::error::abort_on_fatal;

/// Maintains dest_type -> router from config snapshots
pub struct RouterSupervisor {
    config: WarehouseConfig,
    store: UploadStore,
    registry: Arc<InProgressRegistry>,
    hub: Arc<WorkerHub>,
    drivers: DriverRegistry,
    routers: HashMap<DestinationType, Arc<Router>>,
}

impl RouterSupervisor {
    pub fn new(
        config: WarehouseConfig,
        store: UploadStore,
        registry: Arc<InProgressRegistry>,
        hub: Arc<WorkerHub>,
        drivers: DriverRegistry,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            hub,
            drivers,
            routers: HashMap::new(),
        }
    }

    /// Consume the snapshot stream until the feed closes
    pub async fn run(mut self, mut snapshots: watch::Receiver<ConfigSnapshot>) {
        info!("router supervisor started");

        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            self.apply_snapshot(&snapshot, &snapshots).await;

            if snapshots.changed().await.is_err() {
                info!("config feed closed, supervisor stopping");
                return;
            }
        }
    }

    async fn apply_snapshot(
        &mut self,
        snapshot: &ConfigSnapshot,
        snapshots: &watch::Receiver<ConfigSnapshot>,
    ) {
        let enabled = enabled_destination_types(snapshot);

        for dest_type in &enabled {
            if self.routers.contains_key(dest_type) {
                continue;
            }

            let manager = match WarehouseManager::new(dest_type.as_str(), &self.drivers) {
                Ok(manager) => manager,
                Err(e) => {
                    warn!(
                        dest_type = %dest_type,
                        error = %e,
                        "no driver registered, destination type stays unrouted"
                    );
                    continue;
                },
            };

            let router = Arc::new(Router::new(
                *dest_type,
                self.config.clone(),
                self.store.clone(),
                self.registry.clone(),
                self.hub.clone(),
                manager,
            ));

            // Recovery-set population is a structural read; failure here is
            // unrecoverable
            if let Err(e) = router.clone().setup(snapshots.clone()).await {
                abort_on_fatal("router setup", &e);
            }

            info!(dest_type = %dest_type, "router started");
            self.routers.insert(*dest_type, router);
        }

        let flags: HashMap<DestinationType, Arc<AtomicBool>> = self
            .routers
            .iter()
            .map(|(dest_type, router)| (*dest_type, router.enabled_flag()))
            .collect();
        reconcile_flags(&flags, &enabled);
    }
}

/// Warehouse destination types present anywhere in the snapshot. Unknown
/// type names (non-warehouse destinations in the same workspace) are skipped.
pub fn enabled_destination_types(snapshot: &ConfigSnapshot) -> HashSet<DestinationType> {
    snapshot
        .destination_type_names()
        .into_iter()
        .filter_map(|name| match name.parse::<DestinationType>() {
            Ok(dest_type) => Some(dest_type),
            Err(_) => {
                debug!(name = %name, "skipping non-warehouse destination type");
                None
            },
        })
        .collect()
}

/// Flip router flags to match the snapshot, logging transitions
pub fn reconcile_flags(
    flags: &HashMap<DestinationType, Arc<AtomicBool>>,
    enabled: &HashSet<DestinationType>,
) {
    for (dest_type, flag) in flags {
        let should_run = enabled.contains(dest_type);
        let was_running = flag.swap(should_run, Ordering::Relaxed);
        if was_running && !should_run {
            info!(dest_type = %dest_type, "router disabled");
        } else if !was_running && should_run {
            info!(dest_type = %dest_type, "router re-enabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(type_names: &[&str]) -> ConfigSnapshot {
        let destinations: Vec<serde_json::Value> = type_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "ID": format!("d{i}"),
                    "Enabled": true,
                    "DestinationDefinition": {"Name": name}
                })
            })
            .collect();

        serde_json::from_value(json!({
            "Sources": [{"ID": "s1", "Name": "app", "Destinations": destinations}]
        }))
        .unwrap()
    }

    #[test]
    fn test_enabled_destination_types_skips_unknown() {
        let types = enabled_destination_types(&snapshot(&["POSTGRES", "RS", "GA", "WEBHOOK"]));
        assert_eq!(types.len(), 2);
        assert!(types.contains(&DestinationType::Postgres));
        assert!(types.contains(&DestinationType::Redshift));
    }

    #[test]
    fn test_reconcile_flags_disables_missing_types() {
        let flags: HashMap<DestinationType, Arc<AtomicBool>> = [
            (DestinationType::Postgres, Arc::new(AtomicBool::new(true))),
            (DestinationType::Redshift, Arc::new(AtomicBool::new(true))),
        ]
        .into_iter()
        .collect();

        let enabled = [DestinationType::Postgres].into_iter().collect();
        reconcile_flags(&flags, &enabled);

        assert!(flags[&DestinationType::Postgres].load(Ordering::Relaxed));
        assert!(!flags[&DestinationType::Redshift].load(Ordering::Relaxed));
    }

    #[test]
    fn test_reconcile_flags_reenables_returning_type() {
        let flags: HashMap<DestinationType, Arc<AtomicBool>> =
            [(DestinationType::Snowflake, Arc::new(AtomicBool::new(false)))]
                .into_iter()
                .collect();

        let enabled = [DestinationType::Snowflake].into_iter().collect();
        reconcile_flags(&flags, &enabled);

        assert!(flags[&DestinationType::Snowflake].load(Ordering::Relaxed));
    }
}
