//! Per-warehouse-kind router
//!
//! One router per destination type. It owns the crash-recovery gate, the
//! config subscription that maintains its bindings and workers, and the main
//! loop that drives pending uploads to completion and groups fresh staging
//! files into new uploads.

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::gate::{FrequencyGate, RetryGate};
use super::jobs::{UploadBatch, UploadJob};
use super::manager::WarehouseManager;
use super::models::{DestinationType, WarehouseBinding};
use super::registry::{InProgressRegistry, RecoverySet};
use super::store::UploadStore;
use super::worker::WorkerHub;
use crate::backendconfig::{ConfigSnapshot, DestinationConfig, SourceConfig};
use crate::config::WarehouseConfig;
use crate::error::abort_on_fatal;

/// Router for one destination type
pub struct Router {
    dest_type: DestinationType,
    enabled: Arc<AtomicBool>,
    config: WarehouseConfig,
    store: UploadStore,
    registry: Arc<InProgressRegistry>,
    recovery: RecoverySet,
    hub: Arc<WorkerHub>,
    manager: WarehouseManager,
    bindings: RwLock<Vec<WarehouseBinding>>,
    retry_gate: RetryGate,
    frequency_gate: FrequencyGate,
}

impl Router {
    pub fn new(
        dest_type: DestinationType,
        config: WarehouseConfig,
        store: UploadStore,
        registry: Arc<InProgressRegistry>,
        hub: Arc<WorkerHub>,
        manager: WarehouseManager,
    ) -> Self {
        Self {
            dest_type,
            enabled: Arc::new(AtomicBool::new(true)),
            retry_gate: RetryGate::new(&config),
            frequency_gate: FrequencyGate::new(&config),
            config,
            store,
            registry,
            recovery: RecoverySet::new(),
            hub,
            manager,
            bindings: RwLock::new(Vec::new()),
        }
    }

    /// Enable/disable handle for the supervisor; honoured at the top of
    /// every main-loop tick
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn dest_type(&self) -> DestinationType {
        self.dest_type
    }

    /// Seed the recovery set and start the config-subscription and
    /// main-loop tasks
    pub async fn setup(
        self: Arc<Self>,
        snapshots: watch::Receiver<ConfigSnapshot>,
    ) -> Result<()> {
        let interrupted = self.store.mark_crash_interrupted(self.dest_type).await?;
        for (source_id, destination_id) in &interrupted {
            self.recovery.insert(source_id, destination_id);
        }
        info!(
            dest_type = %self.dest_type,
            pairs = interrupted.len(),
            "router setup: crash-interrupted pairs recorded"
        );

        let router = self.clone();
        tokio::spawn(async move { router.run_config_subscription(snapshots).await });

        let router = self.clone();
        tokio::spawn(async move {
            if let Err(e) = router.run_main_loop().await {
                abort_on_fatal("router main loop", &e);
            }
        });

        Ok(())
    }

    /// Rebuild bindings and workers from each snapshot; fire the per-
    /// destination one-shots
    async fn run_config_subscription(&self, mut snapshots: watch::Receiver<ConfigSnapshot>) {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();

            match self.resolve_bindings(&snapshot).await {
                Ok(bindings) => {
                    for binding in &bindings {
                        self.hub.ensure_worker(&binding.worker_identity());
                        self.fire_one_shots(binding);
                    }
                    info!(
                        dest_type = %self.dest_type,
                        bindings = bindings.len(),
                        "router bindings updated"
                    );
                    let mut guard = match self.bindings.write() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *guard = bindings;
                },
                Err(e) => {
                    // Keep scheduling over the previous bindings
                    error!(
                        dest_type = %self.dest_type,
                        error = %e,
                        "failed to resolve bindings from snapshot"
                    );
                },
            }

            if snapshots.changed().await.is_err() {
                info!(dest_type = %self.dest_type, "config feed closed, subscription stopping");
                return;
            }
        }
    }

    /// Bindings of this router's type present and enabled in the snapshot
    async fn resolve_bindings(&self, snapshot: &ConfigSnapshot) -> Result<Vec<WarehouseBinding>> {
        let mut bindings = Vec::new();

        for source in &snapshot.sources {
            for destination in &source.destinations {
                if !destination.enabled {
                    continue;
                }
                if destination.destination_definition.name != self.dest_type.as_str() {
                    continue;
                }

                let prior = self
                    .store
                    .latest_namespace(&source.id, &destination.id)
                    .await?;
                let namespace =
                    resolve_namespace(self.dest_type, source, destination, prior);

                bindings.push(WarehouseBinding {
                    source_id: source.id.clone(),
                    source_name: source.name.clone(),
                    destination_id: destination.id.clone(),
                    destination_type: self.dest_type,
                    namespace,
                    sync_frequency: sync_frequency(&destination.config),
                    event_delivery: config_flag(&destination.config, "eventDelivery"),
                    test_connection: config_flag(&destination.config, "testConnection"),
                    identity_resolution: config_flag(
                        &destination.config,
                        "enableIdentityResolution",
                    ),
                });
            }
        }

        Ok(bindings)
    }

    /// One-shot connection test, delivery-status sync, and identity-table
    /// setup for flagged destinations. Failures are logged, never fatal.
    fn fire_one_shots(&self, binding: &WarehouseBinding) {
        if binding.test_connection {
            let manager = self.manager.clone();
            let binding = binding.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.test_connection(&binding).await {
                    warn!(
                        destination_id = %binding.destination_id,
                        error = %e,
                        "connection test failed"
                    );
                }
            });
        }

        if binding.event_delivery {
            let manager = self.manager.clone();
            let store = self.store.clone();
            let binding = binding.clone();
            let pre_fetch_count = self.config.sync_pre_fetch_count;
            tokio::spawn(async move {
                let uploads = match store.latest_uploads(&binding, pre_fetch_count).await {
                    Ok(uploads) => uploads,
                    Err(e) => {
                        warn!(
                            destination_id = %binding.destination_id,
                            error = %e,
                            "failed to fetch uploads for delivery-status sync"
                        );
                        return;
                    },
                };
                if let Err(e) = manager.sync_delivery_status(&binding, &uploads).await {
                    warn!(
                        destination_id = %binding.destination_id,
                        error = %e,
                        "delivery-status sync failed"
                    );
                }
            });
        }

        if binding.identity_resolution {
            let manager = self.manager.clone();
            let binding = binding.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.setup_identity_tables(&binding).await {
                    warn!(
                        destination_id = %binding.destination_id,
                        error = %e,
                        "identity-table setup failed"
                    );
                }
            });
        }
    }

    /// Main loop: one pass over the bindings, then sleep. Store errors are
    /// fatal and bubble up to abort the process.
    async fn run_main_loop(&self) -> Result<()> {
        info!(dest_type = %self.dest_type, "router main loop started");

        loop {
            if self.enabled.load(Ordering::Relaxed) {
                let bindings = {
                    let guard = match self.bindings.read() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.clone()
                };

                for binding in &bindings {
                    self.process_binding(binding).await?;
                }
            }

            tokio::time::sleep(self.config.main_loop_sleep()).await;
        }
    }

    /// One scheduling decision for one pair
    async fn process_binding(&self, binding: &WarehouseBinding) -> Result<()> {
        let key = binding.pair_key();

        if !self.registry.try_acquire(&key) {
            return Ok(());
        }

        if self
            .recovery
            .contains(&binding.source_id, &binding.destination_id)
        {
            match self.manager.crash_recover(binding).await {
                Ok(()) => {
                    self.recovery
                        .remove(&binding.source_id, &binding.destination_id);
                    info!(
                        source_id = %binding.source_id,
                        destination_id = %binding.destination_id,
                        "crash recovery completed"
                    );
                },
                Err(e) => {
                    // Quarantined: the pair stays in the recovery set and is
                    // retried on every pass
                    warn!(
                        source_id = %binding.source_id,
                        destination_id = %binding.destination_id,
                        error = %e,
                        "crash recovery failed, will retry next tick"
                    );
                    self.registry.release(&key);
                    return Ok(());
                },
            }
        }

        let pending = self.store.list_pending_uploads(binding).await?;

        if !pending.is_empty() {
            let now = Utc::now();
            let mut jobs = Vec::new();

            for upload in pending {
                if !self.retry_gate.may_start(&upload, now) {
                    debug!(
                        upload_id = upload.id,
                        attempts = upload.attempts(),
                        "retry gate rejected pending upload"
                    );
                    break;
                }
                let files = self
                    .store
                    .staging_files_in_range(
                        binding,
                        upload.start_staging_file_id,
                        upload.end_staging_file_id,
                    )
                    .await?;
                jobs.push(UploadJob::new(
                    upload,
                    files,
                    binding.clone(),
                    self.manager.clone(),
                ));
            }

            if jobs.is_empty() {
                self.registry.release(&key);
                return Ok(());
            }

            if !self
                .hub
                .try_enqueue(&binding.worker_identity(), UploadBatch::new(key.clone(), jobs))
            {
                self.registry.release(&key);
            }
            return Ok(());
        }

        if !self
            .frequency_gate
            .may_start(binding, self.registry.last_exec(&key), Utc::now())
        {
            self.registry.release(&key);
            return Ok(());
        }
        // Recorded before the upload runs, not after it
        self.registry.record_last_exec(&key, Utc::now().timestamp());

        let files = self.store.list_pending_staging_files(binding).await?;
        if files.is_empty() {
            self.registry.release(&key);
            return Ok(());
        }

        let mut jobs = Vec::new();
        for chunk in files.chunks(self.config.staging_files_batch_size) {
            let upload = self.store.create_upload(binding, chunk).await?;
            debug!(
                upload_id = upload.id,
                start = upload.start_staging_file_id,
                end = upload.end_staging_file_id,
                "upload created"
            );
            jobs.push(UploadJob::new(
                upload,
                chunk.to_vec(),
                binding.clone(),
                self.manager.clone(),
            ));
        }

        if !self
            .hub
            .try_enqueue(&binding.worker_identity(), UploadBatch::new(key.clone(), jobs))
        {
            self.registry.release(&key);
        }

        Ok(())
    }
}

/// Namespace resolution: explicit config namespace (sanitised for the
/// warehouse kind), then the namespace recorded by a prior upload for the
/// pair, then the sanitised source name. ClickHouse uses `config.database`
/// verbatim.
pub fn resolve_namespace(
    dest_type: DestinationType,
    source: &SourceConfig,
    destination: &DestinationConfig,
    prior: Option<String>,
) -> String {
    if dest_type == DestinationType::ClickHouse {
        if let Some(database) = config_str(&destination.config, "database") {
            if !database.is_empty() {
                return database.to_string();
            }
        }
    }

    if let Some(configured) = config_str(&destination.config, "namespace") {
        let sanitised = sanitize_namespace(dest_type, configured);
        if !sanitised.is_empty() {
            return sanitised;
        }
    }

    if let Some(prior) = prior {
        if !prior.is_empty() {
            return prior;
        }
    }

    let fallback = sanitize_namespace(dest_type, &source.name);
    if fallback.is_empty() {
        "default".to_string()
    } else {
        fallback
    }
}

/// Reduce a raw name to a warehouse-safe schema/dataset name: alphanumeric
/// runs joined by underscores, leading digit escaped, case folded per
/// warehouse kind (Snowflake identifiers are upper-cased, the rest lower).
pub fn sanitize_namespace(dest_type: DestinationType, raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_separator = false;

    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_separator = false;
        } else if !out.is_empty() && !last_was_separator {
            out.push('_');
            last_was_separator = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }

    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }

    match dest_type {
        DestinationType::Snowflake => out.to_uppercase(),
        _ => out.to_lowercase(),
    }
}

fn config_flag(config: &serde_json::Value, key: &str) -> bool {
    config.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn config_str<'a>(config: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

/// Destination-configured sync frequency, in minutes, as string or number
fn sync_frequency(config: &serde_json::Value) -> Option<std::time::Duration> {
    let minutes = match config.get("syncFrequency") {
        Some(serde_json::Value::String(s)) => s.parse::<u64>().ok()?,
        Some(serde_json::Value::Number(n)) => n.as_u64()?,
        _ => return None,
    };
    if minutes == 0 {
        return None;
    }
    Some(std::time::Duration::from_secs(minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backendconfig::DestinationDefinition;
    use serde_json::json;

    fn source() -> SourceConfig {
        SourceConfig {
            id: "s1".to_string(),
            name: "Web App".to_string(),
            destinations: Vec::new(),
        }
    }

    fn destination(config: serde_json::Value) -> DestinationConfig {
        DestinationConfig {
            id: "d1".to_string(),
            enabled: true,
            config,
            destination_definition: DestinationDefinition {
                name: "POSTGRES".to_string(),
            },
        }
    }

    #[test]
    fn test_sanitize_namespace() {
        assert_eq!(
            sanitize_namespace(DestinationType::Postgres, "My Analytics-DB"),
            "my_analytics_db"
        );
        assert_eq!(
            sanitize_namespace(DestinationType::Postgres, "  spaced  out  "),
            "spaced_out"
        );
        assert_eq!(sanitize_namespace(DestinationType::Postgres, "2024data"), "_2024data");
        assert_eq!(sanitize_namespace(DestinationType::Postgres, "!!!"), "");
        assert_eq!(
            sanitize_namespace(DestinationType::Snowflake, "my-warehouse"),
            "MY_WAREHOUSE"
        );
    }

    #[test]
    fn test_resolve_namespace_prefers_configured() {
        let namespace = resolve_namespace(
            DestinationType::Postgres,
            &source(),
            &destination(json!({"namespace": "Prod Events"})),
            Some("old_namespace".to_string()),
        );
        assert_eq!(namespace, "prod_events");
    }

    #[test]
    fn test_resolve_namespace_falls_back_to_prior() {
        let namespace = resolve_namespace(
            DestinationType::Postgres,
            &source(),
            &destination(json!({})),
            Some("recorded_before".to_string()),
        );
        assert_eq!(namespace, "recorded_before");
    }

    #[test]
    fn test_resolve_namespace_falls_back_to_source_name() {
        let namespace = resolve_namespace(
            DestinationType::Postgres,
            &source(),
            &destination(json!({})),
            None,
        );
        assert_eq!(namespace, "web_app");
    }

    #[test]
    fn test_resolve_namespace_clickhouse_database_verbatim() {
        let namespace = resolve_namespace(
            DestinationType::ClickHouse,
            &source(),
            &destination(json!({"database": "Raw-Events", "namespace": "ignored"})),
            None,
        );
        assert_eq!(namespace, "Raw-Events");
    }

    #[test]
    fn test_resolve_namespace_unusable_config_falls_through() {
        let namespace = resolve_namespace(
            DestinationType::Postgres,
            &source(),
            &destination(json!({"namespace": "???"})),
            None,
        );
        assert_eq!(namespace, "web_app");
    }

    #[test]
    fn test_sync_frequency_parsing() {
        assert_eq!(
            sync_frequency(&json!({"syncFrequency": "30"})),
            Some(std::time::Duration::from_secs(1800))
        );
        assert_eq!(
            sync_frequency(&json!({"syncFrequency": 15})),
            Some(std::time::Duration::from_secs(900))
        );
        assert_eq!(sync_frequency(&json!({"syncFrequency": "often"})), None);
        assert_eq!(sync_frequency(&json!({"syncFrequency": "0"})), None);
        assert_eq!(sync_frequency(&json!({})), None);
    }

    #[test]
    fn test_config_flags() {
        let config = json!({"eventDelivery": true, "testConnection": false});
        assert!(config_flag(&config, "eventDelivery"));
        assert!(!config_flag(&config, "testConnection"));
        assert!(!config_flag(&config, "enableIdentityResolution"));
        assert!(!config_flag(&serde_json::Value::Null, "eventDelivery"));
    }
}
