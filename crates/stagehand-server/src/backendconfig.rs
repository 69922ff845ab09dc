//! Backend-config feed
//!
//! The control plane serves full workspace snapshots; each snapshot wholly
//! replaces the prior view. The subscriber polls, deduplicates, and fans the
//! snapshots out on a watch channel so every consumer keeps its own
//! latest-snapshot view without shared mutation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;

/// Full backend-config snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(rename = "Sources", default)]
    pub sources: Vec<SourceConfig>,
}

/// One configured event source and its destinations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Destinations", default)]
    pub destinations: Vec<DestinationConfig>,
}

/// One destination attached to a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Enabled")]
    pub enabled: bool,
    #[serde(rename = "Config", default)]
    pub config: serde_json::Value,
    #[serde(rename = "DestinationDefinition")]
    pub destination_definition: DestinationDefinition,
}

/// Destination kind descriptor; `name` is the warehouse type code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationDefinition {
    #[serde(rename = "Name")]
    pub name: String,
}

impl ConfigSnapshot {
    /// Destination type codes present anywhere in the snapshot
    pub fn destination_type_names(&self) -> std::collections::HashSet<String> {
        self.sources
            .iter()
            .flat_map(|s| &s.destinations)
            .map(|d| d.destination_definition.name.clone())
            .collect()
    }
}

/// Polls the control plane and broadcasts deduplicated snapshots
pub struct BackendConfigSubscriber {
    url: String,
    poll_interval: std::time::Duration,
    client: reqwest::Client,
}

impl BackendConfigSubscriber {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            url: config.url.clone(),
            poll_interval: config.poll_interval(),
            client: reqwest::Client::new(),
        }
    }

    /// Start polling in the background. The receiver starts on an empty
    /// snapshot and observes every change thereafter.
    pub fn start(self) -> (watch::Receiver<ConfigSnapshot>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(ConfigSnapshot::default());

        let handle = tokio::spawn(async move {
            info!(url = %self.url, "backend-config subscriber started");

            loop {
                match self.fetch().await {
                    Ok(snapshot) => {
                        let changed = tx.send_if_modified(|current| {
                            if *current == snapshot {
                                false
                            } else {
                                *current = snapshot;
                                true
                            }
                        });
                        if changed {
                            debug!("backend config updated");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "backend-config poll failed, keeping last snapshot");
                    },
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        });

        (rx, handle)
    }

    async fn fetch(&self) -> Result<ConfigSnapshot> {
        let snapshot = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to reach the config backend")?
            .error_for_status()
            .context("Config backend returned an error status")?
            .json::<ConfigSnapshot>()
            .await
            .context("Failed to decode config snapshot")?;

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_deserialization() {
        let body = json!({
            "Sources": [
                {
                    "ID": "s1",
                    "Name": "web-app",
                    "Destinations": [
                        {
                            "ID": "d1",
                            "Enabled": true,
                            "Config": {"namespace": "analytics", "syncFrequency": "30"},
                            "DestinationDefinition": {"Name": "POSTGRES"}
                        },
                        {
                            "ID": "d2",
                            "Enabled": false,
                            "DestinationDefinition": {"Name": "RS"}
                        }
                    ]
                }
            ]
        });

        let snapshot: ConfigSnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.sources.len(), 1);

        let source = &snapshot.sources[0];
        assert_eq!(source.id, "s1");
        assert_eq!(source.name, "web-app");
        assert_eq!(source.destinations.len(), 2);
        assert!(source.destinations[0].enabled);
        assert_eq!(source.destinations[0].config["namespace"], "analytics");
        assert_eq!(source.destinations[1].destination_definition.name, "RS");
        assert_eq!(source.destinations[1].config, serde_json::Value::Null);
    }

    #[test]
    fn test_destination_type_names() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({
            "Sources": [
                {"ID": "s1", "Name": "a", "Destinations": [
                    {"ID": "d1", "Enabled": true, "DestinationDefinition": {"Name": "POSTGRES"}},
                    {"ID": "d2", "Enabled": true, "DestinationDefinition": {"Name": "RS"}}
                ]},
                {"ID": "s2", "Name": "b", "Destinations": [
                    {"ID": "d3", "Enabled": false, "DestinationDefinition": {"Name": "POSTGRES"}}
                ]}
            ]
        }))
        .unwrap();

        let names = snapshot.destination_type_names();
        assert_eq!(names.len(), 2);
        assert!(names.contains("POSTGRES"));
        assert!(names.contains("RS"));
    }

    #[test]
    fn test_empty_snapshot_deserialization() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({})).unwrap();
        assert!(snapshot.sources.is_empty());
    }
}
