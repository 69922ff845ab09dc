//! Metadata-DB pub/sub
//!
//! The master publishes staging-file parse tasks on the
//! `process_staging_file` topic after every ingress insert; slave listener
//! routines consume them and hand the payload to an externally supplied
//! handler. The parsing pool itself lives outside this crate.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Topic registered by the master; slaves listen on it
pub const STAGING_FILE_TOPIC: &str = "process_staging_file";

/// Parse task published for one registered staging file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingFileTask {
    pub staging_file_id: i64,
    pub location: String,
}

/// Consumer seam for the external parsing pool
#[async_trait]
pub trait StagingFileHandler: Send + Sync {
    async fn handle(&self, task: StagingFileTask) -> Result<()>;
}

/// Publisher over the shared metadata pool
#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
}

impl Notifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fan out a parse task for a freshly registered staging file
    pub async fn publish_staging_file(&self, task: &StagingFileTask) -> Result<()> {
        let payload = serde_json::to_string(task).context("Failed to encode parse task")?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(STAGING_FILE_TOPIC)
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("Failed to publish staging-file parse task")?;

        Ok(())
    }
}

/// Spawn the slave listener routines. Each holds its own LISTEN connection
/// and reconnects with a backoff when it drops.
pub fn spawn_slave_listeners(
    pool: PgPool,
    routines: usize,
    handler: Option<Arc<dyn StagingFileHandler>>,
) -> Vec<JoinHandle<()>> {
    (0..routines)
        .map(|index| tokio::spawn(run_listener(index, pool.clone(), handler.clone())))
        .collect()
}

async fn run_listener(index: usize, pool: PgPool, handler: Option<Arc<dyn StagingFileHandler>>) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(routine = index, error = %e, "slave listener failed to connect");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            },
        };

        if let Err(e) = listener.listen(STAGING_FILE_TOPIC).await {
            warn!(routine = index, error = %e, "slave listener failed to subscribe");
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }

        info!(routine = index, topic = STAGING_FILE_TOPIC, "slave listener ready");

        loop {
            let notification = match listener.recv().await {
                Ok(notification) => notification,
                Err(e) => {
                    warn!(routine = index, error = %e, "slave listener lost its connection");
                    break;
                },
            };

            let task: StagingFileTask = match serde_json::from_str(notification.payload()) {
                Ok(task) => task,
                Err(e) => {
                    warn!(
                        routine = index,
                        error = %e,
                        payload = notification.payload(),
                        "dropping undecodable parse task"
                    );
                    continue;
                },
            };

            match &handler {
                Some(handler) => {
                    if let Err(e) = handler.handle(task).await {
                        warn!(routine = index, error = %e, "parse task handler failed");
                    }
                },
                None => {
                    debug!(
                        routine = index,
                        staging_file_id = task.staging_file_id,
                        "no parse handler registered, dropping task"
                    );
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_payload_round_trip() {
        let task = StagingFileTask {
            staging_file_id: 42,
            location: "s3://bucket/staging/42.json".to_string(),
        };

        let payload = serde_json::to_string(&task).unwrap();
        assert!(payload.contains("\"stagingFileId\":42"));

        let decoded: StagingFileTask = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, task);
    }
}
