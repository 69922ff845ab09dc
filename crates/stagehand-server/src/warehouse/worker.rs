//! Per-destination upload workers
//!
//! One long-lived task per worker identity `<destinationID>_<namespace>`
//! draining a bounded queue of upload batches. Within a batch jobs run in
//! enqueue order and the first failure skips the remainder, preserving
//! upload-id order for the pair. A shared semaphore caps concurrent uploads
//! across all destination types.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::jobs::UploadBatch;
use super::registry::InProgressRegistry;
use super::store::UploadStore;

/// Batches buffered per worker before the main loop backs off
pub const WORKER_QUEUE_CAPACITY: usize = 100;

/// Registry of worker tasks, one per identity, plus the global upload slots
pub struct WorkerHub {
    senders: RwLock<HashMap<String, mpsc::Sender<UploadBatch>>>,
    semaphore: Arc<Semaphore>,
    registry: Arc<InProgressRegistry>,
    store: UploadStore,
    no_of_workers: usize,
    retry_sleep: Duration,
}

impl WorkerHub {
    pub fn new(
        no_of_workers: usize,
        retry_sleep: Duration,
        registry: Arc<InProgressRegistry>,
        store: UploadStore,
    ) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(no_of_workers)),
            registry,
            store,
            no_of_workers,
            retry_sleep,
        }
    }

    /// Idempotently ensure a worker exists for the identity and return its
    /// queue. Workers are never torn down on config churn.
    pub fn ensure_worker(&self, identity: &str) -> mpsc::Sender<UploadBatch> {
        {
            let senders = match self.senders.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(sender) = senders.get(identity) {
                return sender.clone();
            }
        }

        let mut senders = match self.senders.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = senders.get(identity) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        tokio::spawn(run_worker(
            identity.to_string(),
            rx,
            self.semaphore.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.retry_sleep,
        ));
        senders.insert(identity.to_string(), tx.clone());
        info!(worker = %identity, "worker created");
        tx
    }

    /// Non-blocking enqueue. A full queue drops the batch; the caller must
    /// release the pair's in-progress bit and retry on a later tick.
    pub fn try_enqueue(&self, identity: &str, batch: UploadBatch) -> bool {
        let sender = self.ensure_worker(identity);
        match sender.try_send(batch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(
                    worker = %identity,
                    pair = %batch.pair_key,
                    jobs = batch.jobs.len(),
                    "worker queue full, dropping batch until next tick"
                );
                false
            },
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                error!(
                    worker = %identity,
                    pair = %batch.pair_key,
                    "worker queue closed, dropping batch"
                );
                false
            },
        }
    }

    /// Upload slots currently held by workers
    pub fn slots_in_use(&self) -> usize {
        self.no_of_workers - self.semaphore.available_permits()
    }

    pub fn worker_count(&self) -> usize {
        let senders = match self.senders.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders.len()
    }
}

/// Worker loop: one batch at a time, global admission first, jobs in order
async fn run_worker(
    identity: String,
    mut rx: mpsc::Receiver<UploadBatch>,
    semaphore: Arc<Semaphore>,
    registry: Arc<InProgressRegistry>,
    store: UploadStore,
    retry_sleep: Duration,
) {
    info!(worker = %identity, "worker started");

    while let Some(batch) = rx.recv().await {
        let permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            // The semaphore lives as long as the hub; closure means shutdown
            Err(_) => break,
        };

        let mut batch_failed = false;
        for job in &batch.jobs {
            debug!(
                worker = %identity,
                upload_id = job.upload.id,
                staging_files = job.staging_files.len(),
                "running upload"
            );

            match job.run().await {
                Ok(()) => {
                    info!(
                        worker = %identity,
                        upload_id = job.upload.id,
                        source_id = %job.binding.source_id,
                        destination_id = %job.binding.destination_id,
                        "upload completed"
                    );
                },
                Err(e) => {
                    error!(
                        worker = %identity,
                        upload_id = job.upload.id,
                        error = %e,
                        "upload failed, skipping remainder of batch"
                    );
                    if let Err(db_err) = store
                        .record_upload_error(job.upload.id, &e.to_string())
                        .await
                    {
                        error!(
                            upload_id = job.upload.id,
                            error = %db_err,
                            "failed to record upload error"
                        );
                    }
                    batch_failed = true;
                    break;
                },
            }
        }

        drop(permit);
        registry.release(&batch.pair_key);

        if batch_failed {
            tokio::time::sleep(retry_sleep).await;
        }
    }

    info!(worker = %identity, "worker stopped");
}
