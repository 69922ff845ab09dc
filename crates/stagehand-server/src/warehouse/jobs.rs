//! Upload jobs and batches
//!
//! An `UploadJob` is one persisted upload plus the staging files it covers,
//! bound to the manager that will run it. A batch is the contiguous list of
//! jobs the main loop built for one pair in one pass; workers drain batches
//! one at a time, in order.

use super::manager::WarehouseManager;
use super::models::{StagingFile, Upload, WarehouseBinding};
use stagehand_common::Result;

/// One schedulable upload
#[derive(Clone)]
pub struct UploadJob {
    pub upload: Upload,
    pub staging_files: Vec<StagingFile>,
    pub binding: WarehouseBinding,
    manager: WarehouseManager,
}

impl UploadJob {
    pub fn new(
        upload: Upload,
        staging_files: Vec<StagingFile>,
        binding: WarehouseBinding,
        manager: WarehouseManager,
    ) -> Self {
        Self {
            upload,
            staging_files,
            binding,
            manager,
        }
    }

    /// Run the warehouse pipeline for this upload
    pub async fn run(&self) -> Result<()> {
        self.manager.run(self).await
    }
}

/// Jobs for one (source, destination) pair, executed in enqueue order
pub struct UploadBatch {
    /// In-progress registry key the worker releases after draining
    pub pair_key: String,
    pub jobs: Vec<UploadJob>,
}

impl UploadBatch {
    pub fn new(pair_key: String, jobs: Vec<UploadJob>) -> Self {
        Self { pair_key, jobs }
    }
}
