//! Frequency and retry admission gates
//!
//! Pure predicates over persisted and in-memory state deciding whether an
//! upload may start now. The frequency gate governs fresh uploads; the retry
//! gate governs re-enqueueing pending ones.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::models::{Upload, WarehouseBinding};
use crate::config::WarehouseConfig;

/// Admission policy for pending (already-created) uploads
#[derive(Debug, Clone, Copy)]
pub struct RetryGate {
    min_retry_attempts: i64,
    retry_time_window: Duration,
}

impl RetryGate {
    pub fn new(config: &WarehouseConfig) -> Self {
        Self {
            min_retry_attempts: config.min_retry_attempts,
            retry_time_window: config.retry_time_window(),
        }
    }

    /// A pending upload may start iff it has not yet exhausted both the
    /// attempt budget and the time window measured from its first attempt.
    /// Uploads past both are left dormant for operator action; they are
    /// never auto-aborted here.
    pub fn may_start(&self, upload: &Upload, now: DateTime<Utc>) -> bool {
        if upload.attempts() < self.min_retry_attempts {
            return true;
        }
        let elapsed = now.signed_duration_since(upload.first_attempt_at());
        elapsed.num_seconds() < self.retry_time_window.as_secs() as i64
    }
}

/// Admission policy for fresh uploads
#[derive(Debug, Clone, Copy)]
pub struct FrequencyGate {
    default_upload_freq: Duration,
    sync_freq_ignore: bool,
}

impl FrequencyGate {
    pub fn new(config: &WarehouseConfig) -> Self {
        Self {
            default_upload_freq: config.upload_freq(),
            sync_freq_ignore: config.sync_freq_ignore,
        }
    }

    /// A pair may start a fresh upload iff it has not started one within its
    /// sync frequency (destination-configured, else the default).
    pub fn may_start(
        &self,
        binding: &WarehouseBinding,
        last_exec_unix: Option<i64>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.sync_freq_ignore {
            return true;
        }
        let last = match last_exec_unix {
            Some(last) => last,
            None => return true,
        };
        let freq = binding.sync_frequency.unwrap_or(self.default_upload_freq);
        now.timestamp() - last >= freq.as_secs() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::models::DestinationType;
    use chrono::TimeDelta;
    use serde_json::json;

    fn config() -> WarehouseConfig {
        WarehouseConfig {
            min_retry_attempts: 3,
            retry_time_window_in_mins: 180,
            upload_freq_in_s: 60,
            ..WarehouseConfig::default()
        }
    }

    fn binding(sync_frequency: Option<Duration>) -> WarehouseBinding {
        WarehouseBinding {
            source_id: "s1".to_string(),
            source_name: "app".to_string(),
            destination_id: "d1".to_string(),
            destination_type: DestinationType::Postgres,
            namespace: "analytics".to_string(),
            sync_frequency,
            event_delivery: false,
            test_connection: false,
            identity_resolution: false,
        }
    }

    fn failed_upload(attempts: i64, first_attempt_at: DateTime<Utc>) -> Upload {
        Upload {
            id: 7,
            source_id: "s1".to_string(),
            namespace: "analytics".to_string(),
            destination_id: "d1".to_string(),
            destination_type: "POSTGRES".to_string(),
            start_staging_file_id: 1,
            end_staging_file_id: 10,
            start_load_file_id: 0,
            end_load_file_id: 0,
            status: "exporting_data_failed".to_string(),
            schema: json!({}),
            error: json!({"exporting_data_failed": {"attempt": attempts}}),
            timings: json!([{ "waiting": first_attempt_at.to_rfc3339() }]),
            first_event_at: None,
            last_event_at: None,
            created_at: first_attempt_at,
            updated_at: first_attempt_at,
        }
    }

    #[test]
    fn test_retry_gate_admits_below_attempt_budget() {
        let gate = RetryGate::new(&config());
        let now = Utc::now();
        // 4 hours ago is past the window, but only 2 attempts were made
        let upload = failed_upload(2, now - TimeDelta::hours(4));
        assert!(gate.may_start(&upload, now));
    }

    #[test]
    fn test_retry_gate_admits_within_time_window() {
        let gate = RetryGate::new(&config());
        let now = Utc::now();
        // attempts exhausted, but first attempt was only 10 minutes ago
        let upload = failed_upload(5, now - TimeDelta::minutes(10));
        assert!(gate.may_start(&upload, now));
    }

    #[test]
    fn test_retry_gate_rejects_when_both_exhausted() {
        let gate = RetryGate::new(&config());
        let now = Utc::now();
        let upload = failed_upload(5, now - TimeDelta::hours(4));
        assert!(!gate.may_start(&upload, now));
    }

    #[test]
    fn test_retry_gate_admits_upload_with_no_history() {
        let gate = RetryGate::new(&config());
        let now = Utc::now();
        let mut upload = failed_upload(0, now);
        upload.error = json!({});
        upload.timings = json!([]);
        assert!(gate.may_start(&upload, now));
    }

    #[test]
    fn test_frequency_gate_rejects_recent_start() {
        let gate = FrequencyGate::new(&config());
        let now = Utc::now();
        let last = now.timestamp() - 30;
        assert!(!gate.may_start(&binding(None), Some(last), now));
    }

    #[test]
    fn test_frequency_gate_admits_after_interval() {
        let gate = FrequencyGate::new(&config());
        let now = Utc::now();
        let last = now.timestamp() - 61;
        assert!(gate.may_start(&binding(None), Some(last), now));
    }

    #[test]
    fn test_frequency_gate_admits_first_run() {
        let gate = FrequencyGate::new(&config());
        assert!(gate.may_start(&binding(None), None, Utc::now()));
    }

    #[test]
    fn test_frequency_gate_honours_binding_frequency() {
        let gate = FrequencyGate::new(&config());
        let now = Utc::now();
        let last = now.timestamp() - 90;
        // default (60s) would admit; the binding's 30-minute frequency does not
        let slow = binding(Some(Duration::from_secs(1800)));
        assert!(!gate.may_start(&slow, Some(last), now));
    }

    #[test]
    fn test_frequency_gate_ignore_flag_bypasses() {
        let mut cfg = config();
        cfg.sync_freq_ignore = true;
        let gate = FrequencyGate::new(&cfg);
        let now = Utc::now();
        assert!(gate.may_start(&binding(None), Some(now.timestamp()), now));
    }
}
