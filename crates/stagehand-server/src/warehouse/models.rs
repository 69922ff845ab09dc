//! Data models for the warehouse scheduling core
//!
//! Row types for the two metadata tables, the upload state machine, and the
//! resolved (source, destination) binding the routers schedule over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Destination warehouse kind, one router instance per variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    Redshift,
    BigQuery,
    Snowflake,
    Postgres,
    ClickHouse,
}

impl DestinationType {
    /// Control-plane code for this warehouse kind
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationType::Redshift => "RS",
            DestinationType::BigQuery => "BQ",
            DestinationType::Snowflake => "SNOWFLAKE",
            DestinationType::Postgres => "POSTGRES",
            DestinationType::ClickHouse => "CLICKHOUSE",
        }
    }
}

impl std::str::FromStr for DestinationType {
    type Err = stagehand_common::StagehandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS" => Ok(DestinationType::Redshift),
            "BQ" => Ok(DestinationType::BigQuery),
            "SNOWFLAKE" => Ok(DestinationType::Snowflake),
            "POSTGRES" => Ok(DestinationType::Postgres),
            "CLICKHOUSE" => Ok(DestinationType::ClickHouse),
            _ => Err(stagehand_common::StagehandError::UnknownDestination(s.to_string())),
        }
    }
}

impl std::fmt::Display for DestinationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upload lifecycle state
///
/// The scheduler only cares about terminal vs non-terminal; the intermediate
/// states are owned by the warehouse drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Waiting,
    GeneratingUuids,
    GeneratingUuidsFailed,
    GeneratingLoadFiles,
    GeneratingLoadFilesFailed,
    UpdatingIdentityTables,
    UpdatingIdentityTablesFailed,
    UpdatingSchema,
    UpdatingSchemaFailed,
    ExportingData,
    ExportingDataFailed,
    ExportedData,
    Aborted,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Waiting => "waiting",
            UploadState::GeneratingUuids => "generating_uuids",
            UploadState::GeneratingUuidsFailed => "generating_uuids_failed",
            UploadState::GeneratingLoadFiles => "generating_load_files",
            UploadState::GeneratingLoadFilesFailed => "generating_load_files_failed",
            UploadState::UpdatingIdentityTables => "updating_identity_tables",
            UploadState::UpdatingIdentityTablesFailed => "updating_identity_tables_failed",
            UploadState::UpdatingSchema => "updating_schema",
            UploadState::UpdatingSchemaFailed => "updating_schema_failed",
            UploadState::ExportingData => "exporting_data",
            UploadState::ExportingDataFailed => "exporting_data_failed",
            UploadState::ExportedData => "exported_data",
            UploadState::Aborted => "aborted",
        }
    }

    /// Terminal states close out their staging-file range for the pair
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::ExportedData | UploadState::Aborted)
    }
}

impl From<&str> for UploadState {
    fn from(s: &str) -> Self {
        match s {
            "generating_uuids" => UploadState::GeneratingUuids,
            "generating_uuids_failed" => UploadState::GeneratingUuidsFailed,
            "generating_load_files" => UploadState::GeneratingLoadFiles,
            "generating_load_files_failed" => UploadState::GeneratingLoadFilesFailed,
            "updating_identity_tables" => UploadState::UpdatingIdentityTables,
            "updating_identity_tables_failed" => UploadState::UpdatingIdentityTablesFailed,
            "updating_schema" => UploadState::UpdatingSchema,
            "updating_schema_failed" => UploadState::UpdatingSchemaFailed,
            "exporting_data" => UploadState::ExportingData,
            "exporting_data_failed" => UploadState::ExportingDataFailed,
            "exported_data" => UploadState::ExportedData,
            "aborted" => UploadState::Aborted,
            _ => UploadState::Waiting,
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Staging file row (maps to wh_staging_files)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagingFile {
    pub id: i64,
    pub location: String,
    pub schema: serde_json::Value,
    pub source_id: String,
    pub destination_id: String,
    pub status: String,
    pub total_events: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upload row (maps to wh_uploads)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Upload {
    pub id: i64,
    pub source_id: String,
    pub namespace: String,
    pub destination_id: String,
    pub destination_type: String,
    pub start_staging_file_id: i64,
    pub end_staging_file_id: i64,
    pub start_load_file_id: i64,
    pub end_load_file_id: i64,
    pub status: String,
    pub schema: serde_json::Value,
    pub error: serde_json::Value,
    pub timings: serde_json::Value,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn state(&self) -> UploadState {
        UploadState::from(self.status.as_str())
    }

    /// First transition timestamp out of the timings array, falling back to
    /// the row's creation time
    pub fn first_attempt_at(&self) -> DateTime<Utc> {
        self.transition_at(0).unwrap_or(self.created_at)
    }

    /// Most recent transition timestamp out of the timings array
    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        let entries = self.timings.as_array()?;
        self.transition_at(entries.len().checked_sub(1)?)
    }

    /// Attempt counter recorded for the upload's current state
    pub fn attempts(&self) -> i64 {
        self.error
            .get(self.status.as_str())
            .and_then(|e| e.get("attempt"))
            .and_then(|a| a.as_i64())
            .unwrap_or(0)
    }

    fn transition_at(&self, index: usize) -> Option<DateTime<Utc>> {
        let entry = self.timings.as_array()?.get(index)?;
        let (_, raw) = entry.as_object()?.iter().next()?;
        raw.as_str()?
            .parse::<DateTime<Utc>>()
            .ok()
    }
}

/// Resolved route for one configured (source, destination) pair
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseBinding {
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_type: DestinationType,
    pub namespace: String,
    /// Minimum interval between upload starts, from destination config
    pub sync_frequency: Option<Duration>,
    pub event_delivery: bool,
    pub test_connection: bool,
    pub identity_resolution: bool,
}

impl WarehouseBinding {
    /// In-progress / last-exec registry key
    pub fn pair_key(&self) -> String {
        format!("source:{}:destination:{}", self.source_id, self.destination_id)
    }

    /// Worker serialisation unit: one worker per destination instance and
    /// namespace, shared across sources
    pub fn worker_identity(&self) -> String {
        format!("{}_{}", self.destination_id, self.namespace)
    }
}

/// Staging-file descriptor accepted by POST /v1/process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingFileDescriptor {
    pub location: String,
    pub schema: serde_json::Value,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub first_event_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_events: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upload_fixture() -> Upload {
        Upload {
            id: 1,
            source_id: "src".to_string(),
            namespace: "analytics".to_string(),
            destination_id: "dst".to_string(),
            destination_type: "POSTGRES".to_string(),
            start_staging_file_id: 1,
            end_staging_file_id: 3,
            start_load_file_id: 0,
            end_load_file_id: 0,
            status: "waiting".to_string(),
            schema: json!({}),
            error: json!({}),
            timings: json!([]),
            first_event_at: None,
            last_event_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_destination_type_round_trip() {
        for code in ["RS", "BQ", "SNOWFLAKE", "POSTGRES", "CLICKHOUSE"] {
            let parsed: DestinationType = code.parse().unwrap();
            assert_eq!(parsed.as_str(), code);
        }
        assert!("MYSQL".parse::<DestinationType>().is_err());
    }

    #[test]
    fn test_upload_state_terminality() {
        assert!(UploadState::ExportedData.is_terminal());
        assert!(UploadState::Aborted.is_terminal());
        assert!(!UploadState::Waiting.is_terminal());
        assert!(!UploadState::ExportingData.is_terminal());
        assert!(!UploadState::ExportingDataFailed.is_terminal());
    }

    #[test]
    fn test_upload_state_string_round_trip() {
        for state in [
            UploadState::Waiting,
            UploadState::GeneratingLoadFiles,
            UploadState::ExportingDataFailed,
            UploadState::ExportedData,
            UploadState::Aborted,
        ] {
            assert_eq!(UploadState::from(state.as_str()), state);
        }
    }

    #[test]
    fn test_upload_attempts_from_error_json() {
        let mut upload = upload_fixture();
        upload.status = "exporting_data_failed".to_string();
        upload.error = json!({
            "exporting_data_failed": {"attempt": 4, "errors": ["connect timeout"]},
            "generating_load_files_failed": {"attempt": 1},
        });
        assert_eq!(upload.attempts(), 4);

        upload.error = json!({});
        assert_eq!(upload.attempts(), 0);
    }

    #[test]
    fn test_upload_transition_timestamps() {
        let mut upload = upload_fixture();
        upload.timings = json!([
            {"waiting": "2024-03-01T10:00:00Z"},
            {"generating_load_files": "2024-03-01T10:05:00Z"},
            {"exporting_data": "2024-03-01T10:07:00Z"},
        ]);

        assert_eq!(
            upload.first_attempt_at(),
            "2024-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            upload.last_transition_at().unwrap(),
            "2024-03-01T10:07:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_upload_transition_fallback_to_created_at() {
        let upload = upload_fixture();
        assert_eq!(upload.first_attempt_at(), upload.created_at);
        assert!(upload.last_transition_at().is_none());
    }

    #[test]
    fn test_binding_keys() {
        let binding = WarehouseBinding {
            source_id: "s1".to_string(),
            source_name: "app".to_string(),
            destination_id: "d1".to_string(),
            destination_type: DestinationType::Postgres,
            namespace: "analytics".to_string(),
            sync_frequency: None,
            event_delivery: false,
            test_connection: false,
            identity_resolution: false,
        };

        assert_eq!(binding.pair_key(), "source:s1:destination:d1");
        assert_eq!(binding.worker_identity(), "d1_analytics");
    }

    #[test]
    fn test_staging_file_descriptor_deserialization() {
        let body = json!({
            "location": "s3://bucket/staging/1.json",
            "schema": {"tracks": {"id": "string"}},
            "source": "s1",
            "destination": "d1",
            "firstEventAt": "2024-03-01T10:00:00Z",
            "totalEvents": 120,
        });

        let descriptor: StagingFileDescriptor = serde_json::from_value(body).unwrap();
        assert_eq!(descriptor.source, "s1");
        assert_eq!(descriptor.total_events, 120);
        assert!(descriptor.first_event_at.is_some());
        assert!(descriptor.last_event_at.is_none());
    }
}
