//! Upload-state store
//!
//! All SQL against the two metadata tables. Reads are single-statement
//! queries; writes are unconditional inserts or single-row updates.
//! Concurrency control lives in the in-progress registry, not in SQL.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use super::models::{
    DestinationType, StagingFile, StagingFileDescriptor, Upload, UploadState, WarehouseBinding,
};

/// Store over the shared metadata pool
#[derive(Clone)]
pub struct UploadStore {
    pool: PgPool,
    schema_page_size: usize,
}

impl UploadStore {
    pub fn new(pool: PgPool, schema_page_size: usize) -> Self {
        Self {
            pool,
            schema_page_size,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register a staging file from the ingress, in `waiting`
    pub async fn create_staging_file(&self, descriptor: &StagingFileDescriptor) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO wh_staging_files (
                location, schema, source_id, destination_id, status,
                total_events, first_event_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&descriptor.location)
        .bind(&descriptor.schema)
        .bind(&descriptor.source)
        .bind(&descriptor.destination)
        .bind(UploadState::Waiting.as_str())
        .bind(descriptor.total_events)
        .bind(descriptor.first_event_at)
        .bind(descriptor.last_event_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert staging file")?;

        Ok(id)
    }

    /// Staging files not yet covered by a terminal upload for the pair, in
    /// ascending id order
    pub async fn list_pending_staging_files(
        &self,
        binding: &WarehouseBinding,
    ) -> Result<Vec<StagingFile>> {
        let last_end: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(end_staging_file_id), 0)
            FROM wh_uploads
            WHERE source_id = $1 AND destination_id = $2 AND status IN ($3, $4)
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.destination_id)
        .bind(UploadState::ExportedData.as_str())
        .bind(UploadState::Aborted.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to resolve last exported staging file id")?;

        let files = sqlx::query_as::<_, StagingFile>(
            r#"
            SELECT id, location, schema, source_id, destination_id, status,
                   total_events, first_event_at, last_event_at, created_at, updated_at
            FROM wh_staging_files
            WHERE source_id = $1 AND destination_id = $2 AND id > $3
            ORDER BY id ASC
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.destination_id)
        .bind(last_end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending staging files")?;

        Ok(files)
    }

    /// Uploads for the pair that have not reached a terminal state, in
    /// ascending id order
    pub async fn list_pending_uploads(&self, binding: &WarehouseBinding) -> Result<Vec<Upload>> {
        let uploads = sqlx::query_as::<_, Upload>(
            r#"
            SELECT id, source_id, namespace, destination_id, destination_type,
                   start_staging_file_id, end_staging_file_id,
                   start_load_file_id, end_load_file_id, status, schema,
                   error, timings, first_event_at, last_event_at, created_at, updated_at
            FROM wh_uploads
            WHERE source_id = $1 AND destination_id = $2 AND status NOT IN ($3, $4)
            ORDER BY id ASC
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.destination_id)
        .bind(UploadState::ExportedData.as_str())
        .bind(UploadState::Aborted.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending uploads")?;

        Ok(uploads)
    }

    /// Staging files covered by an existing upload's inclusive id range
    pub async fn staging_files_in_range(
        &self,
        binding: &WarehouseBinding,
        start: i64,
        end: i64,
    ) -> Result<Vec<StagingFile>> {
        let files = sqlx::query_as::<_, StagingFile>(
            r#"
            SELECT id, location, schema, source_id, destination_id, status,
                   total_events, first_event_at, last_event_at, created_at, updated_at
            FROM wh_staging_files
            WHERE source_id = $1 AND destination_id = $2 AND id >= $3 AND id <= $4
            ORDER BY id ASC
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.destination_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load staging files for upload range")?;

        Ok(files)
    }

    /// Create an upload in `waiting` covering the given staging-file batch.
    ///
    /// The batch must be non-empty and id-ascending; event timestamps come
    /// from the first and last file in it.
    pub async fn create_upload(
        &self,
        binding: &WarehouseBinding,
        files: &[StagingFile],
    ) -> Result<Upload> {
        let first = files.first().context("Cannot create upload from an empty batch")?;
        let last = files.last().context("Cannot create upload from an empty batch")?;

        let schema = self
            .consolidated_schema(binding, first.id, last.id)
            .await?;

        let upload = sqlx::query_as::<_, Upload>(
            r#"
            INSERT INTO wh_uploads (
                source_id, namespace, destination_id, destination_type,
                start_staging_file_id, end_staging_file_id, status, schema,
                error, timings, first_event_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '{}'::jsonb, $9, $10, $11)
            RETURNING id, source_id, namespace, destination_id, destination_type,
                      start_staging_file_id, end_staging_file_id,
                      start_load_file_id, end_load_file_id, status, schema,
                      error, timings, first_event_at, last_event_at, created_at, updated_at
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.namespace)
        .bind(&binding.destination_id)
        .bind(binding.destination_type.as_str())
        .bind(first.id)
        .bind(last.id)
        .bind(UploadState::Waiting.as_str())
        .bind(&schema)
        .bind(serde_json::json!([{ "waiting": Utc::now().to_rfc3339() }]))
        .bind(first.first_event_at)
        .bind(last.last_event_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create upload")?;

        Ok(upload)
    }

    /// Pairs with uploads interrupted mid-export, for the recovery set
    pub async fn mark_crash_interrupted(
        &self,
        dest_type: DestinationType,
    ) -> Result<Vec<(String, String)>> {
        let pairs = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT source_id, destination_id
            FROM wh_uploads
            WHERE destination_type = $1 AND status IN ($2, $3)
            "#,
        )
        .bind(dest_type.as_str())
        .bind(UploadState::ExportingData.as_str())
        .bind(UploadState::ExportingDataFailed.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to find crash-interrupted uploads")?;

        Ok(pairs)
    }

    /// Record a failed run: bump the attempt counter under the upload's
    /// current state and append the message. This is what the retry gate
    /// counts on the next tick.
    pub async fn record_upload_error(&self, upload_id: i64, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE wh_uploads
            SET error = jsonb_set(
                    COALESCE(error, '{}'::jsonb),
                    ARRAY[status],
                    jsonb_build_object(
                        'attempt', COALESCE((error -> status ->> 'attempt')::bigint, 0) + 1,
                        'errors', COALESCE(error -> status -> 'errors', '[]'::jsonb)
                                  || to_jsonb($2::text)
                    )
                ),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .context("Failed to record upload error")?;

        Ok(())
    }

    /// Namespace recorded by the most recent upload for the pair, if any
    pub async fn latest_namespace(
        &self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<Option<String>> {
        let namespace: Option<String> = sqlx::query_scalar(
            r#"
            SELECT namespace
            FROM wh_uploads
            WHERE source_id = $1 AND destination_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .bind(destination_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up prior namespace")?;

        Ok(namespace)
    }

    /// Most recent uploads for the pair, newest first, for the one-shot
    /// delivery-status sync
    pub async fn latest_uploads(
        &self,
        binding: &WarehouseBinding,
        limit: i64,
    ) -> Result<Vec<Upload>> {
        let uploads = sqlx::query_as::<_, Upload>(
            r#"
            SELECT id, source_id, namespace, destination_id, destination_type,
                   start_staging_file_id, end_staging_file_id,
                   start_load_file_id, end_load_file_id, status, schema,
                   error, timings, first_event_at, last_event_at, created_at, updated_at
            FROM wh_uploads
            WHERE source_id = $1 AND destination_id = $2
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(&binding.source_id)
        .bind(&binding.destination_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list latest uploads")?;

        Ok(uploads)
    }

    /// Health probe against the metadata database
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Metadata database ping failed")?;
        Ok(())
    }

    /// Merge the schemas of the staging files in `[start, end]`, fetched in
    /// pages to bound memory on wide ranges
    async fn consolidated_schema(
        &self,
        binding: &WarehouseBinding,
        start: i64,
        end: i64,
    ) -> Result<serde_json::Value> {
        let mut merged = serde_json::Map::new();
        let mut offset: i64 = 0;

        loop {
            let page: Vec<serde_json::Value> = sqlx::query_scalar(
                r#"
                SELECT schema
                FROM wh_staging_files
                WHERE source_id = $1 AND destination_id = $2 AND id >= $3 AND id <= $4
                ORDER BY id ASC
                LIMIT $5 OFFSET $6
                "#,
            )
            .bind(&binding.source_id)
            .bind(&binding.destination_id)
            .bind(start)
            .bind(end)
            .bind(self.schema_page_size as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to page staging-file schemas")?;

            let fetched = page.len();
            for schema in page {
                merge_schema(&mut merged, &schema);
            }

            if fetched < self.schema_page_size {
                break;
            }
            offset += fetched as i64;
        }

        Ok(serde_json::Value::Object(merged))
    }
}

/// Merge one staging-file schema (table -> column -> type) into the
/// consolidated map. The first type seen for a column wins.
fn merge_schema(into: &mut serde_json::Map<String, serde_json::Value>, schema: &serde_json::Value) {
    let Some(tables) = schema.as_object() else {
        return;
    };

    for (table, columns) in tables {
        let Some(columns) = columns.as_object() else {
            continue;
        };
        let entry = into
            .entry(table.clone())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let Some(merged_columns) = entry.as_object_mut() {
            for (column, column_type) in columns {
                merged_columns
                    .entry(column.clone())
                    .or_insert_with(|| column_type.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_schema_unions_tables_and_columns() {
        let mut merged = serde_json::Map::new();

        merge_schema(&mut merged, &json!({"tracks": {"id": "string", "ts": "datetime"}}));
        merge_schema(&mut merged, &json!({"tracks": {"value": "float"}, "pages": {"url": "string"}}));

        let merged = serde_json::Value::Object(merged);
        assert_eq!(merged["tracks"]["id"], "string");
        assert_eq!(merged["tracks"]["value"], "float");
        assert_eq!(merged["pages"]["url"], "string");
    }

    #[test]
    fn test_merge_schema_first_type_wins() {
        let mut merged = serde_json::Map::new();

        merge_schema(&mut merged, &json!({"tracks": {"value": "int"}}));
        merge_schema(&mut merged, &json!({"tracks": {"value": "float"}}));

        assert_eq!(merged["tracks"]["value"], "int");
    }

    #[test]
    fn test_merge_schema_ignores_non_object_schemas() {
        let mut merged = serde_json::Map::new();

        merge_schema(&mut merged, &json!("not a schema"));
        merge_schema(&mut merged, &json!({"tracks": "not columns"}));

        assert!(merged.is_empty());
    }
}
