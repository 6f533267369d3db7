//! 处理记录与处理日志查询

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::connection::DatabasePool;
use draw_core::store::ProcessingStore;
use draw_core::{
    CopyTask, DrawError, ProcessingLogEntry, ProcessingRecord, ProcessingStatus, Result,
    RtStructFile, SeriesState,
};

#[derive(Debug, FromRow)]
struct DbProcessingRecord {
    id: Uuid,
    copy_task_id: Option<Uuid>,
    patient_id: String,
    patient_name: Option<String>,
    modality: String,
    study_instance_uid: String,
    series_instance_uid: String,
    series_description: Option<String>,
    study_date: Option<NaiveDate>,
    protocol: Option<String>,
    import_directory: String,
    current_directory: String,
    template_name: Option<String>,
    status: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbProcessingRecord> for ProcessingRecord {
    type Error = DrawError;

    fn try_from(db: DbProcessingRecord) -> Result<Self> {
        let status = ProcessingStatus::parse(&db.status)
            .ok_or_else(|| DrawError::Database(format!("unknown processing status {}", db.status)))?;
        let state = match db.state.as_str() {
            "PROCESSING" => SeriesState::Processing,
            "UNPROCESSED" => SeriesState::Unprocessed,
            "COMPLETE" => SeriesState::Complete,
            "FAILED" => SeriesState::Failed,
            other => {
                return Err(DrawError::Database(format!("unknown series state {}", other)));
            }
        };
        Ok(ProcessingRecord {
            id: db.id,
            copy_task_id: db.copy_task_id,
            patient_id: db.patient_id,
            patient_name: db.patient_name,
            modality: db.modality,
            study_instance_uid: db.study_instance_uid,
            series_instance_uid: db.series_instance_uid,
            series_description: db.series_description,
            study_date: db.study_date,
            protocol: db.protocol,
            import_directory: db.import_directory,
            current_directory: db.current_directory,
            template_name: db.template_name,
            status,
            state,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

/// 处理记录存储的Postgres实现
#[derive(Clone)]
pub struct PgProcessingStore {
    pool: DatabasePool,
}

impl PgProcessingStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessingStore for PgProcessingStore {
    async fn create_record(&self, record: &ProcessingRecord) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO processing_records (id, copy_task_id, patient_id, patient_name, modality,
                study_instance_uid, series_instance_uid, series_description, study_date, protocol,
                import_directory, current_directory, template_name, status, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#)
        .bind(record.id)
        .bind(record.copy_task_id)
        .bind(&record.patient_id)
        .bind(&record.patient_name)
        .bind(&record.modality)
        .bind(&record.study_instance_uid)
        .bind(&record.series_instance_uid)
        .bind(&record.series_description)
        .bind(record.study_date)
        .bind(&record.protocol)
        .bind(&record.import_directory)
        .bind(&record.current_directory)
        .bind(&record.template_name)
        .bind(record.status.as_str())
        .bind(record.state.as_str())
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ProcessingRecord>> {
        let result = sqlx::query_as::<_, DbProcessingRecord>(
            "SELECT * FROM processing_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        result.map(ProcessingRecord::try_from).transpose()
    }

    async fn find_record_by_series_uid(
        &self,
        series_instance_uid: &str,
    ) -> Result<Option<ProcessingRecord>> {
        let result = sqlx::query_as::<_, DbProcessingRecord>(
            "SELECT * FROM processing_records WHERE series_instance_uid = $1",
        )
        .bind(series_instance_uid)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        result.map(ProcessingRecord::try_from).transpose()
    }

    async fn update_record(&self, record: &ProcessingRecord) -> Result<()> {
        let result = sqlx::query(r#"
            UPDATE processing_records SET
                current_directory = $2,
                template_name = $3,
                status = $4,
                state = $5,
                updated_at = NOW()
            WHERE id = $1
        "#)
        .bind(record.id)
        .bind(&record.current_directory)
        .bind(&record.template_name)
        .bind(record.status.as_str())
        .bind(record.state.as_str())
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(DrawError::NotFound(format!("processing record {}", record.id)));
        }
        Ok(())
    }

    async fn list_records_by_status(&self, status: ProcessingStatus) -> Result<Vec<ProcessingRecord>> {
        let rows = sqlx::query_as::<_, DbProcessingRecord>(
            "SELECT * FROM processing_records WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        rows.into_iter().map(ProcessingRecord::try_from).collect()
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO processing_logs (id, processing_record_id, status, message)
            VALUES ($1, $2, $3, $4)
        "#)
        .bind(entry.id)
        .bind(entry.processing_record_id)
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn logs_for_record(&self, record_id: Uuid) -> Result<Vec<ProcessingLogEntry>> {
        #[derive(FromRow)]
        struct DbLog {
            id: Uuid,
            processing_record_id: Uuid,
            status: String,
            message: String,
            created_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, DbLog>(
            "SELECT * FROM processing_logs WHERE processing_record_id = $1 ORDER BY created_at",
        )
        .bind(record_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|db| {
                let status = ProcessingStatus::parse(&db.status).ok_or_else(|| {
                    DrawError::Database(format!("unknown processing status {}", db.status))
                })?;
                Ok(ProcessingLogEntry {
                    id: db.id,
                    processing_record_id: db.processing_record_id,
                    status,
                    message: db.message,
                    created_at: db.created_at,
                })
            })
            .collect()
    }

    async fn create_copy_task(&self, task: &CopyTask) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO copy_tasks (id, source_directory, source_modified_at,
                source_size_bytes, target_directory, copy_completed)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#)
        .bind(task.id)
        .bind(&task.source_directory)
        .bind(task.source_modified_at)
        .bind(task.source_size_bytes as i64)
        .bind(&task.target_directory)
        .bind(task.copy_completed)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_copy_task_by_source(&self, source_directory: &str) -> Result<Option<CopyTask>> {
        #[derive(FromRow)]
        struct DbCopyTask {
            id: Uuid,
            source_directory: String,
            source_modified_at: DateTime<Utc>,
            source_size_bytes: i64,
            target_directory: String,
            copy_completed: bool,
            created_at: DateTime<Utc>,
        }

        let result = sqlx::query_as::<_, DbCopyTask>(
            "SELECT * FROM copy_tasks WHERE source_directory = $1",
        )
        .bind(source_directory)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;

        Ok(result.map(|db| CopyTask {
            id: db.id,
            source_directory: db.source_directory,
            source_modified_at: db.source_modified_at,
            source_size_bytes: db.source_size_bytes as u64,
            target_directory: db.target_directory,
            copy_completed: db.copy_completed,
            created_at: db.created_at,
        }))
    }

    async fn mark_copy_task_completed(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE copy_tasks SET copy_completed = TRUE WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DrawError::NotFound(format!("copy task {}", id)));
        }
        Ok(())
    }

    async fn upsert_rtstruct_file(&self, file: &RtStructFile) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO rtstruct_files (original_file_path, series_instance_uid,
                processed_file_path, processing_date, processing_status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (original_file_path) DO UPDATE SET
                series_instance_uid = EXCLUDED.series_instance_uid,
                processed_file_path = EXCLUDED.processed_file_path,
                processing_date = EXCLUDED.processing_date,
                processing_status = EXCLUDED.processing_status
        "#)
        .bind(&file.original_file_path)
        .bind(&file.series_instance_uid)
        .bind(&file.processed_file_path)
        .bind(file.processing_date)
        .bind(&file.processing_status)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }
}
