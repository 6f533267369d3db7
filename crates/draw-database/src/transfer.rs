//! 传输记录查询
//!
//! 收尾关键区用 `SELECT ... FOR UPDATE` 行锁串行化：两个并发的
//! 轮询者不可能同时终结同一条传输。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::connection::DatabasePool;
use draw_core::store::TransferStore;
use draw_core::{DrawError, Result, TransferRecord, TransferStatus};

#[derive(Debug, FromRow)]
struct DbTransfer {
    id: Uuid,
    study_instance_uid: String,
    series_instance_uid: String,
    zip_file_path: String,
    zip_checksum: String,
    server_token: Option<String>,
    status: String,
    server_status: Option<String>,
    rtstruct_file_path: Option<String>,
    rtstruct_checksum: Option<String>,
    rtstruct_checksum_verified: bool,
    sent_at: Option<DateTime<Utc>>,
    rtstruct_received_at: Option<DateTime<Utc>>,
    last_poll_attempt: Option<DateTime<Utc>>,
    poll_attempts: i32,
    server_notified: bool,
    cleaned_up: bool,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbTransfer> for TransferRecord {
    type Error = DrawError;

    fn try_from(db: DbTransfer) -> Result<Self> {
        let status = TransferStatus::parse(&db.status)
            .ok_or_else(|| DrawError::Database(format!("unknown transfer status {}", db.status)))?;
        Ok(TransferRecord {
            id: db.id,
            study_instance_uid: db.study_instance_uid,
            series_instance_uid: db.series_instance_uid,
            zip_file_path: db.zip_file_path,
            zip_checksum: db.zip_checksum,
            server_token: db.server_token,
            status,
            server_status: db.server_status,
            rtstruct_file_path: db.rtstruct_file_path,
            rtstruct_checksum: db.rtstruct_checksum,
            rtstruct_checksum_verified: db.rtstruct_checksum_verified,
            sent_at: db.sent_at,
            rtstruct_received_at: db.rtstruct_received_at,
            last_poll_attempt: db.last_poll_attempt,
            poll_attempts: db.poll_attempts,
            server_notified: db.server_notified,
            cleaned_up: db.cleaned_up,
            error_message: db.error_message,
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

/// 传输记录存储的Postgres实现
#[derive(Clone)]
pub struct PgTransferStore {
    pool: DatabasePool,
}

impl PgTransferStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &TransferRecord,
    ) -> Result<()> {
        sqlx::query(r#"
            UPDATE transfers SET
                server_token = $2,
                status = $3,
                server_status = $4,
                rtstruct_file_path = $5,
                rtstruct_checksum = $6,
                rtstruct_checksum_verified = $7,
                sent_at = $8,
                rtstruct_received_at = $9,
                server_notified = $10,
                cleaned_up = $11,
                error_message = $12,
                zip_file_path = $13,
                updated_at = NOW()
            WHERE id = $1
        "#)
        .bind(record.id)
        .bind(&record.server_token)
        .bind(record.status.as_str())
        .bind(&record.server_status)
        .bind(&record.rtstruct_file_path)
        .bind(&record.rtstruct_checksum)
        .bind(record.rtstruct_checksum_verified)
        .bind(record.sent_at)
        .bind(record.rtstruct_received_at)
        .bind(record.server_notified)
        .bind(record.cleaned_up)
        .bind(&record.error_message)
        .bind(&record.zip_file_path)
        .execute(&mut **tx)
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TransferStore for PgTransferStore {
    async fn create_transfer(&self, record: &TransferRecord) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO transfers (id, study_instance_uid, series_instance_uid,
                zip_file_path, zip_checksum, server_token, status, server_status,
                sent_at, poll_attempts, server_notified, cleaned_up)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#)
        .bind(record.id)
        .bind(&record.study_instance_uid)
        .bind(&record.series_instance_uid)
        .bind(&record.zip_file_path)
        .bind(&record.zip_checksum)
        .bind(&record.server_token)
        .bind(record.status.as_str())
        .bind(&record.server_status)
        .bind(record.sent_at)
        .bind(record.poll_attempts)
        .bind(record.server_notified)
        .bind(record.cleaned_up)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_transfer(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        let result = sqlx::query_as::<_, DbTransfer>("SELECT * FROM transfers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        result.map(TransferRecord::try_from).transpose()
    }

    async fn find_transfer_by_series_uid(
        &self,
        series_instance_uid: &str,
    ) -> Result<Option<TransferRecord>> {
        let result = sqlx::query_as::<_, DbTransfer>(
            "SELECT * FROM transfers WHERE series_instance_uid = $1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(series_instance_uid)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        result.map(TransferRecord::try_from).transpose()
    }

    async fn update_transfer(&self, record: &TransferRecord) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Self::write_record(&mut tx, record).await?;
        tx.commit()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_pending_transfers(&self) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, DbTransfer>(
            "SELECT * FROM transfers WHERE status IN ('SENT', 'PROCESSING') ORDER BY created_at",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn list_unnotified_transfers(&self) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, DbTransfer>(
            "SELECT * FROM transfers WHERE status = 'COMPLETED' AND server_notified = FALSE
             ORDER BY created_at",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn record_poll_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE transfers SET poll_attempts = poll_attempts + 1,
             last_poll_attempt = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DrawError::NotFound(format!("transfer {}", id)));
        }
        Ok(())
    }

    async fn lock_for_finalize(
        &self,
        id: Uuid,
        f: &mut (dyn for<'a> FnMut(&'a mut TransferRecord) -> Result<()> + Send),
    ) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        let row = sqlx::query_as::<_, DbTransfer>(
            "SELECT * FROM transfers WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?
        .ok_or_else(|| DrawError::NotFound(format!("transfer {}", id)))?;

        let mut record = TransferRecord::try_from(row)?;
        f(&mut record)?;

        Self::write_record(&mut tx, &record).await?;
        tx.commit()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }
}
