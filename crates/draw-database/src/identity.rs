//! 身份映射查询
//!
//! 映射记录只插入与更新，永不删除；它们是日后任何时间点
//! 逆转去标识化的唯一钥匙。

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, Row};

use crate::connection::DatabasePool;
use draw_core::store::IdentityStore;
use draw_core::{DrawError, InstanceRecord, PatientRecord, Result, SeriesRecord, StudyRecord};

/// 数据库患者表
#[derive(Debug, FromRow)]
struct DbPatient {
    patient_id: String,
    patient_name: Option<String>,
    patient_birth_date: Option<NaiveDate>,
    deidentified_patient_id: String,
    deidentified_patient_name: Option<String>,
    deidentified_patient_birth_date: Option<NaiveDate>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbPatient> for PatientRecord {
    fn from(db: DbPatient) -> Self {
        PatientRecord {
            patient_id: db.patient_id,
            patient_name: db.patient_name,
            patient_birth_date: db.patient_birth_date,
            deidentified_patient_id: db.deidentified_patient_id,
            deidentified_patient_name: db.deidentified_patient_name,
            deidentified_patient_birth_date: db.deidentified_patient_birth_date,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbStudy {
    study_instance_uid: String,
    patient_id: String,
    study_date: Option<NaiveDate>,
    study_description: Option<String>,
    study_id: Option<String>,
    deidentified_study_instance_uid: String,
    deidentified_study_date: Option<NaiveDate>,
    deidentified_study_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbStudy> for StudyRecord {
    fn from(db: DbStudy) -> Self {
        StudyRecord {
            study_instance_uid: db.study_instance_uid,
            patient_id: db.patient_id,
            study_date: db.study_date,
            study_description: db.study_description,
            study_id: db.study_id,
            deidentified_study_instance_uid: db.deidentified_study_instance_uid,
            deidentified_study_date: db.deidentified_study_date,
            deidentified_study_id: db.deidentified_study_id,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbSeries {
    series_instance_uid: String,
    study_instance_uid: String,
    series_date: Option<NaiveDate>,
    frame_of_reference_uid: Option<String>,
    deidentified_series_instance_uid: String,
    deidentified_series_date: Option<NaiveDate>,
    deidentified_frame_of_reference_uid: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbSeries> for SeriesRecord {
    fn from(db: DbSeries) -> Self {
        SeriesRecord {
            series_instance_uid: db.series_instance_uid,
            study_instance_uid: db.study_instance_uid,
            series_date: db.series_date,
            frame_of_reference_uid: db.frame_of_reference_uid,
            deidentified_series_instance_uid: db.deidentified_series_instance_uid,
            deidentified_series_date: db.deidentified_series_date,
            deidentified_frame_of_reference_uid: db.deidentified_frame_of_reference_uid,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbInstance {
    sop_instance_uid: String,
    series_instance_uid: String,
    deidentified_sop_instance_uid: String,
    created_at: DateTime<Utc>,
}

impl From<DbInstance> for InstanceRecord {
    fn from(db: DbInstance) -> Self {
        InstanceRecord {
            sop_instance_uid: db.sop_instance_uid,
            series_instance_uid: db.series_instance_uid,
            deidentified_sop_instance_uid: db.deidentified_sop_instance_uid,
            created_at: db.created_at,
        }
    }
}

/// 身份映射存储的Postgres实现
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: DatabasePool,
}

impl PgIdentityStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_patient(&self, patient_id: &str) -> Result<Option<PatientRecord>> {
        let result = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE patient_id = $1")
            .bind(patient_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(PatientRecord::from))
    }

    async fn save_patient(&self, patient: &PatientRecord) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO patients (patient_id, patient_name, patient_birth_date,
                deidentified_patient_id, deidentified_patient_name, deidentified_patient_birth_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (patient_id) DO UPDATE SET
                patient_name = EXCLUDED.patient_name,
                updated_at = NOW()
        "#)
        .bind(&patient.patient_id)
        .bind(&patient.patient_name)
        .bind(patient.patient_birth_date)
        .bind(&patient.deidentified_patient_id)
        .bind(&patient.deidentified_patient_name)
        .bind(patient.deidentified_patient_birth_date)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_study(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>> {
        let result =
            sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_instance_uid = $1")
                .bind(study_instance_uid)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(StudyRecord::from))
    }

    async fn save_study(&self, study: &StudyRecord) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO studies (study_instance_uid, patient_id, study_date, study_description,
                study_id, deidentified_study_instance_uid, deidentified_study_date, deidentified_study_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (study_instance_uid) DO UPDATE SET
                study_description = EXCLUDED.study_description,
                updated_at = NOW()
        "#)
        .bind(&study.study_instance_uid)
        .bind(&study.patient_id)
        .bind(study.study_date)
        .bind(&study.study_description)
        .bind(&study.study_id)
        .bind(&study.deidentified_study_instance_uid)
        .bind(study.deidentified_study_date)
        .bind(&study.deidentified_study_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn study_count_for_patient(&self, deidentified_patient_id: &str) -> Result<u32> {
        // 计数在事务内完成，并发分配同一患者的检查计数不会重复
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        // 先锁患者行，同一患者的并发计数排队进行；替代检查UID上的
        // 唯一约束兜底，碰撞宁可报错也不静默重复
        sqlx::query("SELECT patient_id FROM patients WHERE deidentified_patient_id = $1 FOR UPDATE")
            .bind(deidentified_patient_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM studies s
             JOIN patients p ON s.patient_id = p.patient_id
             WHERE p.deidentified_patient_id = $1",
        )
        .bind(deidentified_patient_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;

        let count: i64 = row.get("n");

        tx.commit()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(count as u32)
    }

    async fn find_series(&self, series_instance_uid: &str) -> Result<Option<SeriesRecord>> {
        let result =
            sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_instance_uid = $1")
                .bind(series_instance_uid)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(SeriesRecord::from))
    }

    async fn save_series(&self, series: &SeriesRecord) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO series (series_instance_uid, study_instance_uid, series_date,
                frame_of_reference_uid, deidentified_series_instance_uid,
                deidentified_series_date, deidentified_frame_of_reference_uid)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (series_instance_uid) DO UPDATE SET
                updated_at = NOW()
        "#)
        .bind(&series.series_instance_uid)
        .bind(&series.study_instance_uid)
        .bind(series.series_date)
        .bind(&series.frame_of_reference_uid)
        .bind(&series.deidentified_series_instance_uid)
        .bind(series.deidentified_series_date)
        .bind(&series.deidentified_frame_of_reference_uid)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn deidentified_series_uid_exists(&self, deidentified_series_uid: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM series WHERE deidentified_series_instance_uid = $1) AS present",
        )
        .bind(deidentified_series_uid)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(row.get("present"))
    }

    async fn deidentified_series_uids_for_study(
        &self,
        deidentified_study_uid: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT s.deidentified_series_instance_uid FROM series s
             JOIN studies st ON s.study_instance_uid = st.study_instance_uid
             WHERE st.deidentified_study_instance_uid = $1",
        )
        .bind(deidentified_study_uid)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| r.get("deidentified_series_instance_uid"))
            .collect())
    }

    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<InstanceRecord>> {
        let result =
            sqlx::query_as::<_, DbInstance>("SELECT * FROM instances WHERE sop_instance_uid = $1")
                .bind(sop_instance_uid)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(InstanceRecord::from))
    }

    async fn save_instance(&self, instance: &InstanceRecord) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO instances (sop_instance_uid, series_instance_uid, deidentified_sop_instance_uid)
            VALUES ($1, $2, $3)
            ON CONFLICT (sop_instance_uid) DO NOTHING
        "#)
        .bind(&instance.sop_instance_uid)
        .bind(&instance.series_instance_uid)
        .bind(&instance.deidentified_sop_instance_uid)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn instances_for_series(&self, series_instance_uid: &str) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query_as::<_, DbInstance>(
            "SELECT * FROM instances WHERE series_instance_uid = $1",
        )
        .bind(series_instance_uid)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(rows.into_iter().map(InstanceRecord::from).collect())
    }

    async fn find_series_by_deidentified_uid(
        &self,
        deidentified_series_uid: &str,
    ) -> Result<Option<SeriesRecord>> {
        let result = sqlx::query_as::<_, DbSeries>(
            "SELECT * FROM series WHERE deidentified_series_instance_uid = $1",
        )
        .bind(deidentified_series_uid)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(SeriesRecord::from))
    }

    async fn find_study_by_deidentified_uid(
        &self,
        deidentified_study_uid: &str,
    ) -> Result<Option<StudyRecord>> {
        let result = sqlx::query_as::<_, DbStudy>(
            "SELECT * FROM studies WHERE deidentified_study_instance_uid = $1",
        )
        .bind(deidentified_study_uid)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(StudyRecord::from))
    }

    async fn find_patient_by_deidentified_id(
        &self,
        deidentified_patient_id: &str,
    ) -> Result<Option<PatientRecord>> {
        let result = sqlx::query_as::<_, DbPatient>(
            "SELECT * FROM patients WHERE deidentified_patient_id = $1",
        )
        .bind(deidentified_patient_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(PatientRecord::from))
    }
}
