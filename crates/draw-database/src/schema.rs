//! 数据库表结构

use sqlx::PgPool;

use draw_core::{DrawError, Result};

/// 创建全部数据表
pub async fn create_tables(pool: &PgPool) -> Result<()> {
    // 患者身份映射表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS patients (
            patient_id VARCHAR(100) PRIMARY KEY,
            patient_name VARCHAR(255),
            patient_birth_date DATE,
            deidentified_patient_id VARCHAR(100) UNIQUE NOT NULL,
            deidentified_patient_name VARCHAR(100),
            deidentified_patient_birth_date DATE,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 检查身份映射表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS studies (
            study_instance_uid VARCHAR(100) PRIMARY KEY,
            patient_id VARCHAR(100) NOT NULL REFERENCES patients(patient_id),
            study_date DATE,
            study_description VARCHAR(255),
            study_id VARCHAR(100),
            deidentified_study_instance_uid VARCHAR(100) UNIQUE NOT NULL,
            deidentified_study_date DATE,
            deidentified_study_id VARCHAR(100),
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 系列身份映射表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS series (
            series_instance_uid VARCHAR(100) PRIMARY KEY,
            study_instance_uid VARCHAR(100) NOT NULL REFERENCES studies(study_instance_uid),
            series_date DATE,
            frame_of_reference_uid VARCHAR(100),
            deidentified_series_instance_uid VARCHAR(100) UNIQUE NOT NULL,
            deidentified_series_date DATE,
            deidentified_frame_of_reference_uid VARCHAR(100),
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 实例身份映射表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS instances (
            sop_instance_uid VARCHAR(100) PRIMARY KEY,
            series_instance_uid VARCHAR(100) NOT NULL REFERENCES series(series_instance_uid),
            deidentified_sop_instance_uid VARCHAR(100) UNIQUE NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 复制任务表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS copy_tasks (
            id UUID PRIMARY KEY,
            source_directory VARCHAR(512) UNIQUE NOT NULL,
            source_modified_at TIMESTAMP WITH TIME ZONE NOT NULL,
            source_size_bytes BIGINT NOT NULL,
            target_directory VARCHAR(512) NOT NULL,
            copy_completed BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 系列处理记录表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS processing_records (
            id UUID PRIMARY KEY,
            copy_task_id UUID REFERENCES copy_tasks(id),
            patient_id VARCHAR(255) NOT NULL,
            patient_name VARCHAR(255),
            modality VARCHAR(50) NOT NULL,
            study_instance_uid VARCHAR(255) NOT NULL,
            series_instance_uid VARCHAR(255) UNIQUE NOT NULL,
            series_description VARCHAR(255),
            study_date DATE,
            protocol VARCHAR(255),
            import_directory VARCHAR(512) NOT NULL,
            current_directory VARCHAR(512) NOT NULL,
            template_name VARCHAR(255),
            status VARCHAR(60) NOT NULL,
            state VARCHAR(60) NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 处理日志表，只追加
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS processing_logs (
            id UUID PRIMARY KEY,
            processing_record_id UUID NOT NULL REFERENCES processing_records(id),
            status VARCHAR(60) NOT NULL,
            message TEXT NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 传输记录表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS transfers (
            id UUID PRIMARY KEY,
            study_instance_uid VARCHAR(255) NOT NULL,
            series_instance_uid VARCHAR(255) NOT NULL,
            zip_file_path VARCHAR(512) NOT NULL,
            zip_checksum VARCHAR(64) NOT NULL,
            server_token VARCHAR(255),
            status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
            server_status VARCHAR(255),
            rtstruct_file_path VARCHAR(512),
            rtstruct_checksum VARCHAR(64),
            rtstruct_checksum_verified BOOLEAN NOT NULL DEFAULT FALSE,
            sent_at TIMESTAMP WITH TIME ZONE,
            rtstruct_received_at TIMESTAMP WITH TIME ZONE,
            last_poll_attempt TIMESTAMP WITH TIME ZONE,
            poll_attempts INTEGER NOT NULL DEFAULT 0,
            server_notified BOOLEAN NOT NULL DEFAULT FALSE,
            cleaned_up BOOLEAN NOT NULL DEFAULT FALSE,
            error_message TEXT,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 模板目录表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS templates (
            name VARCHAR(255) PRIMARY KEY,
            artifact_path VARCHAR(512) NOT NULL,
            protocol VARCHAR(255) NOT NULL,
            file_hash VARCHAR(128) UNIQUE NOT NULL,
            description TEXT
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 规则集与规则表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS rule_sets (
            id UUID PRIMARY KEY,
            name VARCHAR(255) UNIQUE NOT NULL,
            description VARCHAR(255),
            template_name VARCHAR(255) NOT NULL REFERENCES templates(name)
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS rules (
            id UUID PRIMARY KEY,
            rule_set_id UUID NOT NULL REFERENCES rule_sets(id),
            tag_name VARCHAR(255) NOT NULL,
            tag_value VARCHAR(255) NOT NULL
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 重识别产物表
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS rtstruct_files (
            original_file_path VARCHAR(512) PRIMARY KEY,
            series_instance_uid VARCHAR(255) NOT NULL,
            processed_file_path VARCHAR(512),
            processing_date DATE NOT NULL,
            processing_status VARCHAR(255) NOT NULL
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    // 凭证表（单行）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY,
            encrypted_bearer_token TEXT,
            encrypted_refresh_token TEXT,
            token_expiry TIMESTAMP WITH TIME ZONE,
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
    "#).execute(pool).await.map_err(|e| DrawError::Database(e.to_string()))?;

    create_indexes(pool).await?;

    tracing::info!("Database tables created successfully");
    Ok(())
}

/// 创建数据库索引
async fn create_indexes(pool: &PgPool) -> Result<()> {
    let indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_patients_deidentified_id ON patients(deidentified_patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_studies_deidentified_uid ON studies(deidentified_study_instance_uid)",
        "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_series_deidentified_uid ON series(deidentified_series_instance_uid)",
        "CREATE INDEX IF NOT EXISTS idx_series_study_uid ON series(study_instance_uid)",
        "CREATE INDEX IF NOT EXISTS idx_instances_deidentified_uid ON instances(deidentified_sop_instance_uid)",
        "CREATE INDEX IF NOT EXISTS idx_instances_series_uid ON instances(series_instance_uid)",
        "CREATE INDEX IF NOT EXISTS idx_processing_records_status ON processing_records(status)",
        "CREATE INDEX IF NOT EXISTS idx_processing_logs_record ON processing_logs(processing_record_id)",
        "CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status)",
        "CREATE INDEX IF NOT EXISTS idx_transfers_server_notified ON transfers(server_notified)",
        "CREATE INDEX IF NOT EXISTS idx_transfers_last_poll ON transfers(last_poll_attempt)",
        "CREATE INDEX IF NOT EXISTS idx_rules_rule_set ON rules(rule_set_id)",
    ];

    for index_sql in indexes {
        sqlx::query(index_sql)
            .execute(pool)
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
    }

    tracing::info!("Database indexes created successfully");
    Ok(())
}
