//! 操作员命令
//!
//! 面向操作员的窄接口：按记录ID重启失败的系列、查看系列状态。
//! 与任何界面解耦，命令只接受记录ID与目标动作。

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::state_machine::ProcessingStateMachine;
use draw_core::store::ProcessingStore;
use draw_core::{
    DrawError, ProcessingLogEntry, ProcessingRecord, Result, SeriesState,
};

/// 重启一个处于失败终态的系列
///
/// 状态回退到该失败状态对应的重启目标；这是状态单调性的唯一
/// 例外，必须由操作员显式触发。
pub async fn restart_series(
    store: &Arc<dyn ProcessingStore>,
    record_id: Uuid,
) -> Result<ProcessingRecord> {
    let mut record = store
        .get_record(record_id)
        .await?
        .ok_or_else(|| DrawError::NotFound(format!("processing record {}", record_id)))?;

    let target = ProcessingStateMachine::restart_target(record.status).ok_or_else(|| {
        DrawError::InvalidStateTransition {
            from: record.status.as_str().to_string(),
            event: "RESTART".to_string(),
        }
    })?;

    let previous = record.status;
    record.status = target;
    record.state = SeriesState::Processing;
    record.updated_at = chrono::Utc::now();
    store.update_record(&record).await?;
    store
        .append_log(&ProcessingLogEntry {
            id: Uuid::new_v4(),
            processing_record_id: record.id,
            status: target,
            message: format!(
                "operator restart: {} -> {}",
                previous.as_str(),
                target.as_str()
            ),
            created_at: chrono::Utc::now(),
        })
        .await?;

    info!(
        "series {} restarted from {} to {}",
        record.series_instance_uid,
        previous.as_str(),
        target.as_str()
    );
    Ok(record)
}

/// 查看一个系列的当前状态与完整处理日志
pub async fn series_status(
    store: &Arc<dyn ProcessingStore>,
    record_id: Uuid,
) -> Result<(ProcessingRecord, Vec<ProcessingLogEntry>)> {
    let record = store
        .get_record(record_id)
        .await?
        .ok_or_else(|| DrawError::NotFound(format!("processing record {}", record_id)))?;
    let logs = store.logs_for_record(record_id).await?;
    Ok((record, logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use draw_core::memory::InMemoryProcessingStore;
    use draw_core::ProcessingStatus;

    fn record(status: ProcessingStatus) -> ProcessingRecord {
        ProcessingRecord {
            id: Uuid::new_v4(),
            copy_task_id: None,
            patient_id: "P1".into(),
            patient_name: None,
            modality: "CT".into(),
            study_instance_uid: "1.2.3".into(),
            series_instance_uid: "1.2.3.4".into(),
            series_description: None,
            study_date: None,
            protocol: None,
            import_directory: "/data/import/x".into(),
            current_directory: "/data/processing/1.2.3.4".into(),
            template_name: None,
            status,
            state: SeriesState::Unprocessed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_restart_failed_series() {
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());
        let failed = record(ProcessingStatus::DeidentificationFailed);
        store.create_record(&failed).await.unwrap();

        let restarted = restart_series(&store, failed.id).await.unwrap();
        assert_eq!(restarted.status, ProcessingStatus::ReadyForDeidentification);
        assert_eq!(restarted.state, SeriesState::Processing);

        // 重启留下审计日志
        let logs = store.logs_for_record(failed.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].message.contains("operator restart"));
    }

    #[tokio::test]
    async fn test_restart_rejects_in_progress_series() {
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());
        let active = record(ProcessingStatus::Deidentified);
        store.create_record(&active).await.unwrap();

        let result = restart_series(&store, active.id).await;
        assert!(matches!(
            result,
            Err(DrawError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_series_status_returns_logs_in_order() {
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());
        let rec = record(ProcessingStatus::NoTemplateFound);
        store.create_record(&rec).await.unwrap();
        restart_series(&store, rec.id).await.unwrap();

        let (loaded, logs) = series_status(&store, rec.id).await.unwrap();
        assert_eq!(loaded.status, ProcessingStatus::SeriesSeparated);
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());
        assert!(matches!(
            restart_series(&store, Uuid::new_v4()).await,
            Err(DrawError::NotFound(_))
        ));
    }
}
