//! 导出流水线
//!
//! 复制 → 分拣 → 模板匹配 → 去标识化 → 传输。每个阶段幂等：
//! 阶段只认领处于对应状态的记录，目录的移动本身就是阶段间的
//! 交接，崩溃后重跑要么无事可做、要么安全续作。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state_machine::ProcessingStateMachine;
use draw_core::store::{ProcessingStore, TemplateStore, TransferStore};
use draw_core::utils::generate_date_offset;
use draw_core::{
    DrawConfig, ProcessingLogEntry, ProcessingRecord, ProcessingStatus, Result, SeriesState,
    StageItem, StageResult,
};
use draw_deid::{deidentify_series, IdentityMapper};
use draw_ingest::{copy_from_datastore, match_series, separate_into_series, MatchOutcome};
use draw_storage::{archive::build_series_archive, workdir};
use draw_transfer::{initiate_transfer, DrawApiClient};

/// 一次流水线运行的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub stages: Vec<StageOutcome>,
}

/// 单个阶段的执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub result: StageResult,
}

/// 状态推进：校验转换、更新记录并追加处理日志
pub(crate) async fn advance_status(
    machine: &ProcessingStateMachine,
    store: &Arc<dyn ProcessingStore>,
    record: &mut ProcessingRecord,
    to: ProcessingStatus,
    message: String,
) -> Result<()> {
    machine.transition(record.status, to)?;
    record.status = to;
    record.updated_at = Utc::now();
    store.update_record(record).await?;
    store
        .append_log(&ProcessingLogEntry {
            id: Uuid::new_v4(),
            processing_record_id: record.id,
            status: to,
            message,
            created_at: Utc::now(),
        })
        .await?;
    Ok(())
}

/// 导出流水线
pub struct ExportPipeline {
    config: DrawConfig,
    machine: ProcessingStateMachine,
    processing: Arc<dyn ProcessingStore>,
    templates: Arc<dyn TemplateStore>,
    transfers: Arc<dyn TransferStore>,
    mapper: Arc<IdentityMapper>,
    client: Arc<DrawApiClient>,
}

impl ExportPipeline {
    pub fn new(
        config: DrawConfig,
        processing: Arc<dyn ProcessingStore>,
        templates: Arc<dyn TemplateStore>,
        transfers: Arc<dyn TransferStore>,
        mapper: Arc<IdentityMapper>,
        client: Arc<DrawApiClient>,
    ) -> Self {
        Self {
            config,
            machine: ProcessingStateMachine::new(),
            processing,
            templates,
            transfers,
            mapper,
            client,
        }
    }

    /// 运行完整的导出链
    pub async fn run(&self) -> Result<PipelineSummary> {
        for dir in self.config.directories.all() {
            workdir::ensure_dir(dir).await?;
        }

        let mut stages = Vec::new();

        let copy = self.copy_stage().await?;
        stages.push(StageOutcome {
            name: "copy".to_string(),
            result: copy,
        });

        let separate = self.separate_stage().await?;
        stages.push(StageOutcome {
            name: "separate-into-series".to_string(),
            result: separate,
        });

        let matched = self.match_stage().await?;
        stages.push(StageOutcome {
            name: "match-template".to_string(),
            result: matched,
        });

        let deidentified = self.deidentify_stage().await?;
        stages.push(StageOutcome {
            name: "pseudonymize".to_string(),
            result: deidentified,
        });

        let transmitted = self.transmit_stage().await?;
        stages.push(StageOutcome {
            name: "transmit".to_string(),
            result: transmitted,
        });

        Ok(PipelineSummary { stages })
    }

    /// 阶段一：数据店扫描复制
    pub async fn copy_stage(&self) -> Result<StageResult> {
        copy_from_datastore(
            &self.config.directories.datastore,
            &self.config.directories.import,
            &self.processing,
        )
        .await
    }

    /// 阶段二：系列分拣
    ///
    /// 逐个处理导入目录下的复制批次；单个批次失败不影响其余批次。
    pub async fn separate_stage(&self) -> Result<StageResult> {
        let import_dir = &self.config.directories.import;
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        let mut entries = tokio::fs::read_dir(import_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let batch_dir = entry.path();
            if !batch_dir.is_dir() {
                continue;
            }
            match separate_into_series(
                &batch_dir,
                &self.config.directories.processing,
                &self.config.deidentification.modality_allow_list,
                &self.processing,
            )
            .await
            {
                Ok((_, result)) => {
                    successful.extend(result.successful);
                    failed.extend(result.failed);
                }
                Err(e) => {
                    warn!("separation failed for {}: {}", batch_dir.display(), e);
                    failed.push(
                        StageItem::for_path(batch_dir.to_string_lossy())
                            .with_detail(e.to_string()),
                    );
                }
            }
        }

        Ok(StageResult::from_items(
            "series separation finished",
            successful,
            failed,
        ))
    }

    /// 阶段三：模板匹配
    ///
    /// 唯一命中的系列移交去标识化输入目录；歧义与未命中进入各自
    /// 的可恢复终态，等操作员处置。
    pub async fn match_stage(&self) -> Result<StageResult> {
        let records = self
            .processing
            .list_records_by_status(ProcessingStatus::SeriesSeparated)
            .await?;
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for mut record in records {
            let series_dir = Path::new(&record.current_directory).to_path_buf();
            if !series_dir.is_dir() {
                warn!(
                    "series directory missing for {}: {}",
                    record.series_instance_uid, record.current_directory
                );
                failed.push(
                    StageItem::for_series(record.id, record.series_instance_uid.clone())
                        .with_detail("series directory missing"),
                );
                continue;
            }

            let outcome = match match_series(&series_dir, &self.templates).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    advance_status(
                        &self.machine,
                        &self.processing,
                        &mut record,
                        ProcessingStatus::Error,
                        format!("template matching error: {}", e),
                    )
                    .await?;
                    failed.push(
                        StageItem::for_series(record.id, record.series_instance_uid.clone())
                            .with_detail(e.to_string()),
                    );
                    continue;
                }
            };

            let status = outcome.to_status();
            let message = outcome.describe();

            if let MatchOutcome::Matched(template) = &outcome {
                // 命中：系列目录移交去标识化输入目录
                let target = self
                    .config
                    .directories
                    .deidentification_input
                    .join(&record.series_instance_uid);
                workdir::move_directory(&series_dir, &target).await?;
                record.current_directory = target.to_string_lossy().into_owned();
                record.template_name = Some(template.name.clone());
                advance_status(
                    &self.machine,
                    &self.processing,
                    &mut record,
                    status,
                    message,
                )
                .await?;
                successful.push(StageItem::for_series(
                    record.id,
                    record.series_instance_uid.clone(),
                ));
            } else {
                record.state = SeriesState::Unprocessed;
                advance_status(
                    &self.machine,
                    &self.processing,
                    &mut record,
                    status,
                    message.clone(),
                )
                .await?;
                failed.push(
                    StageItem::for_series(record.id, record.series_instance_uid.clone())
                        .with_detail(message),
                );
            }
        }

        Ok(StageResult::from_items(
            "template matching finished",
            successful,
            failed,
        ))
    }

    /// 阶段四：去标识化
    ///
    /// 日期偏移量每次运行生成一次，对本次运行的所有系列统一生效。
    pub async fn deidentify_stage(&self) -> Result<StageResult> {
        let records = self
            .processing
            .list_records_by_status(ProcessingStatus::ReadyForDeidentification)
            .await?;
        let date_offset = generate_date_offset();
        info!(
            "deidentifying {} series with date offset {} days",
            records.len(),
            date_offset
        );

        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for mut record in records {
            let series_dir = Path::new(&record.current_directory).to_path_buf();
            let result = deidentify_series(
                &series_dir,
                &self.config.directories.deidentification_output,
                &self.config.deidentification.modality_allow_list,
                date_offset,
                &self.mapper,
            )
            .await;

            match result {
                Ok(deidentified) => {
                    record.current_directory =
                        deidentified.directory.to_string_lossy().into_owned();
                    advance_status(
                        &self.machine,
                        &self.processing,
                        &mut record,
                        ProcessingStatus::Deidentified,
                        format!(
                            "{} files deidentified, {} skipped",
                            deidentified.processed,
                            deidentified.skipped.len()
                        ),
                    )
                    .await?;
                    successful.push(StageItem::for_series(
                        record.id,
                        record.series_instance_uid.clone(),
                    ));
                }
                Err(e) => {
                    record.state = SeriesState::Failed;
                    advance_status(
                        &self.machine,
                        &self.processing,
                        &mut record,
                        ProcessingStatus::DeidentificationFailed,
                        format!("deidentification failed: {}", e),
                    )
                    .await?;
                    failed.push(
                        StageItem::for_series(record.id, record.series_instance_uid.clone())
                            .with_detail(e.to_string()),
                    );
                }
            }
        }

        Ok(StageResult::from_items(
            "deidentification finished",
            successful,
            failed,
        ))
    }

    /// 阶段五：打包上传
    ///
    /// 压缩包随SHA-256校验和一起上传；已有传输记录的系列跳过，
    /// 上传成功的系列目录移入归档目录。
    pub async fn transmit_stage(&self) -> Result<StageResult> {
        let records = self
            .processing
            .list_records_by_status(ProcessingStatus::Deidentified)
            .await?;
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for record in records {
            let series_dir = Path::new(&record.current_directory).to_path_buf();
            if !series_dir.is_dir() {
                // 目录已不在去标识化输出下：上一轮已传输归档
                continue;
            }
            let deidentified_series_uid = match series_dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if self
                .transfers
                .find_transfer_by_series_uid(&deidentified_series_uid)
                .await?
                .is_some()
            {
                info!(
                    "transfer already exists for series {}, skipping",
                    deidentified_series_uid
                );
                continue;
            }

            // 替代系列UID形如 {检查}.{m}，截掉最后一段得到检查UID
            let deidentified_study_uid = deidentified_series_uid
                .rsplit_once('.')
                .map(|(study, _)| study.to_string())
                .unwrap_or_else(|| deidentified_series_uid.clone());

            let transmit_result = async {
                let zip_path = self
                    .config
                    .directories
                    .temp_upload
                    .join(format!("{}.zip", deidentified_series_uid));
                let archive = build_series_archive(&series_dir, &zip_path).await?;
                initiate_transfer(
                    &self.client,
                    &self.transfers,
                    &archive.zip_path,
                    &deidentified_study_uid,
                    &deidentified_series_uid,
                    &archive.checksum,
                    self.config.api.bypass_health_check,
                )
                .await
            }
            .await;

            match transmit_result {
                Ok(transfer) => {
                    // 上传完成，系列目录移入归档
                    let archived = self
                        .config
                        .directories
                        .archive
                        .join(&deidentified_series_uid);
                    workdir::move_directory(&series_dir, &archived).await?;
                    let mut record = record;
                    record.current_directory = archived.to_string_lossy().into_owned();
                    self.processing.update_record(&record).await?;

                    successful.push(
                        StageItem::for_series(record.id, record.series_instance_uid.clone())
                            .with_detail(format!("transfer {}", transfer.id)),
                    );
                }
                Err(e) => {
                    warn!(
                        "transmit failed for series {}: {}",
                        record.series_instance_uid, e
                    );
                    failed.push(
                        StageItem::for_series(record.id, record.series_instance_uid.clone())
                            .with_detail(e.to_string()),
                    );
                }
            }
        }

        Ok(StageResult::from_items(
            "transmission finished",
            successful,
            failed,
        ))
    }
}
